//! Dump streamer: offset probe, streaming dump and the offset list.
//!
//! The capture file is shared with a worker process that appends to it
//! under a full-range write lock. We take the same lock only to sample the
//! end of file and to retry a short transport write.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, info, warn};

use crate::capture::{index, pick_extreme, CaptureLock, Extreme, PCAP_HEADER_SIZE};
use crate::error::{Result, SnifferError};
use crate::registry::Registry;
use crate::sniffer::SnifferRecord;
use crate::transport::Transport;

/// Largest body a single dump reply carries.
pub const MAX_DUMP_SIZE: u64 = i32::MAX as u64;

/// Result of one dump attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpOutcome {
    /// `size` bytes starting at absolute offset `abs_offset` went out.
    Sent {
        abs_offset: u64,
        size: u64,
        drained: bool,
    },
    /// Nothing to send.
    Empty { drained: bool },
}

impl DumpOutcome {
    /// The record is retired and its directory is now empty.
    pub fn drained(&self) -> bool {
        match *self {
            DumpOutcome::Sent { drained, .. } | DumpOutcome::Empty { drained } => drained,
        }
    }
}

fn open_capture(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| {
            warn!("Couldn't open the capture log file {}: {}", path.display(), e);
            SnifferError::Io(e)
        })
}

/// Sample the end of file while holding the worker's lock.
fn sample_eof(file: &File) -> Result<u64> {
    let _lock = CaptureLock::acquire(file)?;
    let eof = (&*file).seek(SeekFrom::End(0))?;
    Ok(eof)
}

/// Absolute offset the worker has written up to, updating `has_logs`.
///
/// With no capture file the stored offset is returned unchanged.
pub fn current_offset(record: &mut SnifferRecord) -> Result<u64> {
    let newest = match &record.dir {
        Some(dir) => pick_extreme(dir, Extreme::Newest)?,
        None => None,
    };
    let Some(newest) = newest else {
        record.state.has_logs = false;
        return Ok(record.abs_offset);
    };

    let file = open_capture(&newest.path)?;
    let eof = sample_eof(&file)?;
    let offset = eof.saturating_sub(PCAP_HEADER_SIZE) + newest.base_offset;

    record.state.has_logs = offset > record.abs_offset;
    debug!(
        "Sniffer {} offset {} (delivered {})",
        record.id, offset, record.abs_offset
    );
    Ok(offset)
}

/// Send `size` bytes from `start`, retrying a short write once under the
/// capture lock.
fn send_body(
    file: &File,
    transport: &mut dyn Transport,
    start: u64,
    size: u64,
) -> Result<()> {
    let sent = match transport.send_file(file, size) {
        Ok(sent) => sent,
        Err(e) => {
            warn!("Sending capture data failed, retrying: {}", e);
            0
        }
    };
    if sent >= size {
        return Ok(());
    }

    warn!(
        "Short transport write ({} of {} bytes), retrying under lock",
        sent, size
    );
    let _lock = CaptureLock::acquire(file)?;
    (&*file).seek(SeekFrom::Start(start + sent))?;
    let remaining = size - sent;
    let retried = transport.send_file(file, remaining)?;
    if retried < remaining {
        return Err(SnifferError::TransportShortWrite {
            sent: sent + retried,
            expected: size,
        });
    }
    Ok(())
}

/// Stream the next chunk of undelivered capture bytes of `record`.
///
/// On `Sent` the reply header "0 <abs_offset> attach <size>" and the body
/// have been written to `transport`. On `Empty` nothing was written. When
/// the outcome is `drained` the caller releases the record.
pub fn stream_dump(record: &mut SnifferRecord, transport: &mut dyn Transport) -> Result<DumpOutcome> {
    stream_dump_capped(record, transport, MAX_DUMP_SIZE)
}

/// `stream_dump` with replies clamped at `max` bytes. The rest of a clamped
/// file stays on disk for the next dump.
pub(crate) fn stream_dump_capped(
    record: &mut SnifferRecord,
    transport: &mut dyn Transport,
    max: u64,
) -> Result<DumpOutcome> {
    let pending = record.is_pending_delete();
    let (oldest, file, eof, size) = loop {
        let oldest = match &record.dir {
            Some(dir) => pick_extreme(dir, Extreme::Oldest)?,
            None => None,
        };
        let Some(oldest) = oldest else {
            record.state.has_logs = false;
            return Ok(DumpOutcome::Empty { drained: pending });
        };

        let file = open_capture(&oldest.path)?;
        let eof = sample_eof(&file)?;

        if record.current_file.as_deref() != Some(oldest.path.as_path()) {
            if record.current_file.is_none() {
                debug!("First dump of sniffer {} from {}", record.id, oldest.name);
            } else {
                debug!("Sniffer {} moved on to {}", record.id, oldest.name);
            }
            record.current_file = Some(oldest.path.clone());
            record.read_cursor = PCAP_HEADER_SIZE;
            record.abs_offset = oldest.base_offset;
        }

        let size = eof.saturating_sub(record.read_cursor);
        if size > 0 {
            break (oldest, file, eof, size.min(max));
        }
        // Nothing more will be written to an exhausted file once a newer
        // one exists or the worker is gone.
        if oldest.count == 1 && !pending {
            record.state.has_logs = false;
            return Ok(DumpOutcome::Empty { drained: false });
        }
        drop(file);
        index::remove(&oldest.path)?;
    };

    let start = record.read_cursor;
    let abs_offset = record.abs_offset;
    (&file).seek(SeekFrom::Start(start))?;
    transport.reply(&format!("0 {} attach {}", abs_offset, size))?;
    send_body(&file, transport, start, size)?;

    record.read_cursor += size;
    record.abs_offset += size;
    record.state.has_logs = false;

    let finished = record.read_cursor >= eof;
    let mut drained = false;
    if finished && (oldest.count > 1 || pending) {
        drop(file);
        if let Err(e) = index::remove(&oldest.path) {
            warn!("Couldn't remove drained capture file {}: {}", oldest.path.display(), e);
        }
    }
    if oldest.count > 1 || !finished {
        record.state.has_logs = true;
    } else if pending {
        drained = true;
    }

    debug!(
        "Dumped {} bytes of sniffer {} at offset {}",
        size, record.id, abs_offset
    );
    Ok(DumpOutcome::Sent {
        abs_offset,
        size,
        drained,
    })
}

/// NUL-terminated "<name> <ifname> <ssn> <offset>" records for every
/// started sniffer.
///
/// With `sync` the offset is probed from disk and sniffers with nothing
/// new are left out. Without it the stored offset is used and retired
/// records are not listed.
pub fn list_with_offsets(registry: &mut Registry, sync: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    for key in registry.keys() {
        let Some(record) = registry.get_mut(key) else {
            continue;
        };
        if !record.state.started {
            continue;
        }

        let offset = if sync {
            match current_offset(record) {
                Ok(offset) if record.state.has_logs => offset,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Couldn't probe offset of sniffer {}: {}", record.id, e);
                    continue;
                }
            }
        } else {
            if record.is_pending_delete() {
                continue;
            }
            record.abs_offset
        };

        buf.extend_from_slice(format!("{} {}", record.id, offset).as_bytes());
        buf.push(0);
    }
    buf
}

/// Remove everything a record left on disk.
pub fn purge(record: &SnifferRecord) {
    if let Some(dir) = &record.dir {
        match index::purge_dir(dir) {
            Ok(()) => info!("Removed capture directory of sniffer {}", record.id),
            Err(e) => warn!("Couldn't clean up sniffer {}: {}", record.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::GlobalSettings;
    use crate::sniffer::SnifferId;
    use crate::transport::MemoryTransport;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Capture file with a pcap header and `body` bytes numbered from `first`.
    fn write_capture(dir: &Path, name: &str, first: u8, body: usize) -> PathBuf {
        let mut data = vec![0xd4u8; PCAP_HEADER_SIZE as usize];
        data.extend((0..body).map(|i| first.wrapping_add(i as u8)));
        let path = dir.join(name);
        fs::write(&path, data).unwrap();
        path
    }

    fn record_in(dir: &Path) -> SnifferRecord {
        let defaults = GlobalSettings::new("ta", "/tmp/agent").sniffer_defaults();
        let mut record = SnifferRecord::new(SnifferId::new("s1", "eth0", 0), defaults);
        record.state.started = true;
        record.dir = Some(dir.to_path_buf());
        record
    }

    mod offset_tests {
        use super::*;

        #[test]
        fn no_directory_returns_stored_offset() {
            let defaults = GlobalSettings::new("ta", "/tmp/agent").sniffer_defaults();
            let mut record = SnifferRecord::new(SnifferId::new("s1", "eth0", 0), defaults);
            record.abs_offset = 42;
            record.state.has_logs = true;

            assert_eq!(current_offset(&mut record).unwrap(), 42);
            assert!(!record.state.has_logs);
        }

        #[test]
        fn newest_file_sets_offset() {
            let temp = TempDir::new().unwrap();
            write_capture(temp.path(), "0", 0, 16);
            write_capture(temp.path(), "16", 0, 10);
            let mut record = record_in(temp.path());

            assert_eq!(current_offset(&mut record).unwrap(), 26);
            assert!(record.state.has_logs);

            record.abs_offset = 26;
            assert_eq!(current_offset(&mut record).unwrap(), 26);
            assert!(!record.state.has_logs);
        }

        #[test]
        fn header_only_file() {
            let temp = TempDir::new().unwrap();
            write_capture(temp.path(), "0", 0, 0);
            let mut record = record_in(temp.path());
            assert_eq!(current_offset(&mut record).unwrap(), 0);
            assert!(!record.state.has_logs);
        }
    }

    mod dump_tests {
        use super::*;

        #[test]
        fn empty_directory_is_no_data() {
            let temp = TempDir::new().unwrap();
            let mut record = record_in(temp.path());
            let mut t = MemoryTransport::new();

            let outcome = stream_dump(&mut record, &mut t).unwrap();
            assert_eq!(outcome, DumpOutcome::Empty { drained: false });
            assert!(t.buffer.is_empty());
        }

        #[test]
        fn first_dump_skips_pcap_header() {
            let temp = TempDir::new().unwrap();
            let path = write_capture(temp.path(), "0", 0, 100);
            let mut record = record_in(temp.path());
            let mut t = MemoryTransport::new();

            let outcome = stream_dump(&mut record, &mut t).unwrap();
            assert_eq!(
                outcome,
                DumpOutcome::Sent { abs_offset: 0, size: 100, drained: false }
            );
            let (header, body) = t.split_reply().unwrap();
            assert_eq!(header, "0 0 attach 100");
            assert_eq!(body.len(), 100);
            assert_eq!(body[0], 0);
            assert_eq!(body[99], 99);

            assert_eq!(record.abs_offset, 100);
            assert_eq!(record.read_cursor, 124);
            assert!(path.exists());
        }

        #[test]
        fn nothing_new_after_full_read() {
            let temp = TempDir::new().unwrap();
            write_capture(temp.path(), "0", 0, 10);
            let mut record = record_in(temp.path());
            let mut t = MemoryTransport::new();

            stream_dump(&mut record, &mut t).unwrap();
            t.clear();
            let outcome = stream_dump(&mut record, &mut t).unwrap();
            assert_eq!(outcome, DumpOutcome::Empty { drained: false });
            assert!(!record.state.has_logs);
        }

        #[test]
        fn successive_dumps_are_contiguous() {
            let temp = TempDir::new().unwrap();
            let path = write_capture(temp.path(), "0", 0, 10);
            let mut record = record_in(temp.path());
            let mut t = MemoryTransport::new();
            stream_dump(&mut record, &mut t).unwrap();

            // The worker appends more bytes.
            let mut data = fs::read(&path).unwrap();
            data.extend_from_slice(&[10, 11, 12, 13, 14]);
            fs::write(&path, data).unwrap();

            t.clear();
            let outcome = stream_dump(&mut record, &mut t).unwrap();
            assert_eq!(
                outcome,
                DumpOutcome::Sent { abs_offset: 10, size: 5, drained: false }
            );
            assert_eq!(t.split_reply().unwrap().1, &[10, 11, 12, 13, 14]);
        }

        #[test]
        fn rotated_away_file_is_replaced() {
            let temp = TempDir::new().unwrap();
            write_capture(temp.path(), "0", 0, 10);
            let mut record = record_in(temp.path());
            let mut t = MemoryTransport::new();
            stream_dump(&mut record, &mut t).unwrap();

            // Rotation deleted "0" and "100" while nobody was reading.
            fs::remove_file(temp.path().join("0")).unwrap();
            write_capture(temp.path(), "200", 7, 3);

            t.clear();
            stream_dump(&mut record, &mut t).unwrap();
            assert_eq!(t.split_reply().unwrap().0, "0 200 attach 3");
            assert_eq!(record.abs_offset, 203);
            assert_eq!(record.current_file, Some(temp.path().join("200")));
        }

        #[test]
        fn finished_file_is_unlinked_when_newer_exists() {
            let temp = TempDir::new().unwrap();
            let first = write_capture(temp.path(), "0", 0, 8);
            write_capture(temp.path(), "8", 8, 4);
            let mut record = record_in(temp.path());
            let mut t = MemoryTransport::new();

            stream_dump(&mut record, &mut t).unwrap();
            assert!(!first.exists());
            assert!(record.state.has_logs);

            t.clear();
            stream_dump(&mut record, &mut t).unwrap();
            assert_eq!(t.split_reply().unwrap().0, "0 8 attach 4");
            assert!(!record.state.has_logs);
            assert!(temp.path().join("8").exists());
        }

        #[test]
        fn exhausted_file_gives_way_to_next() {
            let temp = TempDir::new().unwrap();
            let first = write_capture(temp.path(), "0", 0, 10);
            let mut record = record_in(temp.path());
            let mut t = MemoryTransport::new();
            stream_dump(&mut record, &mut t).unwrap();
            assert!(first.exists());

            write_capture(temp.path(), "16777216", 0, 512);
            t.clear();
            let outcome = stream_dump(&mut record, &mut t).unwrap();
            assert_eq!(
                outcome,
                DumpOutcome::Sent { abs_offset: 16777216, size: 512, drained: false }
            );
            assert_eq!(t.split_reply().unwrap().0, "0 16777216 attach 512");
            assert!(!first.exists());
            assert!(!record.state.has_logs);
        }

        #[test]
        fn clamped_dump_keeps_file_and_continues() {
            let temp = TempDir::new().unwrap();
            let first = write_capture(temp.path(), "0", 0, 25);
            write_capture(temp.path(), "25", 100, 5);
            let mut record = record_in(temp.path());
            let mut t = MemoryTransport::new();

            let outcome = stream_dump_capped(&mut record, &mut t, 10).unwrap();
            assert_eq!(
                outcome,
                DumpOutcome::Sent { abs_offset: 0, size: 10, drained: false }
            );
            let (header, body) = t.split_reply().unwrap();
            assert_eq!(header, "0 0 attach 10");
            assert_eq!(body, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
            assert!(first.exists());
            assert!(record.state.has_logs);

            t.clear();
            stream_dump_capped(&mut record, &mut t, 10).unwrap();
            let (header, body) = t.split_reply().unwrap();
            assert_eq!(header, "0 10 attach 10");
            assert_eq!(body[0], 10);
            assert!(first.exists());

            t.clear();
            stream_dump_capped(&mut record, &mut t, 10).unwrap();
            assert_eq!(t.split_reply().unwrap().0, "0 20 attach 5");
            assert!(!first.exists());
            assert!(record.state.has_logs);

            t.clear();
            stream_dump_capped(&mut record, &mut t, 10).unwrap();
            let (header, body) = t.split_reply().unwrap();
            assert_eq!(header, "0 25 attach 5");
            assert_eq!(body, &[100, 101, 102, 103, 104]);
            assert!(!record.state.has_logs);
        }

        #[test]
        fn retired_header_only_file_is_released() {
            let temp = TempDir::new().unwrap();
            write_capture(temp.path(), "0", 0, 0);
            let mut record = record_in(temp.path());
            record.state.pending_delete = true;
            let mut t = MemoryTransport::new();

            let outcome = stream_dump(&mut record, &mut t).unwrap();
            assert_eq!(outcome, DumpOutcome::Empty { drained: true });
            assert!(t.buffer.is_empty());
            assert!(!temp.path().join("0").exists());
        }

        #[test]
        fn retired_record_drains_and_reports() {
            let temp = TempDir::new().unwrap();
            write_capture(temp.path(), "0", 0, 8);
            let mut record = record_in(temp.path());
            record.state.pending_delete = true;
            let mut t = MemoryTransport::new();

            let outcome = stream_dump(&mut record, &mut t).unwrap();
            assert!(outcome.drained());
            assert!(!temp.path().join("0").exists());

            let outcome = stream_dump(&mut record, &mut t).unwrap();
            assert_eq!(outcome, DumpOutcome::Empty { drained: true });
        }

        #[test]
        fn short_write_is_retried_under_lock() {
            let temp = TempDir::new().unwrap();
            write_capture(temp.path(), "0", 0, 200);
            let mut record = record_in(temp.path());
            let mut t = MemoryTransport::new().with_short_writes(&[70]);

            stream_dump(&mut record, &mut t).unwrap();
            let (header, body) = t.split_reply().unwrap();
            assert_eq!(header, "0 0 attach 200");
            assert_eq!(body.len(), 200);
            assert_eq!(body[70], 70);
            assert_eq!(record.read_cursor, 224);
        }

        #[test]
        fn failed_retry_keeps_cursors() {
            let temp = TempDir::new().unwrap();
            write_capture(temp.path(), "0", 0, 200);
            let mut record = record_in(temp.path());
            let mut t = MemoryTransport::new().with_short_writes(&[70, 10]);

            let err = stream_dump(&mut record, &mut t).unwrap_err();
            assert!(matches!(
                err,
                SnifferError::TransportShortWrite { sent: 80, expected: 200 }
            ));
            assert_eq!(record.read_cursor, PCAP_HEADER_SIZE);
            assert_eq!(record.abs_offset, 0);
        }
    }

    #[cfg(unix)]
    mod worker_lock_tests {
        use super::*;
        use std::io::Write;
        use std::process::{Command, Stdio};
        use std::thread;
        use std::time::{Duration, Instant};

        const HOLDER_ENV: &str = "TE_SNIFFER_LOCK_HOLDER";

        /// Created next to the capture directory once the lock is held.
        fn lock_marker(capture: &Path) -> PathBuf {
            capture.parent().unwrap().with_extension("locked")
        }

        /// Stands in for a capture worker when re-run with `HOLDER_ENV` set:
        /// holds the write lock for a while and appends under it.
        #[test]
        fn hold_capture_lock() {
            let Some(path) = std::env::var_os(HOLDER_ENV).map(PathBuf::from) else {
                return;
            };
            let file = OpenOptions::new().read(true).append(true).open(&path).unwrap();
            let lock = CaptureLock::acquire(&file).unwrap();
            fs::write(lock_marker(&path), b"").unwrap();
            thread::sleep(Duration::from_millis(500));
            (&file).write_all(&[1, 2, 3, 4, 5, 6]).unwrap();
            drop(lock);
        }

        #[test]
        fn offset_waits_for_worker_lock() {
            let temp = TempDir::new().unwrap();
            let dir = temp.path().join("s1");
            fs::create_dir(&dir).unwrap();
            let path = write_capture(&dir, "0", 0, 10);
            let marker = lock_marker(&path);
            let mut record = record_in(&dir);

            let mut worker = Command::new(std::env::current_exe().unwrap())
                .args([
                    "--exact",
                    "streamer::tests::worker_lock_tests::hold_capture_lock",
                    "--test-threads=1",
                ])
                .env(HOLDER_ENV, &path)
                .stdout(Stdio::null())
                .spawn()
                .unwrap();

            let deadline = Instant::now() + Duration::from_secs(10);
            while !marker.exists() {
                assert!(Instant::now() < deadline, "worker never took the lock");
                thread::sleep(Duration::from_millis(10));
            }

            // Reading without the lock would see only the first 10 bytes.
            assert_eq!(current_offset(&mut record).unwrap(), 16);
            assert!(record.state.has_logs);
            assert!(worker.wait().unwrap().success());
        }
    }

    mod list_tests {
        use super::*;

        fn split(buf: &[u8]) -> Vec<String> {
            buf.split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8(s.to_vec()).unwrap())
                .collect()
        }

        #[test]
        fn nosync_lists_started_live_records() {
            let temp = TempDir::new().unwrap();
            let mut reg = Registry::new();
            let mut started = record_in(temp.path());
            started.abs_offset = 77;
            reg.insert(started).unwrap();

            let defaults = GlobalSettings::new("ta", "/tmp/agent").sniffer_defaults();
            reg.insert(SnifferRecord::new(SnifferId::new("idle", "eth0", 1), defaults))
                .unwrap();

            let buf = list_with_offsets(&mut reg, false);
            assert_eq!(split(&buf), vec!["s1 eth0 0 77".to_string()]);
            assert_eq!(*buf.last().unwrap(), 0);
        }

        #[test]
        fn sync_lists_only_records_with_new_data() {
            let temp = TempDir::new().unwrap();
            write_capture(temp.path(), "0", 0, 30);
            let mut reg = Registry::new();
            let key = reg.insert(record_in(temp.path())).unwrap();

            assert_eq!(split(&list_with_offsets(&mut reg, true)), vec!["s1 eth0 0 30".to_string()]);

            reg.get_mut(key).unwrap().abs_offset = 30;
            assert!(list_with_offsets(&mut reg, true).is_empty());
        }
    }
}
