//! Capture-file index for one sniffer directory.
//!
//! The worker names each capture file after the absolute offset at which its
//! pcap body starts (`000000000000_0.pcap`, `16777216`, ...), so ordering the
//! files by that leading number gives oldest and newest.

use std::cmp::Ordering;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, SnifferError};

/// Size of the pcap global header at the start of every capture file.
pub const PCAP_HEADER_SIZE: u64 = 24;

/// Which end of the directory to pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extreme {
    Oldest,
    Newest,
}

/// A capture file picked from a sniffer directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFile {
    /// Absolute path of the file.
    pub path: PathBuf,
    /// Base file name.
    pub name: String,
    /// Absolute offset of the first body byte in this file.
    pub base_offset: u64,
    /// Number of capture files in the directory at scan time.
    pub count: usize,
}

/// Parse the leading decimal token of a capture file name.
pub fn base_offset_of(name: &str) -> Result<u64> {
    let end = name
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(name.len());
    let digits = &name[..end];
    if digits.is_empty() {
        return Err(SnifferError::Invalid(format!(
            "capture file name '{}' has no offset prefix",
            name
        )));
    }
    digits
        .parse()
        .map_err(|_| SnifferError::Invalid(format!("capture file offset out of range: {}", name)))
}

fn order(a: (u64, &str), b: (u64, &str)) -> Ordering {
    a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1))
}

/// Scan `dir` and return the oldest or newest capture file.
///
/// Entries without a numeric prefix are not capture files and are skipped.
/// A missing directory is reported as empty.
pub fn pick_extreme(dir: &Path, which: Extreme) -> Result<Option<CaptureFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            warn!("Couldn't open the sniffer directory {}: {}", dir.display(), e);
            return Err(e.into());
        }
    };

    let mut best: Option<(u64, String)> = None;
    let mut count = 0;

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let offset = match base_offset_of(&name) {
            Ok(offset) => offset,
            Err(_) => {
                debug!("Skipping non-capture entry {}", name);
                continue;
            }
        };
        count += 1;

        let replace = match &best {
            None => true,
            Some((best_off, best_name)) => {
                let cmp = order((offset, &name), (*best_off, best_name));
                match which {
                    Extreme::Oldest => cmp == Ordering::Less,
                    Extreme::Newest => cmp == Ordering::Greater,
                }
            }
        };
        if replace {
            best = Some((offset, name));
        }
    }

    Ok(best.map(|(base_offset, name)| CaptureFile {
        path: dir.join(&name),
        name,
        base_offset,
        count,
    }))
}

/// Number of capture files in `dir`.
pub fn count(dir: &Path) -> Result<usize> {
    Ok(pick_extreme(dir, Extreme::Oldest)?.map_or(0, |f| f.count))
}

/// Unlink a fully drained capture file.
pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed drained capture file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove every capture file in `dir` and then the directory itself.
pub fn purge_dir(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if base_offset_of(&name).is_ok() || name.ends_with(".pcap") {
            remove(&entry.path())?;
        }
    }
    match fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!("Couldn't remove sniffer directory {}: {}", dir.display(), e);
            Err(e.into())
        }
    }
}
