//! Sniffer lifecycle: output directories, worker argv, start/stop and the
//! resume-from-backup probe.
//!
//! ```text
//! add ──▶ Configured ──enable=1──▶ Running ──enable=0──▶ Retired ──drained──▶ Released
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::capture::{pick_extreme, Extreme, PCAP_HEADER_SIZE};
use crate::error::{Result, SnifferError};
use crate::settings::{GlobalSettings, OverfillMethod};
use crate::sniffer::{SnifferConfig, SnifferId, SnifferRecord};
use crate::supervisor::Supervisor;

/// Name the worker is started under.
pub const WORKER_NAME: &str = "te_sniffer_process";

/// Output directory of one sniffer incarnation.
pub fn sniffer_dir(settings: &GlobalSettings, id: &SnifferId) -> PathBuf {
    settings.sniffers_dir().join(format!(
        "{}_{}_{}_{}",
        settings.ta_name(),
        id.ifname,
        id.name,
        id.ssn
    ))
}

/// Create the output root, the sniffers directory and the sniffer directory.
pub fn make_dir(settings: &GlobalSettings, id: &SnifferId) -> Result<PathBuf> {
    let dir = sniffer_dir(settings, id);
    fs::create_dir_all(&dir).map_err(|e| {
        error!("Couldn't create sniffer directory {}: {}", dir.display(), e);
        SnifferError::Io(e)
    })?;
    Ok(dir)
}

/// Worker argument vector, `argv[0]` included.
pub fn build_argv(id: &SnifferId, config: &SnifferConfig, dir: &Path) -> Vec<String> {
    // The worker appends file names to -P verbatim, so it needs the slash.
    let mut out_dir = dir.display().to_string();
    if !out_dir.ends_with('/') {
        out_dir.push('/');
    }

    let mut argv = vec![
        WORKER_NAME.to_string(),
        "-i".to_string(),
        id.ifname.clone(),
        "-s".to_string(),
        config.snaplen.to_string(),
        "-f".to_string(),
        config.filter_exp_str.clone(),
        "-P".to_string(),
        out_dir,
        "-c".to_string(),
        config.sniffer_space.to_string(),
        "-C".to_string(),
        config.file_size.to_string(),
        "-q".to_string(),
        id.ssn.to_string(),
        "-a".to_string(),
        id.name.clone(),
    ];
    match config.overfill {
        OverfillMethod::TailDrop => argv.push("-o".to_string()),
        OverfillMethod::Rotation => {
            argv.push("-r".to_string());
            argv.push(config.rotation.to_string());
        }
    }
    argv.push("-p".to_string());
    argv
}

/// Launch the worker for a configured record and move it to Running.
///
/// On failure the record is left untouched.
pub fn start(
    settings: &GlobalSettings,
    record: &mut SnifferRecord,
    supervisor: &mut dyn Supervisor,
) -> Result<()> {
    let dir = make_dir(settings, &record.id)?;
    let argv = build_argv(&record.id, &record.config, &dir);
    debug!("Starting sniffer worker: {:?}", argv);

    let pid = supervisor.start(&argv).map_err(|e| {
        warn!("Couldn't start the sniffer process {}: {}", record.id, e);
        SnifferError::WorkerStartFailed(format!("{}: {}", record.id, e))
    })?;

    info!("The sniffer process {} started, pid {}", record.id, pid);
    record.pid = Some(pid);
    record.enabled = true;
    record.state.started = true;
    record.dir = Some(dir);
    Ok(())
}

/// Kill the worker of a running record. The record is marked stopped even
/// when the kill itself fails.
pub fn stop(record: &mut SnifferRecord, supervisor: &mut dyn Supervisor) {
    if let Some(pid) = record.pid.take() {
        match supervisor.kill(pid) {
            Ok(()) => info!("The sniffer process {} stopped, pid {}", record.id, pid),
            Err(e) => warn!("Couldn't kill sniffer process {} (pid {}): {}", record.id, pid, e),
        }
    }
    record.enabled = false;
}

/// Find leftover output directories of earlier incarnations of
/// (ifname, name), returned as (ssn, directory) pairs sorted by ssn.
pub fn find_backups(
    settings: &GlobalSettings,
    ifname: &str,
    name: &str,
) -> Result<Vec<(u32, PathBuf)>> {
    let root = settings.sniffers_dir();
    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let pattern = format!(
        r"^{}_{}_{}_(\d+)$",
        regex::escape(settings.ta_name()),
        regex::escape(ifname),
        regex::escape(name)
    );
    let re = Regex::new(&pattern)
        .map_err(|e| SnifferError::Invalid(format!("backup directory pattern: {}", e)))?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().to_string();
        let Some(caps) = re.captures(&dir_name) else {
            continue;
        };
        match caps[1].parse::<u32>() {
            Ok(ssn) => found.push((ssn, entry.path())),
            Err(_) => debug!("Ignoring directory with oversized SSN: {}", dir_name),
        }
    }
    found.sort_by_key(|(ssn, _)| *ssn);
    Ok(found)
}

/// Build a PendingDelete record owning the capture files left in `dir`,
/// or `None` when the directory holds none.
pub fn resume_from_backup(
    id: SnifferId,
    config: SnifferConfig,
    dir: &Path,
) -> Result<Option<SnifferRecord>> {
    let Some(oldest) = pick_extreme(dir, Extreme::Oldest)? else {
        return Ok(None);
    };

    let mut record = SnifferRecord::new(id, config);
    record.state.started = true;
    record.state.pending_delete = true;
    record.current_file = Some(oldest.path);
    record.read_cursor = PCAP_HEADER_SIZE;
    record.abs_offset = oldest.base_offset;
    record.dir = Some(dir.to_path_buf());

    info!(
        "Resuming sniffer {} from backup {} ({} files)",
        record.id,
        dir.display(),
        oldest.count
    );
    Ok(Some(record))
}
