//! The sniffer manager core.
//!
//! `SnifferCore` owns the global settings, the registry, the SSN allocator
//! and the worker supervisor. Every controller operation is a method on it;
//! callers serialize access.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::capture::index;
use crate::error::{Result, SnifferError};
use crate::lifecycle;
use crate::registry::{RecordKey, Registry};
use crate::settings::{parse_flag, GlobalSettings, SettingKey};
use crate::sniffer::{SnifferField, SnifferId, SnifferRecord, SnifferState};
use crate::ssn::SsnAllocator;
use crate::streamer::{self, DumpOutcome};
use crate::supervisor::Supervisor;
use crate::transport::Transport;

pub struct SnifferCore {
    settings: GlobalSettings,
    registry: Registry,
    ssn: SsnAllocator,
    supervisor: Box<dyn Supervisor>,
}

/// Reject names that would not survive the "<name> <ifname> <ssn>" form or
/// a directory name.
fn check_name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '/') {
        return Err(SnifferError::Invalid(format!("bad {} '{}'", what, value)));
    }
    Ok(())
}

/// Whether a sniffer directory still holds capture files. An unreadable
/// directory counts as non-empty so nothing is thrown away.
fn has_capture_files(dir: Option<&Path>) -> bool {
    match dir {
        Some(dir) => index::count(dir).map_or(true, |n| n > 0),
        None => false,
    }
}

impl SnifferCore {
    pub fn new(
        ta_name: impl Into<String>,
        private_dir: impl AsRef<Path>,
        supervisor: Box<dyn Supervisor>,
    ) -> Self {
        let settings = GlobalSettings::new(ta_name, private_dir.as_ref());
        let ssn = SsnAllocator::new(settings.private_dir(), settings.ssn_file());
        Self {
            settings,
            registry: Registry::new(),
            ssn,
            supervisor,
        }
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn get_setting(&self, key: SettingKey) -> String {
        self.settings.get(key)
    }

    pub fn set_setting(&mut self, key: SettingKey, value: &str) -> Result<()> {
        self.settings.set(key, value)?;
        debug!("Sniffer setting {} = '{}'", key, value);
        Ok(())
    }

    fn live_key(&self, ifname: &str, name: &str) -> Result<RecordKey> {
        self.registry
            .find(ifname, name)
            .ok_or_else(|| SnifferError::NotFound(format!("sniffer {} on {}", name, ifname)))
    }

    fn live_record(&self, ifname: &str, name: &str) -> Result<&SnifferRecord> {
        let key = self.live_key(ifname, name)?;
        self.registry
            .get(key)
            .ok_or_else(|| SnifferError::NotFound(format!("sniffer {} on {}", name, ifname)))
    }

    /// Allocate an SSN no record of (ifname, name) uses and not in `avoid`.
    fn allocate_ssn(&self, ifname: &str, name: &str, avoid: &[u32]) -> Result<u32> {
        loop {
            let ssn = self.ssn.allocate()?;
            if !self.registry.ssn_in_use(ifname, name, ssn) && !avoid.contains(&ssn) {
                return Ok(ssn);
            }
            debug!("SSN {} already used by {} on {}, skipping", ssn, name, ifname);
        }
    }

    /// Register a new sniffer on `ifname`.
    ///
    /// Output directories left by earlier incarnations of the same sniffer
    /// are picked up as retired records so their backlog can be drained.
    pub fn add_sniffer(&mut self, ifname: &str, name: &str) -> Result<SnifferId> {
        check_name("interface name", ifname)?;
        check_name("sniffer name", name)?;
        if self.registry.find(ifname, name).is_some() {
            return Err(SnifferError::Exists(format!("sniffer {} on {}", name, ifname)));
        }

        let backups = lifecycle::find_backups(&self.settings, ifname, name)?;
        let taken: Vec<u32> = backups.iter().map(|(ssn, _)| *ssn).collect();
        let ssn = self.allocate_ssn(ifname, name, &taken)?;

        for (backup_ssn, dir) in backups {
            let id = SnifferId::new(name, ifname, backup_ssn);
            if self.registry.find_by_id(&id).is_some() {
                continue;
            }
            match lifecycle::resume_from_backup(id, self.settings.sniffer_defaults(), &dir) {
                Ok(Some(clone)) => {
                    self.registry.insert(clone)?;
                }
                Ok(None) => debug!("Backup directory {} holds no captures", dir.display()),
                Err(e) => warn!("Couldn't resume from backup {}: {}", dir.display(), e),
            }
        }

        let record = SnifferRecord::new(
            SnifferId::new(name, ifname, ssn),
            self.settings.sniffer_defaults(),
        );
        let id = record.id.clone();
        self.registry.insert(record)?;
        info!("Added sniffer {}", id);
        Ok(id)
    }

    /// Retire a sniffer. A running worker is killed; the record stays
    /// reachable by id until its backlog is drained.
    pub fn delete_sniffer(&mut self, ifname: &str, name: &str) -> Result<()> {
        let key = self.live_key(ifname, name)?;
        let Some(record) = self.registry.get_mut(key) else {
            return Err(SnifferError::NotFound(format!("sniffer {} on {}", name, ifname)));
        };

        if record.enabled {
            lifecycle::stop(record, self.supervisor.as_mut());
        }
        if let Err(e) = streamer::current_offset(record) {
            warn!("Couldn't probe offset of deleted sniffer {}: {}", record.id, e);
        }
        let has_files = has_capture_files(record.dir.as_deref());

        self.registry.mark_pending_delete(key)?;
        if !has_files {
            if let Some(record) = self.registry.release(key) {
                streamer::purge(&record);
                info!("Deleted sniffer {}", record.id);
            }
        } else {
            info!("Sniffer {} {} retired with backlog", name, ifname);
        }
        Ok(())
    }

    /// Names of the live sniffers on `ifname`.
    pub fn list_sniffers(&self, ifname: &str) -> Vec<String> {
        self.registry.list(ifname)
    }

    pub fn sniffer_ssn(&self, ifname: &str, name: &str) -> Result<u32> {
        Ok(self.live_record(ifname, name)?.id.ssn)
    }

    pub fn get_sniffer_field(&self, ifname: &str, name: &str, field: SnifferField) -> Result<String> {
        Ok(self.live_record(ifname, name)?.get(field))
    }

    pub fn set_sniffer_field(
        &mut self,
        ifname: &str,
        name: &str,
        field: SnifferField,
        value: &str,
    ) -> Result<()> {
        if field == SnifferField::Enable {
            return self.set_enable(ifname, name, parse_flag(value)?);
        }
        let key = self.live_key(ifname, name)?;
        let record = self
            .registry
            .get_mut(key)
            .ok_or_else(|| SnifferError::NotFound(format!("sniffer {} on {}", name, ifname)))?;
        record.set(field, value)
    }

    /// Start or stop the worker of a live sniffer.
    pub fn set_enable(&mut self, ifname: &str, name: &str, enable: bool) -> Result<()> {
        let key = self.live_key(ifname, name)?;
        let enabled = self.registry.get(key).is_some_and(|r| r.enabled);
        if enabled == enable {
            if enable {
                warn!("The sniffer {} ({}) is already running", name, ifname);
            }
            return Ok(());
        }

        if enable {
            self.enable(key)
        } else {
            self.disable(key, ifname, name)
        }
    }

    fn enable(&mut self, key: RecordKey) -> Result<()> {
        let record = self
            .registry
            .get_mut(key)
            .ok_or_else(|| SnifferError::NotFound("sniffer to enable".to_string()))?;
        lifecycle::start(&self.settings, record, self.supervisor.as_mut())?;
        self.settings.lock();
        Ok(())
    }

    fn disable(&mut self, key: RecordKey, ifname: &str, name: &str) -> Result<()> {
        // Allocate first so a counter failure leaves the sniffer untouched.
        let ssn = self.allocate_ssn(ifname, name, &[])?;

        let record = self
            .registry
            .get_mut(key)
            .ok_or_else(|| SnifferError::NotFound("sniffer to disable".to_string()))?;
        lifecycle::stop(record, self.supervisor.as_mut());
        let dir = record.dir.clone();

        if has_capture_files(dir.as_deref()) {
            let clone = self.registry.insert_retirement_clone(key)?;
            debug!("Retirement clone {:?} holds the backlog", clone);
        } else if let Some(dir) = &dir {
            if let Err(e) = index::purge_dir(dir) {
                warn!("Couldn't remove empty sniffer directory {}: {}", dir.display(), e);
            }
        }

        if let Some(record) = self.registry.get_mut(key) {
            record.reset_cursors();
            record.state = SnifferState {
                started: true,
                ..SnifferState::default()
            };
        }
        self.registry.reassign_ssn(key, ssn)?;
        info!("The sniffer {} ({}) stopped, next SSN {}", name, ifname, ssn);
        Ok(())
    }

    fn key_by_id(&self, id: &SnifferId) -> Result<RecordKey> {
        self.registry
            .find_by_id(id)
            .ok_or_else(|| SnifferError::NotFound(format!("sniffer {}", id)))
    }

    pub fn record(&self, id: &SnifferId) -> Option<&SnifferRecord> {
        self.registry.find_by_id(id).and_then(|key| self.registry.get(key))
    }

    /// Absolute offset the worker of `id` has written up to.
    pub fn current_offset(&mut self, id: &SnifferId) -> Result<u64> {
        let key = self.key_by_id(id)?;
        let record = self
            .registry
            .get_mut(key)
            .ok_or_else(|| SnifferError::NotFound(format!("sniffer {}", id)))?;
        streamer::current_offset(record)
    }

    pub fn list_with_offsets(&mut self, sync: bool) -> Vec<u8> {
        streamer::list_with_offsets(&mut self.registry, sync)
    }

    /// Send the next chunk of capture bytes of `id`.
    ///
    /// Returns the absolute offset and size of what was sent, or `NoData`.
    /// A retired record whose directory is empty is released here.
    pub fn stream_dump(&mut self, id: &SnifferId, transport: &mut dyn Transport) -> Result<(u64, u64)> {
        let key = self.key_by_id(id)?;
        let record = self
            .registry
            .get_mut(key)
            .ok_or_else(|| SnifferError::NotFound(format!("sniffer {}", id)))?;
        let outcome = streamer::stream_dump(record, transport)?;

        if outcome.drained() {
            if let Some(record) = self.registry.release(key) {
                streamer::purge(&record);
                info!("Sniffer {} drained and released", record.id);
            }
        }

        match outcome {
            DumpOutcome::Sent {
                abs_offset, size, ..
            } => Ok((abs_offset, size)),
            DumpOutcome::Empty { .. } => Err(SnifferError::NoData),
        }
    }

    /// Stop every worker and remove everything the agent put on disk.
    pub fn shutdown(&mut self) {
        for key in self.registry.keys() {
            if let Some(mut record) = self.registry.release(key) {
                lifecycle::stop(&mut record, self.supervisor.as_mut());
                streamer::purge(&record);
            }
        }

        if let Err(e) = fs::remove_file(self.ssn.path()) {
            debug!("Couldn't remove {}: {}", self.ssn.path().display(), e);
        }
        for dir in [
            self.settings.sniffers_dir(),
            self.settings.path().to_path_buf(),
            self.settings.private_dir().to_path_buf(),
        ] {
            if let Err(e) = fs::remove_dir(&dir) {
                debug!("Couldn't remove {}: {}", dir.display(), e);
            }
        }
        info!("Sniffer manager shut down");
    }
}
