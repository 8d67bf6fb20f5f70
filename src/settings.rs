//! Agent-wide sniffer settings.
//!
//! One instance per agent. The defaults seed every new sniffer record and
//! are frozen once any sniffer has been started (or `enable` is set).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::info;

use crate::error::{Result, SnifferError};
use crate::sniffer::SnifferConfig;

/// Default per-agent disk budget passed to workers (MiB).
pub const DEFAULT_TOTAL_SIZE: u64 = 256;
/// Default per-sniffer disk budget (MiB).
pub const DEFAULT_SNIFFER_SPACE: u64 = 64;
/// Default capture file size cap (MiB).
pub const DEFAULT_FILE_SIZE: u64 = 16;
/// Default number of files kept under rotation.
pub const DEFAULT_ROTATION: u32 = 4;

const SSN_FILE_SUFFIX: &str = "next_sniffer_ssn";

/// What the worker does when the sniffer budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverfillMethod {
    /// Delete the oldest capture file.
    #[default]
    Rotation,
    /// Stop recording new packets.
    TailDrop,
}

impl OverfillMethod {
    pub fn as_value(self) -> u8 {
        match self {
            OverfillMethod::Rotation => 0,
            OverfillMethod::TailDrop => 1,
        }
    }
}

impl FromStr for OverfillMethod {
    type Err = SnifferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0" => Ok(OverfillMethod::Rotation),
            "1" => Ok(OverfillMethod::TailDrop),
            other => Err(SnifferError::Invalid(format!(
                "overfill method must be 0 or 1, got '{}'",
                other
            ))),
        }
    }
}

/// Keys of the `settings/...` subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    Enable,
    Snaplen,
    TotalSize,
    FileSize,
    Rotation,
    OverfillMeth,
    Path,
    FilterExpStr,
    FilterExpFile,
}

impl FromStr for SettingKey {
    type Err = SnifferError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "enable" => SettingKey::Enable,
            "snaplen" => SettingKey::Snaplen,
            "total_size" => SettingKey::TotalSize,
            "file_size" => SettingKey::FileSize,
            "rotation" => SettingKey::Rotation,
            "overfill_meth" => SettingKey::OverfillMeth,
            "path" => SettingKey::Path,
            "filter_exp_str" => SettingKey::FilterExpStr,
            "filter_exp_file" => SettingKey::FilterExpFile,
            _ => return Err(SnifferError::NotFound(format!("setting '{}'", s))),
        })
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettingKey::Enable => "enable",
            SettingKey::Snaplen => "snaplen",
            SettingKey::TotalSize => "total_size",
            SettingKey::FileSize => "file_size",
            SettingKey::Rotation => "rotation",
            SettingKey::OverfillMeth => "overfill_meth",
            SettingKey::Path => "path",
            SettingKey::FilterExpStr => "filter_exp_str",
            SettingKey::FilterExpFile => "filter_exp_file",
        };
        f.write_str(name)
    }
}

/// Parse a 0/1 flag.
pub(crate) fn parse_flag(value: &str) -> Result<bool> {
    match value.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(SnifferError::Invalid(format!(
            "expected 0 or 1, got '{}'",
            other
        ))),
    }
}

/// Parse an unsigned decimal value.
pub(crate) fn parse_number<T: FromStr>(value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SnifferError::Invalid(format!("expected an unsigned number, got '{}'", value)))
}

/// Parse a rotation count (at least one file).
pub(crate) fn parse_rotation(value: &str) -> Result<u32> {
    let rotation: u32 = parse_number(value)?;
    if rotation == 0 {
        return Err(SnifferError::Invalid("rotation must be at least 1".to_string()));
    }
    Ok(rotation)
}

/// Settings shared by all sniffers of the agent.
#[derive(Debug, Clone)]
pub struct GlobalSettings {
    /// Test agent name, used in file and directory names.
    ta_name: String,
    /// Agent-private directory holding the SSN file.
    private_dir: PathBuf,
    enabled: bool,
    snaplen: u32,
    total_size: u64,
    file_size: u64,
    rotation: u32,
    overfill: OverfillMethod,
    /// Output root; sniffer directories go under `<path>/sniffers`.
    path: PathBuf,
    filter_exp_str: String,
    filter_exp_file: String,
    locked: bool,
}

impl GlobalSettings {
    pub fn new(ta_name: impl Into<String>, private_dir: impl AsRef<Path>) -> Self {
        let private_dir = private_dir.as_ref().to_path_buf();
        Self {
            ta_name: ta_name.into(),
            path: private_dir.clone(),
            private_dir,
            enabled: false,
            snaplen: 0,
            total_size: DEFAULT_TOTAL_SIZE,
            file_size: DEFAULT_FILE_SIZE,
            rotation: DEFAULT_ROTATION,
            overfill: OverfillMethod::Rotation,
            filter_exp_str: String::new(),
            filter_exp_file: String::new(),
            locked: false,
        }
    }

    pub fn ta_name(&self) -> &str {
        &self.ta_name
    }

    pub fn private_dir(&self) -> &Path {
        &self.private_dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding one sub-directory per sniffer.
    pub fn sniffers_dir(&self) -> PathBuf {
        self.path.join("sniffers")
    }

    /// Path of the persisted SSN counter.
    pub fn ssn_file(&self) -> PathBuf {
        self.private_dir
            .join(format!("{}_{}", self.ta_name, SSN_FILE_SUFFIX))
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Freeze the settings. Called the first time a sniffer starts.
    pub fn lock(&mut self) {
        if !self.locked {
            info!("Sniffer settings locked");
            self.locked = true;
        }
    }

    /// Configuration a freshly added sniffer starts from.
    pub fn sniffer_defaults(&self) -> SnifferConfig {
        SnifferConfig {
            filter_exp_str: self.filter_exp_str.clone(),
            filter_exp_file: self.filter_exp_file.clone(),
            snaplen: self.snaplen,
            sniffer_space: DEFAULT_SNIFFER_SPACE,
            file_size: self.file_size,
            rotation: self.rotation,
            overfill: self.overfill,
        }
    }

    pub fn get(&self, key: SettingKey) -> String {
        match key {
            SettingKey::Enable => u8::from(self.enabled).to_string(),
            SettingKey::Snaplen => self.snaplen.to_string(),
            SettingKey::TotalSize => self.total_size.to_string(),
            SettingKey::FileSize => self.file_size.to_string(),
            SettingKey::Rotation => self.rotation.to_string(),
            SettingKey::OverfillMeth => self.overfill.as_value().to_string(),
            SettingKey::Path => self.path.display().to_string(),
            SettingKey::FilterExpStr => self.filter_exp_str.clone(),
            SettingKey::FilterExpFile => self.filter_exp_file.clone(),
        }
    }

    /// Change a setting. Rejected with `Busy` once locked.
    pub fn set(&mut self, key: SettingKey, value: &str) -> Result<()> {
        if self.locked {
            return Err(SnifferError::Busy(format!(
                "sniffer settings are locked, cannot change '{}'",
                key
            )));
        }

        match key {
            SettingKey::Enable => {
                self.enabled = parse_flag(value)?;
                if self.enabled {
                    self.lock();
                }
            }
            SettingKey::Snaplen => self.snaplen = parse_number(value)?,
            SettingKey::TotalSize => self.total_size = parse_number(value)?,
            SettingKey::FileSize => self.file_size = parse_number(value)?,
            SettingKey::Rotation => self.rotation = parse_rotation(value)?,
            SettingKey::OverfillMeth => self.overfill = value.parse()?,
            SettingKey::Path => {
                if value.trim().is_empty() {
                    return Err(SnifferError::Invalid("empty output path".to_string()));
                }
                self.path = PathBuf::from(value.trim());
            }
            SettingKey::FilterExpStr => self.filter_exp_str = value.to_string(),
            SettingKey::FilterExpFile => self.filter_exp_file = value.to_string(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> GlobalSettings {
        GlobalSettings::new("ta", "/tmp/agent")
    }

    #[test]
    fn defaults() {
        let s = settings();
        assert_eq!(s.get(SettingKey::Enable), "0");
        assert_eq!(s.get(SettingKey::Snaplen), "0");
        assert_eq!(s.get(SettingKey::TotalSize), "256");
        assert_eq!(s.get(SettingKey::FileSize), "16");
        assert_eq!(s.get(SettingKey::Rotation), "4");
        assert_eq!(s.get(SettingKey::OverfillMeth), "0");
        assert_eq!(s.get(SettingKey::Path), "/tmp/agent");
        assert_eq!(s.get(SettingKey::FilterExpStr), "");
        assert!(!s.is_locked());
    }

    #[test]
    fn derived_paths() {
        let s = settings();
        assert_eq!(s.sniffers_dir(), PathBuf::from("/tmp/agent/sniffers"));
        assert_eq!(s.ssn_file(), PathBuf::from("/tmp/agent/ta_next_sniffer_ssn"));
    }

    #[test]
    fn set_and_get_values() {
        let mut s = settings();
        s.set(SettingKey::Snaplen, "1500").unwrap();
        s.set(SettingKey::OverfillMeth, "1").unwrap();
        s.set(SettingKey::FilterExpStr, "tcp port 80").unwrap();
        s.set(SettingKey::Path, "/var/tmp/out").unwrap();

        assert_eq!(s.get(SettingKey::Snaplen), "1500");
        assert_eq!(s.get(SettingKey::OverfillMeth), "1");
        assert_eq!(s.get(SettingKey::FilterExpStr), "tcp port 80");
        assert_eq!(s.sniffers_dir(), PathBuf::from("/var/tmp/out/sniffers"));
    }

    #[test]
    fn defaults_flow_into_sniffer_config() {
        let mut s = settings();
        s.set(SettingKey::FilterExpStr, "udp").unwrap();
        s.set(SettingKey::Rotation, "9").unwrap();

        let config = s.sniffer_defaults();
        assert_eq!(config.filter_exp_str, "udp");
        assert_eq!(config.rotation, 9);
        assert_eq!(config.sniffer_space, DEFAULT_SNIFFER_SPACE);
    }

    #[test]
    fn malformed_values_are_invalid() {
        let mut s = settings();
        assert!(matches!(s.set(SettingKey::Snaplen, "abc"), Err(SnifferError::Invalid(_))));
        assert!(matches!(s.set(SettingKey::Rotation, "0"), Err(SnifferError::Invalid(_))));
        assert!(matches!(s.set(SettingKey::OverfillMeth, "2"), Err(SnifferError::Invalid(_))));
        assert!(matches!(s.set(SettingKey::Enable, "yes"), Err(SnifferError::Invalid(_))));
    }

    #[test]
    fn enable_locks_everything() {
        let mut s = settings();
        s.set(SettingKey::Enable, "1").unwrap();
        assert!(s.is_locked());

        assert!(matches!(s.set(SettingKey::Snaplen, "10"), Err(SnifferError::Busy(_))));
        assert!(matches!(s.set(SettingKey::Enable, "0"), Err(SnifferError::Busy(_))));
        assert_eq!(s.get(SettingKey::Enable), "1");
        assert_eq!(s.get(SettingKey::Snaplen), "0");
    }

    #[test]
    fn unknown_key() {
        assert!("tmp_logs".parse::<SettingKey>().is_err());
        assert_eq!("overfill_meth".parse::<SettingKey>().unwrap(), SettingKey::OverfillMeth);
    }
}
