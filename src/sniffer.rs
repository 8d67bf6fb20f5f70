//! Sniffer identity, configuration and per-sniffer record.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use regex::Regex;

use crate::error::{Result, SnifferError};
use crate::settings::{parse_flag, parse_number, parse_rotation, OverfillMethod};

/// Identity of one sniffer incarnation.
///
/// The same (name, ifname) pair may come back after a delete, but only
/// with a fresh SSN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnifferId {
    pub name: String,
    pub ifname: String,
    pub ssn: u32,
}

impl SnifferId {
    pub fn new(name: impl Into<String>, ifname: impl Into<String>, ssn: u32) -> Self {
        Self {
            name: name.into(),
            ifname: ifname.into(),
            ssn,
        }
    }
}

impl fmt::Display for SnifferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.ifname, self.ssn)
    }
}

/// Parse "<name> <ifname> <ssn>".
impl FromStr for SnifferId {
    type Err = SnifferError;

    fn from_str(s: &str) -> Result<Self> {
        let re = Regex::new(r"^\s*(\S+)\s+(\S+)\s+(\d+)\s*$")
            .map_err(|e| SnifferError::Invalid(format!("sniffer id pattern: {}", e)))?;
        let caps = re
            .captures(s)
            .ok_or_else(|| SnifferError::Invalid(format!("malformed sniffer id '{}'", s)))?;
        let ssn = caps[3]
            .parse()
            .map_err(|_| SnifferError::Invalid(format!("sniffer SSN out of range in '{}'", s)))?;
        Ok(SnifferId::new(&caps[1], &caps[2], ssn))
    }
}

/// Per-sniffer worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnifferConfig {
    pub filter_exp_str: String,
    pub filter_exp_file: String,
    pub snaplen: u32,
    /// Disk budget for this sniffer (MiB).
    pub sniffer_space: u64,
    /// Capture file size cap (MiB).
    pub file_size: u64,
    pub rotation: u32,
    pub overfill: OverfillMethod,
}

/// Fields under `interface/<if>/sniffer/<name>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnifferField {
    Enable,
    Snaplen,
    SnifferSpace,
    FileSize,
    Rotation,
    OverfillMeth,
    FilterExpStr,
    FilterExpFile,
}

impl FromStr for SnifferField {
    type Err = SnifferError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "enable" => SnifferField::Enable,
            "snaplen" => SnifferField::Snaplen,
            "sniffer_space" => SnifferField::SnifferSpace,
            "file_size" => SnifferField::FileSize,
            "rotation" => SnifferField::Rotation,
            "overfill_meth" => SnifferField::OverfillMeth,
            "filter_exp_str" => SnifferField::FilterExpStr,
            "filter_exp_file" => SnifferField::FilterExpFile,
            _ => return Err(SnifferError::NotFound(format!("sniffer field '{}'", s))),
        })
    }
}

/// State bits of a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnifferState {
    /// A worker has been launched for this sniffer at least once.
    pub started: bool,
    /// The last probe or dump saw undelivered bytes.
    pub has_logs: bool,
    /// Hidden from listing; kept only to drain its backlog.
    pub pending_delete: bool,
}

/// One sniffer, live or retired.
#[derive(Debug, Clone)]
pub struct SnifferRecord {
    pub id: SnifferId,
    pub config: SnifferConfig,
    pub enabled: bool,
    pub pid: Option<u32>,
    pub state: SnifferState,
    /// Capture file currently being streamed.
    pub current_file: Option<PathBuf>,
    /// Read position inside `current_file`.
    pub read_cursor: u64,
    /// Absolute offset of the next byte to deliver.
    pub abs_offset: u64,
    /// Output directory, set once the sniffer has one.
    pub dir: Option<PathBuf>,
}

impl SnifferRecord {
    pub fn new(id: SnifferId, config: SnifferConfig) -> Self {
        Self {
            id,
            config,
            enabled: false,
            pid: None,
            state: SnifferState::default(),
            current_file: None,
            read_cursor: 0,
            abs_offset: 0,
            dir: None,
        }
    }

    pub fn is_pending_delete(&self) -> bool {
        self.state.pending_delete
    }

    /// Deep copy that owns the current backlog and is hidden from listing.
    pub fn retirement_clone(&self) -> SnifferRecord {
        let mut clone = self.clone();
        clone.enabled = false;
        clone.pid = None;
        clone.state.pending_delete = true;
        clone
    }

    /// Forget streaming progress and the output directory.
    pub fn reset_cursors(&mut self) {
        self.current_file = None;
        self.read_cursor = 0;
        self.abs_offset = 0;
        self.dir = None;
        self.state.has_logs = false;
    }

    pub fn get(&self, field: SnifferField) -> String {
        let c = &self.config;
        match field {
            SnifferField::Enable => u8::from(self.enabled).to_string(),
            SnifferField::Snaplen => c.snaplen.to_string(),
            SnifferField::SnifferSpace => c.sniffer_space.to_string(),
            SnifferField::FileSize => c.file_size.to_string(),
            SnifferField::Rotation => c.rotation.to_string(),
            SnifferField::OverfillMeth => c.overfill.as_value().to_string(),
            SnifferField::FilterExpStr => c.filter_exp_str.clone(),
            SnifferField::FilterExpFile => c.filter_exp_file.clone(),
        }
    }

    /// Change a configuration field. `Enable` is driven by the lifecycle
    /// engine and is not accepted here.
    pub fn set(&mut self, field: SnifferField, value: &str) -> Result<()> {
        if self.enabled {
            return Err(SnifferError::Busy(format!(
                "sniffer {} is running",
                self.id
            )));
        }

        let c = &mut self.config;
        match field {
            SnifferField::Enable => {
                parse_flag(value)?;
                return Err(SnifferError::Invalid(
                    "enable is handled by the lifecycle engine".to_string(),
                ));
            }
            SnifferField::Snaplen => c.snaplen = parse_number(value)?,
            SnifferField::SnifferSpace => c.sniffer_space = parse_number(value)?,
            SnifferField::FileSize => c.file_size = parse_number(value)?,
            SnifferField::Rotation => c.rotation = parse_rotation(value)?,
            SnifferField::OverfillMeth => c.overfill = value.parse()?,
            SnifferField::FilterExpStr => c.filter_exp_str = value.to_string(),
            SnifferField::FilterExpFile => c.filter_exp_file = value.to_string(),
        }
        Ok(())
    }
}
