//! Session sequence number allocation.
//!
//! The next SSN lives in a small file inside the agent private directory as
//! a native-endian `u32` at offset 0. The file is never truncated.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{Result, SnifferError};

const COUNTER_WIDTH: usize = std::mem::size_of::<u32>();

/// Allocates SSNs from the persisted counter file.
#[derive(Debug)]
pub struct SsnAllocator {
    /// Directory holding the counter file, created on first use.
    dir: PathBuf,
    /// Counter file path.
    path: PathBuf,
    /// Serializes allocations within this process.
    data_lock: Mutex<()>,
}

impl SsnAllocator {
    pub fn new(dir: impl AsRef<Path>, path: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            path: path.as_ref().to_path_buf(),
            data_lock: Mutex::new(()),
        }
    }

    /// Get the counter file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the current counter value and persist value + 1.
    pub fn allocate(&self) -> Result<u32> {
        let _guard = self
            .data_lock
            .lock()
            .map_err(|_| SnifferError::CorruptCounter("SSN data lock poisoned".to_string()))?;

        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&self.dir)?;
                let mut file = OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(&self.path)?;
                file.write_all(&1u32.to_ne_bytes())?;
                debug!("Created SSN file {}", self.path.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut buf = [0u8; COUNTER_WIDTH];
        if let Err(e) = file.read_exact(&mut buf) {
            if e.kind() == ErrorKind::UnexpectedEof {
                return Err(SnifferError::CorruptCounter(format!(
                    "short read from {}",
                    self.path.display()
                )));
            }
            return Err(e.into());
        }

        let ssn = u32::from_ne_bytes(buf);
        let next = ssn.checked_add(1).ok_or_else(|| {
            SnifferError::CorruptCounter(format!("counter exhausted in {}", self.path.display()))
        })?;

        file.seek(SeekFrom::Start(0))?;
        if let Err(e) = file.write_all(&next.to_ne_bytes()) {
            warn!("Couldn't write to the SSN file {}: {}", self.path.display(), e);
            return Err(e.into());
        }

        Ok(ssn)
    }
}
