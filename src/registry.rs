//! Sniffer registry.
//!
//! Records live in a slot arena. Released slots are reused with a bumped
//! generation so a stale `RecordKey` never resolves to a newer record.
//! Lookups go through two maps: SnifferId -> key for every record, and
//! (ifname, name) -> key for live (not PendingDelete) records only.

use std::collections::HashMap;

use crate::error::{Result, SnifferError};
use crate::sniffer::{SnifferId, SnifferRecord};

/// Stable handle to a record in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordKey {
    index: usize,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    record: Option<SnifferRecord>,
}

#[derive(Debug, Default)]
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    by_id: HashMap<SnifferId, RecordKey>,
    live: HashMap<(String, String), RecordKey>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, key: RecordKey) -> Option<&SnifferRecord> {
        self.slots
            .get(key.index)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    pub fn get_mut(&mut self, key: RecordKey) -> Option<&mut SnifferRecord> {
        self.slots
            .get_mut(key.index)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    /// Live record by (ifname, name). PendingDelete records are ignored.
    pub fn find(&self, ifname: &str, name: &str) -> Option<RecordKey> {
        self.live
            .get(&(ifname.to_string(), name.to_string()))
            .copied()
    }

    /// Any record, live or retired, by full identity.
    pub fn find_by_id(&self, id: &SnifferId) -> Option<RecordKey> {
        self.by_id.get(id).copied()
    }

    /// Names of live sniffers on `ifname`, in slot order.
    pub fn list(&self, ifname: &str) -> Vec<String> {
        self.iter()
            .map(|(_, r)| r)
            .filter(|r| r.id.ifname == ifname && !r.is_pending_delete())
            .map(|r| r.id.name.clone())
            .collect()
    }

    /// All records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (RecordKey, &SnifferRecord)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|r| {
                (
                    RecordKey {
                        index,
                        generation: slot.generation,
                    },
                    r,
                )
            })
        })
    }

    /// Keys of all records in slot order.
    pub fn keys(&self) -> Vec<RecordKey> {
        self.iter().map(|(key, _)| key).collect()
    }

    /// Insert a record. A live record must not clash with another live
    /// (ifname, name) and no two records may share a SnifferId.
    pub fn insert(&mut self, record: SnifferRecord) -> Result<RecordKey> {
        if self.by_id.contains_key(&record.id) {
            return Err(SnifferError::Exists(format!("sniffer {}", record.id)));
        }
        let live_key = (record.id.ifname.clone(), record.id.name.clone());
        if !record.is_pending_delete() && self.live.contains_key(&live_key) {
            return Err(SnifferError::Exists(format!(
                "sniffer {} on {}",
                record.id.name, record.id.ifname
            )));
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        let key = RecordKey {
            index,
            generation: slot.generation,
        };

        self.by_id.insert(record.id.clone(), key);
        if !record.is_pending_delete() {
            self.live.insert(live_key, key);
        }
        slot.record = Some(record);
        Ok(key)
    }

    /// Install a PendingDelete deep copy of the record behind `key`.
    pub fn insert_retirement_clone(&mut self, key: RecordKey) -> Result<RecordKey> {
        let clone = self
            .get(key)
            .map(SnifferRecord::retirement_clone)
            .ok_or_else(|| SnifferError::NotFound("record to clone".to_string()))?;

        // The clone takes over the id; the live record must be renumbered
        // by the caller before it is looked up by id again.
        self.by_id.remove(&clone.id);
        self.insert(clone)
    }

    /// Give the record behind `key` a new SSN.
    pub fn reassign_ssn(&mut self, key: RecordKey, ssn: u32) -> Result<()> {
        let record = self
            .get(key)
            .ok_or_else(|| SnifferError::NotFound("record to renumber".to_string()))?;
        let mut new_id = record.id.clone();
        new_id.ssn = ssn;
        if self.by_id.contains_key(&new_id) {
            return Err(SnifferError::Exists(format!("sniffer {}", new_id)));
        }

        let old_id = record.id.clone();
        if self.by_id.get(&old_id) == Some(&key) {
            self.by_id.remove(&old_id);
        }
        self.by_id.insert(new_id.clone(), key);
        if let Some(record) = self.get_mut(key) {
            record.id = new_id;
        }
        Ok(())
    }

    /// Hide a live record from listing; it stays reachable by id.
    pub fn mark_pending_delete(&mut self, key: RecordKey) -> Result<()> {
        let record = self
            .get_mut(key)
            .ok_or_else(|| SnifferError::NotFound("record to retire".to_string()))?;
        record.state.pending_delete = true;
        let live_key = (record.id.ifname.clone(), record.id.name.clone());
        if self.live.get(&live_key) == Some(&key) {
            self.live.remove(&live_key);
        }
        Ok(())
    }

    /// Remove a record from storage and return it.
    pub fn release(&mut self, key: RecordKey) -> Option<SnifferRecord> {
        let slot = self.slots.get_mut(key.index)?;
        if slot.generation != key.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);

        if self.by_id.get(&record.id) == Some(&key) {
            self.by_id.remove(&record.id);
        }
        let live_key = (record.id.ifname.clone(), record.id.name.clone());
        if self.live.get(&live_key) == Some(&key) {
            self.live.remove(&live_key);
        }
        Some(record)
    }

    /// Whether any record of (ifname, name) uses `ssn`.
    pub fn ssn_in_use(&self, ifname: &str, name: &str, ssn: u32) -> bool {
        self.by_id
            .contains_key(&SnifferId::new(name, ifname, ssn))
    }
}
