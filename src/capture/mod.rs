//! On-disk capture files written by the sniffer worker.
//!
//! `index` enumerates and retires the files of one sniffer directory;
//! `lock` is the advisory lock shared with the worker.

pub mod index;
mod lock;

pub use index::{base_offset_of, pick_extreme, CaptureFile, Extreme, PCAP_HEADER_SIZE};
pub use lock::CaptureLock;
