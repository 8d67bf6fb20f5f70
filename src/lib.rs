//! Test agent sniffer manager.
//!
//! Supervises external capture workers, one per sniffer, and streams the
//! pcap files they write to a controller in absolute-offset order.

pub mod capture;
pub mod config;
pub mod core;
pub mod error;
pub mod interfaces;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod settings;
pub mod sniffer;
pub mod ssn;
pub mod streamer;
pub mod supervisor;
pub mod transport;
pub mod tree;

pub use crate::config::AgentConfig;
pub use crate::core::SnifferCore;
pub use crate::error::{Result, SnifferError};
pub use crate::server::ControlServer;
pub use crate::settings::{GlobalSettings, OverfillMethod, SettingKey};
pub use crate::sniffer::{SnifferConfig, SnifferField, SnifferId, SnifferRecord};
pub use crate::supervisor::{ProcessSupervisor, Supervisor};
pub use crate::transport::{MemoryTransport, SocketTransport, Transport};
