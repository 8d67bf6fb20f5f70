//! Network interfaces a sniffer can be attached to.

use pnet::datalink::{self, NetworkInterface};

use crate::error::{Result, SnifferError};

/// One line per interface: "name: UP|DOWN [ips]".
pub fn list_interfaces() -> Vec<String> {
    datalink::interfaces().iter().map(describe).collect()
}

fn describe(iface: &NetworkInterface) -> String {
    let status = if iface.is_up() { "UP" } else { "DOWN" };
    let ips: Vec<_> = iface.ips.iter().map(|ip| ip.to_string()).collect();
    format!(
        "{}: {} [{}]",
        iface.name,
        status,
        if ips.is_empty() {
            "no IP".to_string()
        } else {
            ips.join(", ")
        }
    )
}

/// Describe a single interface by name.
pub fn describe_interface(name: &str) -> Result<String> {
    datalink::interfaces()
        .iter()
        .find(|iface| iface.name == name)
        .map(describe)
        .ok_or_else(|| SnifferError::NotFound(format!("interface '{}'", name)))
}
