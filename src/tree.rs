//! Configuration tree paths mapped onto core operations.
//!
//! ```text
//! settings/<key>                          get / set
//! interface/<if>/sniffer                  list
//! interface/<if>/sniffer/<name>           add / del / get (SSN)
//! interface/<if>/sniffer/<name>/<field>   get / set
//! ```

use std::str::FromStr;

use crate::core::SnifferCore;
use crate::error::{Result, SnifferError};
use crate::settings::SettingKey;
use crate::sniffer::SnifferField;

/// A resolved configuration tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Setting(SettingKey),
    Sniffers { ifname: String },
    Sniffer { ifname: String, name: String },
    Field {
        ifname: String,
        name: String,
        field: SnifferField,
    },
}

impl FromStr for Node {
    type Err = SnifferError;

    fn from_str(path: &str) -> Result<Self> {
        let parts: Vec<&str> = path
            .trim()
            .trim_matches('/')
            .split('/')
            .filter(|p| !p.is_empty())
            .collect();

        match parts.as_slice() {
            ["settings", key] => Ok(Node::Setting(key.parse()?)),
            ["interface", ifname, "sniffer"] => Ok(Node::Sniffers {
                ifname: ifname.to_string(),
            }),
            ["interface", ifname, "sniffer", name] => Ok(Node::Sniffer {
                ifname: ifname.to_string(),
                name: name.to_string(),
            }),
            ["interface", ifname, "sniffer", name, field] => Ok(Node::Field {
                ifname: ifname.to_string(),
                name: name.to_string(),
                field: field.parse()?,
            }),
            _ => Err(SnifferError::NotFound(format!("no such node '{}'", path))),
        }
    }
}

fn unsupported(op: &str, path: &str) -> SnifferError {
    SnifferError::Invalid(format!("'{}' is not supported on '{}'", op, path))
}

pub fn get(core: &SnifferCore, path: &str) -> Result<String> {
    match path.parse::<Node>()? {
        Node::Setting(key) => Ok(core.get_setting(key)),
        Node::Sniffer { ifname, name } => Ok(core.sniffer_ssn(&ifname, &name)?.to_string()),
        Node::Field {
            ifname,
            name,
            field,
        } => core.get_sniffer_field(&ifname, &name, field),
        Node::Sniffers { .. } => Err(unsupported("get", path)),
    }
}

pub fn set(core: &mut SnifferCore, path: &str, value: &str) -> Result<()> {
    match path.parse::<Node>()? {
        Node::Setting(key) => core.set_setting(key, value),
        Node::Field {
            ifname,
            name,
            field,
        } => core.set_sniffer_field(&ifname, &name, field, value),
        Node::Sniffers { .. } | Node::Sniffer { .. } => Err(unsupported("set", path)),
    }
}

pub fn add(core: &mut SnifferCore, path: &str) -> Result<()> {
    match path.parse::<Node>()? {
        Node::Sniffer { ifname, name } => core.add_sniffer(&ifname, &name).map(|_| ()),
        _ => Err(unsupported("add", path)),
    }
}

pub fn del(core: &mut SnifferCore, path: &str) -> Result<()> {
    match path.parse::<Node>()? {
        Node::Sniffer { ifname, name } => core.delete_sniffer(&ifname, &name),
        _ => Err(unsupported("del", path)),
    }
}

/// Sniffer names on an interface.
pub fn list(core: &SnifferCore, path: &str) -> Result<Vec<String>> {
    match path.parse::<Node>()? {
        Node::Sniffers { ifname } => Ok(core.list_sniffers(&ifname)),
        _ => Err(unsupported("list", path)),
    }
}
