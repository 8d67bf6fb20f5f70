use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Result, SnifferError};

const DEFAULT_CONFIG_PATH: &str = "/etc/te-snifferd.conf";
const DEFAULT_TA_NAME: &str = "ta";
const DEFAULT_PRIVATE_DIR: &str = "/var/lib/te-snifferd";
const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 5080;
const DEFAULT_WORKER: &str = "/usr/lib/te/te_sniffer_process";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Agent daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Test agent name used in file and directory names.
    pub ta_name: String,
    /// Agent-private directory (SSN counter, default output root).
    pub private_dir: PathBuf,
    pub bind_address: String,
    pub port: u16,
    /// Capture worker executable.
    pub worker: PathBuf,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ta_name: DEFAULT_TA_NAME.to_string(),
            private_dir: PathBuf::from(DEFAULT_PRIVATE_DIR),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            worker: PathBuf::from(DEFAULT_WORKER),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl AgentConfig {
    /// Load from `path`, else `SNIFFERD_CONFIG`, else the default path.
    /// A missing file leaves the defaults; environment variables override
    /// both.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => std::env::var("SNIFFERD_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };

        let mut config = AgentConfig::default();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let key = key.trim();
                    let value = value.trim();
                    match key {
                        "ta_name" => config.ta_name = value.to_string(),
                        "private_dir" => config.private_dir = PathBuf::from(value),
                        "bind_address" => config.bind_address = value.to_string(),
                        "port" => {
                            config.port = value.parse().map_err(|_| {
                                SnifferError::Config(format!("Invalid port: {}", value))
                            })?;
                        }
                        "worker" => config.worker = PathBuf::from(value),
                        "log_level" => config.log_level = value.to_string(),
                        _ => {}
                    }
                }
            }
        }

        // Allow environment variable overrides
        if let Ok(val) = std::env::var("SNIFFERD_TA_NAME") {
            config.ta_name = val;
        }
        if let Ok(val) = std::env::var("SNIFFERD_PRIVATE_DIR") {
            config.private_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SNIFFERD_BIND_ADDRESS") {
            config.bind_address = val;
        }
        if let Ok(val) = std::env::var("SNIFFERD_PORT") {
            config.port = val
                .parse()
                .map_err(|_| SnifferError::Config(format!("Invalid SNIFFERD_PORT: {}", val)))?;
        }
        if let Ok(val) = std::env::var("SNIFFERD_WORKER") {
            config.worker = PathBuf::from(val);
        }

        if config.ta_name.is_empty() || config.ta_name.contains(|c: char| c.is_whitespace() || c == '/') {
            return Err(SnifferError::Config(format!(
                "Invalid ta_name: '{}'",
                config.ta_name
            )));
        }

        Ok(config)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|_| {
                SnifferError::Config(format!(
                    "Invalid bind address: {}:{}",
                    self.bind_address, self.port
                ))
            })
    }

    /// Default filter for the tracing subscriber.
    pub fn tracing_filter(&self) -> String {
        format!("te_sniffer={0},te_snifferd={0}", self.log_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    const ENV_VARS: [&str; 6] = [
        "SNIFFERD_CONFIG",
        "SNIFFERD_TA_NAME",
        "SNIFFERD_PRIVATE_DIR",
        "SNIFFERD_BIND_ADDRESS",
        "SNIFFERD_PORT",
        "SNIFFERD_WORKER",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn missing_file_gives_defaults() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let config = AgentConfig::load(Some(temp.path().join("none.conf").as_path())).unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.socket_addr().unwrap().port(), DEFAULT_PORT);
    }

    #[test]
    #[serial]
    fn file_values_are_read() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("te-snifferd.conf");
        fs::write(
            &path,
            "# agent\nta_name = agt_a\nprivate_dir=/tmp/agt\nport = 6000\nworker = /opt/te/worker\nunknown = 1\n",
        )
        .unwrap();

        let config = AgentConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.ta_name, "agt_a");
        assert_eq!(config.private_dir, PathBuf::from("/tmp/agt"));
        assert_eq!(config.port, 6000);
        assert_eq!(config.worker, PathBuf::from("/opt/te/worker"));
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("te-snifferd.conf");
        fs::write(&path, "ta_name = from_file\nport = 6000\n").unwrap();
        env::set_var("SNIFFERD_CONFIG", &path);
        env::set_var("SNIFFERD_TA_NAME", "from_env");
        env::set_var("SNIFFERD_PORT", "6001");

        let config = AgentConfig::load(None).unwrap();
        clear_env();
        assert_eq!(config.ta_name, "from_env");
        assert_eq!(config.port, 6001);
    }

    #[test]
    #[serial]
    fn bad_port_is_config_error() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("te-snifferd.conf");
        fs::write(&path, "port = many\n").unwrap();
        assert!(matches!(
            AgentConfig::load(Some(path.as_path())),
            Err(SnifferError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn bad_ta_name_is_config_error() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("te-snifferd.conf");
        fs::write(&path, "ta_name = a b\n").unwrap();
        assert!(AgentConfig::load(Some(path.as_path())).is_err());
    }

    #[test]
    fn tracing_filter_uses_level() {
        let config = AgentConfig {
            log_level: "debug".to_string(),
            ..AgentConfig::default()
        };
        assert_eq!(config.tracing_filter(), "te_sniffer=debug,te_snifferd=debug");
    }
}
