//! Daemon configuration, loaded from an optional TOML file given as the
//! single CLI argument, with every field falling back to a built-in
//! default when the file is absent or a table is partially specified.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            network: NetworkConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default = "default_control_api_bind")]
    pub control_api_bind: SocketAddr,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            control_api_bind: default_control_api_bind(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    "/var/lib/faasd".into()
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_control_api_bind() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_address_pool_cidr")]
    pub address_pool_cidr: String,
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    #[serde(default = "default_iface_label")]
    pub iface_label: String,
    #[serde(default = "default_bind_interface")]
    pub bind_interface: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address_pool_cidr: default_address_pool_cidr(),
            container_port: default_container_port(),
            iface_label: default_iface_label(),
            bind_interface: default_bind_interface(),
        }
    }
}

fn default_bind_interface() -> String {
    "lo".to_owned()
}

fn default_address_pool_cidr() -> String {
    "169.254.92.0/24".to_owned()
}

fn default_container_port() -> u16 {
    80
}

fn default_iface_label() -> String {
    "faasd".to_owned()
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runc_path")]
    pub runc_path: PathBuf,
    #[serde(default = "default_rendezvous_timeout_ms")]
    pub rendezvous_timeout_ms: u64,
    #[serde(default = "default_exit_timeout_ms")]
    pub exit_timeout_ms: u64,
    #[serde(default = "default_memory_mib")]
    pub default_memory_mib: u64,
    /// `cpu.cfs_quota_us` equivalent: microseconds of CPU time allowed per
    /// `cpu_period_us` period. Defaults to one full core.
    #[serde(default = "default_cpu_quota_us")]
    pub cpu_quota_us: i64,
    /// `cpu.cfs_period_us` equivalent.
    #[serde(default = "default_cpu_period_us")]
    pub cpu_period_us: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runc_path: default_runc_path(),
            rendezvous_timeout_ms: default_rendezvous_timeout_ms(),
            exit_timeout_ms: default_exit_timeout_ms(),
            default_memory_mib: default_memory_mib(),
            cpu_quota_us: default_cpu_quota_us(),
            cpu_period_us: default_cpu_period_us(),
        }
    }
}

fn default_runc_path() -> PathBuf {
    "runc".into()
}

fn default_rendezvous_timeout_ms() -> u64 {
    5_000
}

fn default_exit_timeout_ms() -> u64 {
    30_000
}

fn default_memory_mib() -> u64 {
    512
}

fn default_cpu_quota_us() -> i64 {
    100_000
}

fn default_cpu_period_us() -> u64 {
    100_000
}

impl Config {
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
                let config: Config = toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
                Ok(config)
            }
            None => Ok(Config::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file_given() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.daemon.root_dir, PathBuf::from("/var/lib/faasd"));
        assert_eq!(config.network.container_port, 80);
    }

    #[test]
    fn partial_table_fills_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faasd.toml");
        std::fs::write(&path, "[network]\ncontainer_port = 9000\n").unwrap();
        let config = Config::load(Some(path)).unwrap();
        assert_eq!(config.network.container_port, 9000);
        assert_eq!(config.network.address_pool_cidr, "169.254.92.0/24");
    }
}
