use common::Identity;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lease::LeaseTiming;

pub const DEFAULT_LEASE_ROLE: &str = "cluster-controller-master";
pub const DEFAULT_CSI_ENDPOINT: &str = "unix://csi/csi.sock";
pub const DEFAULT_DRIVER_NAME: &str = "disk.hwameistor.io";
pub const VENDOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Agent configuration. Built once at startup (file, then CLI overlay, then
/// environment defaults) and handed to every component; never re-read.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub namespace: String,
    pub pod_name: String,
    pub node_name: String,
    /// Run without a coordination store; leases and resources stay in memory.
    pub standalone: bool,
    pub xline_config: XlineConfig,
    pub lease: LeaseConfig,
    pub metrics: MetricsConfig,
    pub csi: CsiConfig,
    pub smart_sync_period_secs: u64,
    pub disk_poll_interval_secs: u64,
    pub sys_block_path: PathBuf,
    pub shutdown_grace_secs: u64,
    pub log_level: u8,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            namespace: String::new(),
            pod_name: String::new(),
            node_name: String::new(),
            standalone: false,
            xline_config: XlineConfig::default(),
            lease: LeaseConfig::default(),
            metrics: MetricsConfig::default(),
            csi: CsiConfig::default(),
            smart_sync_period_secs: 6 * 60 * 60,
            disk_poll_interval_secs: 5,
            sys_block_path: PathBuf::from("/sys/block"),
            shutdown_grace_secs: 3,
            log_level: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for XlineConfig {
    fn default() -> Self {
        XlineConfig {
            endpoints: Vec::new(),
            prefix: "/ldm".to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub role: String,
    pub lease_duration_secs: u64,
    pub renew_deadline_secs: u64,
    pub retry_period_secs: u64,
    pub max_backoff_secs: u64,
    /// Give up acquiring after this many consecutive store failures. Unset means retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            role: DEFAULT_LEASE_ROLE.to_string(),
            lease_duration_secs: 15,
            renew_deadline_secs: 10,
            retry_period_secs: 2,
            max_backoff_secs: 30,
            max_attempts: None,
        }
    }
}

impl LeaseConfig {
    pub fn timing(&self) -> LeaseTiming {
        LeaseTiming {
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
    pub operator_port: u16,
    pub service_name: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            host: "0.0.0.0".to_string(),
            port: 8383,
            operator_port: 8686,
            service_name: "local-disk-manager-metrics".to_string(),
        }
    }
}

impl MetricsConfig {
    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("metrics address {}:{}: {e}", self.host, self.port)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CsiConfig {
    pub enable: bool,
    pub endpoint: String,
    pub driver_name: String,
    pub node_id: String,
    #[serde(skip)]
    pub vendor_version: String,
}

impl Default for CsiConfig {
    fn default() -> Self {
        CsiConfig {
            enable: false,
            endpoint: DEFAULT_CSI_ENDPOINT.to_string(),
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            node_id: String::new(),
            vendor_version: VENDOR_VERSION.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn identity(&self) -> Identity {
        Identity::new(self.namespace.clone(), self.pod_name.clone())
    }

    pub fn smart_sync_period(&self) -> Duration {
        Duration::from_secs(self.smart_sync_period_secs)
    }

    pub fn disk_poll_interval(&self) -> Duration {
        Duration::from_secs(self.disk_poll_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Fill identity fields left empty by the file and the CLI.
    /// `POD_NAMESPACE`/`POD_NAME`/`NODENAME` are already consumed by the CLI,
    /// so only host-derived fallbacks remain here.
    pub fn fill_defaults(&mut self, hostname: &str) {
        if self.namespace.is_empty() {
            self.namespace = "default".to_string();
        }
        if self.pod_name.is_empty() {
            self.pod_name = hostname.to_string();
        }
        if self.node_name.is_empty() {
            self.node_name = hostname.to_string();
        }
        if self.csi.node_id.is_empty() {
            self.csi.node_id = self.node_name.clone();
        }
        if self.csi.vendor_version.is_empty() {
            self.csi.vendor_version = VENDOR_VERSION.to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease.role.trim().is_empty() {
            return Err(ConfigError::Invalid("lease role must not be empty".into()));
        }
        if self.lease.lease_duration_secs == 0 || self.lease.retry_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "lease duration and retry period must be positive".into(),
            ));
        }
        if self.lease.renew_deadline_secs >= self.lease.lease_duration_secs {
            return Err(ConfigError::Invalid(format!(
                "renew deadline ({}s) must be shorter than lease duration ({}s)",
                self.lease.renew_deadline_secs, self.lease.lease_duration_secs
            )));
        }
        if self.lease.retry_period_secs >= self.lease.renew_deadline_secs {
            return Err(ConfigError::Invalid(format!(
                "retry period ({}s) must be shorter than renew deadline ({}s)",
                self.lease.retry_period_secs, self.lease.renew_deadline_secs
            )));
        }
        if self.smart_sync_period_secs == 0 || self.disk_poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("task intervals must be positive".into()));
        }
        if !self.standalone && self.xline_config.endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "xline endpoints are required unless running standalone".into(),
            ));
        }
        if self.namespace.is_empty() || self.pod_name.is_empty() || self.node_name.is_empty() {
            return Err(ConfigError::Invalid("process identity is incomplete".into()));
        }
        if self.csi.enable && !self.csi.endpoint.starts_with("unix://") {
            return Err(ConfigError::Invalid(format!(
                "csi endpoint must be a unix socket, got {}",
                self.csi.endpoint
            )));
        }
        self.metrics.bind_address()?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: AgentConfig = serde_yaml::from_str(&content)?;
    Ok(cfg)
}
