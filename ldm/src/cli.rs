use clap::Parser;
use std::path::PathBuf;

use crate::config::AgentConfig;

#[derive(Parser, Debug)]
#[command(name = "ldm", version, about = "Local disk manager agent")]
pub struct Cli {
    /// YAML config file; flags below override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "POD_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    #[arg(long, env = "NODENAME")]
    pub node_name: Option<String>,

    /// Keep leases and resources in memory instead of xline
    #[arg(long)]
    pub standalone: bool,

    /// Xline endpoints, comma separated
    #[arg(long, value_delimiter = ',')]
    pub xline_endpoints: Vec<String>,

    /// Enable disk CSI driver
    #[arg(long = "csi-enable")]
    pub csi_enable: bool,

    /// CSI endpoint
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Name of the csidriver
    #[arg(long = "drivername")]
    pub driver_name: Option<String>,

    /// Node id
    #[arg(long = "nodeid")]
    pub node_id: Option<String>,

    #[arg(long)]
    pub metrics_host: Option<String>,

    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Number for the log level verbosity
    #[arg(short = 'v', long = "v")]
    pub log_level: Option<u8>,
}

impl Cli {
    /// Overlay explicitly given flags onto `cfg`.
    pub fn apply(&self, cfg: &mut AgentConfig) {
        if let Some(ns) = &self.namespace {
            cfg.namespace = ns.clone();
        }
        if let Some(pod) = &self.pod_name {
            cfg.pod_name = pod.clone();
        }
        if let Some(node) = &self.node_name {
            cfg.node_name = node.clone();
        }
        if self.standalone {
            cfg.standalone = true;
        }
        if !self.xline_endpoints.is_empty() {
            cfg.xline_config.endpoints = self.xline_endpoints.clone();
        }
        if self.csi_enable {
            cfg.csi.enable = true;
        }
        if let Some(endpoint) = &self.endpoint {
            cfg.csi.endpoint = endpoint.clone();
        }
        if let Some(driver) = &self.driver_name {
            cfg.csi.driver_name = driver.clone();
        }
        if let Some(node_id) = &self.node_id {
            cfg.csi.node_id = node_id.clone();
        }
        if let Some(host) = &self.metrics_host {
            cfg.metrics.host = host.clone();
        }
        if let Some(port) = self.metrics_port {
            cfg.metrics.port = port;
        }
        if let Some(level) = self.log_level {
            cfg.log_level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "ldm",
            "--namespace",
            "storage",
            "--pod-name",
            "agent-1",
            "--csi-enable",
            "--drivername",
            "disk.example.io",
            "--xline-endpoints",
            "http://10.0.0.1:2379,http://10.0.0.2:2379",
            "-v",
            "5",
        ])
        .unwrap();

        let mut cfg = AgentConfig::default();
        cli.apply(&mut cfg);
        assert_eq!(cfg.namespace, "storage");
        assert_eq!(cfg.pod_name, "agent-1");
        assert!(cfg.csi.enable);
        assert_eq!(cfg.csi.driver_name, "disk.example.io");
        assert_eq!(cfg.xline_config.endpoints.len(), 2);
        assert_eq!(cfg.log_level, 5);
    }

    #[test]
    #[serial]
    fn test_absent_flags_keep_config() {
        let cli = Cli::try_parse_from(["ldm"]).unwrap();
        let mut cfg = AgentConfig {
            standalone: true,
            log_level: 2,
            ..Default::default()
        };
        cfg.metrics.port = 9000;
        cli.apply(&mut cfg);
        assert!(cfg.standalone);
        assert_eq!(cfg.log_level, 2);
        assert_eq!(cfg.metrics.port, 9000);
        assert!(!cfg.csi.enable);
    }
}
