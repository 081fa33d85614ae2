use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const LOCAL_DISK_KIND: &str = "LocalDisk";
pub const LOCAL_DISK_API_VERSION: &str = "hwameistor.io/v1alpha1";

/// Field path of the node owning a [`LocalDisk`], used as a cache index key.
pub const NODE_NAME_FIELD: &str = "spec.nodeName";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, rename = "resourceVersion")]
    pub resource_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskSpec {
    pub node_name: String,
    pub device_path: String,
    #[serde(default)]
    pub capacity_bytes: u64,
    #[serde(default)]
    pub rotational: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DiskState {
    Active,
    Inactive,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SmartSummary {
    pub passed: bool,
    #[serde(default)]
    pub temperature_celsius: Option<i64>,
    #[serde(default)]
    pub power_on_hours: Option<u64>,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LocalDiskStatus {
    #[serde(default)]
    pub state: DiskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smart: Option<SmartSummary>,
}

/// A block device attached to a storage node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalDisk {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: LocalDiskSpec,
    #[serde(default)]
    pub status: LocalDiskStatus,
}

impl LocalDisk {
    /// Build a disk object named `<node>-<device>` for a device seen on `node_name`.
    pub fn new(node_name: &str, device: &str, capacity_bytes: u64, rotational: bool) -> Self {
        LocalDisk {
            api_version: LOCAL_DISK_API_VERSION.to_string(),
            kind: LOCAL_DISK_KIND.to_string(),
            metadata: ObjectMeta {
                name: format!("{node_name}-{device}"),
                namespace: None,
                resource_version: 0,
            },
            spec: LocalDiskSpec {
                node_name: node_name.to_string(),
                device_path: format!("/dev/{device}"),
                capacity_bytes,
                rotational,
            },
            status: LocalDiskStatus {
                state: DiskState::Active,
                smart: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn node_name(&self) -> &str {
        &self.spec.node_name
    }

    pub fn is_active(&self) -> bool {
        self.status.state == DiskState::Active
    }
}

/// Identity of one agent process. Constant for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: String,
    pub pod_name: String,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Identity {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)
    }
}
