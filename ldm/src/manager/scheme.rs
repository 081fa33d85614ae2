use common::{LOCAL_DISK_API_VERSION, LOCAL_DISK_KIND};
use std::collections::BTreeMap;

use super::ManagerError;

/// Resource kinds a manager knows how to handle, by kind name.
#[derive(Debug, Default, Clone)]
pub struct Scheme {
    kinds: BTreeMap<String, String>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_known_kind(&mut self, api_version: &str, kind: &str) -> Result<(), ManagerError> {
        if self.kinds.contains_key(kind) {
            return Err(ManagerError::DuplicateKind(kind.to_string()));
        }
        self.kinds.insert(kind.to_string(), api_version.to_string());
        Ok(())
    }

    pub fn recognizes(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    pub fn api_version(&self, kind: &str) -> Option<&str> {
        self.kinds.get(kind).map(String::as_str)
    }
}

/// Register the local disk manager's resource types.
pub fn add_to_scheme(scheme: &mut Scheme) -> Result<(), ManagerError> {
    scheme.add_known_kind(LOCAL_DISK_API_VERSION, LOCAL_DISK_KIND)
}
