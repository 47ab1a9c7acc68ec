//! Persisted record of where a pre-installed bundle's archives live.

use serde::{Deserialize, Serialize};

use crate::AppType;

/// Survives independently of the live [`crate::PackageRecord`]: created on
/// first system install, refreshed on every OTA scan, deleted when the bundle
/// is fully uninstalled at the bundle level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreInstallRecord {
    pub bundle_name: String,
    pub bundle_paths: Vec<String>,
    pub app_type: AppType,
    pub version_code: u32,
}

impl PreInstallRecord {
    pub fn add_path(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.bundle_paths.contains(&path) {
            self.bundle_paths.push(path);
        }
    }
}
