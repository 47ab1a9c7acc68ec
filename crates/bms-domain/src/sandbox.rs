//! Sandbox app instances: isolated copies of an installed bundle's identity.

use serde::{Deserialize, Serialize};

use crate::PackageRecord;

/// Lowest assignable app index; 1 is reserved to mean "no sandbox".
pub const FIRST_SANDBOX_APP_INDEX: u32 = 2;

/// One sandbox instance, keyed by `bundleName_appIndex`.
///
/// Wraps a copy of the base bundle's record with `is_sandbox` set, a single
/// user entry, its own uid and its own access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub bundle_name: String,
    pub app_index: u32,
    pub user_id: i32,
    pub uid: i32,
    pub access_token_id: u32,
    pub data_dir: String,
    pub record: PackageRecord,
}

impl SandboxRecord {
    #[must_use]
    pub fn key(&self) -> String {
        sandbox_key(&self.bundle_name, self.app_index)
    }
}

/// Canonical sandbox map key.
#[must_use]
pub fn sandbox_key(bundle_name: &str, app_index: u32) -> String {
    format!("{bundle_name}_{app_index}")
}
