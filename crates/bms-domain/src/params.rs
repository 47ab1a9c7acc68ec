//! Parameters and well-known user identifiers for engine operations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The default/system user. Singleton bundles may only exist here.
pub const DEFAULT_USER_ID: i32 = 0;
/// Wildcard accepted by sandbox teardown: match every user.
pub const ANY_USER_ID: i32 = -2;
/// Sentinel for an unresolved user id.
pub const INVALID_USER_ID: i32 = -1;

/// Spacing between per-user uid ranges; uid = user * range + class offset.
pub const BASE_USER_RANGE: i32 = 200_000;

/// How an install call treats an already-installed bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallFlag {
    /// Plain install; same-version reinstall for an installed user fails.
    Normal,
    /// Replace modules of an equal-version installed bundle.
    ReplaceExisting,
    /// Install-on-demand placement; replace semantics plus removable marking.
    FreeInstall,
}

/// Caller-supplied options for install/update operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallParams {
    pub user_id: i32,
    pub flag: InstallFlag,
    /// Keep data directories when replacing or removing.
    pub keep_data: bool,
    /// Force past the non-removable system-app refusal.
    pub force: bool,
    /// Terminate running processes before touching an installed module.
    /// Boot-time reconciliation replay turns this off.
    pub kill_running: bool,
    /// Publish a status notification when the operation finishes.
    pub send_event: bool,
    pub is_pre_install_app: bool,
    /// Record the source archive paths as a pre-install record.
    pub save_pre_install_record: bool,
    /// Whether the installed bundle may be uninstalled without force.
    /// Cleared by boot scans for bundles the device configuration pins.
    pub removable: bool,
    /// module name -> expected integrity hash.
    pub hash_params: BTreeMap<String, String>,
}

impl Default for InstallParams {
    fn default() -> Self {
        Self {
            user_id: DEFAULT_USER_ID,
            flag: InstallFlag::Normal,
            keep_data: false,
            force: false,
            kill_running: true,
            send_event: true,
            is_pre_install_app: false,
            save_pre_install_record: false,
            removable: true,
            hash_params: BTreeMap::new(),
        }
    }
}

impl InstallParams {
    #[must_use]
    pub fn for_user(user_id: i32) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn replace(&self) -> bool {
        matches!(self.flag, InstallFlag::ReplaceExisting | InstallFlag::FreeInstall)
    }
}
