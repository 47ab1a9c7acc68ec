//! In-memory representation of one installed bundle.
//!
//! A [`PackageRecord`] is owned by the package index; engines work on clones
//! and commit whole records back under the bundle's lock.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Classification of a bundle, deciding its identifier range and install root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppType {
    System,
    ThirdPartySystem,
    ThirdParty,
}

/// Durable marker recording the last phase a transaction reached.
///
/// Written strictly before the corresponding filesystem mutation begins and
/// advanced strictly after it completes; any non-terminal value found at boot
/// identifies an interrupted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionStatus {
    InstallStart,
    InstallFinish,
    UpdatingNewStart,
    UpdatingExistedStart,
    UpdatingFinish,
    UninstallBundleStart,
    UninstallPackageStart,
    /// Metadata committed, batch rename of `.tmp` staging dirs still pending.
    RenamePending,
    RollBack,
}

impl ExceptionStatus {
    /// Terminal states require no recovery at boot.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::InstallFinish | Self::UpdatingFinish)
    }
}

/// The write-ahead marker persisted inside the bundle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMark {
    pub bundle_name: String,
    pub module: Option<String>,
    pub status: ExceptionStatus,
}

/// One module (split package) inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Module package name, unique within the bundle.
    pub package: String,
    /// Human-facing module name from the manifest.
    pub module_name: String,
    /// Installed module directory under the bundle code path.
    pub source_dir: String,
    /// Path of the archive this module was installed from.
    pub archive_path: String,
    /// Caller-supplied integrity hash, if any.
    pub hash: Option<String>,
    pub is_entry: bool,
    pub installation_free: bool,
    pub defined_permissions: Vec<String>,
    pub requested_permissions: Vec<String>,
}

/// Per-user installation state of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: i32,
    /// uid handed to the filesystem layer; encodes user and class offset.
    pub uid: i32,
    pub access_token_id: u32,
    pub install_time: i64,
    pub update_time: i64,
    pub enabled: bool,
}

/// Full metadata of one installed bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub bundle_name: String,
    /// Signature-derived application identity; stable across versions.
    pub app_id: String,
    /// App privilege level from the signing provision.
    pub apl: String,
    pub version_code: u32,
    pub version_name: String,
    pub min_compatible_version: u32,
    pub target_version: u32,
    pub compatible_version: u32,
    pub release_type: String,
    pub vendor: String,
    pub app_type: AppType,
    pub is_system_app: bool,
    pub is_pre_install: bool,
    pub singleton: bool,
    /// Atomic-service-like bundles: the entry module is installation free.
    pub entry_installation_free: bool,
    pub removable: bool,
    /// Whether the bundle uses the new manifest format; formats cannot mix.
    pub new_module_format: bool,
    /// Bundle code directory; module dirs live directly below it.
    pub code_path: String,
    /// Ordered module set. At most one module is the entry module.
    pub modules: IndexMap<String, ModuleRecord>,
    /// user id -> per-user state.
    pub users: BTreeMap<i32, UserRecord>,
    pub install_mark: Option<InstallMark>,
    /// Sandbox instances carry the owning index; base bundles use zero.
    pub app_index: u32,
    pub is_sandbox: bool,
}

impl PackageRecord {
    #[must_use]
    pub fn has_entry(&self) -> bool {
        self.modules.values().any(|m| m.is_entry)
    }

    #[must_use]
    pub fn find_module(&self, package: &str) -> Option<&ModuleRecord> {
        self.modules.get(package)
    }

    #[must_use]
    pub fn is_only_module(&self, package: &str) -> bool {
        self.modules.len() == 1 && self.modules.contains_key(package)
    }

    #[must_use]
    pub fn has_user(&self, user_id: i32) -> bool {
        self.users.contains_key(&user_id)
    }

    #[must_use]
    pub fn user(&self, user_id: i32) -> Option<&UserRecord> {
        self.users.get(&user_id)
    }

    #[must_use]
    pub fn uid(&self, user_id: i32) -> Option<i32> {
        self.users.get(&user_id).map(|u| u.uid)
    }

    /// Inserts or replaces a module. Enforces the single-entry invariant.
    ///
    /// # Errors
    /// Fails when a second entry module would be introduced.
    pub fn upsert_module(&mut self, module: ModuleRecord) -> Result<(), crate::InstallError> {
        if module.is_entry {
            let other_entry = self
                .modules
                .values()
                .any(|m| m.is_entry && m.package != module.package);
            if other_entry {
                return Err(crate::InstallError::EntryAlreadyExists);
            }
        }
        self.modules.insert(module.package.clone(), module);
        Ok(())
    }

    pub fn remove_module(&mut self, package: &str) -> Option<ModuleRecord> {
        self.modules.shift_remove(package)
    }

    pub fn add_user(&mut self, user: UserRecord) {
        self.users.insert(user.user_id, user);
    }

    pub fn remove_user(&mut self, user_id: i32) -> Option<UserRecord> {
        self.users.remove(&user_id)
    }

    pub fn set_access_token(&mut self, user_id: i32, token: u32) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.access_token_id = token;
        }
    }

    pub fn set_install_time(&mut self, user_id: i32, when: i64) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.install_time = when;
            user.update_time = when;
        }
    }

    pub fn set_update_time(&mut self, user_id: i32, when: i64) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.update_time = when;
        }
    }

    pub fn set_install_mark(&mut self, module: Option<&str>, status: ExceptionStatus) {
        self.install_mark = Some(InstallMark {
            bundle_name: self.bundle_name.clone(),
            module: module.map(str::to_owned),
            status,
        });
    }

    /// All permissions defined across modules, deduplicated.
    #[must_use]
    pub fn defined_permissions(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for module in self.modules.values() {
            for perm in &module.defined_permissions {
                if !out.contains(perm) {
                    out.push(perm.clone());
                }
            }
        }
        out
    }

    /// All permissions requested across modules, deduplicated.
    #[must_use]
    pub fn requested_permissions(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for module in self.modules.values() {
            for perm in &module.requested_permissions {
                if !out.contains(perm) {
                    out.push(perm.clone());
                }
            }
        }
        out
    }
}
