//! Service configuration: install roots, scan directories, identifier
//! ranges and device capabilities.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use bms_domain::AppType;

/// Contiguous identifier range for one bundle class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub base: u32,
    pub count: u32,
}

impl IdRange {
    #[must_use]
    pub fn contains(self, offset: u32) -> bool {
        offset >= self.base && offset < self.base + self.count
    }
}

/// Everything the engines need to know about the host layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServiceConfig {
    /// Root for bundle code directories, one subdir per bundle.
    pub code_root: PathBuf,
    /// Root for per-user data directories.
    pub data_root: PathBuf,
    /// Root for persisted metadata documents.
    pub store_root: PathBuf,
    /// Directories scanned for system bundles at boot.
    pub system_app_dirs: Vec<PathBuf>,
    /// Directories scanned for vendor-provided system bundles at boot.
    pub third_system_app_dirs: Vec<PathBuf>,
    /// Bundle installed first during a cold-boot scan.
    pub system_resources_bundle: String,
    /// Capabilities this device provides; requirements are checked here.
    pub device_capabilities: BTreeSet<String>,
    pub system_ids: IdRange,
    pub third_system_ids: IdRange,
    pub third_party_ids: IdRange,
    /// Highest assignable sandbox app index per bundle.
    pub max_sandbox_app_index: u32,
    /// Optional pre-install config files consumed by boot reconciliation.
    pub pre_install_config: Option<PathBuf>,
    pub pre_uninstall_config: Option<PathBuf>,
    pub pre_install_ability_config: Option<PathBuf>,
    pub default_permission_config: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            code_root: PathBuf::from("/data/app/el1/bundle/public"),
            data_root: PathBuf::from("/data/app/el2"),
            store_root: PathBuf::from("/data/service/el1/public/bms"),
            system_app_dirs: vec![PathBuf::from("/system/app")],
            third_system_app_dirs: vec![PathBuf::from("/system/vendor")],
            system_resources_bundle: "ohos.global.systemres".into(),
            device_capabilities: BTreeSet::new(),
            system_ids: IdRange {
                base: 2_100,
                count: 800,
            },
            third_system_ids: IdRange {
                base: 2_900,
                count: 100,
            },
            third_party_ids: IdRange {
                base: 10_000,
                count: 55_536,
            },
            max_sandbox_app_index: 100,
            pre_install_config: None,
            pre_uninstall_config: None,
            pre_install_ability_config: None,
            default_permission_config: None,
        }
    }
}

impl ServiceConfig {
    /// Loads the configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or contains unknown or
    /// ill-typed fields.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading service config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing service config {}", path.display()))?;
        Ok(config)
    }

    #[must_use]
    pub fn id_range(&self, app_type: AppType) -> IdRange {
        match app_type {
            AppType::System => self.system_ids,
            AppType::ThirdPartySystem => self.third_system_ids,
            AppType::ThirdParty => self.third_party_ids,
        }
    }

    #[must_use]
    pub fn code_dir(&self, bundle_name: &str) -> PathBuf {
        self.code_root.join(bundle_name)
    }

    #[must_use]
    pub fn data_dir(&self, bundle_name: &str, user_id: i32) -> PathBuf {
        self.data_root.join(user_id.to_string()).join(bundle_name)
    }
}
