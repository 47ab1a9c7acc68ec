//! Typed fragments produced by the package parser.
//!
//! One archive parses into one [`BundleManifest`] carrying app-level labels
//! and exactly one module descriptor. The pack summary is a separate,
//! optional document.

use serde::{Deserialize, Serialize};

use crate::AppType;

/// Module-level portion of a parsed manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub package: String,
    pub module_name: String,
    pub is_entry: bool,
    pub installation_free: bool,
    pub required_capabilities: Vec<String>,
    pub defined_permissions: Vec<String>,
    pub requested_permissions: Vec<String>,
    /// Relative native library dir inside the archive, if any.
    pub native_library_path: Option<String>,
    pub cpu_abi: Option<String>,
}

/// App-level labels that every split of one bundle must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub bundle_name: String,
    pub vendor: String,
    pub version_code: u32,
    pub version_name: String,
    pub min_compatible_version: u32,
    pub target_version: u32,
    pub compatible_version: u32,
    pub release_type: String,
    pub singleton: bool,
    pub app_type: AppType,
    /// True for the current manifest format, false for the legacy one.
    pub new_module_format: bool,
    pub module: ModuleManifest,
}

/// Entry in the human-readable pack summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackModule {
    pub module_name: String,
    pub module_type: String,
    pub installation_free: bool,
}

/// Pack summary document; zero or one per split, cached once valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackManifest {
    pub bundle_name: String,
    pub version_code: u32,
    pub version_name: String,
    pub modules: Vec<PackModule>,
    #[serde(default)]
    valid: bool,
}

impl PackManifest {
    /// Builds a summary from its app-level labels; modules start empty and
    /// the summary is not valid until marked with [`Self::set_valid`].
    #[must_use]
    pub fn new(bundle_name: String, version_code: u32, version_name: String) -> Self {
        Self {
            bundle_name,
            version_code,
            version_name,
            modules: Vec::new(),
            valid: false,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Whether the entry module is marked installation free.
    #[must_use]
    pub fn entry_installation_free(&self) -> bool {
        self.modules
            .iter()
            .any(|m| m.module_type == "entry" && m.installation_free)
    }
}

/// One row of the pre-install scan configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreInstallConfigEntry {
    pub app_dir: String,
    #[serde(default = "default_true")]
    pub removable: bool,
}

/// One row of the pre-install ability configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreInstallAbilityEntry {
    pub bundle_name: String,
    pub ability_name: String,
}

/// Default permission grants applied when a bundle's token is issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultPermissionEntry {
    pub bundle_name: String,
    pub permissions: Vec<String>,
}

fn default_true() -> bool {
    true
}
