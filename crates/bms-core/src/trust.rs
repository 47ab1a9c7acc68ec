//! Signature verification seam.
//!
//! The engines only need three facts out of a package's signing information:
//! a stable application identity, the privilege level, and the app feature.
//! [`LocalTrustManager`] reads them from a signature document embedded in the
//! archive; production deployments plug in a real verifier behind the trait.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use bms_domain::{DefaultPermissionEntry, InstallError, InstallResult, PackageRecord};

use crate::parser::read_entry;

const SIGNATURE_ENTRY: &str = "META-INF/signature.json";

/// Outcome of verifying one archive.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SignatureInfo {
    /// Signature-derived identity, stable across versions of one app.
    pub app_id: String,
    /// App privilege level, e.g. `normal` or `system_core`.
    #[serde(default = "default_apl")]
    pub apl: String,
    #[serde(default)]
    pub app_feature: String,
}

fn default_apl() -> String {
    "normal".into()
}

pub trait TrustManager: Send + Sync {
    /// Verifies one archive and returns its signing facts.
    ///
    /// # Errors
    /// [`InstallError::SignatureVerifyFailed`] when the archive carries no
    /// acceptable signature.
    fn verify(&self, path: &Path) -> InstallResult<SignatureInfo>;

    /// Issues an access token binding the bundle (or one sandbox instance,
    /// `app_index > 0`) for one user to its permission set.
    fn issue_token(
        &self,
        record: &PackageRecord,
        user_id: i32,
        app_index: u32,
    ) -> InstallResult<u32>;

    /// Revoking an unknown token is not an error.
    fn revoke_token(&self, token: u32) -> InstallResult<()>;

    /// Grants the record's requested permissions to an issued token.
    fn grant_permissions(&self, record: &PackageRecord, token: u32) -> InstallResult<()>;
}

/// Verifier for self-describing archives: the signing facts are read from a
/// `META-INF/signature.json` entry inside the zip. Tokens are plain local
/// counters; grants are recorded in the log only.
#[derive(Debug, Default)]
pub struct LocalTrustManager {
    next_token: AtomicU32,
    default_permissions: Vec<DefaultPermissionEntry>,
}

impl LocalTrustManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds device-policy permission grants applied on top of what each
    /// bundle requests.
    #[must_use]
    pub fn with_default_permissions(defaults: Vec<DefaultPermissionEntry>) -> Self {
        Self {
            next_token: AtomicU32::new(0),
            default_permissions: defaults,
        }
    }

    /// Like [`Self::with_default_permissions`], reading the grant list from a
    /// JSON file. An absent or unreadable file yields an empty list.
    #[must_use]
    pub fn with_default_permission_file(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::new();
        };
        let defaults = match crate::parser::PackageParser::parse_default_permissions(path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %path.display(), %err, "default permission config unreadable");
                Vec::new()
            }
        };
        Self::with_default_permissions(defaults)
    }
}

impl TrustManager for LocalTrustManager {
    fn verify(&self, path: &Path) -> InstallResult<SignatureInfo> {
        let file = std::fs::File::open(path).map_err(|err| InstallError::SignatureVerifyFailed {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|err| InstallError::SignatureVerifyFailed {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        let Some(text) = read_entry(&mut archive, SIGNATURE_ENTRY) else {
            return Err(InstallError::SignatureVerifyFailed {
                path: path.display().to_string(),
                reason: "no signature entry".into(),
            });
        };
        let text = text.map_err(|err| InstallError::SignatureVerifyFailed {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        let root: Value =
            serde_json::from_str(&text).map_err(|err| InstallError::SignatureVerifyFailed {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        let info: SignatureInfo =
            serde_json::from_value(root).map_err(|err| InstallError::SignatureVerifyFailed {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        if info.app_id.is_empty() {
            return Err(InstallError::SignatureVerifyFailed {
                path: path.display().to_string(),
                reason: "empty app id".into(),
            });
        }
        debug!(path = %path.display(), app_id = %info.app_id, apl = %info.apl, "signature verified");
        Ok(info)
    }

    fn issue_token(
        &self,
        record: &PackageRecord,
        user_id: i32,
        app_index: u32,
    ) -> InstallResult<u32> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            bundle = %record.bundle_name,
            user = user_id,
            app_index,
            token,
            "access token issued"
        );
        Ok(token)
    }

    fn revoke_token(&self, token: u32) -> InstallResult<()> {
        debug!(token, "access token revoked");
        Ok(())
    }

    fn grant_permissions(&self, record: &PackageRecord, token: u32) -> InstallResult<()> {
        let mut granted = record.requested_permissions();
        for entry in &self.default_permissions {
            if entry.bundle_name == record.bundle_name {
                for perm in &entry.permissions {
                    if !granted.contains(perm) {
                        granted.push(perm.clone());
                    }
                }
            }
        }
        debug!(bundle = %record.bundle_name, token, count = granted.len(), "permissions granted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn archive(signature: Option<&str>) -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        let file = std::fs::File::create(temp.path().join("pkg.hap")).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer.start_file("module.json", FileOptions::default()).unwrap();
        writer.write_all(b"{}").unwrap();
        if let Some(signature) = signature {
            writer
                .start_file("META-INF/signature.json", FileOptions::default())
                .unwrap();
            writer.write_all(signature.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        temp
    }

    #[test]
    fn embedded_signature_is_read() {
        let temp = archive(Some(r#"{"app_id": "id-1", "apl": "system_basic"}"#));
        let info = LocalTrustManager::new()
            .verify(&temp.path().join("pkg.hap"))
            .unwrap();
        assert_eq!(info.app_id, "id-1");
        assert_eq!(info.apl, "system_basic");
    }

    #[test]
    fn missing_signature_fails_verification() {
        let temp = archive(None);
        assert!(matches!(
            LocalTrustManager::new()
                .verify(&temp.path().join("pkg.hap"))
                .unwrap_err(),
            InstallError::SignatureVerifyFailed { .. }
        ));
    }

    #[test]
    fn tokens_are_unique_and_monotonic() {
        let trust = LocalTrustManager::new();
        let record = sample_record();
        let a = trust.issue_token(&record, 0, 0).unwrap();
        let b = trust.issue_token(&record, 0, 2).unwrap();
        assert_ne!(a, b);
        trust.revoke_token(a).unwrap();
        trust.grant_permissions(&record, b).unwrap();
    }

    fn sample_record() -> PackageRecord {
        PackageRecord {
            bundle_name: "com.example.demo".into(),
            app_id: "id".into(),
            apl: "normal".into(),
            version_code: 1,
            version_name: "1.0".into(),
            min_compatible_version: 1,
            target_version: 8,
            compatible_version: 8,
            release_type: "Release".into(),
            vendor: "v".into(),
            app_type: bms_domain::AppType::ThirdParty,
            is_system_app: false,
            is_pre_install: false,
            singleton: false,
            entry_installation_free: false,
            removable: true,
            new_module_format: true,
            code_path: "/app/com.example.demo".into(),
            modules: indexmap::IndexMap::new(),
            users: std::collections::BTreeMap::new(),
            install_mark: None,
            app_index: 0,
            is_sandbox: false,
        }
    }
}
