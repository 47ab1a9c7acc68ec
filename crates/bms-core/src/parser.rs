//! Package archive parsing.
//!
//! A package is a zip archive carrying a JSON profile (`module.json` in the
//! current format, `config.json` in the legacy one) plus an optional
//! `pack.info` summary. The profile is walked field by field so a missing
//! property and an ill-typed property report as distinct results.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;
use zip::ZipArchive;

use bms_domain::{
    AppType, BundleManifest, DefaultPermissionEntry, InstallError, InstallResult, ModuleManifest,
    PackManifest, PreInstallAbilityEntry, PreInstallConfigEntry,
};

const NEW_PROFILE: &str = "module.json";
const OLD_PROFILE: &str = "config.json";
const PACK_INFO: &str = "pack.info";

pub struct PackageParser;

impl PackageParser {
    /// Parses the profile of one archive into a [`BundleManifest`].
    ///
    /// `app_type` comes from the install source (scan directory or caller),
    /// not from the profile.
    ///
    /// # Errors
    /// [`InstallError::InvalidBundleFile`] when the path is not a readable
    /// archive, [`InstallError::NoProfile`] when neither profile name exists
    /// inside it, and the parse-profile variants for malformed content.
    pub fn parse(path: &Path, app_type: AppType) -> InstallResult<BundleManifest> {
        let mut archive = open_archive(path)?;
        let (text, new_format) = match read_entry(&mut archive, NEW_PROFILE) {
            Some(text) => (text?, true),
            None => match read_entry(&mut archive, OLD_PROFILE) {
                Some(text) => (text?, false),
                None => return Err(InstallError::NoProfile),
            },
        };
        let root: Value = serde_json::from_str(&text)
            .map_err(|err| InstallError::ParseUnexpected(err.to_string()))?;
        debug!(path = %path.display(), new_format, "profile loaded");
        parse_profile(&root, app_type, new_format)
    }

    /// Parses the optional `pack.info` summary of one archive.
    ///
    /// Archives without a summary yield `None`; a present but malformed
    /// summary is an error.
    pub fn parse_pack_info(path: &Path) -> InstallResult<Option<PackManifest>> {
        let mut archive = open_archive(path)?;
        let Some(text) = read_entry(&mut archive, PACK_INFO) else {
            return Ok(None);
        };
        let root: Value = serde_json::from_str(&text?)
            .map_err(|err| InstallError::ParseUnexpected(err.to_string()))?;
        parse_pack_info(&root).map(Some)
    }

    /// Parses the pre-install scan configuration.
    pub fn parse_pre_install_config(path: &Path) -> InstallResult<Vec<PreInstallConfigEntry>> {
        parse_config_file(path)
    }

    /// Parses the list of bundle names the device forbids.
    pub fn parse_pre_uninstall_config(path: &Path) -> InstallResult<Vec<String>> {
        parse_config_file(path)
    }

    /// Parses the pre-install ability configuration.
    pub fn parse_pre_install_abilities(path: &Path) -> InstallResult<Vec<PreInstallAbilityEntry>> {
        parse_config_file(path)
    }

    /// Parses the device-policy default permission grants.
    pub fn parse_default_permissions(path: &Path) -> InstallResult<Vec<DefaultPermissionEntry>> {
        parse_config_file(path)
    }

    /// SHA-256 of the whole archive file, hex encoded.
    pub fn archive_sha256(path: &Path) -> InstallResult<String> {
        let mut file = File::open(path).map_err(|_| InstallError::InvalidBundleFile {
            path: path.display().to_string(),
        })?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).map_err(|err| InstallError::FileOperationFailed {
            op: "read",
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Ok(hex::encode(hasher.finalize()))
    }
}

fn parse_config_file<T: DeserializeOwned>(path: &Path) -> InstallResult<T> {
    let text =
        std::fs::read_to_string(path).map_err(|err| InstallError::FileOperationFailed {
            op: "read",
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
    serde_json::from_str(&text).map_err(|err| InstallError::ParseUnexpected(err.to_string()))
}

fn open_archive(path: &Path) -> InstallResult<ZipArchive<File>> {
    if !path.is_file() {
        return Err(InstallError::InvalidBundleFile {
            path: path.display().to_string(),
        });
    }
    let file = File::open(path).map_err(|_| InstallError::InvalidBundleFile {
        path: path.display().to_string(),
    })?;
    ZipArchive::new(file).map_err(|_| InstallError::InvalidBundleFile {
        path: path.display().to_string(),
    })
}

/// Reads a top-level archive entry as text. `None` when the entry does not
/// exist, `Some(Err)` when it exists but cannot be read.
pub(crate) fn read_entry(
    archive: &mut ZipArchive<File>,
    name: &str,
) -> Option<InstallResult<String>> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return None,
        Err(err) => return Some(Err(InstallError::ParseUnexpected(err.to_string()))),
    };
    let mut text = String::new();
    if let Err(err) = entry.read_to_string(&mut text) {
        return Some(Err(InstallError::ParseUnexpected(err.to_string())));
    }
    Some(Ok(text))
}

fn parse_profile(root: &Value, app_type: AppType, new_format: bool) -> InstallResult<BundleManifest> {
    let app = require_object(root, "app")?;
    let module = require_object(root, "module")?;
    let version = require_object(app, "version")?;
    let api = require_object(app, "apiVersion")?;
    let distro = require_object(module, "distro")?;

    let module_type = require_string(distro, "moduleType")?;
    Ok(BundleManifest {
        bundle_name: require_string(app, "bundleName")?,
        vendor: optional_string(app, "vendor")?.unwrap_or_default(),
        version_code: require_u32(version, "code")?,
        version_name: require_string(version, "name")?,
        min_compatible_version: optional_u32(version, "minCompatibleVersionCode")?
            .unwrap_or(require_u32(version, "code")?),
        target_version: require_u32(api, "target")?,
        compatible_version: require_u32(api, "compatible")?,
        release_type: optional_string(api, "releaseType")?.unwrap_or_else(|| "Release".into()),
        singleton: optional_bool(app, "singleton")?.unwrap_or(false),
        app_type,
        new_module_format: new_format,
        module: ModuleManifest {
            package: require_string(module, "package")?,
            module_name: require_string(distro, "moduleName")?,
            is_entry: module_type == "entry",
            installation_free: optional_bool(distro, "installationFree")?.unwrap_or(false),
            required_capabilities: string_array(module, "reqCapabilities")?,
            defined_permissions: named_array(module, "defPermissions")?,
            requested_permissions: named_array(module, "reqPermissions")?,
            native_library_path: optional_string(module, "nativeLibraryPath")?,
            cpu_abi: optional_string(module, "cpuAbi")?,
        },
    })
}

fn parse_pack_info(root: &Value) -> InstallResult<PackManifest> {
    let summary = require_object(root, "summary")?;
    let app = require_object(summary, "app")?;
    let version = require_object(app, "version")?;
    let mut manifest = PackManifest::new(
        require_string(app, "bundleName")?,
        require_u32(version, "code")?,
        require_string(version, "name")?,
    );
    let Some(modules) = summary.get("modules") else {
        return Err(InstallError::ParseProfileMissingProp("modules".into()));
    };
    let modules = modules
        .as_array()
        .ok_or_else(|| InstallError::ParseProfilePropTypeError("modules".into()))?;
    for entry in modules {
        let distro = require_object(entry, "distro")?;
        manifest.modules.push(bms_domain::PackModule {
            module_name: require_string(distro, "moduleName")?,
            module_type: require_string(distro, "moduleType")?,
            installation_free: optional_bool(distro, "installationFree")?.unwrap_or(false),
        });
    }
    manifest.set_valid(true);
    Ok(manifest)
}

// -- field extraction helpers; missing and ill-typed report differently --

fn require_object<'a>(value: &'a Value, key: &str) -> InstallResult<&'a Value> {
    let inner = value
        .get(key)
        .ok_or_else(|| InstallError::ParseProfileMissingProp(key.into()))?;
    if !inner.is_object() {
        return Err(InstallError::ParseProfilePropTypeError(key.into()));
    }
    Ok(inner)
}

fn require_string(value: &Value, key: &str) -> InstallResult<String> {
    match value.get(key) {
        None => Err(InstallError::ParseProfileMissingProp(key.into())),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(InstallError::ParseProfilePropTypeError(key.into())),
    }
}

fn optional_string(value: &Value, key: &str) -> InstallResult<Option<String>> {
    match value.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(InstallError::ParseProfilePropTypeError(key.into())),
    }
}

fn require_u32(value: &Value, key: &str) -> InstallResult<u32> {
    match value.get(key) {
        None => Err(InstallError::ParseProfileMissingProp(key.into())),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| InstallError::ParseProfilePropTypeError(key.into())),
    }
}

fn optional_u32(value: &Value, key: &str) -> InstallResult<Option<u32>> {
    match value.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| InstallError::ParseProfilePropTypeError(key.into())),
    }
}

fn optional_bool(value: &Value, key: &str) -> InstallResult<Option<bool>> {
    match value.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(InstallError::ParseProfilePropTypeError(key.into())),
    }
}

fn string_array(value: &Value, key: &str) -> InstallResult<Vec<String>> {
    match value.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| InstallError::ParseProfilePropTypeError(key.into()))
            })
            .collect(),
        Some(_) => Err(InstallError::ParseProfilePropTypeError(key.into())),
    }
}

/// Arrays of `{"name": ...}` objects, as used by the permission lists.
fn named_array(value: &Value, key: &str) -> InstallResult<Vec<String>> {
    match value.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| require_string(item, "name"))
            .collect(),
        Some(_) => Err(InstallError::ParseProfilePropTypeError(key.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn archive_with(entries: &[(&str, &str)]) -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        let file = File::create(temp.path().join("pkg.hap")).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, content) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        temp
    }

    fn profile(module_type: &str) -> String {
        format!(
            r#"{{
                "app": {{
                    "bundleName": "com.example.demo",
                    "vendor": "example",
                    "version": {{ "code": 3, "name": "3.0" }},
                    "apiVersion": {{ "compatible": 8, "target": 8, "releaseType": "Release" }}
                }},
                "module": {{
                    "package": "com.example.demo.{module_type}",
                    "distro": {{ "moduleName": "{module_type}", "moduleType": "{module_type}" }},
                    "reqPermissions": [ {{ "name": "ohos.permission.INTERNET" }} ]
                }}
            }}"#
        )
    }

    #[test]
    fn new_format_profile_parses() {
        let temp = archive_with(&[("module.json", &profile("entry"))]);
        let manifest =
            PackageParser::parse(&temp.path().join("pkg.hap"), AppType::ThirdParty).unwrap();
        assert_eq!(manifest.bundle_name, "com.example.demo");
        assert_eq!(manifest.version_code, 3);
        assert!(manifest.new_module_format);
        assert!(manifest.module.is_entry);
        assert_eq!(manifest.min_compatible_version, 3);
        assert_eq!(
            manifest.module.requested_permissions,
            vec!["ohos.permission.INTERNET".to_owned()]
        );
    }

    #[test]
    fn legacy_profile_clears_new_format_flag() {
        let temp = archive_with(&[("config.json", &profile("feature"))]);
        let manifest =
            PackageParser::parse(&temp.path().join("pkg.hap"), AppType::ThirdParty).unwrap();
        assert!(!manifest.new_module_format);
        assert!(!manifest.module.is_entry);
    }

    #[test]
    fn missing_profile_is_distinct_from_bad_archive() {
        let temp = archive_with(&[("other.txt", "x")]);
        assert_eq!(
            PackageParser::parse(&temp.path().join("pkg.hap"), AppType::ThirdParty).unwrap_err(),
            InstallError::NoProfile
        );

        let temp2 = tempfile::tempdir().unwrap();
        std::fs::write(temp2.path().join("junk.hap"), b"not a zip").unwrap();
        assert!(matches!(
            PackageParser::parse(&temp2.path().join("junk.hap"), AppType::ThirdParty).unwrap_err(),
            InstallError::InvalidBundleFile { .. }
        ));
    }

    #[test]
    fn missing_and_mistyped_properties_report_differently() {
        let no_name = r#"{
            "app": { "version": { "code": 1, "name": "1.0" },
                     "apiVersion": { "compatible": 8, "target": 8 } },
            "module": { "package": "p", "distro": { "moduleName": "m", "moduleType": "entry" } }
        }"#;
        let temp = archive_with(&[("module.json", no_name)]);
        assert_eq!(
            PackageParser::parse(&temp.path().join("pkg.hap"), AppType::ThirdParty).unwrap_err(),
            InstallError::ParseProfileMissingProp("bundleName".into())
        );

        let bad_code = r#"{
            "app": { "bundleName": "b", "version": { "code": "one", "name": "1.0" },
                     "apiVersion": { "compatible": 8, "target": 8 } },
            "module": { "package": "p", "distro": { "moduleName": "m", "moduleType": "entry" } }
        }"#;
        let temp = archive_with(&[("module.json", bad_code)]);
        assert_eq!(
            PackageParser::parse(&temp.path().join("pkg.hap"), AppType::ThirdParty).unwrap_err(),
            InstallError::ParseProfilePropTypeError("code".into())
        );
    }

    #[test]
    fn pack_info_is_optional_but_validated_when_present() {
        let temp = archive_with(&[("module.json", &profile("entry"))]);
        assert_eq!(
            PackageParser::parse_pack_info(&temp.path().join("pkg.hap")).unwrap(),
            None
        );

        let pack = r#"{
            "summary": {
                "app": { "bundleName": "com.example.demo", "version": { "code": 3, "name": "3.0" } },
                "modules": [
                    { "distro": { "moduleName": "entry", "moduleType": "entry", "installationFree": true } }
                ]
            }
        }"#;
        let temp = archive_with(&[("module.json", &profile("entry")), ("pack.info", pack)]);
        let manifest = PackageParser::parse_pack_info(&temp.path().join("pkg.hap"))
            .unwrap()
            .unwrap();
        assert!(manifest.is_valid());
        assert!(manifest.entry_installation_free());
    }

    #[test]
    fn archive_hash_is_stable() {
        let temp = archive_with(&[("module.json", &profile("entry"))]);
        let path = temp.path().join("pkg.hap");
        let a = PackageParser::archive_sha256(&path).unwrap();
        let b = PackageParser::archive_sha256(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
