//! Durable JSON storage: one document per bundle record, one per
//! pre-install record, one for the identifier maps.
//!
//! Writes land in a sibling temp file first and are renamed into place so a
//! crash never leaves a half-written document behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use bms_domain::{InstallError, InstallResult, PackageRecord, PreInstallRecord};

const BUNDLES_DIR: &str = "bundles";
const PRE_INSTALL_DIR: &str = "preinstall";
const IDS_FILE: &str = "ids.json";

#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    /// # Errors
    /// Fails when the storage directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> InstallResult<Self> {
        let root = root.into();
        for dir in [root.join(BUNDLES_DIR), root.join(PRE_INSTALL_DIR)] {
            fs::create_dir_all(&dir).map_err(|err| io_error("create_dir", &dir, &err))?;
        }
        Ok(Self { root })
    }

    fn bundle_path(&self, bundle_name: &str) -> PathBuf {
        self.root.join(BUNDLES_DIR).join(format!("{bundle_name}.json"))
    }

    fn pre_install_path(&self, bundle_name: &str) -> PathBuf {
        self.root
            .join(PRE_INSTALL_DIR)
            .join(format!("{bundle_name}.json"))
    }

    pub fn save_record(&self, record: &PackageRecord) -> InstallResult<()> {
        write_document(&self.bundle_path(&record.bundle_name), record)
    }

    pub fn remove_record(&self, bundle_name: &str) -> InstallResult<()> {
        remove_document(&self.bundle_path(bundle_name))
    }

    /// Loads every persisted bundle record; unreadable documents are skipped
    /// with a warning so one corrupt file cannot brick the service.
    pub fn load_records(&self) -> InstallResult<Vec<PackageRecord>> {
        load_documents(&self.root.join(BUNDLES_DIR))
    }

    pub fn save_pre_install(&self, record: &PreInstallRecord) -> InstallResult<()> {
        write_document(&self.pre_install_path(&record.bundle_name), record)
    }

    pub fn remove_pre_install(&self, bundle_name: &str) -> InstallResult<()> {
        remove_document(&self.pre_install_path(bundle_name))
    }

    pub fn load_pre_install(&self, bundle_name: &str) -> InstallResult<Option<PreInstallRecord>> {
        let path = self.pre_install_path(bundle_name);
        if !path.exists() {
            return Ok(None);
        }
        read_document(&path).map(Some)
    }

    pub fn load_pre_installs(&self) -> InstallResult<Vec<PreInstallRecord>> {
        load_documents(&self.root.join(PRE_INSTALL_DIR))
    }

    pub fn save_id_maps(&self, maps: &BTreeMap<u32, String>) -> InstallResult<()> {
        write_document(&self.root.join(IDS_FILE), maps)
    }

    pub fn load_id_maps(&self) -> InstallResult<BTreeMap<u32, String>> {
        let path = self.root.join(IDS_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        read_document(&path)
    }
}

fn write_document<T: Serialize>(path: &Path, value: &T) -> InstallResult<()> {
    let payload = serde_json::to_vec_pretty(value)
        .map_err(|err| InstallError::Internal(format!("serializing {}: {err}", path.display())))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload).map_err(|err| io_error("write", &tmp, &err))?;
    fs::rename(&tmp, path).map_err(|err| io_error("rename", path, &err))?;
    Ok(())
}

fn read_document<T: DeserializeOwned>(path: &Path) -> InstallResult<T> {
    let text = fs::read_to_string(path).map_err(|err| io_error("read", path, &err))?;
    serde_json::from_str(&text)
        .map_err(|err| InstallError::Internal(format!("parsing {}: {err}", path.display())))
}

fn remove_document(path: &Path) -> InstallResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_error("remove", path, &err)),
    }
}

fn load_documents<T: DeserializeOwned>(dir: &Path) -> InstallResult<Vec<T>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let entries = fs::read_dir(dir).map_err(|err| io_error("read_dir", dir, &err))?;
    for entry in entries {
        let entry = entry.map_err(|err| io_error("read_dir", dir, &err))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_document(&path) {
            Ok(value) => out.push(value),
            Err(err) => warn!(path = %path.display(), %err, "skipping unreadable metadata document"),
        }
    }
    Ok(out)
}

fn io_error(op: &'static str, path: &Path, err: &std::io::Error) -> InstallError {
    InstallError::FileOperationFailed {
        op,
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bms_domain::AppType;

    #[test]
    fn pre_install_records_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(temp.path()).unwrap();
        let record = PreInstallRecord {
            bundle_name: "com.example.sys".into(),
            bundle_paths: vec!["/system/app/sys.hap".into()],
            app_type: AppType::System,
            version_code: 3,
        };
        store.save_pre_install(&record).unwrap();
        assert_eq!(store.load_pre_install("com.example.sys").unwrap(), Some(record.clone()));
        assert_eq!(store.load_pre_installs().unwrap(), vec![record]);
        store.remove_pre_install("com.example.sys").unwrap();
        assert_eq!(store.load_pre_install("com.example.sys").unwrap(), None);
    }

    #[test]
    fn corrupt_document_is_skipped_on_load() {
        let temp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(temp.path()).unwrap();
        fs::write(temp.path().join("bundles/broken.json"), b"not json").unwrap();
        assert!(store.load_records().unwrap().is_empty());
    }
}
