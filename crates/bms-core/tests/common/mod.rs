//! Shared fixtures: a service rooted in a temp dir and a package builder.
#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use zip::write::FileOptions;

use bms_core::{BundleService, ServiceConfig};

pub struct Fixture {
    pub temp: tempfile::TempDir,
    pub service: BundleService,
}

pub fn fixture() -> Fixture {
    fixture_with(|_| {})
}

pub fn fixture_with(tweak: impl FnOnce(&mut ServiceConfig)) -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    let mut config = ServiceConfig {
        code_root: root.join("app"),
        data_root: root.join("data"),
        store_root: root.join("store"),
        system_app_dirs: vec![root.join("system")],
        third_system_app_dirs: vec![],
        ..ServiceConfig::default()
    };
    std::fs::create_dir_all(root.join("system")).unwrap();
    tweak(&mut config);
    let service = BundleService::open_local(config).unwrap();
    Fixture { temp, service }
}

/// Drops the running service and opens a fresh one over the same state,
/// simulating a process restart.
pub fn reopen(fixture: Fixture) -> Fixture {
    let Fixture { temp, service } = fixture;
    let config = service.config.clone();
    drop(service);
    let service = BundleService::open_local(config).unwrap();
    Fixture { temp, service }
}

/// Declarative split-archive builder.
pub struct Hap {
    pub bundle: String,
    pub package: String,
    pub module_name: String,
    pub module_type: String,
    pub version: u32,
    pub version_name: String,
    pub vendor: String,
    pub singleton: bool,
    pub app_id: String,
    pub permissions: Vec<String>,
    pub capabilities: Vec<String>,
}

impl Hap {
    pub fn entry(bundle: &str, version: u32) -> Self {
        Self::module(bundle, "entry", "entry", version)
    }

    pub fn feature(bundle: &str, name: &str, version: u32) -> Self {
        Self::module(bundle, name, "feature", version)
    }

    fn module(bundle: &str, name: &str, module_type: &str, version: u32) -> Self {
        Self {
            bundle: bundle.to_owned(),
            package: format!("{bundle}.{name}"),
            module_name: name.to_owned(),
            module_type: module_type.to_owned(),
            version,
            version_name: format!("{version}.0"),
            vendor: "example".to_owned(),
            singleton: false,
            app_id: format!("appid-{bundle}"),
            permissions: Vec::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn permission(mut self, name: &str) -> Self {
        self.permissions.push(name.to_owned());
        self
    }

    pub fn write_to(&self, dir: &Path) -> PathBuf {
        let path = dir.join(format!("{}-{}-v{}.hap", self.bundle, self.module_name, self.version));
        let profile = serde_json::json!({
            "app": {
                "bundleName": self.bundle,
                "vendor": self.vendor,
                "version": { "code": self.version, "name": self.version_name },
                "apiVersion": { "compatible": 8, "target": 8, "releaseType": "Release" },
                "singleton": self.singleton,
            },
            "module": {
                "package": self.package,
                "distro": {
                    "moduleName": self.module_name,
                    "moduleType": self.module_type,
                    "installationFree": false,
                },
                "reqCapabilities": self.capabilities,
                "reqPermissions": self
                    .permissions
                    .iter()
                    .map(|name| serde_json::json!({ "name": name }))
                    .collect::<Vec<_>>(),
            },
        });
        let signature = serde_json::json!({ "app_id": self.app_id, "apl": "normal" });

        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer.start_file("module.json", FileOptions::default()).unwrap();
        writer
            .write_all(serde_json::to_string(&profile).unwrap().as_bytes())
            .unwrap();
        writer
            .start_file("META-INF/signature.json", FileOptions::default())
            .unwrap();
        writer
            .write_all(serde_json::to_string(&signature).unwrap().as_bytes())
            .unwrap();
        writer
            .start_file("payload.bin", FileOptions::default())
            .unwrap();
        writer.write_all(&[0u8; 64]).unwrap();
        writer.finish().unwrap();
        path
    }
}
