//! Boot-time reconciliation of persisted metadata against the on-disk
//! archive set.
//!
//! Runs in two phases: crash recovery first (any record whose exception
//! marker is non-terminal identifies an interrupted transaction), then the
//! scan pass. Cold boot (empty metadata) installs everything found in the
//! system directories; warm boot diffs the scan against the pre-install
//! records and applies only the drift. The pass is a fixed point: running it
//! twice against the same disk state performs no work the second time.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use bms_domain::{
    AppType, ExceptionStatus, InstallFlag, InstallParams, InstallResult, PackageRecord,
    PreInstallAbilityEntry, PreInstallConfigEntry, PreInstallRecord, DEFAULT_USER_ID,
};

use crate::config::ServiceConfig;
use crate::fileops::FileOps;
use crate::ident::IdentifierAllocator;
use crate::index::PackageIndex;
use crate::install::InstallEngine;
use crate::metrics::Metrics;
use crate::parser::PackageParser;

const ARCHIVE_EXTENSION: &str = "hap";

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub recovered: usize,
    pub installed: usize,
    pub updated: usize,
    pub module_installs: usize,
    pub uninstalled: usize,
    pub module_uninstalls: usize,
}

impl ReconcileSummary {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// One bundle as discovered by the directory scan.
struct ScannedBundle {
    app_type: AppType,
    version_code: u32,
    /// archive path -> module package name.
    archives: Vec<(PathBuf, String)>,
    removable: bool,
}

pub struct BootReconciler {
    config: ServiceConfig,
    index: Arc<PackageIndex>,
    engine: Arc<InstallEngine>,
    allocator: Arc<IdentifierAllocator>,
    fileops: Arc<dyn FileOps>,
    metrics: Arc<Metrics>,
}

impl BootReconciler {
    pub fn new(
        config: ServiceConfig,
        index: Arc<PackageIndex>,
        engine: Arc<InstallEngine>,
        allocator: Arc<IdentifierAllocator>,
        fileops: Arc<dyn FileOps>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            index,
            engine,
            allocator,
            fileops,
            metrics,
        }
    }

    /// Runs one full reconciliation pass.
    pub fn reconcile(&self) -> InstallResult<ReconcileSummary> {
        self.metrics.reset();
        let mut summary = ReconcileSummary {
            recovered: self.recover_interrupted(),
            ..ReconcileSummary::default()
        };

        let scan_started = Instant::now();
        let mut scanned = self.scan();
        self.metrics.add_scan_time(scan_started.elapsed());
        let blocked = self.load_pre_uninstall_list();
        if !blocked.is_empty() {
            scanned.retain(|name, _| !blocked.contains(name));
        }
        let recorded = self.index.pre_install_records()?;
        if self.index.is_empty() && recorded.is_empty() {
            info!(bundles = scanned.len(), "cold boot scan");
            self.cold_boot(&scanned, &mut summary);
        } else {
            info!(
                scanned = scanned.len(),
                recorded = recorded.len(),
                "warm boot scan"
            );
            self.warm_boot(&scanned, recorded, &mut summary)?;
        }
        info!(?summary, "reconciliation finished");
        Ok(summary)
    }

    // ---- crash recovery ----

    /// Repairs every bundle whose durable marker shows an interrupted
    /// transaction. Returns how many bundles needed repair.
    fn recover_interrupted(&self) -> usize {
        let mut recovered = 0;
        for name in self.index.bundle_names() {
            let Some(record) = self.index.get(&name) else {
                continue;
            };
            let Some(mark) = record.install_mark.clone() else {
                continue;
            };
            if mark.status.is_terminal() {
                continue;
            }
            info!(bundle = %name, status = ?mark.status, "recovering interrupted transaction");
            if let Err(err) = self.repair(record, mark.status, mark.module.as_deref()) {
                warn!(bundle = %name, %err, "crash recovery failed");
            }
            self.metrics.record_boot_recovery();
            recovered += 1;
        }
        recovered
    }

    fn repair(
        &self,
        record: PackageRecord,
        status: ExceptionStatus,
        module: Option<&str>,
    ) -> InstallResult<()> {
        let name = record.bundle_name.clone();
        match status {
            // Fresh install never committed: drop every trace, the
            // allocated identifier included.
            ExceptionStatus::InstallStart => {
                self.fileops.remove_dir(Path::new(&record.code_path))?;
                for user_id in record.users.keys() {
                    self.fileops
                        .remove_dir(&self.config.data_dir(&name, *user_id))?;
                }
                self.index.drop_record(&name);
                self.allocator.recycle(&name)?;
                Ok(())
            }
            // Update never reached its commit: the installed modules are
            // still the pre-update ones, only staging dirs may remain.
            ExceptionStatus::UpdatingNewStart
            | ExceptionStatus::UpdatingExistedStart
            | ExceptionStatus::RollBack => {
                self.remove_staging_dirs(&record.code_path);
                self.clear_mark(record)
            }
            // Metadata committed, batch rename interrupted: finish it.
            ExceptionStatus::RenamePending => {
                for module in record.modules.values() {
                    let final_dir = PathBuf::from(&module.source_dir);
                    let tmp_dir = staging_dir(&final_dir);
                    if tmp_dir.is_dir() {
                        self.fileops.remove_dir(&final_dir)?;
                        self.fileops.rename_dir(&tmp_dir, &final_dir)?;
                    } else if !final_dir.is_dir() {
                        // Neither staged nor final: rebuild from the source
                        // archive.
                        self.fileops
                            .extract_archive(Path::new(&module.archive_path), &final_dir)?;
                    }
                }
                self.clear_mark(record)
            }
            ExceptionStatus::UninstallBundleStart => {
                let users: Vec<i32> = record.users.keys().copied().collect();
                for user_id in users {
                    self.engine.uninstall(&name, &boot_uninstall_params(user_id))?;
                }
                Ok(())
            }
            ExceptionStatus::UninstallPackageStart => {
                if let Some(package) = module {
                    if record.find_module(package).is_some() {
                        return self.engine.uninstall_module(
                            &name,
                            package,
                            &boot_uninstall_params(DEFAULT_USER_ID),
                        );
                    }
                }
                self.clear_mark(record)
            }
            ExceptionStatus::InstallFinish | ExceptionStatus::UpdatingFinish => Ok(()),
        }
    }

    fn clear_mark(&self, mut record: PackageRecord) -> InstallResult<()> {
        record.set_install_mark(None, ExceptionStatus::InstallFinish);
        self.index.save_record(&record)
    }

    fn remove_staging_dirs(&self, code_path: &str) {
        let Ok(entries) = std::fs::read_dir(code_path) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_staging = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".tmp"));
            if is_staging {
                if let Err(err) = self.fileops.remove_dir(&path) {
                    warn!(path = %path.display(), %err, "staging dir removal failed");
                }
            }
        }
    }

    // ---- scanning ----

    fn scan(&self) -> HashMap<String, ScannedBundle> {
        let mut bundles: HashMap<String, ScannedBundle> = HashMap::new();
        let pre_install_entries = self.load_pre_install_config();
        let dirs = self
            .config
            .system_app_dirs
            .iter()
            .map(|dir| (dir.clone(), AppType::System))
            .chain(
                self.config
                    .third_system_app_dirs
                    .iter()
                    .map(|dir| (dir.clone(), AppType::ThirdPartySystem)),
            );
        for (dir, app_type) in dirs {
            if !dir.is_dir() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&dir)
                .follow_links(false)
                .into_iter()
                .filter_map(Result::ok)
            {
                let path = entry.path();
                if !entry.file_type().is_file()
                    || path.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXTENSION)
                {
                    continue;
                }
                let manifest = match PackageParser::parse(path, app_type) {
                    Ok(manifest) => manifest,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "skipping unparseable archive");
                        continue;
                    }
                };
                let removable = removable_for(&pre_install_entries, path);
                let bundle = bundles
                    .entry(manifest.bundle_name.clone())
                    .or_insert_with(|| ScannedBundle {
                        app_type,
                        version_code: manifest.version_code,
                        archives: Vec::new(),
                        removable,
                    });
                bundle.version_code = bundle.version_code.max(manifest.version_code);
                bundle.removable = bundle.removable && removable;
                bundle
                    .archives
                    .push((path.to_path_buf(), manifest.module.package));
            }
        }
        bundles
    }

    fn load_pre_install_config(&self) -> Vec<PreInstallConfigEntry> {
        let Some(path) = &self.config.pre_install_config else {
            return Vec::new();
        };
        match PackageParser::parse_pre_install_config(path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %path.display(), %err, "pre-install config unreadable");
                Vec::new()
            }
        }
    }

    /// Bundle names the device configuration forbids: their archives are
    /// ignored by the scan, so installed copies retire like any other
    /// vanished bundle.
    fn load_pre_uninstall_list(&self) -> HashSet<String> {
        let Some(path) = &self.config.pre_uninstall_config else {
            return HashSet::new();
        };
        match PackageParser::parse_pre_uninstall_config(path) {
            Ok(names) => names.into_iter().collect(),
            Err(err) => {
                warn!(path = %path.display(), %err, "pre-uninstall config unreadable");
                HashSet::new()
            }
        }
    }

    /// Typed rows of the pre-install ability configuration. Launching the
    /// listed abilities is the caller's business.
    pub fn pre_install_abilities(&self) -> Vec<PreInstallAbilityEntry> {
        let Some(path) = &self.config.pre_install_ability_config else {
            return Vec::new();
        };
        match PackageParser::parse_pre_install_abilities(path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %path.display(), %err, "pre-install ability config unreadable");
                Vec::new()
            }
        }
    }

    // ---- cold boot ----

    fn cold_boot(&self, scanned: &HashMap<String, ScannedBundle>, summary: &mut ReconcileSummary) {
        // The system resources bundle installs first; everything else in a
        // stable order.
        let mut names: Vec<&String> = scanned.keys().collect();
        names.sort_by_key(|name| (*name != &self.config.system_resources_bundle, name.as_str()));
        for name in names {
            let bundle = &scanned[name];
            match self.install_scanned(bundle) {
                Ok(()) => summary.installed += 1,
                Err(err) => warn!(bundle = %name, %err, "cold boot install failed"),
            }
        }
    }

    // ---- warm boot ----

    fn warm_boot(
        &self,
        scanned: &HashMap<String, ScannedBundle>,
        recorded: Vec<PreInstallRecord>,
        summary: &mut ReconcileSummary,
    ) -> InstallResult<()> {
        let recorded: HashMap<String, PreInstallRecord> = recorded
            .into_iter()
            .map(|record| (record.bundle_name.clone(), record))
            .collect();

        let mut names: Vec<&String> = scanned.keys().collect();
        names.sort_by_key(|name| (*name != &self.config.system_resources_bundle, name.as_str()));
        for name in &names {
            let bundle = &scanned[*name];
            let live = self.index.get(name);
            match (recorded.get(*name), &live) {
                // Never seen before: install as new.
                (None, _) => {
                    match self.install_scanned(bundle) {
                        Ok(()) => summary.installed += 1,
                        Err(err) => warn!(bundle = %name, %err, "boot install failed"),
                    }
                }
                // Known and installed: update on a strictly newer version,
                // otherwise fill in missing modules only.
                (Some(_), Some(live_record)) => {
                    if bundle.version_code > live_record.version_code {
                        match self.install_scanned(bundle) {
                            Ok(()) => summary.updated += 1,
                            Err(err) => warn!(bundle = %name, %err, "boot update failed"),
                        }
                    } else {
                        for (path, package) in &bundle.archives {
                            if live_record.find_module(package).is_none() {
                                match self.install_archive(bundle, path) {
                                    Ok(()) => summary.module_installs += 1,
                                    Err(err) => {
                                        warn!(bundle = %name, module = %package, %err, "boot module install failed");
                                    }
                                }
                            }
                        }
                    }
                }
                // Known but removed by the user: reinstall only when the
                // scan carries a strictly newer version (OTA).
                (Some(pre), None) => {
                    if bundle.version_code > pre.version_code {
                        match self.install_scanned(bundle) {
                            Ok(()) => summary.installed += 1,
                            Err(err) => warn!(bundle = %name, %err, "ota reinstall failed"),
                        }
                    } else {
                        debug!(bundle = %name, "stays uninstalled by user choice");
                    }
                }
            }
        }

        // Recorded bundles that vanished from the scan are retired.
        for (name, pre) in &recorded {
            if scanned.contains_key(name) {
                continue;
            }
            if let Some(live) = self.index.get(name) {
                let users: Vec<i32> = live.users.keys().copied().collect();
                let mut failed = false;
                for user_id in users {
                    if let Err(err) = self.engine.uninstall(name, &boot_uninstall_params(user_id)) {
                        warn!(bundle = %name, user = user_id, %err, "boot uninstall failed");
                        failed = true;
                    }
                }
                if !failed {
                    summary.uninstalled += 1;
                }
            }
            self.index.remove_pre_install_record(&pre.bundle_name)?;
        }

        // Bundle survives but one of its recorded archives is gone: retire
        // that module.
        for name in &names {
            let bundle = &scanned[*name];
            let Some(pre) = recorded.get(*name) else {
                continue;
            };
            let Some(live) = self.index.get(name) else {
                continue;
            };
            let still_present: Vec<&str> = bundle
                .archives
                .iter()
                .map(|(path, _)| path.to_str().unwrap_or_default())
                .collect();
            for recorded_path in &pre.bundle_paths {
                if still_present.contains(&recorded_path.as_str()) {
                    continue;
                }
                let Some(package) = live
                    .modules
                    .values()
                    .find(|m| m.archive_path == *recorded_path)
                    .map(|m| m.package.clone())
                else {
                    continue;
                };
                match self.engine.uninstall_module(
                    name,
                    &package,
                    &boot_uninstall_params(DEFAULT_USER_ID),
                ) {
                    Ok(()) => summary.module_uninstalls += 1,
                    Err(err) => {
                        warn!(bundle = %name, module = %package, %err, "boot module uninstall failed");
                    }
                }
            }
        }

        // Refresh the pre-install set to match the scan exactly.
        for name in &names {
            let bundle = &scanned[*name];
            let record = PreInstallRecord {
                bundle_name: (*name).clone(),
                bundle_paths: bundle
                    .archives
                    .iter()
                    .map(|(path, _)| path.display().to_string())
                    .collect(),
                app_type: bundle.app_type,
                version_code: bundle.version_code,
            };
            self.index.save_pre_install_record(&record)?;
        }
        Ok(())
    }

    fn install_scanned(&self, bundle: &ScannedBundle) -> InstallResult<()> {
        let paths: Vec<PathBuf> = bundle.archives.iter().map(|(p, _)| p.clone()).collect();
        self.engine
            .install_as(&paths, &boot_install_params(bundle.removable), bundle.app_type)
            .map(|_| ())
    }

    fn install_archive(&self, bundle: &ScannedBundle, path: &Path) -> InstallResult<()> {
        self.engine
            .install_as(
                &[path.to_path_buf()],
                &boot_install_params(bundle.removable),
                bundle.app_type,
            )
            .map(|_| ())
    }
}

fn staging_dir(final_dir: &Path) -> PathBuf {
    let mut name = final_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_owned();
    name.push_str(".tmp");
    final_dir.with_file_name(name)
}

fn boot_install_params(removable: bool) -> InstallParams {
    InstallParams {
        user_id: DEFAULT_USER_ID,
        flag: InstallFlag::ReplaceExisting,
        kill_running: false,
        send_event: false,
        is_pre_install_app: true,
        save_pre_install_record: true,
        removable,
        ..InstallParams::default()
    }
}

fn boot_uninstall_params(user_id: i32) -> InstallParams {
    InstallParams {
        user_id,
        force: true,
        kill_running: false,
        send_event: false,
        ..InstallParams::default()
    }
}

fn removable_for(entries: &[PreInstallConfigEntry], path: &Path) -> bool {
    for entry in entries {
        if path.starts_with(&entry.app_dir) {
            return entry.removable;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_dir_appends_the_suffix() {
        assert_eq!(
            staging_dir(Path::new("/app/demo/entry")),
            PathBuf::from("/app/demo/entry.tmp")
        );
    }

    #[test]
    fn removable_defaults_to_true_outside_configured_dirs() {
        let entries = vec![PreInstallConfigEntry {
            app_dir: "/system/app/pinned".into(),
            removable: false,
        }];
        assert!(!removable_for(&entries, Path::new("/system/app/pinned/demo.hap")));
        assert!(removable_for(&entries, Path::new("/system/app/other/demo.hap")));
    }
}
