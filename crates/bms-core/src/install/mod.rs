//! The install/update/uninstall state machine.
//!
//! One engine call is one transaction: pre-flight checks happen before any
//! mutation, the bundle's lock is held across the whole read-modify-write
//! sequence, and the durable exception marker is advanced strictly before
//! each filesystem mutation and strictly after it completes. Failures after
//! the first mutation unwind through an explicit [`rollback::RollbackStack`].

pub mod rollback;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info, warn};

use bms_domain::{
    AppType, BundleManifest, ExceptionStatus, InstallError, InstallParams, InstallResult,
    InstallState, InstallerState, ModuleRecord, PackageRecord, PreInstallRecord, UserRecord,
    ANY_USER_ID, DEFAULT_USER_ID,
};

use crate::config::ServiceConfig;
use crate::events::{EventHub, NotifyType, StatusEvent};
use crate::fileops::FileOps;
use crate::ident::{uid_for, IdentifierAllocator};
use crate::index::PackageIndex;
use crate::metrics::Metrics;
use crate::parser::PackageParser;
use crate::process::ProcessController;
use crate::sandbox::SandboxInstallEngine;
use crate::trust::{SignatureInfo, TrustManager};

use rollback::{RollbackStack, UndoAction};

/// Validated, mutually consistent split set for one bundle.
struct ValidatedSplits {
    bundle_name: String,
    version_code: u32,
    singleton: bool,
    new_format: bool,
    app_type: AppType,
    signature: SignatureInfo,
    manifests: Vec<(PathBuf, BundleManifest)>,
}

impl ValidatedSplits {
    fn has_entry(&self) -> bool {
        self.manifests.iter().any(|(_, m)| m.module.is_entry)
    }

    fn entry_installation_free(&self) -> bool {
        self.manifests
            .iter()
            .any(|(_, m)| m.module.is_entry && m.module.installation_free)
    }

    fn packages(&self) -> HashSet<&str> {
        self.manifests
            .iter()
            .map(|(_, m)| m.module.package.as_str())
            .collect()
    }
}

pub struct InstallEngine {
    config: ServiceConfig,
    index: Arc<PackageIndex>,
    allocator: Arc<IdentifierAllocator>,
    trust: Arc<dyn TrustManager>,
    fileops: Arc<dyn FileOps>,
    process: Arc<dyn ProcessController>,
    sandbox: Arc<SandboxInstallEngine>,
    events: Arc<EventHub>,
    metrics: Arc<Metrics>,
    progress: Mutex<HashMap<String, InstallerState>>,
}

impl InstallEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServiceConfig,
        index: Arc<PackageIndex>,
        allocator: Arc<IdentifierAllocator>,
        trust: Arc<dyn TrustManager>,
        fileops: Arc<dyn FileOps>,
        process: Arc<dyn ProcessController>,
        sandbox: Arc<SandboxInstallEngine>,
        events: Arc<EventHub>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            index,
            allocator,
            trust,
            fileops,
            process,
            sandbox,
            events,
            metrics,
            progress: Mutex::new(HashMap::new()),
        }
    }

    /// Installs or updates a third-party bundle from its split archives.
    pub fn install(&self, paths: &[PathBuf], params: &InstallParams) -> InstallResult<String> {
        self.install_as(paths, params, AppType::ThirdParty)
    }

    /// Install with an explicit bundle class; boot scans use the system
    /// classes.
    pub fn install_as(
        &self,
        paths: &[PathBuf],
        params: &InstallParams,
        app_type: AppType,
    ) -> InstallResult<String> {
        let started = Instant::now();
        let result = self.run_install(paths, params, app_type);
        self.metrics.add_install_time(started.elapsed());
        result
    }

    fn run_install(
        &self,
        paths: &[PathBuf],
        params: &InstallParams,
        app_type: AppType,
    ) -> InstallResult<String> {
        let splits = match self.preflight(paths, params, app_type) {
            Ok(splits) => splits,
            Err(err) => {
                warn!(%err, "install rejected before mutation");
                return Err(err);
            }
        };
        let name = splits.bundle_name.clone();

        // Sandbox state does not survive a base-bundle change.
        self.sandbox.uninstall_all(&name, ANY_USER_ID)?;
        self.set_progress(&name, InstallerState::SandboxRemoved);

        let lock = self.index.bundle_lock(&name);
        let _guard = lock.lock().expect("bundle lock poisoned");

        let existing = self.index.get(&name);
        let updating = existing.is_some();
        let result = match existing {
            None => self.process_new_install(&splits, params),
            Some(old) => self.process_update(&old, &splits, params),
        };
        match result {
            Ok(()) => {
                self.set_progress(&name, InstallerState::Success);
                if updating {
                    self.metrics.record_update(true);
                } else {
                    self.metrics.record_install(true);
                }
                if params.send_event {
                    let notify = if updating {
                        NotifyType::Update
                    } else {
                        NotifyType::Install
                    };
                    self.publish(&name, None, notify, params.user_id, true);
                }
                info!(bundle = %name, user = params.user_id, updating, "install finished");
                Ok(name)
            }
            Err(err) => {
                self.set_progress(&name, InstallerState::Failed);
                if updating {
                    self.metrics.record_update(false);
                } else {
                    self.metrics.record_install(false);
                }
                if params.send_event {
                    self.publish(&name, None, NotifyType::Install, params.user_id, false);
                }
                warn!(bundle = %name, user = params.user_id, %err, "install failed");
                Err(err)
            }
        }
    }

    /// Uninstalls the whole bundle for one user; the last user's uninstall
    /// removes the bundle entirely.
    pub fn uninstall(&self, bundle_name: &str, params: &InstallParams) -> InstallResult<()> {
        let started = Instant::now();
        let lock = self.index.bundle_lock(bundle_name);
        let _guard = lock.lock().expect("bundle lock poisoned");
        let result = self.uninstall_locked(bundle_name, params);
        self.metrics.record_uninstall(result.is_ok());
        self.metrics.add_uninstall_time(started.elapsed());
        if params.send_event {
            self.publish(
                bundle_name,
                None,
                NotifyType::Uninstall,
                params.user_id,
                result.is_ok(),
            );
        }
        result
    }

    /// Uninstalls one module; removing the only remaining module removes
    /// the bundle.
    pub fn uninstall_module(
        &self,
        bundle_name: &str,
        package: &str,
        params: &InstallParams,
    ) -> InstallResult<()> {
        let started = Instant::now();
        let lock = self.index.bundle_lock(bundle_name);
        let _guard = lock.lock().expect("bundle lock poisoned");

        let Some(record) = self.index.get(bundle_name) else {
            return Err(InstallError::NotInstalled);
        };
        if record.find_module(package).is_none() {
            return Err(InstallError::ModuleNotInstalled(package.to_owned()));
        }
        if record.is_only_module(package) {
            let result = self.uninstall_locked(bundle_name, params);
            self.metrics.record_uninstall(result.is_ok());
            self.metrics.add_uninstall_time(started.elapsed());
            if params.send_event {
                self.publish(
                    bundle_name,
                    Some(package),
                    NotifyType::Uninstall,
                    params.user_id,
                    result.is_ok(),
                );
            }
            return result;
        }

        let result = self.uninstall_module_locked(record, package, params);
        self.metrics.record_uninstall(result.is_ok());
        self.metrics.add_uninstall_time(started.elapsed());
        if params.send_event {
            self.publish(
                bundle_name,
                Some(package),
                NotifyType::UninstallModule,
                params.user_id,
                result.is_ok(),
            );
        }
        result
    }

    /// Reinstalls from the persisted pre-install record; for a bundle that
    /// already exists but not for this user, only per-user state is created.
    pub fn install_by_name(
        &self,
        bundle_name: &str,
        params: &InstallParams,
    ) -> InstallResult<String> {
        let Some(pre) = self.index.pre_install_record(bundle_name)? else {
            return Err(InstallError::NotInstalled);
        };
        if let Some(record) = self.index.get(bundle_name) {
            if record.has_user(params.user_id) {
                return Err(InstallError::AlreadyExists);
            }
            self.add_user_state(bundle_name, params)?;
            return Ok(bundle_name.to_owned());
        }
        let paths: Vec<PathBuf> = pre.bundle_paths.iter().map(PathBuf::from).collect();
        let mut replay = params.clone();
        replay.is_pre_install_app = true;
        replay.save_pre_install_record = true;
        self.install_as(&paths, &replay, pre.app_type)
    }

    /// Restores a previously removed system bundle.
    pub fn recover(&self, bundle_name: &str, params: &InstallParams) -> InstallResult<String> {
        let Some(pre) = self.index.pre_install_record(bundle_name)? else {
            return Err(InstallError::NotInstalled);
        };
        if pre.app_type == AppType::ThirdParty {
            return Err(InstallError::RecoverNotSystemApp);
        }
        self.install_by_name(bundle_name, params)
    }

    /// Coarse percentage-complete of the most recent operation on a bundle.
    #[must_use]
    pub fn progress(&self, bundle_name: &str) -> u8 {
        self.progress
            .lock()
            .expect("progress map poisoned")
            .get(bundle_name)
            .map_or(0, |state| state.percentage())
    }

    // ---- pre-flight ----

    fn preflight(
        &self,
        paths: &[PathBuf],
        params: &InstallParams,
        app_type: AppType,
    ) -> InstallResult<ValidatedSplits> {
        if paths.is_empty() {
            return Err(InstallError::InvalidParam {
                reason: "no package files supplied".into(),
            });
        }
        if !self.index.has_user(params.user_id) {
            return Err(InstallError::UserNotExist(params.user_id));
        }
        for path in paths {
            if !path.is_file() {
                return Err(InstallError::InvalidBundleFile {
                    path: path.display().to_string(),
                });
            }
        }

        let mut manifests = Vec::with_capacity(paths.len());
        for path in paths {
            let manifest = PackageParser::parse(path, app_type)?;
            manifests.push((path.clone(), manifest));
        }
        let bundle_name = manifests[0].1.bundle_name.clone();
        self.set_progress(&bundle_name, InstallerState::BundleChecked);

        for (_, manifest) in &manifests {
            for capability in &manifest.module.required_capabilities {
                if !self.config.device_capabilities.contains(capability) {
                    return Err(InstallError::CapabilityCheckFailed(capability.clone()));
                }
            }
        }
        self.set_progress(&bundle_name, InstallerState::SyscapChecked);

        let signature = self.trust.verify(&manifests[0].0)?;
        for (path, _) in manifests.iter().skip(1) {
            let other = self.trust.verify(path)?;
            if other.app_id != signature.app_id || other.apl != signature.apl {
                return Err(InstallError::InconsistentSignature);
            }
        }
        self.set_progress(&bundle_name, InstallerState::SignatureChecked);

        check_split_consistency(&manifests)?;
        self.set_progress(&bundle_name, InstallerState::Parsed);

        check_hash_params(&manifests, params)?;
        self.set_progress(&bundle_name, InstallerState::HashChecked);

        let first = &manifests[0].1;
        if first.singleton && params.user_id != DEFAULT_USER_ID {
            return Err(InstallError::SingletonUserMismatch {
                singleton: true,
                user_id: params.user_id,
            });
        }
        self.set_progress(&bundle_name, InstallerState::LabelChecked);

        Ok(ValidatedSplits {
            bundle_name,
            version_code: first.version_code,
            singleton: first.singleton,
            new_format: first.new_module_format,
            app_type,
            signature,
            manifests,
        })
    }

    // ---- fresh install ----

    fn process_new_install(
        &self,
        splits: &ValidatedSplits,
        params: &InstallParams,
    ) -> InstallResult<()> {
        let name = &splits.bundle_name;
        self.index
            .update_install_state(name, InstallState::InstallStart)?;
        let mut stack = RollbackStack::new();
        let result = self.do_new_install(splits, params, &mut stack);
        if let Err(err) = result {
            stack.unwind(
                &self.index,
                &self.allocator,
                self.trust.as_ref(),
                self.fileops.as_ref(),
            );
            self.metrics.record_rollback();
            self.index
                .settle_install_state(name, InstallState::InstallFail);
            return Err(err);
        }
        Ok(())
    }

    fn do_new_install(
        &self,
        splits: &ValidatedSplits,
        params: &InstallParams,
        stack: &mut RollbackStack,
    ) -> InstallResult<()> {
        let name = &splits.bundle_name;
        self.fileops
            .check_disk_space(&self.config.code_root, archive_bytes(&splits.manifests) * 2)?;

        let code_dir = self.config.code_dir(name);
        self.fileops.create_dir(&code_dir)?;
        stack.push(UndoAction::RemoveDir(code_dir.clone()));

        let offset = self.allocator.generate(name, splits.app_type)?;
        stack.push(UndoAction::RecycleId(name.clone()));
        let uid = uid_for(params.user_id, offset);

        let mut record = base_record(splits, params, &code_dir);
        record.set_install_mark(None, ExceptionStatus::InstallStart);
        self.index.add_record(record.clone())?;
        stack.push(UndoAction::DropRecord(name.clone()));

        let mut staged = Vec::new();
        for (path, manifest) in &splits.manifests {
            let package = &manifest.module.package;
            let final_dir = code_dir.join(package);
            let tmp_dir = code_dir.join(format!("{package}.tmp"));
            self.fileops.extract_archive(path, &tmp_dir)?;
            stack.push(UndoAction::RemoveDir(tmp_dir.clone()));
            staged.push((tmp_dir, final_dir.clone()));
            record.upsert_module(module_record(path, manifest, &final_dir, params)?)?;
        }

        let data_dir = self.config.data_dir(name, params.user_id);
        self.fileops.create_dir(&data_dir)?;
        stack.push(UndoAction::RemoveDir(data_dir));

        let token = self.trust.issue_token(&record, params.user_id, 0)?;
        stack.push(UndoAction::RevokeToken(token));
        let when = now();
        record.add_user(UserRecord {
            user_id: params.user_id,
            uid,
            access_token_id: token,
            install_time: when,
            update_time: when,
            enabled: true,
        });
        self.trust.grant_permissions(&record, token)?;
        self.set_progress(name, InstallerState::InfoSaved);

        // Metadata commits before the batch rename; the marker closes the
        // window between the two.
        record.set_install_mark(None, ExceptionStatus::RenamePending);
        self.index.save_record(&record)?;
        for (tmp, final_dir) in &staged {
            self.fileops.rename_dir(tmp, final_dir)?;
        }
        self.set_progress(name, InstallerState::Renamed);

        record.set_install_mark(None, ExceptionStatus::InstallFinish);
        self.index.save_record(&record)?;
        self.index
            .update_install_state(name, InstallState::InstallSuccess)?;
        stack.commit();

        if params.save_pre_install_record || params.is_pre_install_app {
            self.save_pre_install(splits)?;
        }
        Ok(())
    }

    // ---- update ----

    fn process_update(
        &self,
        old: &PackageRecord,
        splits: &ValidatedSplits,
        params: &InstallParams,
    ) -> InstallResult<()> {
        let name = &splits.bundle_name;
        check_type_compat(old, splits)?;
        check_version_compat(old, splits)?;

        self.index
            .update_install_state(name, InstallState::UpdatingStart)?;
        self.index.disable_bundle(name);
        let mut stack = RollbackStack::new();
        let result = self.do_update(old, splits, params, &mut stack);
        self.index.enable_bundle(name);

        if let Err(err) = result {
            if err.is_preflight() && !stack.is_committed() {
                debug!(bundle = %name, %err, "update rejected before mutation");
            }
            stack.unwind(
                &self.index,
                &self.allocator,
                self.trust.as_ref(),
                self.fileops.as_ref(),
            );
            self.metrics.record_rollback();
            // Restore the pre-transaction record through the rollback state.
            if self
                .index
                .update_install_state(name, InstallState::RollBack)
                .is_ok()
            {
                let mut restored = old.clone();
                restored.set_install_mark(None, ExceptionStatus::InstallFinish);
                if let Err(restore_err) = self.index.update_record(&restored) {
                    warn!(bundle = %name, %restore_err, "record restore failed");
                }
                self.index
                    .settle_install_state(name, InstallState::InstallSuccess);
            }
            return Err(err);
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn do_update(
        &self,
        old: &PackageRecord,
        splits: &ValidatedSplits,
        params: &InstallParams,
        stack: &mut RollbackStack,
    ) -> InstallResult<()> {
        let name = &splits.bundle_name;
        let new_version = splits.version_code;
        let replacing = params.replace();
        let mut record = old.clone();
        let code_dir = PathBuf::from(record.code_path.clone());

        // A same-version reinstall for an installed user is rejected before
        // the bundle's running processes are touched.
        if new_version == old.version_code && !replacing && record.has_user(params.user_id) {
            let reinstalls_existing = splits
                .manifests
                .iter()
                .any(|(_, manifest)| record.find_module(&manifest.module.package).is_some());
            if reinstalls_existing {
                return Err(InstallError::AlreadyExists);
            }
        }

        if params.kill_running {
            if let Some(uid) = record.uid(params.user_id) {
                self.process.kill_processes(name, uid)?;
            }
        }
        self.fileops
            .check_disk_space(&self.config.code_root, archive_bytes(&splits.manifests) * 2)?;

        let mut staged = Vec::new();
        for (path, manifest) in &splits.manifests {
            let package = &manifest.module.package;
            let final_dir = code_dir.join(package);
            if record.find_module(package).is_some() {
                if new_version == old.version_code && !replacing {
                    // Same version, new user: metadata refresh only.
                    continue;
                }
                record.set_install_mark(Some(package), ExceptionStatus::UpdatingExistedStart);
                self.index.save_record(&record)?;
            } else {
                if manifest.module.is_entry && record.has_entry() {
                    return Err(InstallError::EntryAlreadyExists);
                }
                if new_version == old.version_code {
                    check_labels_against(old, manifest)?;
                }
                record.set_install_mark(Some(package), ExceptionStatus::UpdatingNewStart);
                self.index.save_record(&record)?;
            }
            let tmp_dir = code_dir.join(format!("{package}.tmp"));
            self.fileops.extract_archive(path, &tmp_dir)?;
            stack.push(UndoAction::RemoveDir(tmp_dir.clone()));
            staged.push((tmp_dir, final_dir.clone()));
            record.upsert_module(module_record(path, manifest, &final_dir, params)?)?;
        }

        if !record.has_user(params.user_id) {
            // The incoming regime decides placement, so a bundle dropping
            // its singleton flag may gain this user in the same update.
            if splits.singleton && params.user_id != DEFAULT_USER_ID {
                return Err(InstallError::SingletonUserMismatch {
                    singleton: true,
                    user_id: params.user_id,
                });
            }
            let offset = self.allocator.generate(name, record.app_type)?;
            let uid = uid_for(params.user_id, offset);
            let data_dir = self.config.data_dir(name, params.user_id);
            self.fileops.create_dir(&data_dir)?;
            stack.push(UndoAction::RemoveDir(data_dir));
            let token = self.trust.issue_token(&record, params.user_id, 0)?;
            stack.push(UndoAction::RevokeToken(token));
            let when = now();
            record.add_user(UserRecord {
                user_id: params.user_id,
                uid,
                access_token_id: token,
                install_time: when,
                update_time: when,
                enabled: true,
            });
        }

        // A version bump drops modules the new version no longer ships.
        let mut dropped = Vec::new();
        if new_version > old.version_code {
            let incoming = splits.packages();
            let leftover: Vec<String> = record
                .modules
                .keys()
                .filter(|package| !incoming.contains(package.as_str()))
                .cloned()
                .collect();
            for package in leftover {
                if let Some(module) = record.remove_module(&package) {
                    dropped.push(module);
                }
            }
        }
        apply_labels(&mut record, splits);
        record.set_update_time(params.user_id, now());

        for user in record.users.values() {
            self.trust.grant_permissions(&record, user.access_token_id)?;
        }
        self.set_progress(name, InstallerState::InfoSaved);

        self.index
            .update_install_state(name, InstallState::UpdatingSuccess)?;
        record.set_install_mark(None, ExceptionStatus::RenamePending);
        self.index.update_record(&record)?;

        // Past this point the metadata is committed; a rename failure leaves
        // the marker in place for boot-time repair instead of rolling back.
        let mut rename_ok = true;
        for (tmp, final_dir) in &staged {
            let swap = self
                .fileops
                .remove_dir(final_dir)
                .and_then(|()| self.fileops.rename_dir(tmp, final_dir));
            if let Err(err) = swap {
                warn!(path = %final_dir.display(), %err, "module swap failed, deferred to boot repair");
                rename_ok = false;
            }
        }
        for module in &dropped {
            if let Err(err) = self.fileops.remove_dir(Path::new(&module.source_dir)) {
                warn!(path = %module.source_dir, %err, "dropped module dir removal failed");
            }
        }
        self.set_progress(name, InstallerState::Renamed);

        if rename_ok {
            record.set_install_mark(None, ExceptionStatus::UpdatingFinish);
            self.index.update_record(&record)?;
        }
        self.index
            .update_install_state(name, InstallState::InstallSuccess)?;
        stack.commit();

        if params.save_pre_install_record || params.is_pre_install_app {
            self.save_pre_install(splits)?;
        }

        // A bundle that just became singleton leaves every non-default user.
        if !old.singleton && record.singleton {
            let extra: Vec<i32> = record
                .users
                .keys()
                .filter(|user| **user != DEFAULT_USER_ID)
                .copied()
                .collect();
            for user_id in extra {
                let mut leave = params.clone();
                leave.user_id = user_id;
                leave.send_event = false;
                if let Err(err) = self.uninstall_locked(name, &leave) {
                    warn!(bundle = %name, user = user_id, %err, "singleton transition uninstall failed");
                }
            }
        }
        // The reverse transition retires the default-user state the
        // singleton regime created, unless this update targets that user.
        if old.singleton
            && !record.singleton
            && params.user_id != DEFAULT_USER_ID
            && record.has_user(DEFAULT_USER_ID)
        {
            let mut leave = params.clone();
            leave.user_id = DEFAULT_USER_ID;
            leave.send_event = false;
            if let Err(err) = self.uninstall_locked(name, &leave) {
                warn!(bundle = %name, %err, "singleton transition uninstall failed");
            }
        }
        Ok(())
    }

    // ---- uninstall ----

    fn uninstall_locked(&self, bundle_name: &str, params: &InstallParams) -> InstallResult<()> {
        if !self.index.has_user(params.user_id) {
            return Err(InstallError::UserNotExist(params.user_id));
        }
        let Some(record) = self.index.get(bundle_name) else {
            return Err(InstallError::NotInstalled);
        };
        if !record.has_user(params.user_id) {
            return Err(InstallError::NotInstalledAtUser(params.user_id));
        }
        if record.is_system_app && !record.removable && !params.force {
            return Err(InstallError::UninstallSystemAppError);
        }
        self.sandbox.uninstall_all(bundle_name, ANY_USER_ID)?;

        self.index
            .update_install_state(bundle_name, InstallState::UninstallStart)?;
        let result = self.do_uninstall(record, params);
        if result.is_err() {
            // The bundle stays installed; leave the index consistent.
            self.index
                .settle_install_state(bundle_name, InstallState::InstallSuccess);
        }
        result
    }

    fn do_uninstall(&self, mut record: PackageRecord, params: &InstallParams) -> InstallResult<()> {
        let name = record.bundle_name.clone();
        let Some(user) = record.user(params.user_id).cloned() else {
            return Err(InstallError::NotInstalledAtUser(params.user_id));
        };
        if params.kill_running {
            self.process.kill_processes(&name, user.uid)?;
        }

        record.set_install_mark(None, ExceptionStatus::UninstallBundleStart);
        self.index.update_record(&record)?;

        if !params.keep_data {
            self.fileops
                .remove_dir(&self.config.data_dir(&name, params.user_id))?;
        }
        if let Err(err) = self.trust.revoke_token(user.access_token_id) {
            warn!(bundle = %name, %err, "token revoke failed during uninstall");
        }
        record.remove_user(params.user_id);

        if record.users.is_empty() {
            self.fileops.remove_dir(Path::new(&record.code_path))?;
            self.allocator.recycle(&name)?;
            // Terminal transition removes the record and its document. The
            // pre-install record survives so a system bundle stays
            // recoverable; boot reconciliation retires it once the source
            // archives disappear.
            self.index
                .update_install_state(&name, InstallState::UninstallSuccess)?;
            info!(bundle = %name, "bundle fully uninstalled");
        } else {
            record.set_install_mark(None, ExceptionStatus::InstallFinish);
            self.index.update_record(&record)?;
            self.index
                .update_install_state(&name, InstallState::InstallSuccess)?;
            info!(bundle = %name, user = params.user_id, "user state removed");
        }
        Ok(())
    }

    fn uninstall_module_locked(
        &self,
        mut record: PackageRecord,
        package: &str,
        params: &InstallParams,
    ) -> InstallResult<()> {
        let name = record.bundle_name.clone();
        if !self.index.has_user(params.user_id) {
            return Err(InstallError::UserNotExist(params.user_id));
        }
        if !record.has_user(params.user_id) {
            return Err(InstallError::NotInstalledAtUser(params.user_id));
        }
        if record.is_system_app && !record.removable && !params.force {
            return Err(InstallError::UninstallSystemAppError);
        }
        self.sandbox.uninstall_all(&name, ANY_USER_ID)?;

        self.index
            .update_install_state(&name, InstallState::UninstallStart)?;
        let result = (|| -> InstallResult<()> {
            if params.kill_running {
                if let Some(uid) = record.uid(params.user_id) {
                    self.process.kill_processes(&name, uid)?;
                }
            }
            record.set_install_mark(Some(package), ExceptionStatus::UninstallPackageStart);
            self.index.update_record(&record)?;
            if let Some(module) = record.remove_module(package) {
                self.fileops.remove_dir(Path::new(&module.source_dir))?;
            }
            record.set_install_mark(None, ExceptionStatus::InstallFinish);
            self.index.update_record(&record)?;
            Ok(())
        })();
        // Either way the bundle remains installed.
        self.index
            .settle_install_state(&name, InstallState::InstallSuccess);
        result
    }

    // ---- multi-user fast path ----

    fn add_user_state(&self, bundle_name: &str, params: &InstallParams) -> InstallResult<()> {
        if !self.index.has_user(params.user_id) {
            return Err(InstallError::UserNotExist(params.user_id));
        }
        let lock = self.index.bundle_lock(bundle_name);
        let _guard = lock.lock().expect("bundle lock poisoned");
        let Some(mut record) = self.index.get(bundle_name) else {
            return Err(InstallError::NotInstalled);
        };
        if record.singleton && params.user_id != DEFAULT_USER_ID {
            return Err(InstallError::SingletonUserMismatch {
                singleton: true,
                user_id: params.user_id,
            });
        }
        self.index
            .update_install_state(bundle_name, InstallState::UserChange)?;
        let mut stack = RollbackStack::new();
        let result = (|| -> InstallResult<()> {
            let offset = self.allocator.generate(bundle_name, record.app_type)?;
            let uid = uid_for(params.user_id, offset);
            let data_dir = self.config.data_dir(bundle_name, params.user_id);
            self.fileops.create_dir(&data_dir)?;
            stack.push(UndoAction::RemoveDir(data_dir));
            let token = self.trust.issue_token(&record, params.user_id, 0)?;
            stack.push(UndoAction::RevokeToken(token));
            let when = now();
            record.add_user(UserRecord {
                user_id: params.user_id,
                uid,
                access_token_id: token,
                install_time: when,
                update_time: when,
                enabled: true,
            });
            self.trust.grant_permissions(&record, token)?;
            self.index.update_record(&record)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                stack.commit();
                self.index
                    .update_install_state(bundle_name, InstallState::InstallSuccess)?;
                info!(bundle = bundle_name, user = params.user_id, "user state added");
                Ok(())
            }
            Err(err) => {
                stack.unwind(
                    &self.index,
                    &self.allocator,
                    self.trust.as_ref(),
                    self.fileops.as_ref(),
                );
                self.index
                    .settle_install_state(bundle_name, InstallState::InstallSuccess);
                Err(err)
            }
        }
    }

    // ---- helpers ----

    fn save_pre_install(&self, splits: &ValidatedSplits) -> InstallResult<()> {
        let mut record = self
            .index
            .pre_install_record(&splits.bundle_name)?
            .unwrap_or(PreInstallRecord {
                bundle_name: splits.bundle_name.clone(),
                bundle_paths: Vec::new(),
                app_type: splits.app_type,
                version_code: splits.version_code,
            });
        record.app_type = splits.app_type;
        record.version_code = splits.version_code;
        for (path, _) in &splits.manifests {
            record.add_path(path.display().to_string());
        }
        self.index.save_pre_install_record(&record)
    }

    fn set_progress(&self, bundle_name: &str, state: InstallerState) {
        self.progress
            .lock()
            .expect("progress map poisoned")
            .insert(bundle_name.to_owned(), state);
    }

    fn publish(
        &self,
        bundle_name: &str,
        module: Option<&str>,
        notify_type: NotifyType,
        user_id: i32,
        success: bool,
    ) {
        let record = self.index.get(bundle_name);
        let (uid, token) = record
            .as_ref()
            .and_then(|r| r.user(user_id))
            .map_or((0, 0), |u| (u.uid, u.access_token_id));
        self.events.publish(&StatusEvent {
            notify_type,
            bundle_name: bundle_name.to_owned(),
            module: module.map(str::to_owned),
            user_id,
            uid,
            access_token_id: token,
            app_index: 0,
            success,
        });
    }
}

fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn archive_bytes(manifests: &[(PathBuf, BundleManifest)]) -> u64 {
    manifests
        .iter()
        .map(|(path, _)| std::fs::metadata(path).map(|m| m.len()).unwrap_or(0))
        .sum()
}

fn base_record(splits: &ValidatedSplits, params: &InstallParams, code_dir: &Path) -> PackageRecord {
    let first = &splits.manifests[0].1;
    PackageRecord {
        bundle_name: splits.bundle_name.clone(),
        app_id: splits.signature.app_id.clone(),
        apl: splits.signature.apl.clone(),
        version_code: first.version_code,
        version_name: first.version_name.clone(),
        min_compatible_version: first.min_compatible_version,
        target_version: first.target_version,
        compatible_version: first.compatible_version,
        release_type: first.release_type.clone(),
        vendor: first.vendor.clone(),
        app_type: splits.app_type,
        is_system_app: splits.app_type != AppType::ThirdParty,
        is_pre_install: params.is_pre_install_app,
        singleton: splits.singleton,
        entry_installation_free: splits.entry_installation_free(),
        removable: params.removable,
        new_module_format: splits.new_format,
        code_path: code_dir.display().to_string(),
        modules: indexmap::IndexMap::new(),
        users: std::collections::BTreeMap::new(),
        install_mark: None,
        app_index: 0,
        is_sandbox: false,
    }
}

fn module_record(
    path: &Path,
    manifest: &BundleManifest,
    final_dir: &Path,
    params: &InstallParams,
) -> InstallResult<ModuleRecord> {
    let hash = match params.hash_params.get(&manifest.module.module_name) {
        Some(hash) => Some(hash.clone()),
        None => Some(PackageParser::archive_sha256(path)?),
    };
    Ok(ModuleRecord {
        package: manifest.module.package.clone(),
        module_name: manifest.module.module_name.clone(),
        source_dir: final_dir.display().to_string(),
        archive_path: path.display().to_string(),
        hash,
        is_entry: manifest.module.is_entry,
        installation_free: manifest.module.installation_free,
        defined_permissions: manifest.module.defined_permissions.clone(),
        requested_permissions: manifest.module.requested_permissions.clone(),
    })
}

fn apply_labels(record: &mut PackageRecord, splits: &ValidatedSplits) {
    let first = &splits.manifests[0].1;
    record.app_id = splits.signature.app_id.clone();
    record.apl = splits.signature.apl.clone();
    record.version_code = first.version_code;
    record.version_name = first.version_name.clone();
    record.min_compatible_version = first.min_compatible_version;
    record.target_version = first.target_version;
    record.compatible_version = first.compatible_version;
    record.release_type = first.release_type.clone();
    record.vendor = first.vendor.clone();
    record.singleton = first.singleton;
    record.new_module_format = first.new_module_format;
    record.entry_installation_free = splits.entry_installation_free();
}

fn check_split_consistency(manifests: &[(PathBuf, BundleManifest)]) -> InstallResult<()> {
    let first = &manifests[0].1;
    let mut entries = 0;
    let mut seen_modules: HashSet<&str> = HashSet::new();
    for (path, manifest) in manifests {
        if manifest.bundle_name != first.bundle_name {
            return Err(InstallError::BundleNameNotSame);
        }
        if manifest.version_code != first.version_code {
            return Err(InstallError::VersionCodeNotSame);
        }
        if manifest.version_name != first.version_name {
            return Err(InstallError::VersionNameNotSame);
        }
        if manifest.min_compatible_version != first.min_compatible_version {
            return Err(InstallError::MinCompatibleVersionNotSame);
        }
        if manifest.vendor != first.vendor {
            return Err(InstallError::VendorNotSame);
        }
        if manifest.target_version != first.target_version {
            return Err(InstallError::TargetVersionNotSame);
        }
        if manifest.compatible_version != first.compatible_version {
            return Err(InstallError::CompatibleVersionNotSame);
        }
        if manifest.release_type != first.release_type {
            return Err(InstallError::ReleaseTypeNotSame);
        }
        if manifest.singleton != first.singleton {
            return Err(InstallError::SingletonNotSame);
        }
        if manifest.app_type != first.app_type {
            return Err(InstallError::AppTypeNotSame);
        }
        if manifest.new_module_format != first.new_module_format {
            return Err(InstallError::IncompatibleModuleFormat);
        }
        if manifest.module.module_name.is_empty() {
            return Err(InstallError::ModuleNameEmpty(path.display().to_string()));
        }
        if !seen_modules.insert(manifest.module.module_name.as_str()) {
            return Err(InstallError::ModuleNameDuplicate(
                manifest.module.module_name.clone(),
            ));
        }
        if manifest.module.is_entry {
            entries += 1;
        }
    }
    if entries > 1 {
        return Err(InstallError::MultipleEntryModules);
    }
    Ok(())
}

fn check_hash_params(
    manifests: &[(PathBuf, BundleManifest)],
    params: &InstallParams,
) -> InstallResult<()> {
    for module_name in params.hash_params.keys() {
        let known = manifests
            .iter()
            .any(|(_, m)| m.module.module_name == *module_name);
        if !known {
            return Err(InstallError::ModuleNameMissing(module_name.clone()));
        }
    }
    Ok(())
}

fn check_type_compat(old: &PackageRecord, splits: &ValidatedSplits) -> InstallResult<()> {
    if old.new_module_format != splits.new_format {
        return Err(InstallError::IncompatibleModuleFormat);
    }
    if splits.has_entry() && old.has_entry()
        && old.entry_installation_free != splits.entry_installation_free()
    {
        return Err(InstallError::IncompatibleServiceType);
    }
    Ok(())
}

fn check_version_compat(old: &PackageRecord, splits: &ValidatedSplits) -> InstallResult<()> {
    use std::cmp::Ordering;
    let incoming = splits.version_code;
    if old.has_entry() && !splits.has_entry() {
        return match incoming.cmp(&old.version_code) {
            Ordering::Less => Err(InstallError::VersionDowngrade),
            Ordering::Greater => Err(InstallError::VersionNotCompatible),
            Ordering::Equal => Ok(()),
        };
    }
    if incoming < old.version_code {
        return Err(InstallError::VersionDowngrade);
    }
    Ok(())
}

fn check_labels_against(old: &PackageRecord, manifest: &BundleManifest) -> InstallResult<()> {
    if manifest.version_name != old.version_name {
        return Err(InstallError::VersionNameNotSame);
    }
    if manifest.min_compatible_version != old.min_compatible_version {
        return Err(InstallError::MinCompatibleVersionNotSame);
    }
    if manifest.vendor != old.vendor {
        return Err(InstallError::VendorNotSame);
    }
    if manifest.target_version != old.target_version {
        return Err(InstallError::TargetVersionNotSame);
    }
    if manifest.compatible_version != old.compatible_version {
        return Err(InstallError::CompatibleVersionNotSame);
    }
    if manifest.release_type != old.release_type {
        return Err(InstallError::ReleaseTypeNotSame);
    }
    Ok(())
}
