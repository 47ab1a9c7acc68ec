//! The package index: single source of truth for what is installed.
//!
//! Mutations are driven by the install-state transition table; every commit
//! persists the record synchronously before returning. Callers are expected
//! to hold the bundle's lock around any read-modify-write sequence (a
//! contract, not enforced here).

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use bms_domain::{
    InstallError, InstallResult, InstallState, PackageRecord, PreInstallRecord, DEFAULT_USER_ID,
};

use crate::storage::MetadataStore;

/// Legal `(to, from)` pairs of the install-state machine.
const TRANSITIONS: &[(InstallState, InstallState)] = &[
    (InstallState::InstallSuccess, InstallState::InstallStart),
    (InstallState::InstallFail, InstallState::InstallStart),
    (InstallState::UninstallStart, InstallState::InstallSuccess),
    (InstallState::UninstallStart, InstallState::InstallStart),
    (InstallState::UninstallStart, InstallState::UpdatingSuccess),
    (InstallState::UninstallFail, InstallState::UninstallStart),
    (InstallState::UninstallSuccess, InstallState::UninstallStart),
    (InstallState::UpdatingStart, InstallState::InstallSuccess),
    (InstallState::UpdatingSuccess, InstallState::UpdatingStart),
    (InstallState::UpdatingFail, InstallState::UpdatingStart),
    (InstallState::UpdatingFail, InstallState::InstallStart),
    (InstallState::UpdatingStart, InstallState::InstallStart),
    (InstallState::InstallSuccess, InstallState::UpdatingStart),
    (InstallState::InstallSuccess, InstallState::UpdatingSuccess),
    (InstallState::InstallSuccess, InstallState::UninstallStart),
    (InstallState::UpdatingStart, InstallState::UpdatingSuccess),
    (InstallState::RollBack, InstallState::UpdatingStart),
    (InstallState::RollBack, InstallState::UpdatingSuccess),
    (InstallState::InstallSuccess, InstallState::RollBack),
    (InstallState::UninstallStart, InstallState::UserChange),
    (InstallState::UpdatingStart, InstallState::UserChange),
    (InstallState::InstallSuccess, InstallState::UserChange),
    (InstallState::UpdatingSuccess, InstallState::UserChange),
    (InstallState::UserChange, InstallState::InstallSuccess),
    (InstallState::UserChange, InstallState::UpdatingSuccess),
    (InstallState::UserChange, InstallState::UpdatingStart),
];

/// Entering one of these states removes the bundle from the index.
fn deletes_data(state: InstallState) -> bool {
    matches!(
        state,
        InstallState::InstallFail | InstallState::UninstallSuccess | InstallState::UpdatingFail
    )
}

pub struct PackageIndex {
    records: Mutex<HashMap<String, PackageRecord>>,
    states: Mutex<HashMap<String, InstallState>>,
    // Lock entries are created lazily and never removed, so a lock can never
    // vanish while another thread still waits on it.
    bundle_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    disabled: Mutex<HashSet<String>>,
    users: Mutex<BTreeSet<i32>>,
    store: MetadataStore,
}

impl PackageIndex {
    /// Opens the index and loads all persisted records.
    ///
    /// Returns the index together with the loaded records so the caller can
    /// rebuild the identifier allocator and run crash recovery over them.
    ///
    /// # Errors
    /// Fails when the storage root is unusable.
    pub fn open(store: MetadataStore) -> InstallResult<(Self, Vec<PackageRecord>)> {
        let loaded = store.load_records()?;
        let mut records = HashMap::new();
        let mut states = HashMap::new();
        let mut users = BTreeSet::new();
        users.insert(DEFAULT_USER_ID);
        for record in &loaded {
            states.insert(record.bundle_name.clone(), InstallState::InstallSuccess);
            for user_id in record.users.keys() {
                users.insert(*user_id);
            }
            records.insert(record.bundle_name.clone(), record.clone());
        }
        let index = Self {
            records: Mutex::new(records),
            states: Mutex::new(states),
            bundle_locks: RwLock::new(HashMap::new()),
            disabled: Mutex::new(HashSet::new()),
            users: Mutex::new(users),
            store,
        };
        Ok((index, loaded))
    }

    /// Per-bundle mutex, created lazily, never removed.
    pub fn bundle_lock(&self, bundle_name: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self
            .bundle_locks
            .read()
            .expect("bundle lock map poisoned")
            .get(bundle_name)
        {
            return Arc::clone(lock);
        }
        let mut map = self.bundle_locks.write().expect("bundle lock map poisoned");
        Arc::clone(map.entry(bundle_name.to_owned()).or_default())
    }

    /// Drives the install-state machine for one bundle.
    ///
    /// # Errors
    /// Fails with [`InstallError::InstallStateError`] on an illegal
    /// transition (typically: another operation already in flight).
    pub fn update_install_state(
        &self,
        bundle_name: &str,
        state: InstallState,
    ) -> InstallResult<()> {
        if bundle_name.is_empty() {
            return Err(InstallError::InvalidParam {
                reason: "empty bundle name".into(),
            });
        }
        let mut records = self.records.lock().expect("record map poisoned");
        let mut states = self.states.lock().expect("state map poisoned");
        let current = states.get(bundle_name).copied();
        let Some(current) = current else {
            if state == InstallState::InstallStart {
                states.insert(bundle_name.to_owned(), state);
                return Ok(());
            }
            debug!(bundle = bundle_name, ?state, "state update rejected: no current state");
            return Err(InstallError::InstallStateError);
        };
        let allowed = TRANSITIONS
            .iter()
            .any(|(to, from)| *to == state && *from == current);
        if !allowed {
            debug!(bundle = bundle_name, ?current, ?state, "illegal state transition");
            return Err(InstallError::InstallStateError);
        }
        if deletes_data(state) {
            states.remove(bundle_name);
            records.remove(bundle_name);
            self.store.remove_record(bundle_name)?;
            return Ok(());
        }
        states.insert(bundle_name.to_owned(), state);
        Ok(())
    }

    #[must_use]
    pub fn install_state(&self, bundle_name: &str) -> Option<InstallState> {
        self.states
            .lock()
            .expect("state map poisoned")
            .get(bundle_name)
            .copied()
    }

    /// Adds a brand-new record. Requires the bundle to be in `InstallStart`.
    pub fn add_record(&self, record: PackageRecord) -> InstallResult<()> {
        let mut records = self.records.lock().expect("record map poisoned");
        if records.contains_key(&record.bundle_name) {
            return Err(InstallError::Internal(format!(
                "record for {} already exists",
                record.bundle_name
            )));
        }
        let states = self.states.lock().expect("state map poisoned");
        if states.get(&record.bundle_name).copied() != Some(InstallState::InstallStart) {
            return Err(InstallError::InstallStateError);
        }
        self.store.save_record(&record)?;
        records.insert(record.bundle_name.clone(), record);
        Ok(())
    }

    /// Persists and replaces a record without a state check.
    ///
    /// Used for write-ahead marker updates; the record must already exist
    /// unless `create` semantics went through [`Self::add_record`].
    pub fn save_record(&self, record: &PackageRecord) -> InstallResult<()> {
        self.store.save_record(record)?;
        self.records
            .lock()
            .expect("record map poisoned")
            .insert(record.bundle_name.clone(), record.clone());
        Ok(())
    }

    /// Commits an updated record; legal only while updating or rolling back.
    pub fn update_record(&self, record: &PackageRecord) -> InstallResult<()> {
        let state = self.install_state(&record.bundle_name);
        if !matches!(
            state,
            Some(
                InstallState::UpdatingSuccess
                    | InstallState::RollBack
                    | InstallState::UserChange
                    | InstallState::UninstallStart
            )
        ) {
            return Err(InstallError::InstallStateError);
        }
        self.save_record(record)
    }

    #[must_use]
    pub fn get(&self, bundle_name: &str) -> Option<PackageRecord> {
        self.records
            .lock()
            .expect("record map poisoned")
            .get(bundle_name)
            .cloned()
    }

    /// Query variant honoring the transaction disable guard.
    #[must_use]
    pub fn query(&self, bundle_name: &str) -> Option<PackageRecord> {
        if self
            .disabled
            .lock()
            .expect("disabled set poisoned")
            .contains(bundle_name)
        {
            return None;
        }
        self.get(bundle_name)
    }

    #[must_use]
    pub fn bundle_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .lock()
            .expect("record map poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().expect("record map poisoned").is_empty()
    }

    /// Hides the bundle from queries for the duration of a transaction.
    pub fn disable_bundle(&self, bundle_name: &str) {
        self.disabled
            .lock()
            .expect("disabled set poisoned")
            .insert(bundle_name.to_owned());
    }

    pub fn enable_bundle(&self, bundle_name: &str) {
        self.disabled
            .lock()
            .expect("disabled set poisoned")
            .remove(bundle_name);
    }

    #[must_use]
    pub fn has_user(&self, user_id: i32) -> bool {
        self.users.lock().expect("user set poisoned").contains(&user_id)
    }

    pub fn add_user_id(&self, user_id: i32) {
        self.users.lock().expect("user set poisoned").insert(user_id);
    }

    pub fn remove_user_id(&self, user_id: i32) {
        self.users.lock().expect("user set poisoned").remove(&user_id);
    }

    // -- pre-install records --

    pub fn pre_install_record(&self, bundle_name: &str) -> InstallResult<Option<PreInstallRecord>> {
        self.store.load_pre_install(bundle_name)
    }

    pub fn pre_install_records(&self) -> InstallResult<Vec<PreInstallRecord>> {
        self.store.load_pre_installs()
    }

    pub fn save_pre_install_record(&self, record: &PreInstallRecord) -> InstallResult<()> {
        self.store.save_pre_install(record)
    }

    pub fn remove_pre_install_record(&self, bundle_name: &str) -> InstallResult<()> {
        self.store.remove_pre_install(bundle_name)
    }

    /// Best-effort terminal-state reset used by scope-exit guards; an
    /// illegal transition here only means the bundle already reached a
    /// terminal state through another path.
    pub fn settle_install_state(&self, bundle_name: &str, state: InstallState) {
        if let Err(err) = self.update_install_state(bundle_name, state) {
            debug!(bundle = bundle_name, ?state, %err, "settle skipped");
        }
    }

    /// Removes a record that failed validation after load; storage cleanup
    /// failures are logged, not propagated.
    pub fn drop_record(&self, bundle_name: &str) {
        self.records
            .lock()
            .expect("record map poisoned")
            .remove(bundle_name);
        self.states
            .lock()
            .expect("state map poisoned")
            .remove(bundle_name);
        if let Err(err) = self.store.remove_record(bundle_name) {
            warn!(bundle = bundle_name, %err, "failed to remove stored record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bms_domain::AppType;
    use indexmap::IndexMap;
    use std::collections::BTreeMap;

    fn record(name: &str) -> PackageRecord {
        PackageRecord {
            bundle_name: name.into(),
            app_id: "id".into(),
            apl: "normal".into(),
            version_code: 1,
            version_name: "1.0".into(),
            min_compatible_version: 1,
            target_version: 8,
            compatible_version: 8,
            release_type: "Release".into(),
            vendor: "v".into(),
            app_type: AppType::ThirdParty,
            is_system_app: false,
            is_pre_install: false,
            singleton: false,
            entry_installation_free: false,
            removable: true,
            new_module_format: true,
            code_path: format!("/app/{name}"),
            modules: IndexMap::new(),
            users: BTreeMap::new(),
            install_mark: None,
            app_index: 0,
            is_sandbox: false,
        }
    }

    fn index() -> (tempfile::TempDir, PackageIndex) {
        let temp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(temp.path()).unwrap();
        let (index, _) = PackageIndex::open(store).unwrap();
        (temp, index)
    }

    #[test]
    fn unknown_bundle_only_accepts_install_start() {
        let (_t, index) = index();
        assert_eq!(
            index.update_install_state("a", InstallState::UpdatingStart),
            Err(InstallError::InstallStateError)
        );
        index
            .update_install_state("a", InstallState::InstallStart)
            .unwrap();
    }

    #[test]
    fn double_install_start_is_rejected() {
        let (_t, index) = index();
        index
            .update_install_state("a", InstallState::InstallStart)
            .unwrap();
        assert_eq!(
            index.update_install_state("a", InstallState::InstallStart),
            Err(InstallError::InstallStateError)
        );
    }

    #[test]
    fn install_fail_removes_the_pending_record() {
        let (_t, index) = index();
        index
            .update_install_state("a", InstallState::InstallStart)
            .unwrap();
        index.add_record(record("a")).unwrap();
        index
            .update_install_state("a", InstallState::InstallFail)
            .unwrap();
        assert!(index.get("a").is_none());
        assert_eq!(index.install_state("a"), None);
    }

    #[test]
    fn full_lifecycle_reaches_uninstall_success() {
        let (_t, index) = index();
        index
            .update_install_state("a", InstallState::InstallStart)
            .unwrap();
        index.add_record(record("a")).unwrap();
        index
            .update_install_state("a", InstallState::InstallSuccess)
            .unwrap();
        index
            .update_install_state("a", InstallState::UpdatingStart)
            .unwrap();
        index
            .update_install_state("a", InstallState::UpdatingSuccess)
            .unwrap();
        index
            .update_install_state("a", InstallState::InstallSuccess)
            .unwrap();
        index
            .update_install_state("a", InstallState::UninstallStart)
            .unwrap();
        index
            .update_install_state("a", InstallState::UninstallSuccess)
            .unwrap();
        assert!(index.get("a").is_none());
    }

    #[test]
    fn records_survive_reopen() {
        let temp = tempfile::tempdir().unwrap();
        {
            let store = MetadataStore::open(temp.path()).unwrap();
            let (index, _) = PackageIndex::open(store).unwrap();
            index
                .update_install_state("a", InstallState::InstallStart)
                .unwrap();
            index.add_record(record("a")).unwrap();
            index
                .update_install_state("a", InstallState::InstallSuccess)
                .unwrap();
        }
        let store = MetadataStore::open(temp.path()).unwrap();
        let (index, loaded) = PackageIndex::open(store).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(index.install_state("a"), Some(InstallState::InstallSuccess));
        assert!(index.get("a").is_some());
    }

    #[test]
    fn disabled_bundles_are_hidden_from_queries() {
        let (_t, index) = index();
        index
            .update_install_state("a", InstallState::InstallStart)
            .unwrap();
        index.add_record(record("a")).unwrap();
        index.disable_bundle("a");
        assert!(index.query("a").is_none());
        assert!(index.get("a").is_some());
        index.enable_bundle("a");
        assert!(index.query("a").is_some());
    }

    #[test]
    fn bundle_locks_are_stable_per_name() {
        let (_t, index) = index();
        let a1 = index.bundle_lock("a");
        let a2 = index.bundle_lock("a");
        let b = index.bundle_lock("b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}
