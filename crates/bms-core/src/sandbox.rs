//! Sandbox app instances: isolated per-index copies of an installed bundle.
//!
//! Sandbox state does not survive an update or uninstall of the base bundle;
//! the install engine tears every instance down before touching the base.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use bms_domain::{
    sandbox_key, InstallError, InstallResult, SandboxRecord, ANY_USER_ID, FIRST_SANDBOX_APP_INDEX,
};

use crate::config::ServiceConfig;
use crate::events::{EventHub, NotifyType, StatusEvent};
use crate::fileops::FileOps;
use crate::ident::{uid_for, IdentifierAllocator};
use crate::index::PackageIndex;
use crate::install::rollback::{RollbackStack, UndoAction};
use crate::metrics::Metrics;
use crate::trust::TrustManager;

/// Sandbox record map plus the per-bundle app-index allocation map.
///
/// Records are read-mostly and sit behind a reader-writer lock; the
/// allocation map has short write-heavy critical sections and gets its own
/// mutex.
#[derive(Default)]
pub struct SandboxIndex {
    records: RwLock<HashMap<String, SandboxRecord>>,
    indices: Mutex<HashMap<String, BTreeSet<u32>>>,
}

impl SandboxIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// First free app index in `[FIRST_SANDBOX_APP_INDEX, max]`.
    fn allocate_index(&self, bundle_name: &str, max: u32) -> InstallResult<u32> {
        let mut indices = self.indices.lock().expect("sandbox index map poisoned");
        let used = indices.entry(bundle_name.to_owned()).or_default();
        let mut candidate = FIRST_SANDBOX_APP_INDEX;
        for occupied in used.iter() {
            if *occupied == candidate {
                candidate += 1;
            } else if *occupied > candidate {
                break;
            }
        }
        if candidate > max {
            return Err(InstallError::InvalidAppIndex);
        }
        used.insert(candidate);
        Ok(candidate)
    }

    fn release_index(&self, bundle_name: &str, app_index: u32) {
        let mut indices = self.indices.lock().expect("sandbox index map poisoned");
        if let Some(used) = indices.get_mut(bundle_name) {
            used.remove(&app_index);
            if used.is_empty() {
                indices.remove(bundle_name);
            }
        }
    }

    fn insert(&self, record: SandboxRecord) {
        self.records
            .write()
            .expect("sandbox record map poisoned")
            .insert(record.key(), record);
    }

    fn remove(&self, key: &str) -> Option<SandboxRecord> {
        self.records
            .write()
            .expect("sandbox record map poisoned")
            .remove(key)
    }

    #[must_use]
    pub fn get(&self, bundle_name: &str, app_index: u32) -> Option<SandboxRecord> {
        self.records
            .read()
            .expect("sandbox record map poisoned")
            .get(&sandbox_key(bundle_name, app_index))
            .cloned()
    }

    /// All instances of one bundle, ordered by app index.
    #[must_use]
    pub fn instances(&self, bundle_name: &str) -> Vec<SandboxRecord> {
        let mut out: Vec<SandboxRecord> = self
            .records
            .read()
            .expect("sandbox record map poisoned")
            .values()
            .filter(|r| r.bundle_name == bundle_name)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.app_index);
        out
    }
}

pub struct SandboxInstallEngine {
    config: ServiceConfig,
    index: Arc<PackageIndex>,
    sandbox_index: Arc<SandboxIndex>,
    allocator: Arc<IdentifierAllocator>,
    trust: Arc<dyn TrustManager>,
    fileops: Arc<dyn FileOps>,
    events: Arc<EventHub>,
    metrics: Arc<Metrics>,
}

impl SandboxInstallEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServiceConfig,
        index: Arc<PackageIndex>,
        sandbox_index: Arc<SandboxIndex>,
        allocator: Arc<IdentifierAllocator>,
        trust: Arc<dyn TrustManager>,
        fileops: Arc<dyn FileOps>,
        events: Arc<EventHub>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            index,
            sandbox_index,
            allocator,
            trust,
            fileops,
            events,
            metrics,
        }
    }

    /// Installs a new sandbox instance of `bundle_name` for `user_id`.
    ///
    /// Returns the allocated app index, starting at
    /// [`FIRST_SANDBOX_APP_INDEX`].
    pub fn install(&self, bundle_name: &str, dlp_type: i32, user_id: i32) -> InstallResult<u32> {
        if !self.index.has_user(user_id) {
            return Err(InstallError::UserNotExist(user_id));
        }
        let Some(base) = self.index.get(bundle_name) else {
            return Err(InstallError::AppNotExisted);
        };
        if !base.has_user(user_id) {
            return Err(InstallError::NotInstalledAtUser(user_id));
        }
        let app_index = self
            .sandbox_index
            .allocate_index(bundle_name, self.config.max_sandbox_app_index)?;

        let mut stack = RollbackStack::new();
        let result = self.provision(&base, app_index, dlp_type, user_id, &mut stack);
        match result {
            Ok(record) => {
                stack.commit();
                self.sandbox_index.insert(record.clone());
                self.metrics.record_sandbox_install();
                self.publish(&record, NotifyType::SandboxInstall);
                info!(bundle = bundle_name, app_index, user = user_id, "sandbox installed");
                Ok(app_index)
            }
            Err(err) => {
                stack.unwind(
                    &self.index,
                    &self.allocator,
                    self.trust.as_ref(),
                    self.fileops.as_ref(),
                );
                self.sandbox_index.release_index(bundle_name, app_index);
                warn!(bundle = bundle_name, app_index, %err, "sandbox install failed");
                Err(err)
            }
        }
    }

    fn provision(
        &self,
        base: &bms_domain::PackageRecord,
        app_index: u32,
        dlp_type: i32,
        user_id: i32,
        stack: &mut RollbackStack,
    ) -> InstallResult<SandboxRecord> {
        let key = sandbox_key(&base.bundle_name, app_index);

        let mut record = base.clone();
        record.is_sandbox = true;
        record.app_index = app_index;
        record.install_mark = None;
        record.users.retain(|id, _| *id == user_id);

        let token = self.trust.issue_token(&record, user_id, app_index)?;
        stack.push(UndoAction::RevokeToken(token));
        self.trust.grant_permissions(&record, token)?;

        // The sandbox identity is allocated under the composite key so it is
        // independent of the base app's identifier.
        let offset = self.allocator.generate(&key, base.app_type)?;
        stack.push(UndoAction::RecycleId(key.clone()));
        let uid = uid_for(user_id, offset);

        let data_dir = self.config.data_dir(&key, user_id);
        self.fileops.create_dir(&data_dir)?;
        stack.push(UndoAction::RemoveDir(data_dir.clone()));

        if let Some(user) = record.users.get_mut(&user_id) {
            user.uid = uid;
            user.access_token_id = token;
        }
        tracing::debug!(key = %key, dlp_type, uid, "sandbox provisioned");
        Ok(SandboxRecord {
            bundle_name: base.bundle_name.clone(),
            app_index,
            user_id,
            uid,
            access_token_id: token,
            data_dir: data_dir.display().to_string(),
            record,
        })
    }

    /// Removes one sandbox instance.
    pub fn uninstall(&self, bundle_name: &str, app_index: u32, user_id: i32) -> InstallResult<()> {
        let Some(record) = self.sandbox_index.get(bundle_name, app_index) else {
            return Err(InstallError::SandboxNotExisted {
                bundle: bundle_name.to_owned(),
                app_index,
            });
        };
        if user_id != ANY_USER_ID && record.user_id != user_id {
            return Err(InstallError::SandboxNotExisted {
                bundle: bundle_name.to_owned(),
                app_index,
            });
        }
        if let Err(err) = self.trust.revoke_token(record.access_token_id) {
            warn!(bundle = bundle_name, app_index, %err, "sandbox token revoke failed");
        }
        self.fileops
            .remove_dir(std::path::Path::new(&record.data_dir))?;
        self.allocator.recycle(&record.key())?;
        self.sandbox_index.release_index(bundle_name, app_index);
        self.sandbox_index.remove(&record.key());
        self.metrics.record_sandbox_uninstall();
        self.publish(&record, NotifyType::SandboxUninstall);
        info!(bundle = bundle_name, app_index, "sandbox uninstalled");
        Ok(())
    }

    /// Removes every sandbox instance of `bundle_name` whose user matches
    /// `user_id` ([`ANY_USER_ID`] matches all). Missing instances are fine.
    pub fn uninstall_all(&self, bundle_name: &str, user_id: i32) -> InstallResult<()> {
        for instance in self.sandbox_index.instances(bundle_name) {
            if user_id != ANY_USER_ID && instance.user_id != user_id {
                continue;
            }
            self.uninstall(bundle_name, instance.app_index, user_id)?;
        }
        Ok(())
    }

    fn publish(&self, record: &SandboxRecord, notify_type: NotifyType) {
        self.events.publish(&StatusEvent {
            notify_type,
            bundle_name: record.bundle_name.clone(),
            module: None,
            user_id: record.user_id,
            uid: record.uid,
            access_token_id: record.access_token_id,
            app_index: record.app_index,
            success: true,
        });
    }
}
