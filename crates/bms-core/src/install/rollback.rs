//! Explicit undo stack for one install transaction.
//!
//! Engines push an undo action right after each side effect succeeds and
//! call [`RollbackStack::commit`] once the transaction's durable commit is
//! in place. An uncommitted stack is unwound explicitly on the error path,
//! in reverse order, best effort.

use std::path::PathBuf;

use tracing::warn;

use bms_domain::PackageRecord;

use crate::fileops::FileOps;
use crate::ident::IdentifierAllocator;
use crate::index::PackageIndex;
use crate::trust::TrustManager;

pub enum UndoAction {
    RemoveDir(PathBuf),
    RestoreRecord(Box<PackageRecord>),
    DropRecord(String),
    RecycleId(String),
    RevokeToken(u32),
}

#[derive(Default)]
pub struct RollbackStack {
    actions: Vec<UndoAction>,
    committed: bool,
}

impl RollbackStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    /// Dismisses the stack; a later [`Self::unwind`] does nothing.
    pub fn commit(&mut self) {
        self.committed = true;
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Runs the accumulated undo actions in reverse order.
    ///
    /// Failures are logged and skipped; metadata restoration takes priority
    /// over file cleanup, and stray files are reconciled at next boot.
    pub fn unwind(
        &mut self,
        index: &PackageIndex,
        allocator: &IdentifierAllocator,
        trust: &dyn TrustManager,
        fileops: &dyn FileOps,
    ) {
        if self.committed {
            self.actions.clear();
            return;
        }
        while let Some(action) = self.actions.pop() {
            match action {
                UndoAction::RemoveDir(path) => {
                    if let Err(err) = fileops.remove_dir(&path) {
                        warn!(path = %path.display(), %err, "rollback: dir removal failed");
                    }
                }
                UndoAction::RestoreRecord(record) => {
                    if let Err(err) = index.save_record(&record) {
                        warn!(bundle = %record.bundle_name, %err, "rollback: record restore failed");
                    }
                }
                UndoAction::DropRecord(name) => index.drop_record(&name),
                UndoAction::RecycleId(name) => {
                    if let Err(err) = allocator.recycle(&name) {
                        warn!(bundle = %name, %err, "rollback: identifier recycle failed");
                    }
                }
                UndoAction::RevokeToken(token) => {
                    if let Err(err) = trust.revoke_token(token) {
                        warn!(token, %err, "rollback: token revoke failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::fileops::HostFileOps;
    use crate::storage::MetadataStore;
    use crate::trust::LocalTrustManager;

    #[test]
    fn committed_stack_leaves_everything_in_place() {
        let temp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(temp.path()).unwrap();
        let (index, _) = PackageIndex::open(store.clone()).unwrap();
        let allocator = IdentifierAllocator::open(&ServiceConfig::default(), store).unwrap();

        let dir = temp.path().join("staged");
        std::fs::create_dir(&dir).unwrap();
        let mut stack = RollbackStack::new();
        stack.push(UndoAction::RemoveDir(dir.clone()));
        stack.commit();
        stack.unwind(&index, &allocator, &LocalTrustManager::new(), &HostFileOps);
        assert!(dir.exists());
    }

    #[test]
    fn uncommitted_stack_unwinds_in_reverse() {
        let temp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(temp.path()).unwrap();
        let (index, _) = PackageIndex::open(store.clone()).unwrap();
        let allocator = IdentifierAllocator::open(&ServiceConfig::default(), store).unwrap();
        allocator
            .generate("com.example.demo", bms_domain::AppType::ThirdParty)
            .unwrap();

        let dir = temp.path().join("staged");
        std::fs::create_dir(&dir).unwrap();
        let mut stack = RollbackStack::new();
        stack.push(UndoAction::RecycleId("com.example.demo".into()));
        stack.push(UndoAction::RemoveDir(dir.clone()));
        stack.unwind(&index, &allocator, &LocalTrustManager::new(), &HostFileOps);
        assert!(!dir.exists());
        // The recycled offset is free again.
        assert_eq!(
            allocator
                .generate("other", bms_domain::AppType::ThirdParty)
                .unwrap(),
            10_000
        );
    }
}
