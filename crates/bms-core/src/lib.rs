#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

//! Bundle management service core: the install/update/uninstall state
//! machine, the package index, identifier allocation, sandbox instances and
//! boot-time reconciliation.
//!
//! Collaborator seams ([`trust::TrustManager`], [`fileops::FileOps`],
//! [`process::ProcessController`]) are traits injected at construction;
//! everything else is owned state.

pub mod config;
pub mod events;
pub mod fileops;
pub mod ident;
pub mod index;
pub mod install;
pub mod metrics;
pub mod parser;
pub mod process;
pub mod reconcile;
pub mod sandbox;
pub mod storage;
pub mod trust;

pub use config::{IdRange, ServiceConfig};
pub use events::{EventHub, NotifyType, StatusEvent, StatusListener};
pub use fileops::{FileOps, HostFileOps};
pub use ident::{uid_for, IdentifierAllocator};
pub use index::PackageIndex;
pub use install::InstallEngine;
pub use metrics::{Metrics, MetricsSnapshot};
pub use parser::PackageParser;
pub use process::{NoopProcessController, ProcessController};
pub use reconcile::{BootReconciler, ReconcileSummary};
pub use sandbox::{SandboxIndex, SandboxInstallEngine};
pub use storage::MetadataStore;
pub use trust::{LocalTrustManager, SignatureInfo, TrustManager};

use std::sync::Arc;

use bms_domain::InstallResult;

/// Fully wired service: one of each component sharing the same store,
/// index and metrics.
pub struct BundleService {
    pub config: ServiceConfig,
    pub index: Arc<PackageIndex>,
    pub allocator: Arc<IdentifierAllocator>,
    pub engine: Arc<InstallEngine>,
    pub sandbox: Arc<SandboxInstallEngine>,
    pub sandbox_index: Arc<SandboxIndex>,
    pub reconciler: Arc<BootReconciler>,
    pub events: Arc<EventHub>,
    pub metrics: Arc<Metrics>,
}

impl BundleService {
    /// Opens the metadata store, loads persisted records and wires every
    /// component with the given collaborator implementations.
    pub fn open(
        config: ServiceConfig,
        trust: Arc<dyn TrustManager>,
        fileops: Arc<dyn FileOps>,
        process: Arc<dyn ProcessController>,
    ) -> InstallResult<Self> {
        let store = MetadataStore::open(config.store_root.clone())?;
        let (index, loaded) = PackageIndex::open(store.clone())?;
        let index = Arc::new(index);
        let allocator = Arc::new(IdentifierAllocator::open(&config, store)?);
        allocator.restore(&loaded)?;

        let events = Arc::new(EventHub::new());
        let metrics = Arc::new(Metrics::default());
        let sandbox_index = Arc::new(SandboxIndex::new());
        let sandbox = Arc::new(SandboxInstallEngine::new(
            config.clone(),
            Arc::clone(&index),
            Arc::clone(&sandbox_index),
            Arc::clone(&allocator),
            Arc::clone(&trust),
            Arc::clone(&fileops),
            Arc::clone(&events),
            Arc::clone(&metrics),
        ));
        let engine = Arc::new(InstallEngine::new(
            config.clone(),
            Arc::clone(&index),
            Arc::clone(&allocator),
            Arc::clone(&trust),
            Arc::clone(&fileops),
            process,
            Arc::clone(&sandbox),
            Arc::clone(&events),
            Arc::clone(&metrics),
        ));
        let reconciler = Arc::new(BootReconciler::new(
            config.clone(),
            Arc::clone(&index),
            Arc::clone(&engine),
            Arc::clone(&allocator),
            fileops,
            Arc::clone(&metrics),
        ));
        Ok(Self {
            config,
            index,
            allocator,
            engine,
            sandbox,
            sandbox_index,
            reconciler,
            events,
            metrics,
        })
    }

    /// Opens a service backed by the host filesystem and the built-in local
    /// trust manager.
    pub fn open_local(config: ServiceConfig) -> InstallResult<Self> {
        let trust = Arc::new(LocalTrustManager::with_default_permission_file(
            config.default_permission_config.as_deref(),
        ));
        Self::open(
            config,
            trust,
            Arc::new(HostFileOps),
            Arc::new(NoopProcessController),
        )
    }
}
