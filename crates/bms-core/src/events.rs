//! Status notification fan-out.
//!
//! Engines publish one terminal event per transaction (and sandbox
//! lifecycle events) through the [`EventHub`]; listeners are registered by
//! the host at construction time. A panicking or slow listener is the
//! host's problem, not the engine's; dispatch is synchronous.

use std::sync::Mutex;

use tracing::info;

/// What happened to the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyType {
    Install,
    Update,
    Uninstall,
    UninstallModule,
    SandboxInstall,
    SandboxUninstall,
}

/// Terminal status event of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub notify_type: NotifyType,
    pub bundle_name: String,
    pub module: Option<String>,
    pub user_id: i32,
    pub uid: i32,
    pub access_token_id: u32,
    pub app_index: u32,
    pub success: bool,
}

pub trait StatusListener: Send + Sync {
    fn on_status(&self, event: &StatusEvent);
}

#[derive(Default)]
pub struct EventHub {
    listeners: Mutex<Vec<Box<dyn StatusListener>>>,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Box<dyn StatusListener>) {
        self.listeners
            .lock()
            .expect("listener list poisoned")
            .push(listener);
    }

    pub fn publish(&self, event: &StatusEvent) {
        info!(
            notify = ?event.notify_type,
            bundle = %event.bundle_name,
            user = event.user_id,
            success = event.success,
            "status event"
        );
        for listener in self.listeners.lock().expect("listener list poisoned").iter() {
            listener.on_status(event);
        }
    }
}
