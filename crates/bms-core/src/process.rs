//! Process termination seam.
//!
//! Updating or uninstalling a bundle first terminates its running processes,
//! keyed by the per-user uid. The host integration supplies the real
//! implementation; [`NoopProcessController`] is for hosts without one and
//! for tests.

use tracing::debug;

use bms_domain::InstallResult;

pub trait ProcessController: Send + Sync {
    /// Terminates every process running under `uid`.
    ///
    /// # Errors
    /// [`bms_domain::InstallError::KillProcessFailed`] when termination is
    /// refused; the surrounding transaction then fails before mutating disk.
    fn kill_processes(&self, bundle_name: &str, uid: i32) -> InstallResult<()>;
}

#[derive(Debug, Default)]
pub struct NoopProcessController;

impl ProcessController for NoopProcessController {
    fn kill_processes(&self, bundle_name: &str, uid: i32) -> InstallResult<()> {
        debug!(bundle = bundle_name, uid, "no process controller attached");
        Ok(())
    }
}
