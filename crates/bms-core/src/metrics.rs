//! Operation counters and wall-time accumulators, injected into the
//! engines at construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Monotonic counters and elapsed-time sums over engine operations. Cheap
/// to share behind an `Arc`; snapshots are not atomic across fields.
#[derive(Debug, Default)]
pub struct Metrics {
    installs_ok: AtomicU64,
    installs_failed: AtomicU64,
    updates_ok: AtomicU64,
    updates_failed: AtomicU64,
    uninstalls_ok: AtomicU64,
    uninstalls_failed: AtomicU64,
    rollbacks: AtomicU64,
    sandbox_installs: AtomicU64,
    sandbox_uninstalls: AtomicU64,
    boot_recoveries: AtomicU64,
    install_time_ns: AtomicU64,
    uninstall_time_ns: AtomicU64,
    scan_time_ns: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub installs_ok: u64,
    pub installs_failed: u64,
    pub updates_ok: u64,
    pub updates_failed: u64,
    pub uninstalls_ok: u64,
    pub uninstalls_failed: u64,
    pub rollbacks: u64,
    pub sandbox_installs: u64,
    pub sandbox_uninstalls: u64,
    pub boot_recoveries: u64,
    pub install_time_ns: u64,
    pub uninstall_time_ns: u64,
    pub scan_time_ns: u64,
}

impl Metrics {
    pub fn record_install(&self, success: bool) {
        self.bump(success, &self.installs_ok, &self.installs_failed);
    }

    pub fn record_update(&self, success: bool) {
        self.bump(success, &self.updates_ok, &self.updates_failed);
    }

    pub fn record_uninstall(&self, success: bool) {
        self.bump(success, &self.uninstalls_ok, &self.uninstalls_failed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sandbox_install(&self) {
        self.sandbox_installs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sandbox_uninstall(&self) {
        self.sandbox_uninstalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_boot_recovery(&self) {
        self.boot_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_install_time(&self, elapsed: Duration) {
        self.install_time_ns.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub fn add_uninstall_time(&self, elapsed: Duration) {
        self.uninstall_time_ns
            .fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub fn add_scan_time(&self, elapsed: Duration) {
        self.scan_time_ns.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    fn bump(&self, success: bool, ok: &AtomicU64, failed: &AtomicU64) {
        if success {
            ok.fetch_add(1, Ordering::Relaxed);
        } else {
            failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Zeroes every counter and timer; boot passes start from a clean slate.
    pub fn reset(&self) {
        for counter in [
            &self.installs_ok,
            &self.installs_failed,
            &self.updates_ok,
            &self.updates_failed,
            &self.uninstalls_ok,
            &self.uninstalls_failed,
            &self.rollbacks,
            &self.sandbox_installs,
            &self.sandbox_uninstalls,
            &self.boot_recoveries,
            &self.install_time_ns,
            &self.uninstall_time_ns,
            &self.scan_time_ns,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            installs_ok: self.installs_ok.load(Ordering::Relaxed),
            installs_failed: self.installs_failed.load(Ordering::Relaxed),
            updates_ok: self.updates_ok.load(Ordering::Relaxed),
            updates_failed: self.updates_failed.load(Ordering::Relaxed),
            uninstalls_ok: self.uninstalls_ok.load(Ordering::Relaxed),
            uninstalls_failed: self.uninstalls_failed.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            sandbox_installs: self.sandbox_installs.load(Ordering::Relaxed),
            sandbox_uninstalls: self.sandbox_uninstalls.load(Ordering::Relaxed),
            boot_recoveries: self.boot_recoveries.load(Ordering::Relaxed),
            install_time_ns: self.install_time_ns.load(Ordering::Relaxed),
            uninstall_time_ns: self.uninstall_time_ns.load(Ordering::Relaxed),
            scan_time_ns: self.scan_time_ns.load(Ordering::Relaxed),
        }
    }
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_accumulate_and_reset_with_the_counters() {
        let metrics = Metrics::default();
        metrics.record_install(true);
        metrics.add_install_time(Duration::from_micros(5));
        metrics.add_install_time(Duration::from_micros(7));
        let snap = metrics.snapshot();
        assert_eq!(snap.installs_ok, 1);
        assert_eq!(snap.install_time_ns, 12_000);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn snapshot_serializes_for_status_output() {
        let metrics = Metrics::default();
        metrics.record_install(true);
        metrics.add_scan_time(Duration::from_nanos(42));
        let value = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(value["installs_ok"], 1);
        assert_eq!(value["scan_time_ns"], 42);
    }
}
