//! Coarse progress marker for in-flight install operations.

use serde::{Deserialize, Serialize};

/// Phase checkpoints of one install transaction, for UI progress queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstallerState {
    InstallStart,
    BundleChecked,
    SyscapChecked,
    SignatureChecked,
    Parsed,
    HashChecked,
    LabelChecked,
    SandboxRemoved,
    InfoSaved,
    Renamed,
    Success,
    Failed,
}

impl InstallerState {
    /// Percentage-complete shown to callers polling install progress.
    #[must_use]
    pub fn percentage(self) -> u8 {
        match self {
            Self::InstallStart => 0,
            Self::BundleChecked => 5,
            Self::SyscapChecked => 10,
            Self::SignatureChecked => 15,
            Self::Parsed => 20,
            Self::HashChecked => 25,
            Self::LabelChecked => 30,
            Self::SandboxRemoved => 50,
            Self::InfoSaved => 80,
            Self::Renamed => 90,
            Self::Success | Self::Failed => 100,
        }
    }
}

/// Index-level lifecycle state of a bundle, guarded by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallState {
    InstallStart,
    InstallSuccess,
    InstallFail,
    UpdatingStart,
    UpdatingSuccess,
    UpdatingFail,
    UninstallStart,
    UninstallSuccess,
    UninstallFail,
    RollBack,
    UserChange,
}
