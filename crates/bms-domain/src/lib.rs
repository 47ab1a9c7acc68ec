#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Data model for the bundle management service: installed-package records,
//! operation parameters, the result-code taxonomy and parsed manifest types.
//! No I/O lives here.

pub mod bundle;
pub mod error;
pub mod manifest;
pub mod params;
pub mod preinstall;
pub mod progress;
pub mod sandbox;

pub use bundle::{
    AppType, ExceptionStatus, InstallMark, ModuleRecord, PackageRecord, UserRecord,
};
pub use error::{InstallError, InstallResult};
pub use manifest::{
    BundleManifest, DefaultPermissionEntry, ModuleManifest, PackManifest, PackModule,
    PreInstallAbilityEntry, PreInstallConfigEntry,
};
pub use params::{
    InstallFlag, InstallParams, ANY_USER_ID, BASE_USER_RANGE, DEFAULT_USER_ID, INVALID_USER_ID,
};
pub use preinstall::PreInstallRecord;
pub use progress::{InstallState, InstallerState};
pub use sandbox::{sandbox_key, SandboxRecord, FIRST_SANDBOX_APP_INDEX};
