//! The closed result-code taxonomy returned by every engine operation.
//!
//! No other error type crosses the engine boundary; internal failures are
//! folded into [`InstallError::Internal`] before they reach a caller.

/// Terminal result of an install, update, uninstall or sandbox operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstallError {
    // -- input validation, detected before any mutation --
    #[error("bundle file is missing or not a regular file: {path}")]
    InvalidBundleFile { path: String },
    #[error("invalid install parameters: {reason}")]
    InvalidParam { reason: String },
    #[error("user {0} does not exist")]
    UserNotExist(i32),

    // -- capability / signature pre-flight --
    #[error("required system capability '{0}' is not present on this device")]
    CapabilityCheckFailed(String),
    #[error("signature verification failed for {path}: {reason}")]
    SignatureVerifyFailed { path: String, reason: String },
    #[error("split packages carry inconsistent signing information")]
    InconsistentSignature,

    // -- cross-split label consistency --
    #[error("bundle name differs across split packages")]
    BundleNameNotSame,
    #[error("version code differs across split packages")]
    VersionCodeNotSame,
    #[error("version name differs across split packages or against the installed bundle")]
    VersionNameNotSame,
    #[error("min-compatible version differs across split packages or against the installed bundle")]
    MinCompatibleVersionNotSame,
    #[error("vendor differs across split packages or against the installed bundle")]
    VendorNotSame,
    #[error("release type differs across split packages or against the installed bundle")]
    ReleaseTypeNotSame,
    #[error("target api version differs across split packages or against the installed bundle")]
    TargetVersionNotSame,
    #[error("compatible api version differs across split packages or against the installed bundle")]
    CompatibleVersionNotSame,
    #[error("singleton flag differs across split packages")]
    SingletonNotSame,
    #[error("app type differs across split packages")]
    AppTypeNotSame,
    #[error("more than one split package carries an entry module")]
    MultipleEntryModules,
    #[error("module name '{0}' appears in more than one split package")]
    ModuleNameDuplicate(String),
    #[error("split package {0} declares no module name")]
    ModuleNameEmpty(String),
    #[error("hash parameter names module '{0}' which is not among the split packages")]
    ModuleNameMissing(String),

    // -- state machine --
    #[error("cannot mix new-format and old-format modules in one bundle")]
    IncompatibleModuleFormat,
    #[error("cannot mix application and service modules in one bundle")]
    IncompatibleServiceType,
    #[error("the bundle already has an entry module")]
    EntryAlreadyExists,
    #[error("incoming version code is lower than the installed version code")]
    VersionDowngrade,
    #[error("incoming version code is not compatible with the installed entry module")]
    VersionNotCompatible,
    #[error("bundle is already installed for this user at the same version")]
    AlreadyExists,
    #[error("singleton placement violation: singleton={singleton} user={user_id}")]
    SingletonUserMismatch { singleton: bool, user_id: i32 },
    #[error("another operation on this bundle is already in flight")]
    InstallStateError,
    #[error("bundle is not installed")]
    NotInstalled,
    #[error("module '{0}' is not installed in this bundle")]
    ModuleNotInstalled(String),
    #[error("bundle is not installed for user {0}")]
    NotInstalledAtUser(i32),
    #[error("cannot uninstall a non-removable system app without force")]
    UninstallSystemAppError,
    #[error("recover is only available for system apps")]
    RecoverNotSystemApp,
    #[error("failed to terminate running processes of the bundle")]
    KillProcessFailed,

    // -- sandbox --
    #[error("base bundle does not exist")]
    AppNotExisted,
    #[error("sandbox app index range is exhausted or the index is invalid")]
    InvalidAppIndex,
    #[error("sandbox instance {bundle}_{app_index} does not exist")]
    SandboxNotExisted { bundle: String, app_index: u32 },

    // -- resources, always during mutation, always rolled back --
    #[error("identifier range for this bundle class is exhausted")]
    IdExhausted,
    #[error("access token issuance failed: {0}")]
    TokenIssueFailed(String),
    #[error("permission grant failed: {0}")]
    GrantPermissionsFailed(String),
    #[error("insufficient disk space at {0}")]
    DiskSpaceInsufficient(String),
    #[error("file operation '{op}' failed on {path}: {message}")]
    FileOperationFailed {
        op: &'static str,
        path: String,
        message: String,
    },

    // -- parse errors --
    #[error("no manifest profile found inside the package archive")]
    NoProfile,
    #[error("unexpected error while parsing the package: {0}")]
    ParseUnexpected(String),
    #[error("manifest is missing required property '{0}'")]
    ParseProfileMissingProp(String),
    #[error("manifest property '{0}' has the wrong type")]
    ParseProfilePropTypeError(String),

    // -- internal / collaborator unavailable --
    #[error("internal error: {0}")]
    Internal(String),
}

impl InstallError {
    /// Whether the failure was detected before any mutation started.
    ///
    /// Pre-flight failures never require rollback; everything else reached
    /// the mutation phase of a transaction.
    #[must_use]
    pub fn is_preflight(&self) -> bool {
        !matches!(
            self,
            Self::IdExhausted
                | Self::TokenIssueFailed(_)
                | Self::GrantPermissionsFailed(_)
                | Self::FileOperationFailed { .. }
                | Self::Internal(_)
        )
    }
}

pub type InstallResult<T> = Result<T, InstallError>;
