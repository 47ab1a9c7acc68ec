//! Command-line surface of the bundle manager.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "bms", about = "Bundle management service", version)]
pub struct Cli {
    /// Service configuration file (JSON); defaults apply when omitted.
    #[arg(long, global = true, env = "BMS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON instead of human output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run boot reconciliation: crash recovery plus directory scan.
    Scan,
    /// Install or update a bundle from its split archives.
    Install(InstallArgs),
    /// Uninstall a bundle, or one module of it.
    Uninstall(UninstallArgs),
    /// Reinstall a bundle from its pre-install record.
    InstallName(NameArgs),
    /// Restore a previously removed system bundle.
    Recover(NameArgs),
    /// Manage sandbox instances of an installed bundle.
    #[command(subcommand)]
    Sandbox(SandboxCommand),
    /// Show installed bundle records and service counters.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Split archive paths forming one bundle.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    #[arg(long, default_value_t = 0)]
    pub user: i32,

    /// Replace modules of an equal-version installed bundle.
    #[arg(long)]
    pub replace: bool,

    /// Keep data directories of replaced modules.
    #[arg(long)]
    pub keep_data: bool,
}

#[derive(Debug, Args)]
pub struct UninstallArgs {
    pub bundle: String,

    /// Uninstall only this module.
    #[arg(long)]
    pub module: Option<String>,

    #[arg(long, default_value_t = 0)]
    pub user: i32,

    /// Keep the bundle's data directories.
    #[arg(long)]
    pub keep_data: bool,

    /// Force past the non-removable system-app refusal.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct NameArgs {
    pub bundle: String,

    #[arg(long, default_value_t = 0)]
    pub user: i32,
}

#[derive(Debug, Subcommand)]
pub enum SandboxCommand {
    /// Install a new sandbox instance; prints the allocated app index.
    Install {
        bundle: String,
        #[arg(long, default_value_t = 0)]
        user: i32,
        #[arg(long, default_value_t = 0)]
        dlp_type: i32,
    },
    /// Remove one sandbox instance.
    Uninstall {
        bundle: String,
        app_index: u32,
        #[arg(long, default_value_t = 0)]
        user: i32,
    },
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Limit output to one bundle.
    pub bundle: Option<String>,
}
