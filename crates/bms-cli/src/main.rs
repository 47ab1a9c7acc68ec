#![deny(clippy::all, warnings)]

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

use bms_core::{BundleService, ServiceConfig};
use bms_domain::{InstallFlag, InstallParams};

mod cli;

use cli::{Cli, Command, SandboxCommand};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    let service = BundleService::open_local(config).context("opening bundle service")?;

    match run(&cli, &service) {
        Ok(payload) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else if let Some(message) = payload.get("message").and_then(|m| m.as_str()) {
                println!("{message}");
            } else {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            }
            Ok(())
        }
        Err(err) => {
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "error": err.to_string() }))?
                );
            } else {
                eprintln!("error: {err}");
            }
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("bms={level}")));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(cli: &Cli, service: &BundleService) -> Result<serde_json::Value> {
    match &cli.command {
        Command::Scan => {
            let summary = service.reconciler.reconcile()?;
            Ok(json!({
                "recovered": summary.recovered,
                "installed": summary.installed,
                "updated": summary.updated,
                "module_installs": summary.module_installs,
                "uninstalled": summary.uninstalled,
                "module_uninstalls": summary.module_uninstalls,
                "message": format!(
                    "reconciled: {} installed, {} updated, {} removed",
                    summary.installed, summary.updated, summary.uninstalled
                ),
            }))
        }
        Command::Install(args) => {
            let params = InstallParams {
                user_id: args.user,
                flag: if args.replace {
                    InstallFlag::ReplaceExisting
                } else {
                    InstallFlag::Normal
                },
                keep_data: args.keep_data,
                ..InstallParams::default()
            };
            let bundle = service.engine.install(&args.paths, &params)?;
            Ok(json!({
                "bundle": bundle,
                "user": args.user,
                "message": format!("installed {bundle} for user {}", args.user),
            }))
        }
        Command::Uninstall(args) => {
            let params = InstallParams {
                user_id: args.user,
                keep_data: args.keep_data,
                force: args.force,
                ..InstallParams::default()
            };
            match &args.module {
                Some(module) => {
                    service
                        .engine
                        .uninstall_module(&args.bundle, module, &params)?;
                    Ok(json!({
                        "bundle": args.bundle,
                        "module": module,
                        "message": format!("uninstalled module {module} of {}", args.bundle),
                    }))
                }
                None => {
                    service.engine.uninstall(&args.bundle, &params)?;
                    Ok(json!({
                        "bundle": args.bundle,
                        "message": format!("uninstalled {} for user {}", args.bundle, args.user),
                    }))
                }
            }
        }
        Command::InstallName(args) => {
            let bundle = service
                .engine
                .install_by_name(&args.bundle, &InstallParams::for_user(args.user))?;
            Ok(json!({
                "bundle": bundle,
                "message": format!("installed {bundle} for user {}", args.user),
            }))
        }
        Command::Recover(args) => {
            let bundle = service
                .engine
                .recover(&args.bundle, &InstallParams::for_user(args.user))?;
            Ok(json!({
                "bundle": bundle,
                "message": format!("recovered {bundle} for user {}", args.user),
            }))
        }
        Command::Sandbox(command) => match command {
            SandboxCommand::Install {
                bundle,
                user,
                dlp_type,
            } => {
                let app_index = service.sandbox.install(bundle, *dlp_type, *user)?;
                Ok(json!({
                    "bundle": bundle,
                    "app_index": app_index,
                    "message": format!("sandbox {bundle}_{app_index} installed"),
                }))
            }
            SandboxCommand::Uninstall {
                bundle,
                app_index,
                user,
            } => {
                service.sandbox.uninstall(bundle, *app_index, *user)?;
                Ok(json!({
                    "bundle": bundle,
                    "app_index": app_index,
                    "message": format!("sandbox {bundle}_{app_index} removed"),
                }))
            }
        },
        Command::Status(args) => status(service, args.bundle.as_deref()),
    }
}

fn status(service: &BundleService, bundle: Option<&str>) -> Result<serde_json::Value> {
    if let Some(name) = bundle {
        let Some(record) = service.index.query(name) else {
            anyhow::bail!("bundle {name} is not installed");
        };
        let sandboxes: Vec<String> = service
            .sandbox_index
            .instances(name)
            .iter()
            .map(bms_domain::SandboxRecord::key)
            .collect();
        return Ok(json!({
            "record": serde_json::to_value(&record)?,
            "sandboxes": sandboxes,
            "progress": service.engine.progress(name),
        }));
    }
    Ok(json!({
        "bundles": service.index.bundle_names(),
        "metrics": serde_json::to_value(service.metrics.snapshot())?,
    }))
}
