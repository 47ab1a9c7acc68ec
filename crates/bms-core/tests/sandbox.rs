//! Sandbox instance lifecycle against a temp-rooted service.

mod common;

use bms_domain::{InstallError, InstallParams};

use common::{fixture, fixture_with, Hap};

const BUNDLE: &str = "com.example.app";

#[test]
fn sandbox_indices_start_at_two_and_allocate_first_fit() {
    let fx = fixture();
    let hap = Hap::entry(BUNDLE, 1).write_to(fx.temp.path());
    fx.service
        .engine
        .install(&[hap], &InstallParams::default())
        .unwrap();

    assert_eq!(fx.service.sandbox.install(BUNDLE, 0, 0).unwrap(), 2);
    assert_eq!(fx.service.sandbox.install(BUNDLE, 0, 0).unwrap(), 3);

    let record = fx.service.sandbox_index.get(BUNDLE, 2).unwrap();
    assert_eq!(record.key(), format!("{BUNDLE}_2"));
    assert!(record.record.is_sandbox);
    assert_eq!(record.user_id, 0);
    // The sandbox identity is distinct from the base bundle's.
    assert_ne!(
        record.uid,
        fx.service.index.get(BUNDLE).unwrap().uid(0).unwrap()
    );

    // Releasing 2 makes it the next first-fit candidate.
    fx.service.sandbox.uninstall(BUNDLE, 2, 0).unwrap();
    assert_eq!(fx.service.sandbox.install(BUNDLE, 0, 0).unwrap(), 2);
}

#[test]
fn sandbox_requires_an_installed_base_bundle_and_user() {
    let fx = fixture();
    assert_eq!(
        fx.service.sandbox.install(BUNDLE, 0, 0).unwrap_err(),
        InstallError::AppNotExisted
    );

    let hap = Hap::entry(BUNDLE, 1).write_to(fx.temp.path());
    fx.service
        .engine
        .install(&[hap], &InstallParams::default())
        .unwrap();
    fx.service.index.add_user_id(100);
    assert_eq!(
        fx.service.sandbox.install(BUNDLE, 0, 100).unwrap_err(),
        InstallError::NotInstalledAtUser(100)
    );
}

#[test]
fn uninstalling_one_sandbox_leaves_base_and_siblings_alone() {
    let fx = fixture();
    let hap = Hap::entry(BUNDLE, 1).write_to(fx.temp.path());
    fx.service
        .engine
        .install(&[hap], &InstallParams::default())
        .unwrap();
    let base_before = fx.service.index.get(BUNDLE).unwrap();
    fx.service.sandbox.install(BUNDLE, 0, 0).unwrap();
    fx.service.sandbox.install(BUNDLE, 0, 0).unwrap();

    fx.service.sandbox.uninstall(BUNDLE, 2, 0).unwrap();

    assert_eq!(fx.service.index.get(BUNDLE).unwrap(), base_before);
    assert!(fx.service.sandbox_index.get(BUNDLE, 2).is_none());
    assert!(fx.service.sandbox_index.get(BUNDLE, 3).is_some());
}

#[test]
fn unknown_sandbox_instances_report_not_existed() {
    let fx = fixture();
    let hap = Hap::entry(BUNDLE, 1).write_to(fx.temp.path());
    fx.service
        .engine
        .install(&[hap], &InstallParams::default())
        .unwrap();

    assert_eq!(
        fx.service.sandbox.uninstall(BUNDLE, 2, 0).unwrap_err(),
        InstallError::SandboxNotExisted {
            bundle: BUNDLE.to_owned(),
            app_index: 2
        }
    );
}

#[test]
fn base_uninstall_tears_down_every_sandbox_first() {
    let fx = fixture();
    let hap = Hap::entry(BUNDLE, 1).write_to(fx.temp.path());
    fx.service
        .engine
        .install(&[hap], &InstallParams::default())
        .unwrap();
    fx.service.sandbox.install(BUNDLE, 0, 0).unwrap();
    fx.service.sandbox.install(BUNDLE, 0, 0).unwrap();

    fx.service
        .engine
        .uninstall(BUNDLE, &InstallParams::default())
        .unwrap();

    assert!(fx.service.index.get(BUNDLE).is_none());
    assert!(fx.service.sandbox_index.instances(BUNDLE).is_empty());
}

#[test]
fn base_update_also_drops_existing_sandboxes() {
    let fx = fixture();
    let v1 = Hap::entry(BUNDLE, 1).write_to(fx.temp.path());
    fx.service
        .engine
        .install(&[v1], &InstallParams::default())
        .unwrap();
    fx.service.sandbox.install(BUNDLE, 0, 0).unwrap();

    let v2 = Hap::entry(BUNDLE, 2).write_to(fx.temp.path());
    let params = InstallParams {
        flag: bms_domain::InstallFlag::ReplaceExisting,
        ..InstallParams::default()
    };
    fx.service.engine.install(&[v2], &params).unwrap();

    assert!(fx.service.sandbox_index.instances(BUNDLE).is_empty());
    assert_eq!(fx.service.index.get(BUNDLE).unwrap().version_code, 2);
}

#[test]
fn exhausted_app_index_range_is_reported() {
    let fx = fixture_with(|config| config.max_sandbox_app_index = 3);
    let hap = Hap::entry(BUNDLE, 1).write_to(fx.temp.path());
    fx.service
        .engine
        .install(&[hap], &InstallParams::default())
        .unwrap();

    assert_eq!(fx.service.sandbox.install(BUNDLE, 0, 0).unwrap(), 2);
    assert_eq!(fx.service.sandbox.install(BUNDLE, 0, 0).unwrap(), 3);
    assert_eq!(
        fx.service.sandbox.install(BUNDLE, 0, 0).unwrap_err(),
        InstallError::InvalidAppIndex
    );
}

#[test]
fn sandbox_data_dirs_are_isolated_per_instance() {
    let fx = fixture();
    let hap = Hap::entry(BUNDLE, 1).write_to(fx.temp.path());
    fx.service
        .engine
        .install(&[hap], &InstallParams::default())
        .unwrap();

    fx.service.sandbox.install(BUNDLE, 0, 0).unwrap();
    let record = fx.service.sandbox_index.get(BUNDLE, 2).unwrap();
    assert!(std::path::Path::new(&record.data_dir).is_dir());
    assert!(record.data_dir.ends_with(&format!("{BUNDLE}_2")));

    fx.service.sandbox.uninstall(BUNDLE, 2, 0).unwrap();
    assert!(!std::path::Path::new(&record.data_dir).exists());
}
