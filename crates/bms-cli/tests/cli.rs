use assert_cmd::Command;

fn config_file(temp: &tempfile::TempDir) -> std::path::PathBuf {
    let root = temp.path();
    let config = serde_json::json!({
        "code_root": root.join("app"),
        "data_root": root.join("data"),
        "store_root": root.join("store"),
        "system_app_dirs": [root.join("system")],
        "third_system_app_dirs": [],
        "system_resources_bundle": "ohos.global.systemres",
        "device_capabilities": [],
        "system_ids": { "base": 2100, "count": 800 },
        "third_system_ids": { "base": 2900, "count": 100 },
        "third_party_ids": { "base": 10000, "count": 55536 },
        "max_sandbox_app_index": 100,
        "pre_install_config": null,
        "pre_uninstall_config": null,
        "pre_install_ability_config": null,
        "default_permission_config": null
    });
    let path = root.join("bms.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();
    path
}

#[test]
fn help_lists_the_subcommands() {
    let output = Command::cargo_bin("bms").unwrap().arg("--help").output().unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["scan", "install", "uninstall", "sandbox", "status"] {
        assert!(text.contains(subcommand), "missing {subcommand} in help");
    }
}

#[test]
fn scan_over_empty_directories_reports_nothing_to_do() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::create_dir(temp.path().join("system")).unwrap();
    let config = config_file(&temp);

    let output = Command::cargo_bin("bms")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "--json", "scan"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let payload: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("scan output is JSON");
    assert_eq!(payload["installed"], 0);
    assert_eq!(payload["uninstalled"], 0);
}

#[test]
fn status_lists_no_bundles_on_a_fresh_store() {
    let temp = tempfile::tempdir().unwrap();
    std::fs::create_dir(temp.path().join("system")).unwrap();
    let config = config_file(&temp);

    let output = Command::cargo_bin("bms")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "--json", "status"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let payload: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("status output is JSON");
    assert_eq!(payload["bundles"], serde_json::json!([]));
}

#[test]
fn uninstalling_an_unknown_bundle_fails() {
    let temp = tempfile::tempdir().unwrap();
    let config = config_file(&temp);

    Command::cargo_bin("bms")
        .unwrap()
        .args([
            "--config",
            config.to_str().unwrap(),
            "uninstall",
            "com.example.absent",
        ])
        .assert()
        .failure();
}
