#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn serverside(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("serverside").unwrap();
    cmd.current_dir(home.path())
        .env("HOME", home.path())
        .env("USER", "deploy")
        .env_remove("RUST_LOG");
    cmd
}

fn identity(cmd: &mut Command, home: &TempDir) {
    let config = serde_json::json!({
        "deploy_to": home.path().join("shop").to_string_lossy(),
    });
    cmd.args([
        "--app",
        "shop",
        "--environment-name",
        "production",
        "--account-name",
        "acme",
        "--framework-env",
        "production",
        "--config",
        &config.to_string(),
    ]);
}

fn release(home: &TempDir) -> PathBuf {
    let release = home.path().join("shop/releases/20240101000000");
    std::fs::create_dir_all(release.join("deploy")).unwrap();
    release
}

#[cfg(unix)]
fn write_executable(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

// ---------------------------------------------------------------------------
// serverside hook
// ---------------------------------------------------------------------------

#[test]
fn hook_without_file_is_skipped() {
    let home = TempDir::new().unwrap();
    let release = release(&home);
    let mut cmd = serverside(&home);
    cmd.args(["hook", "before_migrate"]);
    identity(&mut cmd, &home);
    cmd.arg("--release-path").arg(&release);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("No hook found for before_migrate. Skipping."));
}

#[cfg(unix)]
#[test]
fn executable_hook_sees_deploy_environment() {
    let home = TempDir::new().unwrap();
    let release = release(&home);
    write_executable(
        &release.join("deploy/before_restart"),
        "#!/bin/sh\necho \"app=$EY_DEPLOY_APP roles=$EY_DEPLOY_CURRENT_ROLES rails=$RAILS_ENV verbose=$EY_DEPLOY_VERBOSE\"\necho \"pwd=$(pwd)\"\n",
    );
    let mut cmd = serverside(&home);
    cmd.args(["hook", "before_restart"]);
    identity(&mut cmd, &home);
    cmd.arg("--release-path").arg(&release);
    cmd.args(["--current-roles", "app_master", "--current-name", "primary"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Executing"))
        .stdout(predicate::str::contains(
            "app=shop roles=app_master rails=production verbose=0",
        ))
        .stdout(predicate::str::contains("20240101000000"));

    let log = home.path().join("shop-deploy-hook-before_restart.log");
    let logged = std::fs::read_to_string(log).unwrap();
    assert!(logged.contains("app=shop"));
}

#[cfg(unix)]
#[test]
fn failing_hook_exits_nonzero() {
    let home = TempDir::new().unwrap();
    let release = release(&home);
    write_executable(&release.join("deploy/after_symlink"), "#!/bin/sh\necho nope\nexit 3\n");
    let mut cmd = serverside(&home);
    cmd.args(["hook", "after_symlink"]);
    identity(&mut cmd, &home);
    cmd.arg("--release-path").arg(&release);
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("after_symlink"));
}

#[test]
fn interpreted_hook_runs_actions() {
    let home = TempDir::new().unwrap();
    let release = release(&home);
    std::fs::write(
        release.join("deploy/after_migrate.yml"),
        "- info: \"migrated {{app}} in {{framework_env}}\"\n",
    )
    .unwrap();
    let mut cmd = serverside(&home);
    cmd.args(["hook", "after_migrate"]);
    identity(&mut cmd, &home);
    cmd.arg("--release-path").arg(&release);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("migrated shop in production"));
}

// ---------------------------------------------------------------------------
// serverside deploy
// ---------------------------------------------------------------------------

#[test]
fn conflicting_sources_abort_before_any_work() {
    let home = TempDir::new().unwrap();
    let mut cmd = serverside(&home);
    cmd.arg("deploy");
    identity(&mut cmd, &home);
    cmd.args(["--git", "git@example.com:shop.git", "--archive", "https://example.com/shop.zip"]);
    cmd.assert().failure().code(1).stderr(predicate::str::contains(
        "Both --git and --archive specified. Precedence is not defined. Aborting",
    ));
    assert!(!home.path().join("shop").exists());
}

#[test]
fn missing_required_flag_is_rejected() {
    let home = TempDir::new().unwrap();
    serverside(&home)
        .args(["deploy", "--app", "shop"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--environment-name"));
}

#[test]
fn unknown_deploy_action_is_rejected() {
    let home = TempDir::new().unwrap();
    let mut cmd = serverside(&home);
    cmd.args(["deploy", "redeploy"]);
    identity(&mut cmd, &home);
    cmd.assert().failure();
}

#[test]
fn rollback_without_history_fails() {
    let home = TempDir::new().unwrap();
    let mut cmd = serverside(&home);
    cmd.args(["deploy", "rollback"]);
    identity(&mut cmd, &home);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Already at oldest release"));
}

#[test]
fn invalid_config_json_is_reported() {
    let home = TempDir::new().unwrap();
    serverside(&home)
        .args([
            "restart",
            "--app",
            "shop",
            "--environment-name",
            "production",
            "--account-name",
            "acme",
            "--framework-env",
            "production",
            "--config",
            "{not json",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

// ---------------------------------------------------------------------------
// maintenance
// ---------------------------------------------------------------------------

#[test]
fn maintenance_status_reports_down() {
    let home = TempDir::new().unwrap();
    let mut cmd = serverside(&home);
    cmd.arg("maintenance_status");
    identity(&mut cmd, &home);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Maintenance page: down"));
}

#[test]
fn maintenance_status_reports_up() {
    let home = TempDir::new().unwrap();
    let system = home.path().join("shop/shared/system");
    std::fs::create_dir_all(&system).unwrap();
    std::fs::write(system.join("maintenance.html"), "down for a bit").unwrap();
    let mut cmd = serverside(&home);
    cmd.arg("maintenance_status");
    identity(&mut cmd, &home);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Maintenance page: up"));
}

#[test]
fn enable_maintenance_requires_a_deploy() {
    let home = TempDir::new().unwrap();
    let mut cmd = serverside(&home);
    cmd.arg("enable_maintenance");
    identity(&mut cmd, &home);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("has never been deployed"));
}

#[cfg(unix)]
#[test]
fn enable_maintenance_uses_the_current_release_page() {
    let home = TempDir::new().unwrap();
    let release = release(&home);
    std::fs::create_dir_all(release.join("public")).unwrap();
    std::fs::write(release.join("public/maintenance.html.custom"), "back soon").unwrap();
    std::os::unix::fs::symlink(&release, home.path().join("shop/current")).unwrap();

    let mut cmd = serverside(&home);
    cmd.arg("enable_maintenance");
    identity(&mut cmd, &home);
    cmd.args(["--instances", "localhost", "--instance-roles", "localhost:solo"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("maintenance.html.custom"));

    let page = home.path().join("shop/shared/system/maintenance.html");
    assert_eq!(std::fs::read_to_string(page).unwrap(), "back soon");
}
