//! CLI Integration Tests
//!
//! Tests the command-line interface end-to-end.

use assert_cmd::Command;
use assert_fs::prelude::*;
use predicates::prelude::*;

/// Get the binary to test.
fn caphost() -> Command {
    let mut cmd = Command::cargo_bin("caphost").unwrap();
    cmd.env_remove("CAPHOST_CONFIG").env_remove("RUST_LOG");
    cmd
}

const ECHO_MANIFEST: &str = r#"{
  "id": "echo",
  "name": "Echo",
  "version": "0.3.0",
  "provider": "local",
  "capabilities": [{"type": "chat", "models": ["echo-small"]}],
  "entrypoint": {"kind": "builtin", "target": "echo"}
}"#;

/// Generate a key in `dir` and return its public half.
fn keygen(dir: &assert_fs::TempDir) -> String {
    let output = caphost()
        .args(["keygen", "--out"])
        .arg(dir.child("signing.key").path())
        .output()
        .unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap().lines().last().unwrap().trim().to_string()
}

/// Write a config trusting `public_key` with its plugins dir in `dir`.
fn write_config(dir: &assert_fs::TempDir, public_key: &str) -> std::path::PathBuf {
    let plugins = dir.child("plugins");
    plugins.create_dir_all().unwrap();
    let config = dir.child("caphost.toml");
    config
        .write_str(&format!(
            "[runtime]\nplugins_dir = {:?}\nscratch_dir = {:?}\n\n[security]\ntrusted_keys = [{:?}]\n",
            plugins.path().display().to_string(),
            dir.child("scratch").path().display().to_string(),
            public_key,
        ))
        .unwrap();
    config.path().to_path_buf()
}

fn write_plugin_dir(dir: &assert_fs::TempDir) -> std::path::PathBuf {
    let plugin = dir.child("echo-plugin");
    plugin.child("manifest.json").write_str(ECHO_MANIFEST).unwrap();
    plugin.child("prompts/system.txt").write_str("You repeat what you hear.").unwrap();
    plugin.path().to_path_buf()
}

// ============================================================================
// Help & Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    caphost()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("capability plugins"));
}

#[test]
fn test_version_flag() {
    caphost()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unknown_subcommand() {
    caphost().arg("frobnicate").assert().failure();
}

// ============================================================================
// Keygen / Pack / Inspect
// ============================================================================

#[test]
fn test_keygen_refuses_overwrite() {
    let dir = assert_fs::TempDir::new().unwrap();
    let public_key = keygen(&dir);
    assert_eq!(public_key.len(), 44);
    dir.child("signing.key").assert(predicate::path::exists());

    caphost()
        .args(["keygen", "--out"])
        .arg(dir.child("signing.key").path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    caphost()
        .args(["keygen", "--force", "--out"])
        .arg(dir.child("signing.key").path())
        .assert()
        .success();
}

#[test]
fn test_pack_and_inspect_signed() {
    let dir = assert_fs::TempDir::new().unwrap();
    let public_key = keygen(&dir);
    let config = write_config(&dir, &public_key);
    let plugin = write_plugin_dir(&dir);
    let package = dir.child("plugins/echo-0.3.0.xpkg");

    caphost()
        .arg("pack")
        .arg(&plugin)
        .arg("--key")
        .arg(dir.child("signing.key").path())
        .arg("--out")
        .arg(package.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Packed echo v0.3.0"))
        .stdout(predicate::str::contains("signed"));
    package.assert(predicate::path::exists());

    caphost()
        .arg("--config")
        .arg(&config)
        .arg("inspect")
        .arg(package.path())
        .arg("--verify")
        .assert()
        .success()
        .stdout(predicate::str::contains("Echo v0.3.0 (echo)"))
        .stdout(predicate::str::contains("chat [echo-small]"))
        .stdout(predicate::str::contains("signature ok"));
}

#[test]
fn test_inspect_verify_rejects_unsigned() {
    let dir = assert_fs::TempDir::new().unwrap();
    let public_key = keygen(&dir);
    let config = write_config(&dir, &public_key);
    let plugin = write_plugin_dir(&dir);
    let package = dir.child("echo.xpkg");

    caphost().arg("pack").arg(&plugin).arg("--out").arg(package.path()).assert().success();

    caphost()
        .arg("--config")
        .arg(&config)
        .arg("inspect")
        .arg(package.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("signed:       no"));

    caphost()
        .arg("--config")
        .arg(&config)
        .arg("inspect")
        .arg(package.path())
        .arg("--verify")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Integrity"));
}

#[test]
fn test_pack_requires_manifest() {
    let dir = assert_fs::TempDir::new().unwrap();
    dir.child("empty/readme.txt").write_str("nothing here").unwrap();

    caphost()
        .arg("pack")
        .arg(dir.child("empty").path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("manifest.json"));
}

// ============================================================================
// Config / Discover
// ============================================================================

#[test]
fn test_config_shows_sections() {
    let dir = assert_fs::TempDir::new().unwrap();
    let config = write_config(&dir, "");

    caphost()
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[runtime]"))
        .stdout(predicate::str::contains("[timeouts]"))
        .stdout(predicate::str::contains("require_signatures = true"));

    caphost()
        .arg("--config")
        .arg(&config)
        .args(["config", "--path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("caphost.toml"));
}

#[test]
fn test_config_parse_error() {
    let dir = assert_fs::TempDir::new().unwrap();
    let config = dir.child("broken.toml");
    config.write_str("[runtime\nplugins_dir = 3").unwrap();

    caphost()
        .arg("--config")
        .arg(config.path())
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn test_discover_empty_directory() {
    let dir = assert_fs::TempDir::new().unwrap();
    let public_key = keygen(&dir);
    let config = write_config(&dir, &public_key);

    caphost()
        .arg("--config")
        .arg(&config)
        .arg("discover")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"loaded\": []"));
}

#[test]
fn test_discover_reports_unsigned_package() {
    let dir = assert_fs::TempDir::new().unwrap();
    let public_key = keygen(&dir);
    let config = write_config(&dir, &public_key);
    let plugin = write_plugin_dir(&dir);

    caphost()
        .arg("pack")
        .arg(&plugin)
        .arg("--out")
        .arg(dir.child("plugins/echo.xpkg").path())
        .assert()
        .success();

    caphost()
        .arg("--config")
        .arg(&config)
        .arg("discover")
        .assert()
        .failure()
        .stdout(predicate::str::contains("IntegrityError"))
        .stderr(predicate::str::contains("1 package(s) failed to load"));
}
