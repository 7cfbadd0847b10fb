//! Fatal configuration is reported by the binary before any listener binds.

use std::process::{Command, Output};

fn waypoint(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_waypoint"))
        .args(args)
        .env_remove("CF_API_TOKEN")
        .env_remove("MICRO_WEB_ADDRESS")
        .env_remove("MICRO_WEB_RESOLVER")
        .env_remove("MICRO_ENABLE_ACME")
        .env_remove("MICRO_ACME_PROVIDER")
        .env("RUST_LOG", "error")
        .output()
        .expect("failed to run the waypoint binary")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn dns01_without_credential_exits_non_zero() {
    let storage = tempfile::tempdir().unwrap();
    let output = waypoint(&[
        "--address",
        "127.0.0.1:0",
        "--enable-acme",
        "--acme-provider",
        "dns01",
        "--acme-hosts",
        "chat.example.com",
        "--acme-storage",
        storage.path().to_str().unwrap(),
    ]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("CF_API_TOKEN"), "{}", stderr(&output));
}

#[test]
fn unknown_acme_provider_exits_non_zero() {
    let output = waypoint(&["--address", "127.0.0.1:0", "--enable-acme", "--acme-provider", "letsgo"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("letsgo"), "{}", stderr(&output));
}

#[test]
fn unknown_resolver_exits_non_zero() {
    let output = waypoint(&["--address", "127.0.0.1:0", "--resolver", "hostname"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("hostname"), "{}", stderr(&output));
}

#[test]
fn missing_static_tls_files_exit_non_zero() {
    let output = waypoint(&[
        "--address",
        "127.0.0.1:0",
        "--tls-cert-file",
        "/nonexistent/cert.pem",
        "--tls-key-file",
        "/nonexistent/key.pem",
    ]);
    assert!(!output.status.success());
}

#[test]
fn config_test_mode_accepts_defaults() {
    let output = waypoint(&["--test"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("test is successful"));
}
