//! CLI-level checks for `login`: an existing valid session short-circuits
//! the interactive flow, and `--quiet` stays silent.

use std::path::{Path, PathBuf};
use std::process::Command;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

fn refresh_token(email: &str) -> String {
    let header = serde_json::json!({"alg": "none", "typ": "JWT"});
    let payload = serde_json::json!({
        "type": "refresh",
        "sub": email,
        "exp": 9_999_999_999_i64,
    });
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
    )
}

fn seed_logged_in_config(dir: &Path, email: &str, server: &str) -> PathBuf {
    let cfg_path = dir.join("config.json");
    let data_dir = dir.join("SyftBox");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::write(
        &cfg_path,
        serde_json::to_vec_pretty(&serde_json::json!({
            "email": email,
            "data_dir": data_dir.display().to_string().replace('\\', "/"),
            "server_url": server,
            "client_url": "http://127.0.0.1:7938",
            "refresh_token": refresh_token(email),
        }))
        .unwrap(),
    )
    .unwrap();
    cfg_path
}

fn temp_home(name: &str) -> PathBuf {
    let home = std::env::temp_dir().join(format!("datasite-syncd-login-{name}"));
    let _ = std::fs::remove_dir_all(&home);
    std::fs::create_dir_all(&home).unwrap();
    home
}

#[test]
fn active_session_prints_summary_instead_of_prompting() {
    let home = temp_home("summary");
    let email = "alice@example.com";
    // Must match the CLI's default server, since no --server flag is passed.
    let cfg_path = seed_logged_in_config(&home, email, "https://relay.example.com");

    let out = Command::new(env!("CARGO_BIN_EXE_datasite-syncd"))
        .arg("-c")
        .arg(&cfg_path)
        .arg("login")
        .output()
        .expect("run login");

    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Logged in as alice@example.com"), "stdout: {stdout}");
    assert!(stdout.contains(&cfg_path.display().to_string()), "stdout: {stdout}");
    assert!(stdout.contains("https://relay.example.com"), "stdout: {stdout}");
}

#[test]
fn quiet_flag_suppresses_all_output_for_active_session() {
    let home = temp_home("quiet");
    let cfg_path = seed_logged_in_config(&home, "alice@example.com", "https://relay.example.com");

    let out = Command::new(env!("CARGO_BIN_EXE_datasite-syncd"))
        .arg("-c")
        .arg(&cfg_path)
        .arg("login")
        .arg("--quiet")
        .output()
        .expect("run login --quiet");

    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).trim().is_empty());
    assert!(String::from_utf8_lossy(&out.stderr).trim().is_empty());
}

#[test]
fn server_change_invalidates_the_session_and_fails_without_a_terminal() {
    let home = temp_home("server-change");
    // Stored server differs from the CLI's requested one, so the flow
    // restarts; with stdin closed the email prompt reads empty and the
    // command must fail rather than reuse the stale identity.
    let cfg_path = seed_logged_in_config(&home, "alice@example.com", "https://other.example.com");

    let out = Command::new(env!("CARGO_BIN_EXE_datasite-syncd"))
        .arg("-c")
        .arg(&cfg_path)
        .arg("login")
        .stdin(std::process::Stdio::null())
        .output()
        .expect("run login");

    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).trim().is_empty());
}
