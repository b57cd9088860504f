//! Interactive login: the one-time email code exchange that seeds
//! `config.json` with an identity and refresh token.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::auth;
use crate::config::{validate_email, validate_url, Config};

pub struct LoginArgs {
    pub config_path: PathBuf,
    pub server_url: String,
    pub data_dir: PathBuf,
    pub email: Option<String>,
    pub quiet: bool,
}

enum SessionState {
    /// A config with a refresh token that is still valid for this server.
    Active(Config),
    /// Missing or unusable config, or the requested server changed out
    /// from under the stored identity: run the full flow.
    NeedsLogin,
}

pub async fn run_login(args: LoginArgs) -> Result<()> {
    if let SessionState::Active(cfg) = current_session(&args.config_path, &args.server_url) {
        if !args.quiet {
            print!("{}", render_session(&args.config_path, &cfg));
        }
        return Ok(());
    }

    let email = match args.email {
        Some(email) => email,
        None => read_line("Email: ")?,
    };
    validate_email(&email).context("email")?;
    validate_url(&args.server_url).context("server_url")?;

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("build http client")?;

    if !args.quiet {
        eprintln!("Sending a one-time code to {email}...");
    }
    auth::request_email_code(&http, &args.server_url, &email).await?;

    let code = read_line("Code: ")?;
    let tokens = auth::verify_email_code(&http, &args.server_url, &email, &code).await?;
    auth::validate_token(&tokens.refresh_token, "refresh", &email).context("refresh token")?;
    auth::validate_token(&tokens.access_token, "access", &email).context("access token")?;

    let cfg = Config::new_for_save(
        &args.config_path,
        &args.data_dir,
        &email,
        &args.server_url,
        Some(Config::default_client_url().to_string()),
        None,
        Some(tokens.refresh_token),
    )?;
    cfg.save()?;

    if !args.quiet {
        println!("Datasite ready.");
        print!("{}", render_session(&args.config_path, &cfg));
    }
    Ok(())
}

fn current_session(config_path: &Path, requested_server: &str) -> SessionState {
    let Ok(cfg) = Config::load_file_only(config_path) else {
        return SessionState::NeedsLogin;
    };
    if validate_email(&cfg.email).is_err() || validate_url(&cfg.server_url).is_err() {
        return SessionState::NeedsLogin;
    }
    if cfg.server_url != requested_server {
        return SessionState::NeedsLogin;
    }
    let token_ok = cfg
        .refresh_token
        .as_deref()
        .is_some_and(|t| auth::validate_token(t, "refresh", &cfg.email).is_ok());
    if token_ok {
        SessionState::Active(cfg)
    } else {
        SessionState::NeedsLogin
    }
}

fn render_session(config_path: &Path, cfg: &Config) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Logged in as {}", cfg.email);
    let _ = writeln!(out);
    let _ = writeln!(out, "  config   {}", config_path.display());
    let _ = writeln!(out, "  data     {}", cfg.data_dir.display());
    let _ = writeln!(out, "  server   {}", cfg.server_url);
    let _ = writeln!(
        out,
        "  control  {}",
        cfg.client_url.as_deref().unwrap_or("-")
    );
    out
}

fn read_line(prompt: &str) -> Result<String> {
    let mut err = io::stderr();
    let _ = err.write_all(prompt.as_bytes());
    let _ = err.flush();
    let mut buf = String::new();
    io::stdin().read_line(&mut buf).context("read stdin")?;
    Ok(buf.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use std::time::SystemTime;

    fn make_temp_dir(name: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("datasite-sync-login-test-{name}-{nanos}"));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    fn refresh_token_for(email: &str, exp: i64) -> String {
        let header = serde_json::json!({"alg": "none", "typ": "JWT"});
        let payload = serde_json::json!({"type": "refresh", "sub": email, "exp": exp});
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
        )
    }

    fn write_config(dir: &Path, email: &str, server: &str, refresh: &str) -> PathBuf {
        let cfg_path = dir.join("config.json");
        std::fs::write(
            &cfg_path,
            serde_json::to_vec_pretty(&serde_json::json!({
                "email": email,
                "data_dir": dir.join("data").display().to_string(),
                "server_url": server,
                "client_url": "http://127.0.0.1:7938",
                "refresh_token": refresh,
            }))
            .unwrap(),
        )
        .unwrap();
        cfg_path
    }

    #[test]
    fn valid_session_is_recognized_and_rendered() {
        let tmp = make_temp_dir("active");
        let email = "alice@example.com";
        let server = "http://127.0.0.1:8080";
        let cfg_path = write_config(&tmp, email, server, &refresh_token_for(email, 9_999_999_999));

        let SessionState::Active(cfg) = current_session(&cfg_path, server) else {
            panic!("expected an active session");
        };
        let rendered = render_session(&cfg_path, &cfg);
        assert!(rendered.contains("Logged in as alice@example.com"));
        assert!(rendered.contains(server));
        assert!(rendered.contains("http://127.0.0.1:7938"));
    }

    #[test]
    fn changed_server_forces_a_fresh_login() {
        let tmp = make_temp_dir("server-change");
        let email = "alice@example.com";
        let cfg_path = write_config(
            &tmp,
            email,
            "http://127.0.0.1:1111",
            &refresh_token_for(email, 9_999_999_999),
        );
        assert!(matches!(
            current_session(&cfg_path, "http://127.0.0.1:2222"),
            SessionState::NeedsLogin
        ));
    }

    #[test]
    fn expired_refresh_token_forces_a_fresh_login() {
        let tmp = make_temp_dir("expired");
        let email = "alice@example.com";
        let server = "http://127.0.0.1:8080";
        let cfg_path = write_config(&tmp, email, server, &refresh_token_for(email, 1));
        assert!(matches!(
            current_session(&cfg_path, server),
            SessionState::NeedsLogin
        ));
    }

    #[test]
    fn absent_config_forces_a_fresh_login() {
        let tmp = make_temp_dir("absent");
        assert!(matches!(
            current_session(&tmp.join("config.json"), "http://127.0.0.1:8080"),
            SessionState::NeedsLogin
        ));
    }
}
