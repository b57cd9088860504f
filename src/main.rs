use datasite_sync::config::{Config, ConfigOverrides};
use datasite_sync::daemon::{self, DaemonOptions};
use datasite_sync::errors::{self, SyncErrorKind};
use datasite_sync::login;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "syftbox", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Email override (takes precedence over env/config)
    #[arg(long = "email")]
    email: Option<String>,

    /// Data directory override (takes precedence over env/config)
    #[arg(long = "datadir")]
    datadir: Option<PathBuf>,

    /// Server URL override (takes precedence over env/config)
    #[arg(long = "server")]
    server: Option<String>,

    /// Control plane URL override (takes precedence over env/config)
    #[arg(long = "client-url")]
    client_url: Option<String>,

    /// Control plane token override (takes precedence over env/config)
    #[arg(long = "client-token")]
    client_token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in and register this machine against a relay server
    #[command(alias = "init")]
    Login {
        /// Disable output
        #[arg(short = 'q', long = "quiet", default_value_t = false)]
        quiet: bool,
    },

    /// Run the sync daemon
    Daemon {
        /// Address to bind the local http server
        #[arg(short = 'a', long = "http-addr", default_value = "127.0.0.1:7938")]
        http_addr: String,

        /// Access token for the local http server
        #[arg(short = 't', long = "http-token", default_value = "")]
        http_token: String,

        /// Enable Swagger for the local http server (accepted for parity, currently unused)
        #[arg(
            short = 's',
            long = "http-swagger",
            default_value_t = true,
            default_missing_value = "true",
            num_args = 0..=1,
            value_parser = clap::value_parser!(bool)
        )]
        http_swagger: bool,
    },

    /// Print the resolved config file path
    ConfigPath,

    /// Print version information
    Version,

    /// Continuously poll local control plane /v1/status
    WatchStatus {
        /// Poll interval (e.g. 1s, 250ms)
        #[arg(long = "interval", default_value = "1s")]
        interval: String,

        /// Print raw json without pretty formatting
        #[arg(long = "raw", default_value_t = false)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        email,
        datadir,
        server,
        client_url,
        client_token,
        command,
    } = Cli::parse();
    let resolved_config = Config::resolve_config_path(config.as_deref());

    match command {
        Some(Commands::Login { quiet }) => {
            let requested_server = server
                .clone()
                .unwrap_or_else(|| Config::default_server_url().to_string());
            login::run_login(login::LoginArgs {
                config_path: resolved_config,
                server_url: requested_server,
                data_dir: datadir.unwrap_or_else(Config::default_data_dir),
                email,
                quiet,
            })
            .await
        }
        Some(Commands::ConfigPath) => {
            println!("{}", resolved_config.display());
            Ok(())
        }
        Some(Commands::Version) => {
            println!("{}", detailed_version());
            Ok(())
        }
        Some(Commands::WatchStatus { interval, raw }) => {
            run_watch_status(interval, raw, client_url, client_token, resolved_config).await
        }
        Some(Commands::Daemon {
            http_addr,
            http_token,
            http_swagger: _,
        }) => {
            let overrides = ConfigOverrides {
                email,
                data_dir: datadir,
                server_url: server,
                client_url,
                client_token,
                refresh_token: None,
            };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_daemon_to_completion(cfg, Some(http_addr), non_empty(http_token)).await
        }
        None => {
            // `syftbox` with no subcommand runs the daemon.
            let overrides = ConfigOverrides {
                email,
                data_dir: datadir,
                server_url: server,
                client_url,
                client_token,
                refresh_token: None,
            };
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_daemon_to_completion(cfg, None, None).await
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

async fn run_daemon_to_completion(
    cfg: Config,
    http_addr: Option<String>,
    http_token: Option<String>,
) -> Result<()> {
    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.notify_waiters();
        // Bounded drain: in-flight transfers get a grace period to finish,
        // then the process exits anyway. Uncompleted multipart sessions
        // stay on disk and resume on the next run.
        tokio::time::sleep(std::time::Duration::from_secs(8)).await;
        std::process::exit(0);
    });

    let opts = DaemonOptions {
        http_addr,
        http_token,
        ..DaemonOptions::default()
    };
    match daemon::run_daemon_with_shutdown(cfg, opts, shutdown).await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Losing both the watcher and the relay listing leaves nothing
            // to observe changes with; that gets its own exit code.
            if matches!(errors::classify(&err), Some(SyncErrorKind::Lost(_))) {
                eprintln!("fatal: {err:#}");
                std::process::exit(2);
            }
            Err(err)
        }
    }
}

fn detailed_version() -> String {
    let version = env!("CARGO_PKG_VERSION");
    let revision = option_env!("SYFTBOX_REVISION").unwrap_or("HEAD");
    let build_date = option_env!("SYFTBOX_BUILD_DATE").unwrap_or("");
    format!(
        "{} ({}; rust; {}/{}; {})",
        version,
        revision,
        std::env::consts::OS,
        std::env::consts::ARCH,
        build_date
    )
}

async fn run_watch_status(
    interval: String,
    raw: bool,
    client_url: Option<String>,
    client_token: Option<String>,
    config_path: PathBuf,
) -> Result<()> {
    let overrides = ConfigOverrides {
        email: None,
        data_dir: None,
        server_url: None,
        client_url,
        client_token,
        refresh_token: None,
    };

    let (client_url, client_token) = Config::load_control_plane_settings(&config_path, &overrides)?;
    let client_url = client_url.unwrap_or_default();
    let client_token = client_token.unwrap_or_default();
    if client_url.trim().is_empty() || client_token.trim().is_empty() {
        anyhow::bail!("client control plane not configured; set --client-url/--client-token or SYFTBOX_CLIENT_URL/SYFTBOX_CLIENT_TOKEN");
    }

    let poll_every = parse_duration(&interval)?;
    let status_url = format!("{}/v1/status", client_url.trim_end_matches('/'));
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let mut ticker = tokio::time::interval(poll_every);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {
                let resp = http
                    .get(&status_url)
                    .header("Authorization", format!("Bearer {client_token}"))
                    .send()
                    .await;
                let resp = match resp {
                    Ok(r) => r,
                    Err(e) => {
                        eprintln!("{} ERROR {}", chrono::Utc::now().to_rfc3339(), e);
                        continue;
                    }
                };
                let body = match resp.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        eprintln!("{} ERROR {}", chrono::Utc::now().to_rfc3339(), e);
                        continue;
                    }
                };
                if raw {
                    println!("{}", String::from_utf8_lossy(&body));
                    continue;
                }
                let parsed: serde_json::Value = match serde_json::from_slice(&body) {
                    Ok(v) => v,
                    Err(_) => {
                        println!("{}", String::from_utf8_lossy(&body));
                        continue;
                    }
                };
                println!("{}", serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| String::from_utf8_lossy(&body).to_string()));
            }
        }
    }
}

fn parse_duration(raw: &str) -> Result<std::time::Duration> {
    let s = raw.trim();
    if s.is_empty() {
        anyhow::bail!("invalid duration: empty");
    }
    let (num, unit) = if let Some(v) = s.strip_suffix("ms") {
        (v, "ms")
    } else if let Some(v) = s.strip_suffix('s') {
        (v, "s")
    } else {
        // default seconds if no unit
        (s, "s")
    };
    let value: u64 = num
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration: {raw}"))?;
    Ok(match unit {
        "ms" => std::time::Duration::from_millis(value),
        "s" => std::time::Duration::from_secs(value),
        _ => std::time::Duration::from_secs(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cli_allows_no_subcommand() {
        let cli = Cli::try_parse_from(["syftbox"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn daemon_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "syftbox",
            "-c",
            "config.json",
            "daemon",
            "-a",
            "127.0.0.1:7938",
            "-t",
            "token123",
            "--http-swagger=false",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Daemon {
                http_addr,
                http_token,
                http_swagger,
            }) => {
                assert_eq!(http_addr, "127.0.0.1:7938");
                assert_eq!(http_token, "token123");
                assert!(!http_swagger);
            }
            _ => panic!("expected daemon command"),
        }
    }

    #[test]
    fn watch_status_cli_parses_flags() {
        let cli = Cli::try_parse_from(["syftbox", "watch-status", "--interval", "250ms", "--raw"])
            .unwrap();
        match cli.command {
            Some(Commands::WatchStatus { interval, raw }) => {
                assert_eq!(interval, "250ms");
                assert!(raw);
            }
            _ => panic!("expected watch-status"),
        }
    }

    #[test]
    fn login_cli_supports_init_alias() {
        let cli = Cli::try_parse_from(["syftbox", "init", "--quiet"]).unwrap();
        match cli.command {
            Some(Commands::Login { quiet }) => assert!(quiet),
            _ => panic!("expected login via init alias"),
        }
    }

    #[test]
    fn parse_duration_accepts_ms_and_s() {
        assert_eq!(
            parse_duration("250ms").unwrap(),
            std::time::Duration::from_millis(250)
        );
        assert_eq!(
            parse_duration("2s").unwrap(),
            std::time::Duration::from_secs(2)
        );
        assert_eq!(
            parse_duration("2").unwrap(),
            std::time::Duration::from_secs(2)
        );
        assert!(parse_duration("").is_err());
    }
}
