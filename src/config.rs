use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Fields a caller may force regardless of file/env contents (CLI flags).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub email: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub server_url: Option<String>,
    pub client_url: Option<String>,
    pub client_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// What actually gets written to `config.json`. `access_token` is
/// deliberately absent: it is re-derived from `refresh_token` each run
/// and never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedConfig {
    #[serde(default)]
    email: String,
    #[serde(default)]
    data_dir: String,
    #[serde(default)]
    server_url: String,
    #[serde(default)]
    client_url: String,
    #[serde(default)]
    client_token: String,
    #[serde(default)]
    refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: Option<PathBuf>,
    pub email: String,
    pub data_dir: PathBuf,
    pub server_url: String,
    pub client_url: Option<String>,
    pub client_token: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub tuning: TuningConfig,
}

/// Transfer/scheduling tuning knobs. Environment variables win over
/// everything else for these; there is no file-persisted equivalent
/// because they are meant for diagnostics/benchmarking, not steady-state
/// identity.
#[derive(Debug, Clone)]
pub struct TuningConfig {
    pub multipart_threshold_bytes: u64,
    pub part_size_bytes: Option<u64>,
    pub part_upload_timeout_ms: u64,
    pub heal_journal_gaps: bool,
    pub priority_debounce_ms: u64,
    pub http_write_timeout_ms: Option<u64>,
    pub tombstone_grace_ms: u64,
    pub upload_session_max_age_secs: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            multipart_threshold_bytes: 32 * 1024 * 1024,
            part_size_bytes: None,
            part_upload_timeout_ms: 60_000,
            heal_journal_gaps: true,
            priority_debounce_ms: 50,
            http_write_timeout_ms: None,
            tombstone_grace_ms: 30_000,
            upload_session_max_age_secs: 7 * 24 * 3600,
        }
    }
}

impl TuningConfig {
    fn from_env() -> Self {
        let mut t = TuningConfig::default();
        if let Some(v) = env_u64("MULTIPART_THRESHOLD_BYTES") {
            t.multipart_threshold_bytes = v;
        }
        if let Some(v) = env_u64("PART_SIZE_BYTES") {
            t.part_size_bytes = Some(v);
        }
        if let Some(v) = env_u64("PART_UPLOAD_TIMEOUT_MS") {
            t.part_upload_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("HEAL_JOURNAL_GAPS") {
            t.heal_journal_gaps = v.trim() != "0";
        }
        if let Some(v) = env_u64("PRIORITY_DEBOUNCE_MS") {
            t.priority_debounce_ms = v;
        }
        if let Some(v) = env_u64("HTTP_WRITE_TIMEOUT_MS") {
            t.http_write_timeout_ms = Some(v);
        }
        if let Some(v) = env_u64("TOMBSTONE_GRACE_MS") {
            t.tombstone_grace_ms = v;
        }
        if let Some(v) = env_u64("UPLOAD_SESSION_MAX_AGE_SECS") {
            t.upload_session_max_age_secs = v;
        }
        t
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse::<u64>().ok()
}

impl Config {
    pub fn default_server_url() -> &'static str {
        "https://relay.example.com"
    }

    pub fn default_client_url() -> &'static str {
        "http://127.0.0.1:7938"
    }

    pub fn default_config_path() -> PathBuf {
        home_dir().join(".syftbox").join("config.json")
    }

    pub fn default_data_dir() -> PathBuf {
        home_dir().join("SyftBox")
    }

    /// flag > env(`SYFTBOX_CONFIG_PATH`) > default.
    pub fn resolve_config_path(flag: Option<&Path>) -> PathBuf {
        if let Some(p) = flag {
            return expand_tilde(p);
        }
        if let Ok(v) = std::env::var("SYFTBOX_CONFIG_PATH") {
            if !v.trim().is_empty() {
                return expand_tilde(Path::new(v.trim()));
            }
        }
        Self::default_config_path()
    }

    pub fn load_file_only(path: &Path) -> Result<Config> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let file: PersistedConfig =
            serde_json::from_str(&data).context("parse config json")?;
        Ok(Config {
            config_path: Some(path.to_path_buf()),
            email: file.email,
            data_dir: if file.data_dir.is_empty() {
                Self::default_data_dir()
            } else {
                absolutize_path(Path::new(&file.data_dir))
            },
            server_url: if file.server_url.is_empty() {
                Self::default_server_url().to_string()
            } else {
                file.server_url
            },
            client_url: non_empty(file.client_url),
            client_token: non_empty(file.client_token),
            refresh_token: non_empty(file.refresh_token),
            access_token: None,
            tuning: TuningConfig::default(),
        })
    }

    /// flag > env > file > default, field by field.
    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Config> {
        let mut cfg = Config::load_file_only(path).unwrap_or(Config {
            config_path: Some(path.to_path_buf()),
            email: String::new(),
            data_dir: Self::default_data_dir(),
            server_url: Self::default_server_url().to_string(),
            client_url: None,
            client_token: None,
            refresh_token: None,
            access_token: None,
            tuning: TuningConfig::default(),
        });

        let env = read_env_config();
        if let Some(v) = env.email {
            cfg.email = v;
        }
        if let Some(v) = env.data_dir {
            cfg.data_dir = absolutize_path(&v);
        }
        if let Some(v) = env.server_url {
            cfg.server_url = v;
        }
        if let Some(v) = env.client_url {
            cfg.client_url = Some(v);
        }
        if let Some(v) = env.client_token {
            cfg.client_token = Some(v);
        }
        if let Some(v) = env.refresh_token {
            cfg.refresh_token = Some(v);
        }
        if let Some(v) = env.access_token {
            cfg.access_token = Some(v);
        }

        if let Some(v) = overrides.email {
            cfg.email = v;
        }
        if let Some(v) = overrides.data_dir {
            cfg.data_dir = absolutize_path(&v);
        }
        if let Some(v) = overrides.server_url {
            cfg.server_url = v;
        }
        if let Some(v) = overrides.client_url {
            cfg.client_url = Some(v);
        }
        if let Some(v) = overrides.client_token {
            cfg.client_token = Some(v);
        }
        if let Some(v) = overrides.refresh_token {
            cfg.refresh_token = Some(v);
        }

        cfg.tuning = TuningConfig::from_env();
        cfg.normalize();
        Ok(cfg)
    }

    /// Resolve just the control-plane endpoint + token a CLI helper (e.g.
    /// `watch-status`) needs to reach an already-running daemon, applying
    /// the same env/file precedence as a full config load.
    pub fn load_control_plane_settings(
        path: &Path,
        overrides: &ConfigOverrides,
    ) -> Result<(Option<String>, Option<String>)> {
        let cfg = Config::load_with_overrides(path, overrides.clone())?;
        Ok((cfg.client_url, cfg.client_token))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_for_save(
        config_path: &Path,
        data_dir: &Path,
        email: &str,
        server_url: &str,
        client_url: Option<String>,
        client_token: Option<String>,
        refresh_token: Option<String>,
    ) -> Result<Config> {
        let mut cfg = Config {
            config_path: Some(config_path.to_path_buf()),
            email: email.to_string(),
            data_dir: absolutize_path(data_dir),
            server_url: server_url.to_string(),
            client_url,
            client_token,
            refresh_token,
            access_token: None,
            tuning: TuningConfig::default(),
        };
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn normalize(&mut self) {
        self.email = self.email.trim().to_lowercase();
        self.data_dir = absolutize_path(&self.data_dir);
    }

    pub fn validate(&self) -> Result<()> {
        validate_email(&self.email)?;
        validate_url(&self.server_url)?;
        if let Some(u) = &self.client_url {
            validate_url(u)?;
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            anyhow::bail!("no config path set");
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let persisted = PersistedConfig {
            email: self.email.clone(),
            data_dir: self.data_dir.display().to_string(),
            server_url: self.server_url.clone(),
            client_url: self.client_url.clone().unwrap_or_default(),
            client_token: self.client_token.clone().unwrap_or_default(),
            refresh_token: self.refresh_token.clone().unwrap_or_default(),
        };
        let data = serde_json::to_vec_pretty(&persisted).context("serialize config")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &data).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    pub fn datasites_root(&self) -> PathBuf {
        self.data_dir.join("datasites")
    }

    pub fn owner_root(&self) -> PathBuf {
        self.datasites_root().join(&self.email)
    }
}

/// Rewrite only the `refresh_token` field of an existing config file,
/// leaving every other field untouched. Used when the relay rotates the
/// refresh token mid-run: the full in-memory `Config` may hold values
/// (actual bound port, generated token) that should not be clobbered by
/// a background auth refresh.
pub fn save_refresh_token_file_only(path: &Path, refresh_token: &str) -> Result<()> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let mut persisted: PersistedConfig =
        serde_json::from_str(&data).context("parse config json")?;
    persisted.refresh_token = refresh_token.to_string();
    let data = serde_json::to_vec_pretty(&persisted).context("serialize config")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &data).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

struct EnvConfig {
    email: Option<String>,
    data_dir: Option<PathBuf>,
    server_url: Option<String>,
    client_url: Option<String>,
    client_token: Option<String>,
    refresh_token: Option<String>,
    access_token: Option<String>,
}

fn read_env_config() -> EnvConfig {
    let get = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
    EnvConfig {
        email: get("SYFTBOX_EMAIL"),
        data_dir: get("SYFTBOX_DATA_DIR").map(PathBuf::from),
        server_url: get("SYFTBOX_SERVER_URL"),
        client_url: get("SYFTBOX_CLIENT_URL"),
        client_token: get("SYFTBOX_CLIENT_TOKEN"),
        refresh_token: get("SYFTBOX_REFRESH_TOKEN"),
        access_token: get("SYFTBOX_ACCESS_TOKEN"),
    }
}

pub fn validate_email(email: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap()
    });
    if email.trim().is_empty() || !PATTERN.is_match(email.trim()) {
        anyhow::bail!("invalid email: {:?}", email);
    }
    Ok(())
}

pub fn validate_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url).with_context(|| format!("invalid url: {url:?}"))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        anyhow::bail!("url must be http(s): {url:?}");
    }
    if parsed.host_str() == Some("openmined.org") {
        anyhow::bail!("legacy server host is no longer supported: {url:?}");
    }
    Ok(())
}

pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        return home_dir().join(rest);
    }
    if s == "~" {
        return home_dir();
    }
    path.to_path_buf()
}

pub fn absolutize_path(path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        clean_lexical(&expanded)
    } else {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        clean_lexical(&cwd.join(expanded))
    }
}

/// Go `filepath.Clean`-equivalent lexical normalization: collapse `.` and
/// resolve `..` components without touching the filesystem.
fn clean_lexical(path: &Path) -> PathBuf {
    let mut out: Vec<std::path::Component> = Vec::new();
    for comp in path.components() {
        match comp {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                pop_normal_component(&mut out);
            }
            other => out.push(other),
        }
    }
    rebuild_components(&out)
}

fn pop_normal_component(out: &mut Vec<std::path::Component>) {
    if matches!(out.last(), Some(std::path::Component::Normal(_))) {
        out.pop();
    } else if !matches!(
        out.last(),
        Some(std::path::Component::RootDir) | Some(std::path::Component::Prefix(_))
    ) {
        out.push(std::path::Component::ParentDir);
    }
}

fn rebuild_components(components: &[std::path::Component]) -> PathBuf {
    let mut p = PathBuf::new();
    for c in components {
        p.push(c.as_os_str());
    }
    if p.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: once_cell::sync::Lazy<Mutex<()>> = once_cell::sync::Lazy::new(|| Mutex::new(()));

    struct EnvGuard {
        keys: Vec<&'static str>,
    }

    impl EnvGuard {
        fn set(pairs: &[(&'static str, &str)]) -> Self {
            let keys: Vec<&'static str> = pairs.iter().map(|(k, _)| *k).collect();
            for (k, v) in pairs {
                std::env::set_var(k, v);
            }
            EnvGuard { keys }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for k in &self.keys {
                std::env::remove_var(k);
            }
        }
    }

    #[test]
    fn validate_email_rejects_garbage() {
        assert!(validate_email("alice@example.com").is_ok());
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("").is_err());
    }

    #[test]
    fn validate_url_rejects_legacy_host() {
        assert!(validate_url("https://relay.example.com").is_ok());
        assert!(validate_url("ftp://relay.example.com").is_err());
        assert!(validate_url("https://openmined.org").is_err());
    }

    #[test]
    fn clean_lexical_collapses_dotdot() {
        let p = clean_lexical(Path::new("/a/b/../c/./d"));
        assert_eq!(p, PathBuf::from("/a/c/d"));
    }

    #[test]
    fn env_overrides_take_precedence_over_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let tmp = std::env::temp_dir().join("datasite-sync-config-test-env");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        std::fs::write(
            &cfg_path,
            r#"{"email":"file@example.com","data_dir":"","server_url":"https://relay.example.com"}"#,
        )
        .unwrap();

        let _guard = EnvGuard::set(&[("SYFTBOX_EMAIL", "env@example.com")]);
        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.email, "env@example.com");
    }

    #[test]
    fn cli_override_takes_precedence_over_env_and_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let tmp = std::env::temp_dir().join("datasite-sync-config-test-cli");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        std::fs::write(
            &cfg_path,
            r#"{"email":"file@example.com","data_dir":"","server_url":"https://relay.example.com"}"#,
        )
        .unwrap();

        let _guard = EnvGuard::set(&[("SYFTBOX_EMAIL", "env@example.com")]);
        let overrides = ConfigOverrides {
            email: Some("cli@example.com".to_string()),
            ..Default::default()
        };
        let cfg = Config::load_with_overrides(&cfg_path, overrides).unwrap();
        assert_eq!(cfg.email, "cli@example.com");
    }

    #[test]
    fn tuning_from_env_overrides_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::set(&[
            ("MULTIPART_THRESHOLD_BYTES", "1048576"),
            ("HEAL_JOURNAL_GAPS", "0"),
        ]);
        let t = TuningConfig::from_env();
        assert_eq!(t.multipart_threshold_bytes, 1_048_576);
        assert!(!t.heal_journal_gaps);
    }

    #[test]
    fn save_round_trips_without_access_token() {
        let tmp = std::env::temp_dir().join("datasite-sync-config-test-save");
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");

        let mut cfg = Config::new_for_save(
            &cfg_path,
            &tmp.join("data"),
            "alice@example.com",
            Config::default_server_url(),
            Some(Config::default_client_url().to_string()),
            None,
            Some("refresh-token-value".to_string()),
        )
        .unwrap();
        cfg.access_token = Some("should-not-persist".to_string());
        cfg.save().unwrap();

        let raw = std::fs::read_to_string(&cfg_path).unwrap();
        assert!(!raw.contains("should-not-persist"));
        assert!(raw.contains("refresh-token-value"));

        let reloaded = Config::load_file_only(&cfg_path).unwrap();
        assert_eq!(reloaded.email, "alice@example.com");
        assert!(reloaded.access_token.is_none());
    }
}
