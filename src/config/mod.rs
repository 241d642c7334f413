// Configuration module for the chat gateway

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_DIR_NAME: &str = "chat-gateway";
pub const CONFIG_PATH_ENV: &str = "CHAT_GATEWAY_CONFIG";
pub const ENV_FILE_ENV: &str = "CHAT_GATEWAY_ENV_FILE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub proxy_url: String,

    /// Explicit location of the credential file
    #[serde(default)]
    pub env_file: Option<PathBuf>,

    #[serde(default)]
    pub time_tool: TimeToolConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            body_limit_mb: default_body_limit_mb(),
            request_timeout_secs: default_request_timeout_secs(),
            proxy_url: String::new(),
            env_file: None,
            time_tool: TimeToolConfig::default(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_max_connections() -> usize {
    10
}

fn default_body_limit_mb() -> usize {
    50
}

fn default_request_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_jitter_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TimeToolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Provider ids allowed to receive the time tool; empty keeps the built-in list
    #[serde(default)]
    pub providers: Vec<String>,
}

impl Default for TimeToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            providers: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Where the YAML config lives: `$CHAT_GATEWAY_CONFIG`, else the OS config dir.
pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return expand_home(path.trim());
        }
    }
    user_config_dir().join("config.yaml")
}

pub fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Load the config file, creating it with defaults when it does not exist yet.
pub fn load_config(path: &Path) -> Result<GatewayConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        tracing::info!("Config loaded from {:?}", path);
        return Ok(config);
    }

    let config = GatewayConfig::default();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_yaml::to_string(&config)?)?;
    tracing::info!("Default config written to {:?}", path);
    Ok(config)
}

/// Like `load_config`, but never fails: a broken file falls back to defaults.
pub fn load_or_default(path: &Path) -> GatewayConfig {
    match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config from {:?}, using defaults: {}", path, e);
            GatewayConfig::default()
        }
    }
}

/// Pick the credential file: explicit override, then `./.env` when writable,
/// then the per-user config directory (the install dir may be read-only).
pub fn resolve_env_file(config: &GatewayConfig) -> PathBuf {
    let local = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".env");
    pick_env_file(
        std::env::var(ENV_FILE_ENV).ok(),
        config.env_file.clone(),
        local,
        user_config_dir().join(".env"),
    )
}

fn pick_env_file(
    env_override: Option<String>,
    configured: Option<PathBuf>,
    local: PathBuf,
    fallback: PathBuf,
) -> PathBuf {
    let explicit = env_override
        .filter(|p| !p.trim().is_empty())
        .map(|p| expand_home(p.trim()))
        .or(configured);
    if let Some(path) = explicit {
        return path;
    }

    if is_writable(&local) {
        return local;
    }

    tracing::info!(
        "{:?} is not writable, storing credentials in {:?}",
        local,
        fallback
    );
    fallback
}

/// True when the file can be opened for appending, or created in its directory.
pub fn is_writable(path: &Path) -> bool {
    if path.exists() {
        return std::fs::OpenOptions::new().append(true).open(path).is_ok();
    }
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let probe = dir.join(format!(".{}-write-probe", APP_DIR_NAME));
    match std::fs::File::create(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: GatewayConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.port, 3001);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert!(config.time_tool.enabled);
    }

    #[test]
    fn test_kebab_case_keys() {
        let yaml = "max-connections: 4\ncache:\n  ttl-secs: 5\nretry:\n  max-jitter-ms: 0\n";
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.cache.ttl_secs, 5);
        assert_eq!(config.cache.max_entries, 100);
        assert_eq!(config.retry.max_jitter_ms, 0);
    }

    #[test]
    fn test_load_config_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let config = load_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.port, default_port());
    }

    #[test]
    fn test_broken_config_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "port: [not a number").unwrap();
        let config = load_or_default(&path);
        assert_eq!(config.port, default_port());
    }

    #[test]
    fn test_explicit_env_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join(".env");
        let fallback = dir.path().join("user").join(".env");
        let configured = Some(PathBuf::from("/tmp/custom.env"));

        let picked = pick_env_file(
            Some("/tmp/from-env.env".into()),
            configured.clone(),
            local.clone(),
            fallback.clone(),
        );
        assert_eq!(picked, PathBuf::from("/tmp/from-env.env"));

        let picked = pick_env_file(Some("  ".into()), configured, local, fallback);
        assert_eq!(picked, PathBuf::from("/tmp/custom.env"));
    }

    #[test]
    fn test_writable_local_env_file_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join(".env");
        let fallback = dir.path().join("user").join(".env");
        assert_eq!(pick_env_file(None, None, local.clone(), fallback), local);
    }

    #[test]
    fn test_unwritable_local_falls_back_to_user_dir() {
        let dir = tempfile::tempdir().unwrap();
        // Parent directory does not exist, so nothing can be created there
        let local = dir.path().join("missing").join("deeper").join(".env");
        let fallback = dir.path().join("user").join(".env");
        assert!(!is_writable(&local));
        assert_eq!(pick_env_file(None, None, local, fallback.clone()), fallback);
    }

    #[test]
    fn test_is_writable_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(is_writable(&dir.path().join(".env")));
    }
}
