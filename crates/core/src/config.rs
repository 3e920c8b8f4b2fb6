use crate::secrets::Secret;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v18.0";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub messenger: MessengerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub runtime: Option<RuntimeConfig>,
    #[serde(default)]
    pub dedupe: DedupeConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct MessengerConfig {
    /// Page access token attached to every send call.
    pub page_access_token: Option<Secret>,
    /// Token the platform echoes during the subscription handshake.
    pub verify_token: Option<Secret>,
    /// App secret used to check `X-Hub-Signature-256`.
    pub app_secret: Option<Secret>,
    pub api_base: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Operational tuning. Every field is optional; the binary clamps and
/// fills in defaults.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct RuntimeConfig {
    pub send_max_inflight: Option<usize>,
    pub send_timeout_secs: Option<u64>,
    pub send_max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub retry_jitter_ms: Option<u64>,
    pub dedupe_retention_secs: Option<i64>,
    pub dedupe_max_entries: Option<usize>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DedupeBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DedupeConfig {
    #[serde(default)]
    pub backend: DedupeBackend,
    /// e.g. `sqlite:///var/lib/pagebridge/deliveries.db?mode=rwc`
    pub database_url: Option<String>,
}

impl AppConfig {
    /// Load configuration from an optional JSON file and the environment.
    ///
    /// Precedence, highest first: `PAGEBRIDGE__SECTION__KEY` variables, the
    /// config file, then the bare `VERIFY_TOKEN` / `PAGE_ACCESS_TOKEN` /
    /// `APP_SECRET` variables.
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let (config_path, required) = match custom_path {
            Some(path) => (path, true),
            None => (Self::default_path(), false),
        };

        let mut builder = Config::builder();
        for (key, var) in [
            ("messenger.verify_token", "VERIFY_TOKEN"),
            ("messenger.page_access_token", "PAGE_ACCESS_TOKEN"),
            ("messenger.app_secret", "APP_SECRET"),
        ] {
            if let Ok(value) = std::env::var(var) {
                builder = builder.set_default(key, value)?;
            }
        }

        let s = builder
            .add_source(File::from(config_path).required(required))
            .add_source(
                // Values stay strings so a token like "007123" keeps its zeros;
                // numeric fields are parsed when deserialized.
                Environment::with_prefix("PAGEBRIDGE").separator("__"),
            )
            .build()?;

        s.try_deserialize()
    }

    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".pagebridge/config.json")
    }

    pub fn api_base(&self) -> &str {
        self.messenger
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
    }

    /// Names of required credentials that are missing or blank.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let blank = |s: &Option<Secret>| s.as_ref().map(|v| v.is_empty()).unwrap_or(true);
        if blank(&self.messenger.page_access_token) {
            missing.push("messenger.page_access_token");
        }
        if blank(&self.messenger.verify_token) {
            missing.push("messenger.verify_token");
        }
        if blank(&self.messenger.app_secret) {
            missing.push("messenger.app_secret");
        }
        missing
    }
}
