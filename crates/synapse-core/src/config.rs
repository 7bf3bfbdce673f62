use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Protocol constants shared across the gateway.
pub const DEFAULT_TTL_MS: i64 = 30 * 60 * 1000; // 30 minutes sliding window
pub const CLEANUP_INTERVAL_SECS: u64 = 60; // sweeper cadence
pub const MODEL_LOAD_TIMEOUT_SECS: u64 = 300; // fatal if exceeded
pub const DEFAULT_MODEL_NAME: &str = "litertlm-model"; // envelope fallback
pub const PENDING_APPROVAL: &str = "PENDING_USER_APPROVAL"; // request_token sentinel
pub const DEFAULT_PORT: u16 = 18990;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Compute backend for the native engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Cpu,
    Gpu,
    Npu,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Cpu => f.write_str("cpu"),
            Backend::Gpu => f.write_str("gpu"),
            Backend::Npu => f.write_str("npu"),
        }
    }
}

/// Top-level config (synapse.toml + SYNAPSE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynapseConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub conversations: ConversationsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub host: HostConfig,
}

impl Default for SynapseConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            storage: StorageConfig::default(),
            conversations: ConversationsConfig::default(),
            http: HttpConfig::default(),
            host: HostConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path of the model blob staged on local storage.
    #[serde(default)]
    pub path: String,
    /// Primary compute backend. GPU falls back to CPU once on init failure.
    #[serde(default = "default_backend")]
    pub backend: Backend,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            backend: default_backend(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for all persisted state (conversations, token store).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationsConfig {
    /// Applied when a client passes `ttl_ms <= 0`.
    #[serde(default = "default_ttl")]
    pub default_ttl_ms: i64,
    /// Seconds between sweeper passes over expired conversations.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

/// Optional OpenAI-compatible HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Caller identity of the host UI. Only this caller may revoke tokens
    /// or act on pending approval requests.
    #[serde(default = "default_host_caller")]
    pub caller_id: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            caller_id: default_host_caller(),
        }
    }
}

fn default_backend() -> Backend {
    Backend::Cpu
}
fn default_ttl() -> i64 {
    DEFAULT_TTL_MS
}
fn default_cleanup_interval() -> u64 {
    CLEANUP_INTERVAL_SECS
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_host_caller() -> String {
    "synapse-host".to_string()
}
fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.synapse", home)
}

impl SynapseConfig {
    /// Load config from a TOML file with SYNAPSE_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: SynapseConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SYNAPSE_").split("_"))
            .extract()
            .map_err(|e| crate::error::GatewayError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.synapse/synapse.toml", home)
}
