use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vericorp_core::kv::{KvStore, RedbKvStore};
use vericorp_core::rate_limit::{RateLimits, DEFAULT_DAY_LIMIT, DEFAULT_MINUTE_LIMIT};
use vericorp_core::RateLimiter;
use vericorp_mcp::tools::{vericorp_registry, VeriCorpClient};
use vericorp_mcp::McpServer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Sent as X-RapidAPI-Proxy-Secret on every upstream request.
    #[serde(default)]
    pub proxy_secret: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,

    #[serde(default = "default_per_day")]
    pub per_day: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_kv_file")]
    pub kv_file: String,
}

fn default_base_url() -> String {
    "https://vericorp".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_per_minute() -> u32 {
    DEFAULT_MINUTE_LIMIT
}

fn default_per_day() -> u32 {
    DEFAULT_DAY_LIMIT
}

fn default_kv_file() -> String {
    "kv.redb".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            proxy_secret: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_day: default_per_day(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kv_file: default_kv_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                upstream: Default::default(),
                limits: Default::default(),
                storage: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the key-value store path
    pub fn kv_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.kv_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub mcp: Arc<McpServer>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store = Arc::new(
            RedbKvStore::new(config.kv_path()).context("Failed to open key-value store")?,
        );
        Self::with_store(store, config)
    }

    /// Build the state over an explicit counter store.
    pub fn with_store(store: Arc<dyn KvStore>, config: &ServerConfig) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(
            store,
            RateLimits {
                per_minute: config.limits.per_minute,
                per_day: config.limits.per_day,
            },
        ));

        let base_url =
            url::Url::parse(&config.upstream.base_url).context("Invalid upstream base URL")?;

        let client = Arc::new(
            VeriCorpClient::new(
                base_url,
                &config.upstream.proxy_secret,
                Duration::from_secs(config.upstream.timeout_secs),
            )
            .context("Failed to build VeriCorp client")?,
        );

        let mcp = Arc::new(McpServer::new(vericorp_registry(client)));

        Ok(Self { mcp, limiter })
    }
}
