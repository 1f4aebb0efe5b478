use config::{Config, File};
pub use config::ConfigError;
use serde::Deserialize;

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Settings {
    /// Engine tuning (confirmation window, staleness, guards)
    #[serde(default)]
    pub engine: EngineConfig,
    /// Price feed source
    #[serde(default)]
    pub feed: FeedConfig,
    /// Control/event server
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Seconds a trigger condition must hold before a fill is declared
    #[serde(default = "default_confirm_seconds")]
    pub confirm_seconds: u64,
    /// Live price older than this many seconds falls back to the midpoint
    #[serde(default = "default_price_max_age_secs")]
    pub price_max_age_secs: u64,
    /// Skip ladder levels closer than this fraction of a grid step to the
    /// current price
    #[serde(default = "default_self_fill_guard_ratio")]
    pub self_fill_guard_ratio: f64,
    /// Ledger JSON file; omit for in-memory only
    #[serde(default)]
    pub ledger_file: Option<String>,
    /// Latency of the simulated venue gateway
    #[serde(default = "default_gateway_delay_ms")]
    pub gateway_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confirm_seconds: default_confirm_seconds(),
            price_max_age_secs: default_price_max_age_secs(),
            self_fill_guard_ratio: default_self_fill_guard_ratio(),
            ledger_file: None,
            gateway_delay_ms: default_gateway_delay_ms(),
        }
    }
}

fn default_confirm_seconds() -> u64 {
    crate::engine::DEFAULT_CONFIRM_SECS
}

fn default_price_max_age_secs() -> u64 {
    30
}

fn default_self_fill_guard_ratio() -> f64 {
    0.3
}

fn default_gateway_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize)]
pub struct FeedConfig {
    /// Venue market WebSocket; omit to run without a live feed
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Pair code carried in the venue's price frames
    #[serde(default = "default_pair_code")]
    pub pair_code: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            pair_code: default_pair_code(),
        }
    }
}

fn default_pair_code() -> String {
    "btc".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_server_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            port: default_server_port(),
            host: default_server_host(),
        }
    }
}

fn default_server_enabled() -> bool {
    true
}

fn default_server_port() -> u16 {
    8000
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from a configuration file plus environment overrides
    /// (e.g. `APP_ENGINE__CONFIRM_SECONDS=5`)
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
