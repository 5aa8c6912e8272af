// Configuration for the gateway
//
// Configuration is loaded in order of precedence:
// 1. Environment variables (highest priority)
// 2. Config file (~/.config/tokengate/config.toml)
// 3. Built-in defaults (lowest priority)
//
// Secrets (the provider API key, the identity API token) are env-only and
// never written back to the config file.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::actor::subscriptions::SourceConfig;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Upstream provider settings
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Base URL of the provider API
    pub api_url: String,

    /// Provider API key attached to every forwarded request
    pub api_key: String,

    /// Value of the anthropic-version header
    pub api_version: String,

    /// Cap on the accounting copy of a response body, in bytes
    pub capture_limit: usize,
}

/// Identity backend settings (subscription lookups)
#[derive(Debug, Clone)]
pub struct IdentitySettings {
    /// GraphQL endpoint of the identity system
    pub url: String,

    /// Service token used to authenticate against the identity system
    pub token: String,

    /// Token prefix the subscriptions source claims
    pub token_prefix: String,
}

/// Actor cache freshness policy, in seconds
#[derive(Debug, Clone)]
pub struct FreshnessSettings {
    /// How long a cached actor stays fresh
    pub default_update_secs: u64,

    /// Debounce for opportunistic post-request refreshes
    pub min_update_secs: u64,

    /// How long a cached negative entry stays fresh
    pub negative_update_secs: u64,
}

impl Default for FreshnessSettings {
    fn default() -> Self {
        Self {
            default_update_secs: 24 * 60 * 60,
            min_update_secs: 10 * 60,
            negative_update_secs: 5 * 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Also write JSON logs to a rolling file
    pub file_enabled: bool,

    /// Directory for log files
    pub file_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false,
            file_dir: PathBuf::from("./logs"),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the gateway server to
    pub bind_addr: SocketAddr,

    /// Upstream provider settings
    pub upstream: UpstreamSettings,

    /// Identity backend settings
    pub identity: IdentitySettings,

    /// Actor cache freshness policy
    pub freshness: FreshnessSettings,

    /// Period of the background cache sync, in seconds
    pub sync_interval_secs: u64,

    /// Budget for one event sink call, in milliseconds
    pub event_timeout_ms: u64,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Freshness policy as loaded from config file
#[derive(Debug, Deserialize, Default)]
struct FileFreshness {
    default_update_secs: Option<u64>,
    min_update_secs: Option<u64>,
    negative_update_secs: Option<u64>,
}

/// Logging settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
struct FileLogging {
    level: Option<String>,
    file_enabled: Option<bool>,
    file_dir: Option<String>,
}

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    bind_addr: Option<String>,
    api_url: Option<String>,
    api_version: Option<String>,
    capture_limit: Option<usize>,
    identity_url: Option<String>,
    token_prefix: Option<String>,
    sync_interval_secs: Option<u64>,
    event_timeout_ms: Option<u64>,

    /// Optional [freshness] section
    freshness: Option<FileFreshness>,

    /// Optional [logging] section
    logging: Option<FileLogging>,
}

impl Config {
    /// Get the config file path: ~/.config/tokengate/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("tokengate").join("config.toml"))
    }

    /// Create config template if it doesn't exist
    /// Called during startup to help users discover configuration options
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        // Don't overwrite existing config
        if path.exists() {
            return;
        }

        // Create parent directory
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Silently fail - config is optional
            }
        }

        let template = r#"# tokengate configuration
# Uncomment and modify options as needed.
# Secrets come from the environment, never this file:
#   ANTHROPIC_API_KEY        provider API key
#   TOKENGATE_IDENTITY_TOKEN identity API service token

# Gateway bind address (default: 127.0.0.1:9992)
# bind_addr = "127.0.0.1:9992"

# Upstream provider API (default: https://api.anthropic.com)
# api_url = "https://api.anthropic.com"
# api_version = "2023-06-01"

# Cap on the accounting copy of a response body, in bytes (default: 2 MiB)
# capture_limit = 2097152

# Identity system GraphQL endpoint
# identity_url = "https://sourcegraph.com/.api/graphql"

# Token prefix the subscriptions source claims (default: "sgs_")
# token_prefix = "sgs_"

# Background cache sync period, in seconds (default: 3600)
# sync_interval_secs = 3600

# Budget for one event sink call, in milliseconds (default: 5000)
# event_timeout_ms = 5000

# Actor cache freshness policy
# [freshness]
# default_update_secs = 86400   # cached actors stay fresh this long
# min_update_secs = 600         # debounce for post-request refreshes
# negative_update_secs = 300    # cached negative entries stay fresh this long

# Logging configuration
# [logging]
# level = "info"        # trace, debug, info, warn, error (RUST_LOG overrides)
# file_enabled = false  # also write JSON logs to a rolling file
# file_dir = "./logs"
"#;

        // Write template (ignore errors - config is optional)
        let _ = std::fs::write(&path, template);
    }

    /// Load file config if it exists
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse {}: {}", path.display(), e);
                FileConfig::default()
            }),
            Err(_) => FileConfig::default(), // File doesn't exist, use defaults
        }
    }

    /// Serialize config to TOML string (single source of truth for format)
    pub fn to_toml(&self) -> String {
        format!(
            r#"# tokengate configuration
# Secrets come from the environment, never this file.

# Gateway bind address
bind_addr = "{bind}"

# Upstream provider API
api_url = "{api_url}"
api_version = "{api_version}"

# Cap on the accounting copy of a response body, in bytes
capture_limit = {capture_limit}

# Identity system GraphQL endpoint
identity_url = "{identity_url}"

# Token prefix the subscriptions source claims
token_prefix = "{token_prefix}"

# Background cache sync period, in seconds
sync_interval_secs = {sync_interval}

# Budget for one event sink call, in milliseconds
event_timeout_ms = {event_timeout}

# Actor cache freshness policy
[freshness]
default_update_secs = {fresh_default}
min_update_secs = {fresh_min}
negative_update_secs = {fresh_negative}

# Logging configuration (RUST_LOG env var overrides)
[logging]
level = "{log_level}"
file_enabled = {log_file}
file_dir = "{log_dir}"
"#,
            bind = self.bind_addr,
            api_url = self.upstream.api_url,
            api_version = self.upstream.api_version,
            capture_limit = self.upstream.capture_limit,
            identity_url = self.identity.url,
            token_prefix = self.identity.token_prefix,
            sync_interval = self.sync_interval_secs,
            event_timeout = self.event_timeout_ms,
            fresh_default = self.freshness.default_update_secs,
            fresh_min = self.freshness.min_update_secs,
            fresh_negative = self.freshness.negative_update_secs,
            log_level = self.logging.level,
            log_file = self.logging.file_enabled,
            log_dir = self.logging.file_dir.display(),
        )
    }

    /// Save current configuration to file
    pub fn save(&self) -> Result<(), std::io::Error> {
        let Some(path) = Self::config_path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config path",
            ));
        };

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&path, self.to_toml())
    }

    /// Load configuration: file -> env vars -> defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();

        // Bind address: env > file > default
        let bind_addr = std::env::var("TOKENGATE_BIND")
            .ok()
            .or(file.bind_addr)
            .unwrap_or_else(|| "127.0.0.1:9992".to_string())
            .parse()
            .expect("Invalid bind address");

        // Upstream API URL: env > file > default
        let api_url = std::env::var("ANTHROPIC_API_URL")
            .ok()
            .or(file.api_url)
            .unwrap_or_else(|| "https://api.anthropic.com".to_string());

        // Provider API key: env only (secret)
        let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();

        let api_version = std::env::var("ANTHROPIC_API_VERSION")
            .ok()
            .or(file.api_version)
            .unwrap_or_else(|| "2023-06-01".to_string());

        // Capture limit: file > default (2 MiB)
        let capture_limit = file.capture_limit.unwrap_or(2 * 1024 * 1024);

        // Identity endpoint: env > file > default
        let identity_url = std::env::var("TOKENGATE_IDENTITY_URL")
            .ok()
            .or(file.identity_url)
            .unwrap_or_else(|| "https://sourcegraph.com/.api/graphql".to_string());

        // Identity token: env only (secret)
        let identity_token = std::env::var("TOKENGATE_IDENTITY_TOKEN").unwrap_or_default();

        let token_prefix = file.token_prefix.unwrap_or_else(|| "sgs_".to_string());

        // Sync period: env > file > default (hourly)
        let sync_interval_secs = std::env::var("TOKENGATE_SYNC_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.sync_interval_secs)
            .unwrap_or(3600);

        let event_timeout_ms = file.event_timeout_ms.unwrap_or(5000);

        // Freshness policy: file config only
        let file_freshness = file.freshness.unwrap_or_default();
        let defaults = FreshnessSettings::default();
        let freshness = FreshnessSettings {
            default_update_secs: file_freshness
                .default_update_secs
                .unwrap_or(defaults.default_update_secs),
            min_update_secs: file_freshness
                .min_update_secs
                .unwrap_or(defaults.min_update_secs),
            negative_update_secs: file_freshness
                .negative_update_secs
                .unwrap_or(defaults.negative_update_secs),
        };

        // Logging settings: file config only (RUST_LOG env var handled in main.rs)
        let file_logging = file.logging.unwrap_or_default();
        let logging = LoggingConfig {
            level: file_logging.level.unwrap_or_else(|| "info".to_string()),
            file_enabled: file_logging.file_enabled.unwrap_or(false),
            file_dir: file_logging
                .file_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./logs")),
        };

        Self {
            bind_addr,
            upstream: UpstreamSettings {
                api_url,
                api_key,
                api_version,
                capture_limit,
            },
            identity: IdentitySettings {
                url: identity_url,
                token: identity_token,
                token_prefix,
            },
            freshness,
            sync_interval_secs,
            event_timeout_ms,
            logging,
        }
    }

    /// Freshness policy in the form the subscriptions source consumes.
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            token_prefix: self.identity.token_prefix.clone(),
            default_update_interval: Duration::from_secs(self.freshness.default_update_secs),
            min_update_interval: Duration::from_secs(self.freshness.min_update_secs),
            negative_update_interval: Duration::from_secs(self.freshness.negative_update_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9992".parse().unwrap(),
            upstream: UpstreamSettings {
                api_url: "https://api.anthropic.com".to_string(),
                api_key: String::new(),
                api_version: "2023-06-01".to_string(),
                capture_limit: 2 * 1024 * 1024,
            },
            identity: IdentitySettings {
                url: "https://sourcegraph.com/.api/graphql".to_string(),
                token: String::new(),
                token_prefix: "sgs_".to_string(),
            },
            freshness: FreshnessSettings::default(),
            sync_interval_secs: 3600,
            event_timeout_ms: 5000,
            logging: LoggingConfig::default(),
        }
    }
}
