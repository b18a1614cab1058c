//! Configuration for the `HavenChat` client console.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/havenchat/config.toml`)
//! 4. Compiled defaults
//!
//! A missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use havenchat_proto::auth::UserIdentity;
use havenchat_proto::room::{Namespace, Role, UserId};

use crate::client::ClientOptions;
use crate::connection::ReconnectPolicy;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    api: ApiFileConfig,
    identity: IdentityFileConfig,
    reconnect: ReconnectFileConfig,
    console: ConsoleFileConfig,
}

/// `[api]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ApiFileConfig {
    base_url: Option<String>,
    gateway_url: Option<String>,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    user_id: Option<String>,
    display_name: Option<String>,
    role: Option<Role>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    max_attempts: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

/// `[console]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConsoleFileConfig {
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Api --
    /// Platform REST base URL (token endpoint lives under it).
    pub api_url: String,
    /// Gateway WebSocket base URL (namespace paths are appended).
    pub gateway_url: String,

    // -- Identity --
    /// Platform user id sent on token requests.
    pub user_id: Option<String>,
    /// Display name sent on token requests.
    pub display_name: Option<String>,
    /// Platform role sent on token requests.
    pub role: Role,

    // -- Reconnect --
    /// Retry budget and backoff schedule for dropped connections.
    pub reconnect: ReconnectPolicy,

    // -- Console --
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:9300".to_string(),
            gateway_url: "ws://127.0.0.1:9300".to_string(),
            user_id: None,
            display_name: None,
            role: Role::Student,
            reconnect: ReconnectPolicy::default(),
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/havenchat/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. This is separated from `load()` to
    /// enable unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            api_url: cli
                .api_url
                .clone()
                .or_else(|| file.api.base_url.clone())
                .unwrap_or(defaults.api_url),
            gateway_url: cli
                .gateway_url
                .clone()
                .or_else(|| file.api.gateway_url.clone())
                .unwrap_or(defaults.gateway_url),
            user_id: cli
                .user_id
                .clone()
                .or_else(|| file.identity.user_id.clone()),
            display_name: cli
                .display_name
                .clone()
                .or_else(|| file.identity.display_name.clone()),
            role: cli.role.or(file.identity.role).unwrap_or(defaults.role),
            reconnect: ReconnectPolicy {
                max_attempts: file
                    .reconnect
                    .max_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
                initial_delay: file
                    .reconnect
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: file
                    .reconnect
                    .max_delay_ms
                    .map_or(defaults.reconnect.max_delay, Duration::from_millis),
            },
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.console.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Build [`ClientOptions`] from this configuration.
    #[must_use]
    pub fn to_client_options(&self) -> ClientOptions {
        ClientOptions {
            gateway_url: self.gateway_url.clone(),
            reconnect: self.reconnect,
        }
    }

    /// Build the [`UserIdentity`] for token requests, if both identity
    /// fields are present and non-empty.
    #[must_use]
    pub fn identity(&self) -> Option<UserIdentity> {
        let user_id = self.user_id.clone()?;
        let display_name = self.display_name.clone()?;
        if user_id.is_empty() || display_name.is_empty() {
            return None;
        }

        Some(UserIdentity {
            user_id: UserId::from(user_id),
            display_name,
            role: self.role,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Peer-support chat console")]
pub struct CliArgs {
    /// Platform REST base URL (token endpoint).
    #[arg(long, env = "HAVENCHAT_API_URL")]
    pub api_url: Option<String>,

    /// Gateway WebSocket base URL.
    #[arg(long, env = "HAVENCHAT_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// Your platform user id.
    #[arg(long, env = "HAVENCHAT_USER_ID")]
    pub user_id: Option<String>,

    /// Your display name.
    #[arg(long, env = "HAVENCHAT_DISPLAY_NAME")]
    pub display_name: Option<String>,

    /// Your platform role (student, counsellor, volunteer, admin).
    #[arg(long, env = "HAVENCHAT_ROLE")]
    pub role: Option<Role>,

    /// Namespace to connect to (peer or private-chat).
    #[arg(long, default_value = "peer")]
    pub namespace: Namespace,

    /// Topic room to join on the peer namespace.
    #[arg(long, default_value = "general")]
    pub topic: String,

    /// Peer user id to chat with on the private-chat namespace.
    #[arg(long)]
    pub recipient: Option<String>,

    /// The recipient's role.
    #[arg(long)]
    pub recipient_role: Option<Role>,

    /// Path to config file (default: `~/.config/havenchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "HAVENCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/havenchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            // No config dir available: use defaults.
            return Ok(ConfigFile::default());
        };
        config_dir.join("havenchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
