//! Configuration system for the `HavenChat` gateway.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/havenchat-gateway/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

/// Errors that can occur when loading gateway configuration.
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

/// Top-level TOML config file structure for the gateway.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct GatewayConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section of the gateway config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    token_ttl_secs: Option<u64>,
    max_history_per_room: Option<usize>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the gateway.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "HavenChat realtime gateway")]
pub struct GatewayCliArgs {
    /// Address to bind the gateway to.
    #[arg(short, long, env = "HAVENCHAT_GATEWAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/havenchat-gateway/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Socket token lifetime in seconds.
    #[arg(long)]
    pub token_ttl_secs: Option<u64>,

    /// Maximum messages retained per room.
    #[arg(long)]
    pub max_history_per_room: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "HAVENCHAT_GATEWAY_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9300`).
    pub bind_addr: String,
    /// Socket token lifetime in seconds.
    pub token_ttl_secs: u64,
    /// Maximum number of messages retained per room.
    pub max_history_per_room: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9300".to_string(),
            token_ttl_secs: 30,
            max_history_per_room: 1000,
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &GatewayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `GatewayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &GatewayCliArgs, file: &GatewayConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            token_ttl_secs: cli
                .token_ttl_secs
                .or(file.server.token_ttl_secs)
                .unwrap_or(defaults.token_ttl_secs),
            max_history_per_room: cli
                .max_history_per_room
                .or(file.server.max_history_per_room)
                .unwrap_or(defaults.max_history_per_room),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the gateway.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<GatewayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(GatewayConfigFile::default());
        };
        config_dir.join("havenchat-gateway").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GatewayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
