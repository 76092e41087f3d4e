//! Server configuration: TOML file + CLI overrides.

use crate::broadcast::HubConfig;
use crate::console::{ConsoleConfig, DialPolicy, ReadinessPolicy, SessionLimits};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use vmgate_core::{GateError, GateResult, VmRecord};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub console: ConsoleSection,
    #[serde(default)]
    pub broadcast: BroadcastSection,
    /// Seed inventory, one `[[vm]]` table per machine.
    #[serde(default)]
    pub vm: Vec<VmRecord>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            cert: String::new(),
            key: String::new(),
            allowed_origins: Vec::new(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub jwt_secret: String,
}

/// `[console]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleSection {
    #[serde(default = "default_console_host")]
    pub host: String,
    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: u32,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_dial_retry_delay_ms")]
    pub dial_retry_delay_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_start_poll_interval_ms")]
    pub start_poll_interval_ms: u64,
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: usize,
    #[serde(default = "default_reconnect_limit")]
    pub reconnect_limit: u32,
    #[serde(default = "default_reconnect_window_secs")]
    pub reconnect_window_secs: u64,
}

impl Default for ConsoleSection {
    fn default() -> Self {
        Self {
            host: default_console_host(),
            dial_attempts: default_dial_attempts(),
            dial_timeout_ms: default_dial_timeout_ms(),
            dial_retry_delay_ms: default_dial_retry_delay_ms(),
            chunk_size: default_chunk_size(),
            start_timeout_ms: default_start_timeout_ms(),
            start_poll_interval_ms: default_start_poll_interval_ms(),
            max_sessions_per_user: default_max_sessions_per_user(),
            reconnect_limit: default_reconnect_limit(),
            reconnect_window_secs: default_reconnect_window_secs(),
        }
    }
}

/// `[broadcast]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastSection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Seconds between full status syncs; 0 disables.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            write_timeout_ms: default_write_timeout_ms(),
            sync_interval_secs: default_sync_interval_secs(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    18443
}
fn default_console_host() -> String {
    "localhost".to_string()
}
fn default_dial_attempts() -> u32 {
    3
}
fn default_dial_timeout_ms() -> u64 {
    3000
}
fn default_dial_retry_delay_ms() -> u64 {
    500
}
fn default_chunk_size() -> usize {
    4096
}
fn default_start_timeout_ms() -> u64 {
    3000
}
fn default_start_poll_interval_ms() -> u64 {
    500
}
fn default_max_sessions_per_user() -> usize {
    2
}
fn default_reconnect_limit() -> u32 {
    3
}
fn default_reconnect_window_secs() -> u64 {
    30
}
fn default_capacity() -> usize {
    256
}
fn default_write_timeout_ms() -> u64 {
    5000
}
fn default_sync_interval_secs() -> u64 {
    30
}

/// Floor for the post-start status poll interval.
const MIN_START_POLL_INTERVAL_MS: u64 = 50;

/// Poll interval and deadline for the post-start readiness check. The
/// interval is floored and the deadline always covers at least one poll.
fn readiness_policy(console: &ConsoleSection) -> ReadinessPolicy {
    let poll_ms = console.start_poll_interval_ms.max(MIN_START_POLL_INTERVAL_MS);
    let timeout_ms = console.start_timeout_ms.max(poll_ms);
    if poll_ms != console.start_poll_interval_ms || timeout_ms != console.start_timeout_ms {
        warn!(
            start_poll_interval_ms = poll_ms,
            start_timeout_ms = timeout_ms,
            "readiness settings raised to their minimums"
        );
    }
    ReadinessPolicy {
        start_timeout: Duration::from_millis(timeout_ms),
        poll_interval: Duration::from_millis(poll_ms),
    }
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// TLS is enabled iff both paths are set.
    pub tls: Option<(PathBuf, PathBuf)>,
    pub allowed_origins: Vec<String>,
    pub jwt_secret: String,
    pub console: ConsoleConfig,
    pub readiness: ReadinessPolicy,
    pub session_limits: SessionLimits,
    pub hub: HubConfig,
    pub sync_interval: Option<Duration>,
    pub vms: Vec<VmRecord>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_bind: Option<&str>,
        cli_cert: Option<&str>,
        cli_key: Option<&str>,
        cli_origins: &[String],
        cli_jwt_secret: Option<&str>,
    ) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::from_file(
            file_config,
            cli_port,
            cli_bind,
            cli_cert,
            cli_key,
            cli_origins,
            cli_jwt_secret,
        )
    }

    /// Merge CLI overrides into a parsed file.
    pub fn from_file(
        file_config: ConfigFile,
        cli_port: Option<u16>,
        cli_bind: Option<&str>,
        cli_cert: Option<&str>,
        cli_key: Option<&str>,
        cli_origins: &[String],
        cli_jwt_secret: Option<&str>,
    ) -> GateResult<Self> {
        let ConfigFile {
            server,
            auth,
            console,
            broadcast,
            vm,
        } = file_config;

        let port = cli_port.unwrap_or(server.port);
        let bind = cli_bind.map(str::to_string).unwrap_or(server.bind);
        let cert = cli_cert.map(str::to_string).unwrap_or(server.cert);
        let key = cli_key.map(str::to_string).unwrap_or(server.key);

        let tls = match (cert.is_empty(), key.is_empty()) {
            (true, true) => None,
            (false, false) => Some((expand_tilde_str(&cert), expand_tilde_str(&key))),
            _ => {
                return Err(GateError::Config(
                    "cert and key must be set together".to_string(),
                ))
            }
        };

        // CLI origins replace the file list rather than extending it.
        let allowed_origins = if cli_origins.is_empty() {
            server.allowed_origins
        } else {
            cli_origins.to_vec()
        };

        let jwt_secret = cli_jwt_secret
            .map(str::to_string)
            .unwrap_or(auth.jwt_secret);
        if jwt_secret.is_empty() {
            return Err(GateError::Config(
                "jwt_secret is required ([auth] jwt_secret or --jwt-secret)".to_string(),
            ));
        }

        let readiness = readiness_policy(&console);

        Ok(Self {
            bind,
            port,
            tls,
            allowed_origins,
            jwt_secret,
            console: ConsoleConfig {
                console_host: console.host,
                dial: DialPolicy {
                    attempts: console.dial_attempts,
                    connect_timeout: Duration::from_millis(console.dial_timeout_ms),
                    retry_delay: Duration::from_millis(console.dial_retry_delay_ms),
                },
                chunk_size: console.chunk_size,
            },
            readiness,
            session_limits: SessionLimits {
                max_sessions_per_user: console.max_sessions_per_user,
                reconnect_limit: console.reconnect_limit,
                reconnect_window: Duration::from_secs(console.reconnect_window_secs),
            },
            hub: HubConfig {
                capacity: broadcast.capacity,
                write_timeout: Duration::from_millis(broadcast.write_timeout_ms),
            },
            sync_interval: (broadcast.sync_interval_secs > 0)
                .then(|| Duration::from_secs(broadcast.sync_interval_secs)),
            vms: vm,
        })
    }
}

pub fn parse(content: &str) -> GateResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GateError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
