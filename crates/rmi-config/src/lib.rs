// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed, layered configuration for the RMI execution core.
//!
//! Precedence, lowest to highest: built-in [`Config::default`] values, a
//! TOML config file, `RMI_`-prefixed environment variables, then explicit
//! overrides passed to the daemon entry point (used by tests). Everything
//! is parsed and validated exactly once at [`load_config`] time into a
//! single typed [`Config`]; no other component re-parses raw config
//! values itself.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Upper bound on a worker pool's `capacity`, chosen to catch config typos
/// (an extra zero) rather than to reflect a real resource limit.
pub const MAX_POOL_CAPACITY: u32 = 10_000;

/// Pool capacities at or above this are flagged as a [`ConfigWarning`]
/// rather than rejected outright.
pub const LARGE_POOL_CAPACITY_THRESHOLD: u32 = 1_000;

/// Errors that prevent a [`Config`] from being produced at all.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configured file path does not exist.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// The path that was looked up.
        path: String,
    },
    /// The file's contents are not valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// The underlying parser message.
        reason: String,
    },
    /// One or more fields failed validation.
    #[error("config validation failed: {}", .reasons.join("; "))]
    ValidationError {
        /// One message per failed validation rule.
        reasons: Vec<String>,
    },
    /// Merging a base config with an overlay produced a contradiction.
    #[error("config merge conflict: {reason}")]
    MergeConflict {
        /// What conflicted.
        reason: String,
    },
}

/// Non-fatal observations surfaced alongside a successfully loaded config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A field carries a non-default but discouraged value.
    LargePoolCapacity {
        /// The plugin the warning applies to.
        plugin: String,
        /// The configured capacity.
        capacity: u32,
    },
    /// An optional field was left unset and a reasonable default was used.
    MissingOptionalField {
        /// The field name.
        field: String,
        /// A hint about what was assumed.
        hint: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LargePoolCapacity { plugin, capacity } => {
                write!(f, "plugin '{plugin}' has a large pool capacity ({capacity}); confirm this is intentional")
            }
            Self::MissingOptionalField { field, hint } => {
                write!(f, "'{field}' is unset; {hint}")
            }
        }
    }
}

/// Per-plugin messaging and worker-pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PluginConfig {
    /// The durable queue name this plugin receives requests on.
    pub queue: String,
    /// The exchange the queue is bound to.
    pub exchange: String,
    /// The routing key used in that binding.
    pub routing_key: String,
    /// Worker pool settings for this plugin.
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Worker-pool sizing for one plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PoolConfig {
    /// Number of worker tasks running concurrently for this plugin.
    pub capacity: u32,
    /// Per-worker backlog depth before [`rmi_pool`]-style scheduling blocks.
    pub backlog: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { capacity: 4, backlog: 16 }
    }
}

/// Messaging-layer settings shared by every plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MessagingConfig {
    /// Broker connection URL, passed to the configured broker connector.
    pub url: String,
    /// Name of the authenticator to construct, or `None` to accept every
    /// envelope unconditionally.
    #[serde(default)]
    pub authenticator: Option<String>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self { url: "local://default".to_string(), authenticator: None }
    }
}

/// Pending-store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PendingConfig {
    /// Directory backing the durable pending-request FIFO.
    pub dir: String,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self { dir: "/var/run/rmi-agent/pending".to_string() }
    }
}

/// Single-instance lock settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InstanceLockConfig {
    /// Path to the lock file enforcing single-instance.
    pub path: String,
}

impl Default for InstanceLockConfig {
    fn default() -> Self {
        Self { path: "/var/run/rmi-agent/rmi-agent.lock".to_string() }
    }
}

/// HTTP control-surface settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ControlConfig {
    /// Socket address the control surface binds to.
    pub bind_addr: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:8089".to_string() }
    }
}

/// The fully validated, typed configuration for one agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Broker connection and authenticator settings.
    #[serde(default)]
    pub messaging: MessagingConfig,
    /// One entry per registered plugin, keyed by plugin name.
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
    /// Pending-store directory.
    #[serde(default)]
    pub pending: PendingConfig,
    /// Single-instance lock file.
    #[serde(default)]
    pub instance_lock: InstanceLockConfig,
    /// HTTP control-surface bind address.
    #[serde(default)]
    pub control: ControlConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            messaging: MessagingConfig::default(),
            plugins: BTreeMap::new(),
            pending: PendingConfig::default(),
            instance_lock: InstanceLockConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

/// Load a [`Config`] from `path` (falling back to defaults when `path` is
/// `None`), then apply `RMI_`-prefixed environment variable overrides.
/// Returns the config alongside any non-fatal [`ConfigWarning`]s.
pub fn load_config(path: Option<&Path>) -> Result<(Config, Vec<ConfigWarning>), ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|_| ConfigError::FileNotFound { path: path.display().to_string() })?;
            parse_toml(&content)?
        }
        None => Config::default(),
    };

    apply_env_overrides(&mut config);
    let warnings = validate_config(&config)?;
    Ok((config, warnings))
}

/// Parse TOML `content` into a [`Config`], without touching the filesystem
/// or the environment.
pub fn parse_toml(content: &str) -> Result<Config, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError { reason: e.to_string() })
}

/// Apply `RMI_`-prefixed environment variable overrides in place.
///
/// Recognised variables: `RMI_MESSAGING_URL`, `RMI_MESSAGING_AUTHENTICATOR`,
/// `RMI_PENDING_DIR`, `RMI_INSTANCE_LOCK_PATH`, `RMI_CONTROL_BIND_ADDR`.
/// Per-plugin settings are file/override-only — there is no stable way to
/// name a dynamic map key through an environment variable.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(url) = std::env::var("RMI_MESSAGING_URL") {
        config.messaging.url = url;
    }
    if let Ok(authenticator) = std::env::var("RMI_MESSAGING_AUTHENTICATOR") {
        config.messaging.authenticator = Some(authenticator);
    }
    if let Ok(dir) = std::env::var("RMI_PENDING_DIR") {
        config.pending.dir = dir;
    }
    if let Ok(path) = std::env::var("RMI_INSTANCE_LOCK_PATH") {
        config.instance_lock.path = path;
    }
    if let Ok(bind_addr) = std::env::var("RMI_CONTROL_BIND_ADDR") {
        config.control.bind_addr = bind_addr;
    }
}

/// Validate `config`, returning hard errors as a single
/// [`ConfigError::ValidationError`] or, on success, a list of advisory
/// [`ConfigWarning`]s.
pub fn validate_config(config: &Config) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut reasons = Vec::new();
    let mut warnings = Vec::new();

    if config.messaging.url.trim().is_empty() {
        reasons.push("messaging.url must not be empty".to_string());
    }

    if config.plugins.is_empty() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "plugins".to_string(),
            hint: "no plugins registered; the agent will accept no requests".to_string(),
        });
    }

    for (name, plugin) in &config.plugins {
        if name.trim().is_empty() {
            reasons.push("a plugin name must not be empty".to_string());
        }
        if plugin.queue.trim().is_empty() {
            reasons.push(format!("plugin '{name}': queue must not be empty"));
        }
        if plugin.exchange.trim().is_empty() {
            reasons.push(format!("plugin '{name}': exchange must not be empty"));
        }
        if plugin.routing_key.trim().is_empty() {
            reasons.push(format!("plugin '{name}': routing_key must not be empty"));
        }
        if plugin.pool.capacity == 0 {
            reasons.push(format!("plugin '{name}': pool.capacity must be at least 1"));
        } else if plugin.pool.capacity > MAX_POOL_CAPACITY {
            reasons.push(format!(
                "plugin '{name}': pool.capacity {} exceeds the maximum of {MAX_POOL_CAPACITY}",
                plugin.pool.capacity
            ));
        } else if plugin.pool.capacity >= LARGE_POOL_CAPACITY_THRESHOLD {
            warnings.push(ConfigWarning::LargePoolCapacity { plugin: name.clone(), capacity: plugin.pool.capacity });
        }
        if plugin.pool.backlog == 0 {
            reasons.push(format!("plugin '{name}': pool.backlog must be at least 1"));
        }
    }

    if config.pending.dir.trim().is_empty() {
        reasons.push("pending.dir must not be empty".to_string());
    }
    if config.instance_lock.path.trim().is_empty() {
        reasons.push("instance_lock.path must not be empty".to_string());
    }
    if config.control.bind_addr.parse::<std::net::SocketAddr>().is_err() {
        reasons.push(format!("control.bind_addr '{}' is not a valid socket address", config.control.bind_addr));
    }

    if reasons.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons })
    }
}

/// Merge `overlay` onto `base`: every field set in `overlay` wins, plugin
/// maps are merged key-by-key with `overlay` entries taking precedence on
/// collision.
#[must_use]
pub fn merge_configs(base: Config, overlay: Config) -> Config {
    let mut plugins = base.plugins;
    plugins.extend(overlay.plugins);
    Config {
        messaging: MessagingConfig {
            url: if overlay.messaging.url.is_empty() { base.messaging.url } else { overlay.messaging.url },
            authenticator: overlay.messaging.authenticator.or(base.messaging.authenticator),
        },
        plugins,
        pending: if overlay.pending.dir.is_empty() { base.pending } else { overlay.pending },
        instance_lock: if overlay.instance_lock.path.is_empty() { base.instance_lock } else { overlay.instance_lock },
        control: if overlay.control.bind_addr.is_empty() { base.control } else { overlay.control },
    }
}
