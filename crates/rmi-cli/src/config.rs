// SPDX-License-Identifier: MIT OR Apache-2.0
//! CLI-local configuration: resolving which daemon control surface to talk
//! to. Layered config for the agent process itself lives in `rmi-config`
//! and is reused as-is via [`crate::commands::check_config`].

/// Default base URL for the daemon's HTTP control surface, matching
/// `rmi_config::ControlConfig`'s default bind address.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8089";

/// Environment variable that overrides [`DEFAULT_BASE_URL`] when no
/// `--url` flag is given.
pub const BASE_URL_ENV_VAR: &str = "RMI_CLI_URL";

/// Resolve the base URL to use for daemon control-surface requests.
///
/// Precedence: an explicit `--url` flag, then `RMI_CLI_URL`, then
/// [`DEFAULT_BASE_URL`].
#[must_use]
pub fn resolve_base_url(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var(BASE_URL_ENV_VAR).ok())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}
