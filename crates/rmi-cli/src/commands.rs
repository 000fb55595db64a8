// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared command implementations for the RMI CLI.
//!
//! These functions are library-level so they can be tested without
//! spawning the binary.

use anyhow::{Context, Result};
use rmi_envelope::Envelope;
use schemars::schema_for;
use std::path::Path;

/// Schema types that can be printed by the `schema` subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// JSON schema for the wire [`Envelope`].
    Envelope,
    /// JSON schema for [`rmi_config::Config`].
    Config,
}

impl std::str::FromStr for SchemaKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "envelope" => Ok(Self::Envelope),
            "config" => Ok(Self::Config),
            other => anyhow::bail!("unknown schema kind '{other}'; expected 'envelope' or 'config'"),
        }
    }
}

/// Return the JSON schema string for the given kind.
pub fn schema_json(kind: SchemaKind) -> Result<String> {
    let value = match kind {
        SchemaKind::Envelope => serde_json::to_value(schema_for!(Envelope))?,
        SchemaKind::Config => serde_json::to_value(schema_for!(rmi_config::Config))?,
    };
    serde_json::to_string_pretty(&value).context("serialize schema")
}

/// Read `path` and decode it as an [`Envelope`], surfacing the same
/// diagnostics the daemon's ingress consumer would produce for the
/// identical bytes.
pub fn validate_envelope_file(path: &Path) -> Result<Envelope> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read envelope file '{}'", path.display()))?;
    Envelope::decode(&bytes).map_err(|e| anyhow::anyhow!("{e}"))
}

/// The subset of an envelope's fields worth a human glance, independent
/// of output format.
#[derive(Debug, Clone)]
pub struct EnvelopeSummary {
    /// Serial number.
    pub sn: String,
    /// Contract version the envelope declares.
    pub version: String,
    /// `classname.method`, when the envelope carries a request.
    pub call: Option<String>,
    /// Lifecycle status, as its snake_case wire name.
    pub status: Option<&'static str>,
    /// `"retval"` or `"exval"`, when the envelope carries a result.
    pub result_kind: Option<&'static str>,
    /// Whether a detached signature is attached.
    pub signed: bool,
}

impl From<&Envelope> for EnvelopeSummary {
    fn from(e: &Envelope) -> Self {
        Self {
            sn: e.sn.clone(),
            version: e.version.clone(),
            call: e.request.as_ref().map(|r| format!("{}.{}", r.classname, r.method)),
            status: e.status.map(|s| match s {
                rmi_envelope::Status::Accepted => "accepted",
                rmi_envelope::Status::Rejected => "rejected",
                rmi_envelope::Status::Started => "started",
                rmi_envelope::Status::Progress => "progress",
            }),
            result_kind: e.result.as_ref().map(|r| match r {
                rmi_envelope::ResultBody::Retval(_) => "retval",
                rmi_envelope::ResultBody::Exval(_) => "exval",
            }),
            signed: e.signature.is_some(),
        }
    }
}

/// Decode `path` as an envelope and summarize its lifecycle fields, for
/// `rmi inspect`.
pub fn inspect_envelope_file(path: &Path) -> Result<EnvelopeSummary> {
    let envelope = validate_envelope_file(path)?;
    Ok(EnvelopeSummary::from(&envelope))
}

/// Outcome of `rmi check-config`: the loaded, validated configuration plus
/// any non-fatal warnings.
#[derive(Debug)]
pub struct ConfigCheck {
    /// The loaded, validated configuration.
    pub config: rmi_config::Config,
    /// Non-fatal warnings surfaced alongside a successful load.
    pub warnings: Vec<rmi_config::ConfigWarning>,
}

/// Load and validate the config file at `path` (or built-in defaults plus
/// environment overrides when `path` is `None`), the same way
/// `rmi-agent`'s entry point does at startup.
pub fn check_config(path: Option<&Path>) -> Result<ConfigCheck> {
    let (config, warnings) = rmi_config::load_config(path).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(ConfigCheck { config, warnings })
}
