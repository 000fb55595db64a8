// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output formatting utilities for the RMI CLI.

use crate::commands::EnvelopeSummary;
use rmi_envelope::Envelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported output formats for CLI display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Compact JSON (single line).
    Json,
    /// Pretty-printed JSON.
    JsonPretty,
    /// Human-readable multi-line text.
    Text,
    /// Key-value aligned table.
    Table,
    /// Single-line summary.
    Compact,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Json => "json",
            Self::JsonPretty => "json-pretty",
            Self::Text => "text",
            Self::Table => "table",
            Self::Compact => "compact",
        };
        f.write_str(s)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "json-pretty" | "json_pretty" | "jsonpretty" => Ok(Self::JsonPretty),
            "text" => Ok(Self::Text),
            "table" => Ok(Self::Table),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Formats RMI types for CLI output.
#[derive(Debug, Clone)]
pub struct Formatter {
    format: OutputFormat,
}

impl Formatter {
    /// Create a new formatter with the given output format.
    #[must_use]
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Format a full [`Envelope`] according to the configured output format.
    #[must_use]
    pub fn format_envelope(&self, envelope: &Envelope) -> String {
        match &self.format {
            OutputFormat::Json => serde_json::to_string(envelope).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(envelope).unwrap_or_default(),
            OutputFormat::Text => format_envelope_text(envelope),
            OutputFormat::Table => format_envelope_table(envelope),
            OutputFormat::Compact => format_envelope_compact(envelope),
        }
    }

    /// Format an [`EnvelopeSummary`] (the output of `rmi inspect`) according
    /// to the configured output format.
    #[must_use]
    pub fn format_summary(&self, summary: &EnvelopeSummary) -> String {
        match &self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => {
                serde_json::json!({
                    "sn": summary.sn,
                    "version": summary.version,
                    "call": summary.call,
                    "status": summary.status,
                    "result_kind": summary.result_kind,
                    "signed": summary.signed,
                })
                .to_string()
            }
            OutputFormat::Text => format_summary_text(summary),
            OutputFormat::Table => format_summary_table(summary),
            OutputFormat::Compact => format_summary_compact(summary),
        }
    }

    /// Format an arbitrary JSON value returned by the daemon's HTTP control
    /// surface (health/ready/plugins/cancel responses).
    #[must_use]
    pub fn format_json_value(&self, value: &serde_json::Value) -> String {
        match &self.format {
            OutputFormat::Json => value.to_string(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(value).unwrap_or_default(),
            OutputFormat::Text | OutputFormat::Table => format_value_table(value),
            OutputFormat::Compact => format_value_compact(value),
        }
    }

    /// Format an error message according to the configured output format.
    #[must_use]
    pub fn format_error(&self, err: &str) -> String {
        match &self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => {
                serde_json::json!({"error": err}).to_string()
            }
            OutputFormat::Text => format!("Error: {err}"),
            OutputFormat::Table => format!("error  {err}"),
            OutputFormat::Compact => format!("[error] {err}"),
        }
    }
}

// ── helpers ───────────────────────────────────────────────────────────

fn status_str(status: Option<&'static str>) -> &'static str {
    status.unwrap_or("-")
}

fn call_str(call: &Option<String>) -> &str {
    call.as_deref().unwrap_or("-")
}

// ── Envelope formatters ──────────────────────────────────────────────

fn format_envelope_text(e: &Envelope) -> String {
    let summary = EnvelopeSummary::from(e);
    format_summary_text(&summary)
}

fn format_envelope_table(e: &Envelope) -> String {
    let summary = EnvelopeSummary::from(e);
    format_summary_table(&summary)
}

fn format_envelope_compact(e: &Envelope) -> String {
    let summary = EnvelopeSummary::from(e);
    format_summary_compact(&summary)
}

// ── EnvelopeSummary formatters ───────────────────────────────────────

fn format_summary_text(s: &EnvelopeSummary) -> String {
    format!(
        "sn: {}\nversion: {}\ncall: {}\nstatus: {}\nsigned: {}",
        s.sn,
        s.version,
        call_str(&s.call),
        status_str(s.status),
        s.signed,
    )
}

fn format_summary_table(s: &EnvelopeSummary) -> String {
    let mut lines = Vec::new();
    lines.push(format!("{:<10} {}", "sn", s.sn));
    lines.push(format!("{:<10} {}", "version", s.version));
    lines.push(format!("{:<10} {}", "call", call_str(&s.call)));
    lines.push(format!("{:<10} {}", "status", status_str(s.status)));
    lines.push(format!("{:<10} {}", "signed", s.signed));
    if let Some(kind) = s.result_kind {
        lines.push(format!("{:<10} {kind}", "result"));
    }
    lines.join("\n")
}

fn format_summary_compact(s: &EnvelopeSummary) -> String {
    format!(
        "[{}] {} status={} signed={}",
        &s.sn[..s.sn.len().min(8)],
        call_str(&s.call),
        status_str(s.status),
        s.signed,
    )
}

// ── generic JSON value formatters, for HTTP control-surface responses ──

fn format_value_table(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{k:<14} {}", compact_scalar(v)))
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Array(items) => items
            .iter()
            .map(format_value_table)
            .collect::<Vec<_>>()
            .join("\n---\n"),
        other => compact_scalar(other),
    }
}

fn format_value_compact(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Object(map) => {
            let parts: Vec<String> = map.iter().map(|(k, v)| format!("{k}={}", compact_scalar(v))).collect();
            format!("[{}]", parts.join(" "))
        }
        serde_json::Value::Array(items) => {
            items.iter().map(format_value_compact).collect::<Vec<_>>().join(" ")
        }
        other => compact_scalar(other),
    }
}

fn compact_scalar(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
