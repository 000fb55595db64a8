// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rmi_cli::commands::{self, SchemaKind};
use rmi_cli::config::resolve_base_url;
use rmi_cli::format::{Formatter, OutputFormat};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "rmi", version, about = "Operator CLI for the RMI execution core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: json | json-pretty | text | table | compact.
    #[arg(long, global = true, default_value = "text")]
    format: String,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the JSON Schema for `envelope` or `config`.
    Schema {
        /// Which schema to print: "envelope" or "config".
        kind: String,
    },

    /// Decode and validate a file as an envelope.
    Validate {
        /// Path to the envelope JSON file.
        file: PathBuf,
    },

    /// Decode a file as an envelope and print a short summary.
    Inspect {
        /// Path to the envelope JSON file.
        file: PathBuf,
    },

    /// Load and validate an agent process config file (or defaults).
    CheckConfig {
        /// Path to a TOML config file. Falls back to built-in defaults
        /// plus environment overrides if omitted.
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Query `GET /healthz` on a running agent process.
    Health {
        /// Base URL of the agent's control surface.
        #[arg(long)]
        url: Option<String>,
    },

    /// Query `GET /readyz` on a running agent process.
    Ready {
        /// Base URL of the agent's control surface.
        #[arg(long)]
        url: Option<String>,
    },

    /// Query `GET /plugins` on a running agent process.
    Plugins {
        /// Base URL of the agent's control surface.
        #[arg(long)]
        url: Option<String>,
    },

    /// Send `POST /cancel/{sn}` to a running agent process.
    Cancel {
        /// Serial number of the request to cancel.
        sn: String,
        /// Base URL of the agent's control surface.
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { EnvFilter::new("rmi=debug") } else { EnvFilter::new("rmi=info") };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let format: OutputFormat = match cli.format.parse() {
        Ok(format) => format,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(EXIT_RUNTIME_ERROR);
        }
    };
    let formatter = Formatter::new(format);
    if let Err(err) = run(cli.command, &formatter).await {
        eprintln!("{}", formatter.format_error(&format!("{err:#}")));
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

async fn run(command: Commands, formatter: &Formatter) -> Result<()> {
    match command {
        Commands::Schema { kind } => {
            let kind: SchemaKind = kind.parse()?;
            println!("{}", commands::schema_json(kind)?);
        }
        Commands::Validate { file } => {
            let envelope = commands::validate_envelope_file(&file)
                .with_context(|| format!("validating {}", file.display()))?;
            println!("{}", formatter.format_envelope(&envelope));
        }
        Commands::Inspect { file } => {
            let summary = commands::inspect_envelope_file(&file)
                .with_context(|| format!("inspecting {}", file.display()))?;
            println!("{}", formatter.format_summary(&summary));
        }
        Commands::CheckConfig { path } => {
            let check = commands::check_config(path.as_deref())?;
            let value = serde_json::json!({
                "messaging_url": check.config.messaging.url,
                "plugins": check.config.plugins.keys().collect::<Vec<_>>(),
                "control_bind_addr": check.config.control.bind_addr,
                "warnings": check.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
            });
            println!("{}", formatter.format_json_value(&value));
        }
        Commands::Health { url } => {
            let base = resolve_base_url(url);
            let body = http_get(&base, "/healthz").await?;
            println!("{}", formatter.format_json_value(&body));
        }
        Commands::Ready { url } => {
            let base = resolve_base_url(url);
            let body = http_get(&base, "/readyz").await?;
            println!("{}", formatter.format_json_value(&body));
        }
        Commands::Plugins { url } => {
            let base = resolve_base_url(url);
            let body = http_get(&base, "/plugins").await?;
            println!("{}", formatter.format_json_value(&body));
        }
        Commands::Cancel { sn, url } => {
            let base = resolve_base_url(url);
            let endpoint = format!("{base}/cancel/{sn}");
            let response = reqwest::Client::new()
                .post(&endpoint)
                .send()
                .await
                .with_context(|| format!("POST {endpoint}"))?;
            let body: serde_json::Value =
                response.json().await.context("decode cancel response")?;
            println!("{}", formatter.format_json_value(&body));
        }
    }
    Ok(())
}

async fn http_get(base: &str, path: &str) -> Result<serde_json::Value> {
    let endpoint = format!("{base}{path}");
    let response =
        reqwest::get(&endpoint).await.with_context(|| format!("GET {endpoint}"))?;
    response.json().await.with_context(|| format!("decode response from {endpoint}"))
}
