//! Run one catalog sync and print the run summary as JSON.
//!
//! Usage:
//!   catalog-sync --source registry:https://registry.example.com --out catalog
//!   catalog-sync --source github:acme/servers@main --out catalog \
//!       --header 'Authorization: Bearer ...' --summary-out summary.json

use anyhow::{Context, Result, anyhow};
use catalogsync::{
    SourceRef, SyncConfig, default_schema_path,
    harvest::parse_header,
    observability::{LogFormat, init_logging},
    run_sync, split_list, upstream_for,
};
use clap::Parser;
use std::env;
use std::fs;
use std::path::PathBuf;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Parser, Debug)]
#[command(name = "catalog-sync")]
#[command(about = "Harvest upstream server descriptors into the on-disk catalog")]
struct Cli {
    /// Upstream source: registry:<url> or github:<owner>/<repo>[@ref].
    #[arg(long)]
    source: Option<SourceRef>,
    /// Catalog output root.
    #[arg(long = "out")]
    out: Option<PathBuf>,
    /// JSON config file (defaults to $CATALOG_SYNC_CONFIG when set).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Manifest schema (defaults to $CATALOG_SYNC_SCHEMA, then the bundled schema).
    #[arg(long)]
    schema: Option<PathBuf>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Process at most this many candidates; the rest are carried forward.
    #[arg(long)]
    limit: Option<usize>,
    /// Ignore-segment pattern; repeatable, comma-separated lists accepted.
    /// Replaces the default ignore set.
    #[arg(long = "ignore")]
    ignore: Vec<String>,
    /// Extra request header, 'Name: value'; repeatable.
    #[arg(long = "header")]
    headers: Vec<String>,
    /// Run timestamp (RFC 3339). Defaults to now.
    #[arg(long = "observed-at")]
    observed_at: Option<String>,
    /// Also write the summary JSON to this file.
    #[arg(long = "summary-out")]
    summary_out: Option<PathBuf>,
    /// Commit even when discovery yields no candidates.
    #[arg(long = "allow-empty")]
    allow_empty: bool,
    /// Emit logs as JSON lines on stderr.
    #[arg(long = "log-json")]
    log_json: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    });

    let config = resolve_config(&cli)?;
    let observed_at = match cli.observed_at.as_deref() {
        Some(raw) => OffsetDateTime::parse(raw, &Rfc3339)
            .with_context(|| format!("parsing --observed-at {raw:?}"))?,
        None => OffsetDateTime::now_utc(),
    };
    let headers = cli
        .headers
        .iter()
        .map(|raw| parse_header(raw).map_err(|err| anyhow!(err)))
        .collect::<Result<Vec<_>>>()?;

    let agent = ureq::AgentBuilder::new().build();
    let upstream = upstream_for(&config, agent, headers)?;
    let outcome = run_sync(&config, upstream.as_ref(), observed_at)?;

    let rendered = serde_json::to_string_pretty(&outcome).context("serializing run summary")?;
    if let Some(path) = &cli.summary_out {
        fs::write(path, format!("{rendered}\n"))
            .with_context(|| format!("writing summary {}", path.display()))?;
    }
    println!("{rendered}");
    Ok(())
}

/// Layer flags over the config file, then fill the schema from env or the
/// bundled default.
fn resolve_config(cli: &Cli) -> Result<SyncConfig> {
    let config_path = cli
        .config
        .clone()
        .or_else(|| env::var_os("CATALOG_SYNC_CONFIG").map(PathBuf::from));
    let mut config = match config_path {
        Some(path) => SyncConfig::load(&path)?,
        None => SyncConfig::default(),
    };

    if let Some(source) = &cli.source {
        config.source = Some(source.clone());
    }
    if let Some(out) = &cli.out {
        config.output_root = Some(out.clone());
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if cli.limit.is_some() {
        config.limit = cli.limit;
    }
    if !cli.ignore.is_empty() {
        config.ignore_segments = cli.ignore.iter().flat_map(|raw| split_list(raw)).collect();
    }
    if cli.allow_empty {
        config.allow_empty_harvest = true;
    }

    if let Some(schema) = &cli.schema {
        config.schema_path = Some(schema.clone());
    } else if let Some(schema) = env::var_os("CATALOG_SYNC_SCHEMA") {
        config.schema_path = Some(PathBuf::from(schema));
    } else if config.schema_path.is_none() {
        config.schema_path = Some(default_schema_path().context("locating bundled schema")?);
    }

    config.validate()?;
    Ok(config)
}
