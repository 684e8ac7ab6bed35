//! Validate a committed catalog tree and its index.
//!
//! Usage:
//!   catalog-validate --root catalog
//!   catalog-validate --root catalog --schema schema/manifest.schema.json
//!   catalog-validate --root catalog --skip-schema
//!
//! Prints the report as JSON and exits non-zero when any check fails.

use anyhow::{Context, Result, bail};
use catalogsync::{
    ManifestSchema, default_schema_path,
    observability::{LogFormat, init_logging, validate_span},
    validate_catalog,
};
use clap::Parser;
use serde_json::json;
use std::env;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "catalog-validate")]
#[command(about = "Run structure, schema and index checks over a catalog")]
struct Cli {
    /// Catalog root to check.
    #[arg(long)]
    root: PathBuf,
    /// Manifest schema (defaults to $CATALOG_SYNC_SCHEMA, then the bundled schema).
    #[arg(long, conflicts_with = "skip_schema")]
    schema: Option<PathBuf>,
    /// Only run the structure and index checks.
    #[arg(long = "skip-schema")]
    skip_schema: bool,
}

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(2);
        }
    }
}

fn run() -> Result<bool> {
    let cli = Cli::parse();
    init_logging(LogFormat::Text);

    if !cli.root.is_dir() {
        bail!("catalog root {} is not a directory", cli.root.display());
    }
    let schema = if cli.skip_schema {
        None
    } else {
        let path = match cli.schema {
            Some(path) => path,
            None => match env::var_os("CATALOG_SYNC_SCHEMA") {
                Some(path) => PathBuf::from(path),
                None => default_schema_path().context("locating bundled schema")?,
            },
        };
        Some(ManifestSchema::load(&path)?)
    };

    let span = validate_span(&cli.root.display().to_string());
    let _guard = span.enter();
    let report = validate_catalog(&cli.root, schema.as_ref());
    let passed = report.passed();

    let rendered = serde_json::to_string_pretty(&json!({
        "passed": passed,
        "report": report,
    }))
    .context("serializing validation report")?;
    println!("{rendered}");
    Ok(passed)
}
