//! Manifest JSON Schema loading.
//!
//! The schema file may be a bare JSON Schema or a descriptor wrapper holding
//! the schema inline (`schema`) or by reference (`schema_path`, resolved
//! relative to the wrapper). Whatever is loaded must pin
//! `properties.schema_version.const` to the manifest version this crate
//! writes, so a stale schema is caught at load time rather than by failing
//! every manifest.

use crate::catalog::MANIFEST_SCHEMA_VERSION;
use crate::error::{Check, Violation};
use anyhow::{Context, Result, anyhow, bail};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::fs::File;
use std::path::{Path, PathBuf};

const VERSION_POINTER: &str = "/properties/schema_version/const";

pub struct ManifestSchema {
    compiled: JSONSchema,
    source: PathBuf,
}

impl ManifestSchema {
    pub fn load(path: &Path) -> Result<Self> {
        let descriptor_or_schema = read_json(path)
            .with_context(|| format!("loading schema {}", path.display()))?;

        let schema_value = if let Some(schema_path) = descriptor_or_schema
            .get("schema_path")
            .and_then(Value::as_str)
        {
            let resolved = if Path::new(schema_path).is_absolute() {
                PathBuf::from(schema_path)
            } else {
                path.parent()
                    .map(|base| base.join(schema_path))
                    .unwrap_or_else(|| PathBuf::from(schema_path))
            };
            read_json(&resolved).with_context(|| {
                format!(
                    "loading schema {} referenced by {}",
                    resolved.display(),
                    path.display()
                )
            })?
        } else if let Some(inline) = descriptor_or_schema.get("schema") {
            inline.clone()
        } else {
            descriptor_or_schema
        };

        let version = schema_value
            .pointer(VERSION_POINTER)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("schema {} missing schema_version const", path.display()))?;
        if version != MANIFEST_SCHEMA_VERSION {
            bail!(
                "schema {} pins schema_version '{}', expected '{}'",
                path.display(),
                version,
                MANIFEST_SCHEMA_VERSION
            );
        }

        // Compilation errors borrow the schema value; render them here.
        let compiled = JSONSchema::compile(&schema_value)
            .map_err(|err| anyhow!("compiling schema {}: {err}", path.display()))?;

        Ok(Self {
            compiled,
            source: path.to_path_buf(),
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Schema violations for one manifest, localized by JSON pointer.
    pub fn violations(&self, manifest_path: &str, instance: &Value) -> Vec<Violation> {
        match self.compiled.validate(instance) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|err| Violation {
                    check: Check::Schema,
                    path: manifest_path.to_string(),
                    pointer: err.instance_path.to_string(),
                    message: err.to_string(),
                })
                .collect(),
        }
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(file).with_context(|| format!("parsing {}", path.display()))
}
