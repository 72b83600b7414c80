//! Output extraction from Terraform state documents.
//!
//! A state upload is parsed exactly once. The resulting [`ParsedState`]
//! feeds both the atomic storage write (serial, metadata, output digests)
//! and the schema validation step (output values).

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use stategraph_storage::OutputDigest;

use crate::error::{Error, Result};

/// One output of an uploaded state.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOutput {
    pub value: Value,
    pub sensitive: bool,
    /// Hex SHA-256 of the canonical JSON encoding of `value`.
    pub digest: String,
}

/// The parts of a Terraform state document the engine cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedState {
    pub serial: i64,
    pub lineage: Option<String>,
    pub terraform_version: Option<String>,
    pub outputs: BTreeMap<String, ParsedOutput>,
}

impl ParsedState {
    /// Digest rows in the shape `StateStore::update_content` expects.
    pub fn digests(&self) -> Vec<OutputDigest> {
        self.outputs
            .iter()
            .map(|(key, out)| OutputDigest {
                key: key.clone(),
                digest: out.digest.clone(),
                sensitive: out.sensitive,
            })
            .collect()
    }

    pub fn values(&self) -> BTreeMap<String, Value> {
        self.outputs
            .iter()
            .map(|(k, o)| (k.clone(), o.value.clone()))
            .collect()
    }
}

#[derive(Deserialize)]
struct RawState {
    #[serde(default)]
    serial: i64,
    #[serde(default)]
    lineage: Option<String>,
    #[serde(default)]
    terraform_version: Option<String>,
    #[serde(default)]
    outputs: BTreeMap<String, RawOutput>,
}

#[derive(Deserialize)]
struct RawOutput {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    sensitive: bool,
}

/// Parse raw state bytes. Anything that is not a JSON object with a
/// well-formed `outputs` map is `InvalidContent`.
pub fn parse_state(content: &[u8]) -> Result<ParsedState> {
    if content.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::InvalidContent("state document is empty".into()));
    }
    let raw: RawState =
        serde_json::from_slice(content).map_err(|e| Error::InvalidContent(e.to_string()))?;
    if raw.serial < 0 {
        return Err(Error::InvalidContent(format!(
            "serial must not be negative, got {}",
            raw.serial
        )));
    }
    let outputs = raw
        .outputs
        .into_iter()
        .map(|(key, out)| {
            let digest = digest_value(&out.value);
            (
                key,
                ParsedOutput {
                    value: out.value,
                    sensitive: out.sensitive,
                    digest,
                },
            )
        })
        .collect();
    Ok(ParsedState {
        serial: raw.serial,
        lineage: raw.lineage.filter(|s| !s.is_empty()),
        terraform_version: raw.terraform_version.filter(|s| !s.is_empty()),
        outputs,
    })
}

/// Stable content hash of a JSON value. Object keys are sorted, so two
/// values that differ only in key order hash identically.
pub fn digest_value(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
