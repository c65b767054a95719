//! Station data files: one `key: value` reading per line.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::warn;

use crate::store::{Payload, ID_FIELD};

/// Read and parse a station data file.
pub fn load(path: &Path) -> Result<Payload> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading station file {}", path.display()))?;

    parse(&text).with_context(|| format!("parsing station file {}", path.display()))
}

/// Parse station readings into a payload of string values.
///
/// Blank lines and lines without a key are skipped. Later duplicates win.
pub fn parse(text: &str) -> Result<Payload> {
    let mut payload = Payload::new();

    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            warn!(line = lineno + 1, "skipping station line without a colon");
            continue;
        };

        let key = key.trim();
        if key.is_empty() {
            warn!(line = lineno + 1, "skipping station line with an empty key");
            continue;
        }

        payload.insert(key.to_string(), Value::String(value.trim().to_string()));
    }

    match payload.get(ID_FIELD) {
        Some(Value::String(id)) if !id.is_empty() => Ok(payload),
        _ => bail!("station data has no {ID_FIELD:?} entry"),
    }
}
