//! Read-inputs command: inline referenced definition files into one
//! document, keyed by input name.

use super::write_output;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

pub fn read_inputs(infile: &Path, output: Option<&Path>) -> Result<()> {
    let data = std::fs::read(infile)
        .with_context(|| format!("reading input map {}", infile.display()))?;
    let map: BTreeMap<String, String> = serde_json::from_slice(&data)?;

    let mut transformed = BTreeMap::new();
    for (name, path) in map {
        let raw = std::fs::read(&path)
            .with_context(|| format!("reading input {} from {}", name, path))?;
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing input {} from {}", name, path))?;
        transformed.insert(name, value);
    }

    write_output(output, &serde_json::to_string_pretty(&transformed)?)
}
