//! Marshal command: assemble a fragment tree into a wire definition.

use super::write_output;
use anyhow::Result;
use std::path::Path;
use strata_core::fragment::VERTEX_FILE;
use strata_core::{assemble, canonicalize};
use tracing::debug;

pub fn marshal(fragment_dir: &Path, output: Option<&Path>) -> Result<()> {
    let mut graph = assemble(&fragment_dir.join(VERTEX_FILE))?;
    canonicalize(&mut graph);
    let def = graph.to_def()?;
    debug!(nodes = def.def.len(), "marshaled definition");

    write_output(output, &serde_json::to_string_pretty(&def)?)
}
