//! Mkop command: lower one operation spec into a fragment directory.

use anyhow::{Context, Result};
use std::path::Path;
use strata_core::llb::OpMetadata;
use strata_core::{ops, write_fragment, OpSpec, Vertex};
use tracing::debug;

pub fn mkop(spec_path: &Path, outdir: Option<&Path>) -> Result<()> {
    let spec = OpSpec::read(spec_path)
        .with_context(|| format!("reading operation spec {}", spec_path.display()))?;
    let op = ops::convert(&spec)?;

    let meta = spec
        .meta
        .as_ref()
        .map(|m| OpMetadata { description: m.description.clone() });
    let vertex = Vertex { op, meta };

    let dir = match outdir {
        Some(dir) => {
            // The directory must not already exist; a fragment is written
            // exactly once.
            std::fs::create_dir(dir)
                .with_context(|| format!("creating fragment directory {}", dir.display()))?;
            dir
        }
        None => Path::new("."),
    };
    write_fragment(dir, &vertex)?;
    debug!(spec = %spec_path.display(), dir = %dir.display(), "wrote fragment");
    Ok(())
}
