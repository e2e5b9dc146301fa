//! On-disk fragment store.
//!
//! A fragment directory holds one `vertex.json` (an IR node plus its
//! descriptive metadata) and an `index.json` publishing its externally
//! addressable sub-paths. Exec mounts with a non-root destination and an
//! assigned output index get their own sub-fragment, an alias vertex that
//! references the parent node at that output, so other fragments can mount
//! just that output.

use crate::error::{Result, StrataError};
use crate::llb::{FragmentRef, Input, Op, OpKind, OpMetadata, Reference};
use crate::resolve::INDEX_FILE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// File name of the persisted node inside a fragment directory.
pub const VERTEX_FILE: &str = "vertex.json";

/// The file-persisted unit: one op plus its descriptive metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<OpMetadata>,
}

/// Read one vertex document from `path`.
pub fn read_vertex(path: &Path) -> Result<Vertex> {
    let data = std::fs::read(path).map_err(|e| StrataError::from_io(path, e))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Persist `vertex` into the fragment directory `dir`, writing the vertex
/// document, any per-mount sub-fragments, and the fragment's index.
pub fn write_fragment(dir: &Path, vertex: &Vertex) -> Result<()> {
    let vertex_path = dir.join(VERTEX_FILE);
    write_json(&vertex_path, vertex)?;

    let mut index: BTreeMap<String, String> =
        BTreeMap::from([("/".to_string(), vertex_path.to_string_lossy().into_owned())]);

    if let Some(OpKind::Exec(exec)) = &vertex.op.kind {
        for mount in &exec.mounts {
            if mount.dest == "/" || mount.output < 0 {
                continue;
            }

            let subdir = dir.join(mount.output.to_string());
            match std::fs::create_dir(&subdir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(StrataError::Io { path: subdir, source: e }),
            }

            let alias = Vertex {
                op: Op {
                    kind: None,
                    inputs: vec![Input {
                        reference: Reference::Fragment(FragmentRef::new(&vertex_path)),
                        index: mount.output,
                    }],
                },
                meta: None,
            };
            let sub_vertex = subdir.join(VERTEX_FILE);
            write_json(&sub_vertex, &alias)?;
            index.insert(mount.dest.clone(), sub_vertex.to_string_lossy().into_owned());
        }
    }

    write_json(&dir.join(INDEX_FILE), &index)?;
    debug!(dir = %dir.display(), entries = index.len(), "wrote fragment");
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    std::fs::write(path, data).map_err(|e| StrataError::from_io(path, e))
}
