//! Fragment assembly.
//!
//! Loads a fragment's vertex file and every fragment it transitively
//! references, then converts the file-path references into content digests.
//! Traversal is an iterative depth-first walk producing a post-order, so a
//! node's dependencies always carry a digest before the node itself is
//! converted. Reference cycles between fragments are rejected.
//!
//! The assembled graph ends in a synthetic terminal alias pointing at the
//! requested fragment, which is what makes the head node well-defined after
//! later passes rewrite inputs.

use crate::error::{Result, StrataError};
use crate::fragment::{read_vertex, Vertex};
use crate::graph::Graph;
use crate::llb::{ContentDigest, Input, Op, Reference, SOURCE_METADATA_KEY};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Open,
    Done,
}

enum Frame {
    Enter(PathBuf),
    Exit(PathBuf, Vertex),
}

/// Assemble the fragment rooted at `vertex_path` into a graph.
///
/// Every vertex is keyed by its canonical filesystem path during traversal,
/// so two references to the same file load it once. The returned graph holds
/// only digest references; its head is the terminal alias for `vertex_path`.
pub fn assemble(vertex_path: &Path) -> Result<Graph> {
    let root = canonical(vertex_path)?;

    let mut state: HashMap<PathBuf, Visit> = HashMap::new();
    let mut post_order: Vec<(PathBuf, Vertex)> = Vec::new();
    let mut stack = vec![Frame::Enter(root.clone())];

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(path) => {
                match state.get(&path) {
                    Some(Visit::Done) => continue,
                    Some(Visit::Open) => {
                        return Err(StrataError::CycleDetected {
                            reference: path.to_string_lossy().into_owned(),
                        })
                    }
                    None => {}
                }
                state.insert(path.clone(), Visit::Open);

                let vertex = read_vertex(&path)?;
                let mut children = Vec::new();
                for input in &vertex.op.inputs {
                    if let Some(fragment) = input.reference.as_fragment() {
                        children.push(canonical(fragment.path())?);
                    }
                }
                stack.push(Frame::Exit(path, vertex));
                for child in children.into_iter().rev() {
                    stack.push(Frame::Enter(child));
                }
            }
            Frame::Exit(path, vertex) => {
                state.insert(path.clone(), Visit::Done);
                post_order.push((path, vertex));
            }
        }
    }

    let mut graph = Graph::new();
    let mut outputs: HashMap<PathBuf, ContentDigest> = HashMap::new();

    for (path, vertex) in post_order {
        let mut op = vertex.op;
        for input in &mut op.inputs {
            if let Some(fragment) = input.reference.as_fragment() {
                let child = canonical(fragment.path())?;
                let Some(digest) = outputs.get(&child) else {
                    // Post-order guarantees dependencies were converted
                    // first; a miss means the walk saw a different node than
                    // the conversion does.
                    return Err(StrataError::CycleDetected {
                        reference: child.to_string_lossy().into_owned(),
                    });
                };
                input.reference = Reference::Digest(digest.clone());
            }
        }

        let mut meta = vertex.meta.unwrap_or_default();
        meta.description
            .insert(SOURCE_METADATA_KEY.to_string(), String::from_utf8_lossy(&op.marshal()?).into_owned());

        let digest = graph.insert(op, Some(meta))?;
        debug!(path = %path.display(), digest = %digest, "assembled vertex");
        outputs.insert(path, digest);
    }

    // The terminal alias names the build result. Graph passes rewrite inputs
    // but never remove nodes, so the head stays stable.
    let result = outputs.get(&root).cloned().ok_or_else(|| StrataError::NotFound {
        path: root.clone(),
        reason: "assembled graph has no node for the requested fragment".to_string(),
    })?;
    graph.insert(
        Op { kind: None, inputs: vec![Input { reference: Reference::Digest(result), index: 0 }] },
        None,
    )?;
    Ok(graph)
}

fn canonical(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).map_err(|e| StrataError::from_io(path, e))
}
