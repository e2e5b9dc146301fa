//! Digest-keyed operation graph.
//!
//! An ordered collection of IR nodes keyed by content digest. Digest order is
//! the only defined order; the head (last element) is the graph's final
//! result. A node's digest is the hash of its serialized bytes at insertion
//! time, so mutating inputs afterwards requires the re-keying pass in
//! [`Graph::to_def`].

use crate::error::{Result, StrataError};
use crate::llb::{ContentDigest, Definition, Op, OpMetadata, Reference};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Graph {
    order: Vec<ContentDigest>,
    ops: HashMap<ContentDigest, Op>,
    metadata: HashMap<ContentDigest, OpMetadata>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph from a wire definition, keying each node by the
    /// content digest of its serialized bytes.
    pub fn from_definition(def: &Definition) -> Result<Self> {
        let mut graph = Graph::new();
        for bytes in &def.def {
            let digest = ContentDigest::from_bytes(bytes);
            let op: Op = serde_json::from_slice(bytes)?;
            if graph.ops.insert(digest.clone(), op).is_none() {
                graph.order.push(digest.clone());
            }
            if let Some(meta) = def.metadata.get(&digest) {
                graph.metadata.insert(digest, meta.clone());
            }
        }
        Ok(graph)
    }

    /// Insert a node, keyed by the digest of its current bytes. Inserting a
    /// node whose bytes already exist is a no-op returning the same digest.
    pub fn insert(&mut self, op: Op, meta: Option<OpMetadata>) -> Result<ContentDigest> {
        let digest = op.digest()?;
        if self.ops.insert(digest.clone(), op).is_none() {
            self.order.push(digest.clone());
        }
        if let Some(meta) = meta {
            self.metadata.entry(digest.clone()).or_insert(meta);
        }
        Ok(digest)
    }

    /// The last node in digest order: the graph's final result.
    pub fn head(&self) -> Option<(&ContentDigest, &Op)> {
        let digest = self.order.last()?;
        Some((digest, &self.ops[digest]))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Digests in insertion order.
    pub fn digests(&self) -> &[ContentDigest] {
        &self.order
    }

    pub fn op(&self, digest: &ContentDigest) -> Option<&Op> {
        self.ops.get(digest)
    }

    pub fn op_mut(&mut self, digest: &ContentDigest) -> Option<&mut Op> {
        self.ops.get_mut(digest)
    }

    pub fn metadata(&self, digest: &ContentDigest) -> Option<&OpMetadata> {
        self.metadata.get(digest)
    }

    /// Ordered traversal over `(digest, op)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&ContentDigest, &Op)> {
        self.order.iter().map(move |d| (d, &self.ops[d]))
    }

    /// Serialize the graph back into a wire definition, restoring digest
    /// consistency after in-place input rewrites.
    ///
    /// Walks digest order once with a remap table: inputs pointing at a node
    /// whose bytes changed are rewritten to the new digest before this node
    /// is itself re-serialized and re-digested.
    pub fn to_def(&self) -> Result<Definition> {
        let mut def = Definition::default();
        let mut remapped: HashMap<ContentDigest, ContentDigest> = HashMap::new();

        for digest in &self.order {
            let mut op = self.ops[digest].clone();
            for input in &mut op.inputs {
                let current = match &input.reference {
                    Reference::Digest(d) => d,
                    Reference::Fragment(f) => {
                        return Err(StrataError::InvalidOperation {
                            reason: format!("unresolved fragment reference {} in graph", f),
                        })
                    }
                };
                if let Some(new) = remapped.get(current) {
                    input.reference = Reference::Digest(new.clone());
                }
            }

            let bytes = op.marshal()?;
            let new_digest = ContentDigest::from_bytes(&bytes);
            if new_digest != *digest {
                debug!(old = %digest, new = %new_digest, "node re-keyed");
                remapped.insert(digest.clone(), new_digest.clone());
            }
            def.def.push(bytes);
            if let Some(meta) = self.metadata.get(digest) {
                def.metadata.insert(new_digest, meta.clone());
            }
        }
        Ok(def)
    }
}
