//! Graph canonicalization.
//!
//! Two sequential passes over an assembled graph, both rewriting nodes in
//! place and never creating or deleting graph entries:
//!
//! 1. Alias nodes that are referenced as inputs are materialized as identity
//!    merges of their own inputs. An alias is not executable by the engine,
//!    and materializing lazily at first use avoids synthesizing merges for
//!    aliases nobody references.
//! 2. Merges that are pure pass-throughs (a single merge-input at index 0)
//!    are unrolled: consumers are re-pointed at the underlying input, with
//!    path compression across chains of such merges.
//!
//! Inference must run first so unrolling can also simplify the merges it
//! synthesizes. Both passes leave digests stale; `Graph::to_def` restores
//! consistency.

use crate::graph::Graph;
use crate::llb::{ContentDigest, Input, MergeInput, MergeOp, OpKind};
use tracing::debug;

/// Run both normalization passes. Returns the number of nodes materialized
/// plus input references rewritten; a second run on the same graph returns 0.
pub fn canonicalize(graph: &mut Graph) -> usize {
    let inferred = infer_alias_merges(graph);
    let unrolled = unroll_trivial_merges(graph);
    debug!(inferred, unrolled, "canonicalized graph");
    inferred + unrolled
}

/// Materialize referenced alias nodes as identity merges.
///
/// Walked in reverse digest order: a later position's inputs are processed
/// before that position is itself treated as someone's input, so the head
/// node itself never receives a merge.
fn infer_alias_merges(graph: &mut Graph) -> usize {
    let mut inferred = 0;
    let order: Vec<ContentDigest> = graph.digests().to_vec();

    for digest in order.iter().rev() {
        let inputs: Vec<Input> = match graph.op(digest) {
            Some(op) => op.inputs.clone(),
            None => continue,
        };
        for input in inputs {
            let Some(target) = input.reference.as_digest().cloned() else { continue };
            let Some(referenced) = graph.op_mut(&target) else { continue };
            if referenced.kind.is_none() {
                let merge_inputs =
                    (0..referenced.inputs.len()).map(|i| MergeInput { input: i as i64 }).collect();
                referenced.kind = Some(OpKind::Merge(MergeOp { inputs: merge_inputs }));
                inferred += 1;
            }
        }
    }
    inferred
}

/// Re-point inputs past identity merges, compressing chains until the
/// reference lands on a node that is not a trivial merge.
fn unroll_trivial_merges(graph: &mut Graph) -> usize {
    let mut rewrites = 0;
    let order: Vec<ContentDigest> = graph.digests().to_vec();

    for digest in &order {
        let count = graph.op(digest).map(|op| op.inputs.len()).unwrap_or(0);
        for i in 0..count {
            loop {
                let replacement = {
                    let Some(op) = graph.op(digest) else { break };
                    let Some(target_digest) = op.inputs[i].reference.as_digest() else { break };
                    let Some(target) = graph.op(target_digest) else { break };
                    match &target.kind {
                        Some(OpKind::Merge(m)) if m.inputs.len() == 1 && m.inputs[0].input == 0 => {
                            target.inputs[0].clone()
                        }
                        _ => break,
                    }
                };
                if let Some(op) = graph.op_mut(digest) {
                    op.inputs[i] = replacement;
                    rewrites += 1;
                }
            }
        }
    }
    rewrites
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llb::{Op, Reference, SourceOp};
    use std::collections::BTreeMap;

    fn source(identifier: &str) -> Op {
        Op {
            kind: Some(OpKind::Source(SourceOp {
                identifier: identifier.to_string(),
                attrs: BTreeMap::new(),
            })),
            inputs: Vec::new(),
        }
    }

    fn alias_of(digest: &ContentDigest) -> Op {
        Op {
            kind: None,
            inputs: vec![Input { reference: Reference::Digest(digest.clone()), index: 0 }],
        }
    }

    #[test]
    fn test_referenced_alias_becomes_merge_then_unrolls() {
        let mut graph = Graph::new();
        let b = graph.insert(source("docker-image://alpine"), None).unwrap();
        let a = graph.insert(alias_of(&b), None).unwrap();
        let c = graph.insert(alias_of(&a), None).unwrap();

        canonicalize(&mut graph);

        // A was referenced, so it is now an identity merge of B.
        match &graph.op(&a).unwrap().kind {
            Some(OpKind::Merge(m)) => {
                assert_eq!(m.inputs.len(), 1);
                assert_eq!(m.inputs[0].input, 0);
            }
            other => panic!("expected merge, got {:?}", other),
        }

        // C's input was unrolled straight through to B.
        let c_input = &graph.op(&c).unwrap().inputs[0];
        assert_eq!(c_input.reference.as_digest().unwrap(), &b);
    }

    #[test]
    fn test_head_alias_not_materialized() {
        let mut graph = Graph::new();
        let b = graph.insert(source("docker-image://alpine"), None).unwrap();
        let head = graph.insert(alias_of(&b), None).unwrap();

        canonicalize(&mut graph);

        // Nothing references the head, so it stays an alias.
        assert!(graph.op(&head).unwrap().kind.is_none());
    }

    #[test]
    fn test_unroll_is_transitive() {
        let mut graph = Graph::new();
        let base = graph.insert(source("docker-image://alpine"), None).unwrap();
        // Three chained single-input aliases, then a consumer.
        let m1 = graph.insert(alias_of(&base), None).unwrap();
        let m2 = graph.insert(alias_of(&m1), None).unwrap();
        let m3 = graph.insert(alias_of(&m2), None).unwrap();
        let consumer = graph.insert(alias_of(&m3), None).unwrap();

        canonicalize(&mut graph);

        let input = &graph.op(&consumer).unwrap().inputs[0];
        assert_eq!(input.reference.as_digest().unwrap(), &base);
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let mut graph = Graph::new();
        let base = graph.insert(source("docker-image://alpine"), None).unwrap();
        let m1 = graph.insert(alias_of(&base), None).unwrap();
        let _head = graph.insert(alias_of(&m1), None).unwrap();

        let first = canonicalize(&mut graph);
        assert!(first > 0);
        let second = canonicalize(&mut graph);
        assert_eq!(second, 0);
    }

    #[test]
    fn test_multi_input_merge_not_unrolled() {
        let mut graph = Graph::new();
        let a = graph.insert(source("docker-image://alpine"), None).unwrap();
        let b = graph.insert(source("docker-image://busybox"), None).unwrap();
        let merge = graph
            .insert(
                Op {
                    kind: Some(OpKind::Merge(MergeOp {
                        inputs: vec![MergeInput { input: 0 }, MergeInput { input: 1 }],
                    })),
                    inputs: vec![
                        Input { reference: Reference::Digest(a.clone()), index: 0 },
                        Input { reference: Reference::Digest(b.clone()), index: 0 },
                    ],
                },
                None,
            )
            .unwrap();
        let head = graph.insert(alias_of(&merge), None).unwrap();

        canonicalize(&mut graph);

        let input = &graph.op(&head).unwrap().inputs[0];
        assert_eq!(input.reference.as_digest().unwrap(), &merge);
    }
}
