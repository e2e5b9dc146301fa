//! Strata Core Library
//!
//! A build-graph IR engine: declarative operation specs are lowered into a
//! content-addressed low-level operation graph, assembled from on-disk
//! fragments, canonicalized, enriched with resolved image metadata, and
//! handed to a build engine as a wire definition.

pub mod assemble;
pub mod canonicalize;
pub mod client;
pub mod error;
pub mod fragment;
pub mod frontend;
pub mod graph;
pub mod image;
pub mod llb;
pub mod ops;
pub mod opspec;
pub mod resolve;

// Re-export commonly used items
pub use assemble::assemble;
pub use canonicalize::canonicalize;
pub use client::{EngineClient, ResolvedImage, SolveResult};
pub use error::{Result, StrataError};
pub use fragment::{read_vertex, write_fragment, Vertex};
pub use frontend::{Frontend, SolverConfig};
pub use graph::Graph;
pub use image::{resolve_images, Image, ImageConfig, ImageMap};
pub use llb::{ContentDigest, Definition, FragmentRef, Input, Op, OpKind, OpMetadata, Reference};
pub use opspec::OpSpec;
