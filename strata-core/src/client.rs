//! Build engine client interface.
//!
//! The frontend talks to the engine through this trait: it submits solve
//! requests, reads files out of solved results, and asks the engine to
//! resolve image references. Implementations wrap whatever transport the
//! engine speaks; tests substitute an in-memory mock.

use crate::error::Result;
use crate::llb::{ContentDigest, Definition};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Outcome of a solve request.
#[derive(Debug, Clone, Default)]
pub struct SolveResult {
    /// Handle to the solved filesystem, when the engine produced one.
    pub reference: Option<String>,
    /// Engine-provided metadata attached to the result.
    pub metadata: BTreeMap<String, Vec<u8>>,
}

/// Image metadata returned by the engine's registry lookup.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// The canonical reference the engine settled on.
    pub reference: String,
    /// Manifest digest of the resolved image.
    pub digest: ContentDigest,
    /// Raw image config document.
    pub config: Vec<u8>,
}

#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Submit a definition for solving.
    async fn solve(&self, def: &Definition) -> Result<SolveResult>;

    /// Read a file out of a solved result.
    async fn read_file(&self, reference: &str, path: &str) -> Result<Vec<u8>>;

    /// Resolve an image reference to its canonical form, digest, and config.
    async fn resolve_image_config(&self, reference: &str) -> Result<ResolvedImage>;

    /// Options the caller passed to the build, keyed by option name.
    fn build_opts(&self) -> BTreeMap<String, String>;
}
