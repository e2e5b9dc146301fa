//! Image reference resolution and metadata propagation.
//!
//! Collects every container image source in a graph, resolves each distinct
//! reference through the engine concurrently, then walks the graph in digest
//! order folding image metadata into the nodes: source identifiers are pinned
//! to the resolved digest, and exec nodes inherit working directory, user,
//! and environment from the image backing their root mount.

use crate::client::EngineClient;
use crate::error::{Result, StrataError};
use crate::graph::Graph;
use crate::llb::{ContentDigest, OpKind, DOCKER_IMAGE_SCHEME};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

/// OCI image configuration document. Only the fields the frontend folds into
/// the graph are modeled; everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default)]
    pub config: ImageExecConfig,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageExecConfig {
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A resolved image: the canonical reference, its manifest digest, and the
/// parsed config document.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub reference: String,
    pub digest: ContentDigest,
    pub config: ImageConfig,
}

/// Per-node image association produced by [`resolve_images`]. Keys are the
/// node digests the graph held at resolution time.
#[derive(Debug, Default)]
pub struct ImageMap {
    by_node: HashMap<ContentDigest, Arc<Image>>,
    head: Option<Arc<Image>>,
}

impl ImageMap {
    pub fn for_node(&self, digest: &ContentDigest) -> Option<&Image> {
        self.by_node.get(digest).map(Arc::as_ref)
    }

    /// The image that reaches the graph's head node, if any.
    pub fn head(&self) -> Option<&Image> {
        self.head.as_deref()
    }
}

/// Normalize an image reference to its fully qualified form: an explicit
/// registry domain, a `library/` namespace for bare Docker Hub names, and a
/// `latest` tag when neither tag nor digest is present.
pub fn normalize_reference(reference: &str) -> String {
    let (domain, remainder) = match reference.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first, rest.to_string())
        }
        _ => ("docker.io", reference.to_string()),
    };
    let remainder = if domain == "docker.io" && !remainder.contains('/') {
        format!("library/{}", remainder)
    } else {
        remainder
    };

    let pinned = remainder.contains('@')
        || remainder.rsplit('/').next().is_some_and(|last| last.contains(':'));
    if pinned {
        format!("{}/{}", domain, remainder)
    } else {
        format!("{}/{}:latest", domain, remainder)
    }
}

/// Resolve every image source in `graph` and fold the results back in.
///
/// Resolution is one engine request per distinct normalized reference, run
/// concurrently; the first failure aborts the remaining lookups. The folding
/// walk is sequential in digest order so each node sees its dependencies'
/// associations: a node with no image of its own inherits its first input's.
pub async fn resolve_images<C>(client: Arc<C>, graph: &mut Graph) -> Result<ImageMap>
where
    C: EngineClient + 'static,
{
    let mut references = Vec::new();
    for (_, op) in graph.iter() {
        if let Some(OpKind::Source(src)) = &op.kind {
            if let Some(raw) = src.identifier.strip_prefix(DOCKER_IMAGE_SCHEME) {
                let normalized = normalize_reference(raw);
                if !references.contains(&normalized) {
                    references.push(normalized);
                }
            }
        }
    }

    let mut set = JoinSet::new();
    for reference in references {
        let client = Arc::clone(&client);
        set.spawn(async move {
            let resolved = client.resolve_image_config(&reference).await?;
            Ok::<_, StrataError>((reference, resolved))
        });
    }

    let mut resolved: HashMap<String, Arc<Image>> = HashMap::new();
    let mut first_err: Option<StrataError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok((reference, image))) => {
                let config: ImageConfig = serde_json::from_slice(&image.config)?;
                debug!(reference = %reference, digest = %image.digest, "resolved image");
                resolved.insert(
                    reference,
                    Arc::new(Image {
                        reference: image.reference,
                        digest: image.digest,
                        config,
                    }),
                );
            }
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                    set.abort_all();
                }
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(StrataError::Transport {
                        operation: "resolve image config".to_string(),
                        reason: e.to_string(),
                    });
                    set.abort_all();
                }
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }

    let mut map = ImageMap::default();
    for digest in graph.digests().to_vec() {
        let Some(op) = graph.op_mut(&digest) else { continue };

        let image = match &mut op.kind {
            Some(OpKind::Source(src)) => {
                match src.identifier.strip_prefix(DOCKER_IMAGE_SCHEME) {
                    Some(raw) => {
                        let Some(image) = resolved.get(&normalize_reference(raw)) else {
                            continue;
                        };
                        src.identifier = format!(
                            "{}{}@{}",
                            DOCKER_IMAGE_SCHEME, image.reference, image.digest
                        );
                        Some(Arc::clone(image))
                    }
                    None => None,
                }
            }
            Some(OpKind::Exec(exec)) => {
                let root_input = exec
                    .mounts
                    .iter()
                    .find(|m| m.dest == "/")
                    .map(|m| m.input)
                    .filter(|i| *i >= 0);
                let parent = root_input
                    .and_then(|i| op.inputs.get(i as usize))
                    .and_then(|inp| inp.reference.as_digest())
                    .and_then(|d| map.by_node.get(d))
                    .cloned();
                if let Some(image) = &parent {
                    let meta = &mut exec.meta;
                    if meta.cwd.is_empty() {
                        meta.cwd = image.config.config.working_dir.clone();
                    }
                    if meta.user.is_empty() {
                        meta.user = image.config.config.user.clone();
                    }
                    if !image.config.config.env.is_empty() {
                        // Image environment first, so explicit entries win.
                        let mut env = image.config.config.env.clone();
                        env.append(&mut meta.env);
                        meta.env = env;
                    }
                }
                parent
            }
            _ => op
                .inputs
                .first()
                .and_then(|inp| inp.reference.as_digest())
                .and_then(|d| map.by_node.get(d))
                .cloned(),
        };

        if let Some(image) = image {
            map.by_node.insert(digest, image);
        }
    }

    if let Some(last) = graph.digests().last() {
        map.head = map.by_node.get(last).cloned();
    }
    Ok(map)
}
