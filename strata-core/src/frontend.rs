//! Frontend build orchestration.
//!
//! Drives a full build against the engine: compose a sub-build that runs the
//! expression solver over the caller's build file, read the emitted wire
//! definition back out, canonicalize it, fold in resolved image metadata,
//! and submit the result for solving. External inputs (channels) are
//! resolved by a preliminary sub-build and spliced into the solver's
//! definition as extra mounts.

use crate::canonicalize::canonicalize;
use crate::client::{EngineClient, SolveResult};
use crate::error::{Result, StrataError};
use crate::graph::Graph;
use crate::image::resolve_images;
use crate::llb::{
    Definition, ExecOp, FileAction, FileActionKind, FileActionMkFile, FileOp, Input, Meta, Mount,
    MountType, Op, OpKind, OpMetadata, Reference, SourceOp, CUSTOM_NAME_METADATA_KEY,
    DOCKER_IMAGE_SCHEME, EMPTY_INPUT,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Result metadata key the exporter reads the image config from.
pub const EXPORTER_IMAGE_CONFIG_KEY: &str = "containerimage.config";

/// Build option prefix marking caller-supplied build arguments.
pub const BUILD_ARG_PREFIX: &str = "build-arg:";

const BUILD_FILE: &str = "build.nix";
const CONTEXT_NAME: &str = "context";
const CHANNEL_ROOT: &str = "/nix/var/nix/profiles/per-user/root/channels";

/// Where the solver image comes from. Threaded in explicitly so release
/// builds can pin a repository and version without process-global state.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    pub repository: String,
    pub version: String,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            repository: "docker.io/strata/strata".to_string(),
            version: "latest".to_string(),
        }
    }
}

impl SolverConfig {
    /// The image reference of the solver toolchain variant.
    pub fn image_ref(&self) -> String {
        format!("{}:{}-nix", self.repository, self.version)
    }
}

pub struct Frontend<C> {
    client: Arc<C>,
    config: SolverConfig,
}

impl<C: EngineClient + 'static> Frontend<C> {
    pub fn new(client: Arc<C>, config: SolverConfig) -> Self {
        Self { client, config }
    }

    /// Run the build end to end and return the engine's final result.
    pub async fn build(&self) -> Result<SolveResult> {
        let opts = self.client.build_opts();
        let target = match opts.get("target") {
            Some(t) if !t.is_empty() => t.clone(),
            _ => "default".to_string(),
        };
        let build_args = build_args(&opts);
        info!(target = %target, args = build_args.len(), "starting build");

        let channels = self.resolve_inputs().await?;
        let def = self.solver_definition(&target, &build_args, &channels)?;

        if opts.get("debug").is_some_and(|v| !v.is_empty()) {
            return self.debug_output(&def).await;
        }

        let solved = self.client.solve(&def).await?;
        let reference = solved.reference.ok_or_else(|| StrataError::Transport {
            operation: "solve".to_string(),
            reason: "solver produced no result reference".to_string(),
        })?;
        let data = self.client.read_file(&reference, "build.json").await?;
        let out_def: Definition = serde_json::from_slice(&data)?;

        let mut graph = Graph::from_definition(&out_def)?;
        canonicalize(&mut graph);
        let images = resolve_images(Arc::clone(&self.client), &mut graph).await?;
        let final_def = graph.to_def()?;

        let mut result = self.client.solve(&final_def).await?;
        if let Some(image) = images.head() {
            result.metadata.insert(
                EXPORTER_IMAGE_CONFIG_KEY.to_string(),
                serde_json::to_vec(&image.config)?,
            );
        }
        Ok(result)
    }

    /// Resolve the build file's external inputs through a preliminary
    /// sub-build. Returns one wire definition per input name.
    async fn resolve_inputs(&self) -> Result<BTreeMap<String, Definition>> {
        let invocation = Invocation::new(&self.config.image_ref())?;
        let def = invocation.finish(
            vec![
                "nix-resolve-inputs".to_string(),
                "-f".to_string(),
                format!("/src/{}", BUILD_FILE),
                "-o".to_string(),
                "/result/inputs.json".to_string(),
            ],
            format!("[strata] resolving inputs for {}", BUILD_FILE),
        )?;

        let solved = self.client.solve(&def).await?;
        let reference = solved.reference.ok_or_else(|| StrataError::Transport {
            operation: "solve".to_string(),
            reason: "input resolution produced no result reference".to_string(),
        })?;
        let data = self.client.read_file(&reference, "inputs.json").await?;

        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&data)?;
        let mut inputs = BTreeMap::new();
        for (name, value) in raw {
            let def: Definition = serde_json::from_value(value)?;
            inputs.insert(name, def);
        }
        debug!(inputs = inputs.len(), "resolved external inputs");
        Ok(inputs)
    }

    /// Compose the definition that runs the expression solver.
    fn solver_definition(
        &self,
        target: &str,
        build_args: &BTreeMap<String, String>,
        channels: &BTreeMap<String, Definition>,
    ) -> Result<Definition> {
        let mut invocation = Invocation::new(&self.config.image_ref())?;
        let mut run_args = vec![
            "nix-solve".to_string(),
            "-f".to_string(),
            format!("/src/{}", BUILD_FILE),
            "-t".to_string(),
            target.to_string(),
            "-o".to_string(),
            "/result/build.json".to_string(),
        ];

        if !build_args.is_empty() {
            run_args.push("-a".to_string());
            run_args.push("/inputs/args.json".to_string());

            let data = serde_json::to_vec(build_args)?;
            let args_file = invocation.graph.insert(
                Op {
                    kind: Some(OpKind::File(FileOp {
                        actions: vec![FileAction {
                            input: EMPTY_INPUT,
                            secondary_input: EMPTY_INPUT,
                            output: 0,
                            kind: FileActionKind::Mkfile(FileActionMkFile {
                                path: "/args.json".to_string(),
                                data,
                                mode: 0o444,
                            }),
                        }],
                    })),
                    inputs: Vec::new(),
                },
                None,
            )?;
            let idx = invocation.input(Input {
                reference: Reference::Digest(args_file),
                index: 0,
            });
            invocation.mount("/inputs", idx, true);
        }

        for (name, def) in channels {
            let result = splice_definition(&mut invocation.graph, def)?;
            let idx = invocation.input(result);
            invocation.mount(&format!("{}/{}", CHANNEL_ROOT, name), idx, false);
        }

        invocation.finish(run_args, format!("[strata] resolving {}", BUILD_FILE))
    }

    /// Emit the composed definition itself as a file instead of solving it.
    async fn debug_output(&self, def: &Definition) -> Result<SolveResult> {
        let data = def.to_debug_json()?.into_bytes();
        let mut graph = Graph::new();
        let file = graph.insert(
            Op {
                kind: Some(OpKind::File(FileOp {
                    actions: vec![FileAction {
                        input: EMPTY_INPUT,
                        secondary_input: EMPTY_INPUT,
                        output: 0,
                        kind: FileActionKind::Mkfile(FileActionMkFile {
                            path: "/def.json".to_string(),
                            data,
                            mode: 0o644,
                        }),
                    }],
                })),
                inputs: Vec::new(),
            },
            None,
        )?;
        graph.insert(
            Op {
                kind: None,
                inputs: vec![Input { reference: Reference::Digest(file), index: 0 }],
            },
            None,
        )?;
        self.client.solve(&graph.to_def()?).await
    }
}

/// Builder for the solver sub-build definition: a toolchain image, the local
/// build context, and an exec whose `/result` mount is the build output.
struct Invocation {
    graph: Graph,
    inputs: Vec<Input>,
    mounts: Vec<(String, i64, bool)>,
}

impl Invocation {
    fn new(image_ref: &str) -> Result<Self> {
        let mut invocation = Self { graph: Graph::new(), inputs: Vec::new(), mounts: Vec::new() };

        let image = invocation.graph.insert(
            Op {
                kind: Some(OpKind::Source(SourceOp {
                    identifier: format!("{}{}", DOCKER_IMAGE_SCHEME, image_ref),
                    attrs: BTreeMap::new(),
                })),
                inputs: Vec::new(),
            },
            None,
        )?;
        let idx = invocation
            .input(Input { reference: Reference::Digest(image), index: 0 });
        invocation.mount("/", idx, false);

        // Only the build file is pulled from the local context.
        let context = invocation.graph.insert(
            Op {
                kind: Some(OpKind::Source(SourceOp {
                    identifier: format!("local://{}", CONTEXT_NAME),
                    attrs: BTreeMap::from([(
                        "local.followpaths".to_string(),
                        serde_json::to_string(&[BUILD_FILE])?,
                    )]),
                })),
                inputs: Vec::new(),
            },
            None,
        )?;
        let idx = invocation
            .input(Input { reference: Reference::Digest(context), index: 0 });
        invocation.mount("/src", idx, false);

        Ok(invocation)
    }

    fn input(&mut self, input: Input) -> i64 {
        if let Some(i) = self.inputs.iter().position(|existing| *existing == input) {
            return i as i64;
        }
        self.inputs.push(input);
        self.inputs.len() as i64 - 1
    }

    fn mount(&mut self, dest: &str, input: i64, readonly: bool) {
        self.mounts.push((dest.to_string(), input, readonly));
    }

    fn finish(mut self, run_args: Vec<String>, custom_name: String) -> Result<Definition> {
        self.mount("/result", EMPTY_INPUT, false);
        self.mounts.sort_by(|a, b| a.0.cmp(&b.0));

        let mut num_outputs = 0;
        let mut result_output = 0;
        let mounts = self
            .mounts
            .iter()
            .map(|(dest, input, readonly)| {
                let output = if *readonly {
                    -1
                } else {
                    let assigned = num_outputs;
                    num_outputs += 1;
                    assigned
                };
                if dest == "/result" {
                    result_output = output;
                }
                Mount {
                    dest: dest.clone(),
                    mount_type: MountType::Bind,
                    input: *input,
                    selector: String::new(),
                    output,
                    readonly: *readonly,
                    cache_opt: None,
                    tmpfs_opt: None,
                }
            })
            .collect();

        let exec = self.graph.insert(
            Op {
                kind: Some(OpKind::Exec(ExecOp {
                    meta: Meta { args: run_args, ..Default::default() },
                    mounts,
                })),
                inputs: self.inputs,
            },
            Some(OpMetadata {
                description: BTreeMap::from([(
                    CUSTOM_NAME_METADATA_KEY.to_string(),
                    custom_name,
                )]),
            }),
        )?;
        self.graph.insert(
            Op {
                kind: None,
                inputs: vec![Input {
                    reference: Reference::Digest(exec),
                    index: result_output,
                }],
            },
            None,
        )?;
        self.graph.to_def()
    }
}

/// Insert every node of `def` into `graph` and return the input its terminal
/// node designates as the result.
fn splice_definition(graph: &mut Graph, def: &Definition) -> Result<Input> {
    let sub = Graph::from_definition(def)?;
    let Some((terminal_digest, terminal)) = sub.head() else {
        return Err(StrataError::InvalidOperation {
            reason: "spliced definition is empty".to_string(),
        });
    };

    let result = if terminal.kind.is_none() {
        terminal.inputs.first().cloned().ok_or_else(|| StrataError::InvalidOperation {
            reason: "spliced definition's terminal node has no inputs".to_string(),
        })?
    } else {
        Input { reference: Reference::Digest(terminal_digest.clone()), index: 0 }
    };

    let skip_terminal = terminal.kind.is_none();
    let terminal_digest = terminal_digest.clone();
    for (digest, op) in sub.iter() {
        if skip_terminal && *digest == terminal_digest {
            continue;
        }
        graph.insert(op.clone(), sub.metadata(digest).cloned())?;
    }
    Ok(result)
}

/// Collect caller build arguments, rewriting each key from the option
/// convention (`SOME_NAME`) to the solver's camel-case convention
/// (`someName`).
fn build_args(opts: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut args = BTreeMap::new();
    for (key, value) in opts {
        if let Some(name) = key.strip_prefix(BUILD_ARG_PREFIX) {
            args.insert(to_lower_camel_case(name), value.clone());
        }
    }
    args
}

fn to_lower_camel_case(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut chars = lowered.chars();
    while let Some(c) = chars.next() {
        if c == '_' {
            match chars.next() {
                Some(next) => out.extend(next.to_uppercase()),
                None => out.push('_'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ResolvedImage;
    use crate::llb::{ContentDigest, Reference};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn test_to_lower_camel_case() {
        assert_eq!(to_lower_camel_case("NIX_CHANNEL"), "nixChannel");
        assert_eq!(to_lower_camel_case("name"), "name");
        assert_eq!(to_lower_camel_case("a_b_c"), "aBC");
        assert_eq!(to_lower_camel_case("trailing_"), "trailing_");
        assert_eq!(to_lower_camel_case("a__b"), "a_b");
    }

    #[test]
    fn test_build_args_filters_and_rewrites() {
        let opts = BTreeMap::from([
            ("build-arg:NIX_CHANNEL".to_string(), "nixos-24.05".to_string()),
            ("target".to_string(), "app".to_string()),
        ]);
        let args = build_args(&opts);
        assert_eq!(args, BTreeMap::from([("nixChannel".to_string(), "nixos-24.05".to_string())]));
    }

    #[test]
    fn test_solver_config_image_ref() {
        let config = SolverConfig::default();
        assert_eq!(config.image_ref(), "docker.io/strata/strata:latest-nix");
    }

    struct MockEngine {
        opts: BTreeMap<String, String>,
        build_def: Definition,
        solves: Mutex<Vec<Definition>>,
    }

    impl MockEngine {
        fn new(opts: BTreeMap<String, String>) -> Arc<Self> {
            // The definition the solver sub-build "produces".
            let mut graph = Graph::new();
            let base = graph
                .insert(
                    Op {
                        kind: Some(OpKind::Source(SourceOp {
                            identifier: "docker-image://alpine".to_string(),
                            attrs: BTreeMap::new(),
                        })),
                        inputs: Vec::new(),
                    },
                    None,
                )
                .unwrap();
            graph
                .insert(
                    Op {
                        kind: None,
                        inputs: vec![Input { reference: Reference::Digest(base), index: 0 }],
                    },
                    None,
                )
                .unwrap();
            Arc::new(Self {
                opts,
                build_def: graph.to_def().unwrap(),
                solves: Mutex::new(Vec::new()),
            })
        }

        fn solved(&self) -> Vec<Definition> {
            self.solves.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EngineClient for MockEngine {
        async fn solve(&self, def: &Definition) -> Result<SolveResult> {
            let mut solves = self.solves.lock().unwrap();
            solves.push(def.clone());
            Ok(SolveResult {
                reference: Some(format!("ref-{}", solves.len())),
                metadata: BTreeMap::new(),
            })
        }

        async fn read_file(&self, _reference: &str, path: &str) -> Result<Vec<u8>> {
            match path {
                "inputs.json" => Ok(b"{}".to_vec()),
                "build.json" => Ok(serde_json::to_vec(&self.build_def).unwrap()),
                other => Err(StrataError::Transport {
                    operation: "read file".to_string(),
                    reason: format!("unexpected file {}", other),
                }),
            }
        }

        async fn resolve_image_config(&self, reference: &str) -> Result<ResolvedImage> {
            Ok(ResolvedImage {
                reference: reference.to_string(),
                digest: ContentDigest::from_bytes(reference.as_bytes()),
                config: br#"{"os": "linux"}"#.to_vec(),
            })
        }

        fn build_opts(&self) -> BTreeMap<String, String> {
            self.opts.clone()
        }
    }

    fn exec_of(def: &Definition) -> ExecOp {
        for bytes in &def.def {
            let op: Op = serde_json::from_slice(bytes).unwrap();
            if let Some(OpKind::Exec(exec)) = op.kind {
                return exec;
            }
        }
        panic!("no exec op in definition");
    }

    #[tokio::test]
    async fn test_build_flow() {
        let engine = MockEngine::new(BTreeMap::from([
            ("target".to_string(), "app".to_string()),
            ("build-arg:NIX_CHANNEL".to_string(), "nixos-24.05".to_string()),
        ]));
        let frontend = Frontend::new(Arc::clone(&engine), SolverConfig::default());

        let result = frontend.build().await.unwrap();

        // Input resolution, the solver run, and the final definition.
        let solves = engine.solved();
        assert_eq!(solves.len(), 3);

        let inputs_exec = exec_of(&solves[0]);
        assert_eq!(inputs_exec.meta.args[0], "nix-resolve-inputs");

        let solver_exec = exec_of(&solves[1]);
        assert_eq!(solver_exec.meta.args[0], "nix-solve");
        assert!(solver_exec.meta.args.contains(&"app".to_string()));
        assert!(solver_exec.meta.args.contains(&"/inputs/args.json".to_string()));

        // Build args land in a read-only mount as camel-cased JSON.
        let args_json = solves[1]
            .def
            .iter()
            .filter_map(|b| serde_json::from_slice::<Op>(b).ok())
            .find_map(|op| match op.kind {
                Some(OpKind::File(f)) => Some(f),
                _ => None,
            })
            .expect("args file op");
        let FileActionKind::Mkfile(mkfile) = &args_json.actions[0].kind else { panic!("mkfile") };
        let args: BTreeMap<String, String> = serde_json::from_slice(&mkfile.data).unwrap();
        assert_eq!(args.get("nixChannel").map(String::as_str), Some("nixos-24.05"));

        // The final definition's image sources are pinned.
        let final_def = &solves[2];
        let pinned = final_def
            .def
            .iter()
            .filter_map(|b| serde_json::from_slice::<Op>(b).ok())
            .any(|op| match op.kind {
                Some(OpKind::Source(src)) => src.identifier.contains("@sha256:"),
                _ => false,
            });
        assert!(pinned);

        // The resolved image config rides along for the exporter.
        let config = result.metadata.get(EXPORTER_IMAGE_CONFIG_KEY).expect("image config");
        let parsed: crate::image::ImageConfig = serde_json::from_slice(config).unwrap();
        assert_eq!(parsed.os, "linux");
    }

    #[tokio::test]
    async fn test_debug_mode_emits_definition_file() {
        let engine = MockEngine::new(BTreeMap::from([("debug".to_string(), "1".to_string())]));
        let frontend = Frontend::new(Arc::clone(&engine), SolverConfig::default());

        frontend.build().await.unwrap();

        // One solve for input resolution, one for the debug file. The debug
        // definition writes the composed solver definition as def.json.
        let solves = engine.solved();
        assert_eq!(solves.len(), 2);
        let file = solves[1]
            .def
            .iter()
            .filter_map(|b| serde_json::from_slice::<Op>(b).ok())
            .find_map(|op| match op.kind {
                Some(OpKind::File(f)) => Some(f),
                _ => None,
            })
            .expect("debug file op");
        let FileActionKind::Mkfile(mkfile) = &file.actions[0].kind else { panic!("mkfile") };
        assert_eq!(mkfile.path, "/def.json");
        assert!(String::from_utf8_lossy(&mkfile.data).contains("nix-solve"));
    }

    #[tokio::test]
    async fn test_channel_definitions_spliced_as_mounts() {
        struct ChannelEngine {
            inner: Arc<MockEngine>,
            channel: Definition,
        }

        #[async_trait]
        impl EngineClient for ChannelEngine {
            async fn solve(&self, def: &Definition) -> Result<SolveResult> {
                self.inner.solve(def).await
            }

            async fn read_file(&self, reference: &str, path: &str) -> Result<Vec<u8>> {
                if path == "inputs.json" {
                    let doc = serde_json::json!({
                        "nixpkgs": serde_json::to_value(&self.channel).unwrap(),
                    });
                    return Ok(serde_json::to_vec(&doc).unwrap());
                }
                self.inner.read_file(reference, path).await
            }

            async fn resolve_image_config(&self, reference: &str) -> Result<ResolvedImage> {
                self.inner.resolve_image_config(reference).await
            }

            fn build_opts(&self) -> BTreeMap<String, String> {
                self.inner.build_opts()
            }
        }

        let mut graph = Graph::new();
        let src = graph
            .insert(
                Op {
                    kind: Some(OpKind::Source(SourceOp {
                        identifier: "https://channels.example/nixpkgs.tar.xz".to_string(),
                        attrs: BTreeMap::new(),
                    })),
                    inputs: Vec::new(),
                },
                None,
            )
            .unwrap();
        graph
            .insert(
                Op {
                    kind: None,
                    inputs: vec![Input { reference: Reference::Digest(src), index: 0 }],
                },
                None,
            )
            .unwrap();

        let inner = MockEngine::new(BTreeMap::new());
        let engine = Arc::new(ChannelEngine {
            inner: Arc::clone(&inner),
            channel: graph.to_def().unwrap(),
        });
        let frontend = Frontend::new(engine, SolverConfig::default());

        frontend.build().await.unwrap();

        let solves = inner.solved();
        let solver_exec = exec_of(&solves[1]);
        let channel_mount = solver_exec
            .mounts
            .iter()
            .find(|m| m.dest.ends_with("/channels/nixpkgs"))
            .expect("channel mount");
        assert!(channel_mount.input >= 0);

        // The channel's source node rides along in the solver definition.
        let spliced = solves[1]
            .def
            .iter()
            .filter_map(|b| serde_json::from_slice::<Op>(b).ok())
            .any(|op| match op.kind {
                Some(OpKind::Source(src)) => src.identifier.starts_with("https://"),
                _ => false,
            });
        assert!(spliced);
    }
}
