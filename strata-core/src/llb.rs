//! Wire IR data model.
//!
//! The low-level operation graph consumed by the build engine: tagged op
//! variants, input references, and the serialized `Definition` hand-off
//! format. Serialization is a protobuf-compatible JSON mapping: byte fields
//! are base64, enum values are SCREAMING_CASE, and the op variant is a single
//! keyed sub-object.
//!
//! Node bytes feed content digests, so every type here must serialize
//! deterministically: struct fields in declaration order, maps as `BTreeMap`.

use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Input index value for a mount backed by fresh scratch space.
pub const EMPTY_INPUT: i64 = -1;

/// Metadata key under which the assembler stashes each node's resolved
/// operation JSON for debugging and traceability.
pub const SOURCE_METADATA_KEY: &str = "llb.source";

/// Metadata key for a human-readable display name of a node.
pub const CUSTOM_NAME_METADATA_KEY: &str = "llb.customname";

/// Identifier scheme prefix for container image sources.
pub const DOCKER_IMAGE_SCHEME: &str = "docker-image://";

/// Content hash of a node's serialized bytes, used as its graph key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Digest prefix marking an already-finalized reference.
    pub const PREFIX: &'static str = "sha256:";

    /// Compute the SHA-256 content digest of `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(format!("{}{:x}", Self::PREFIX, Sha256::digest(data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Filesystem path of a not-yet-finalized fragment (its `vertex.json`).
///
/// Kept distinct from [`ContentDigest`]: a fragment reference only becomes a
/// digest through the assembler's explicit resolution step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentRef(PathBuf);

impl FragmentRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for FragmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A reference to another node: a fragment path before assembly, a content
/// digest after. The wire encoding is a single string; digests carry the
/// `sha256:` prefix, fragment paths never do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Fragment(FragmentRef),
    Digest(ContentDigest),
}

impl Reference {
    pub fn as_digest(&self) -> Option<&ContentDigest> {
        match self {
            Reference::Digest(d) => Some(d),
            Reference::Fragment(_) => None,
        }
    }

    pub fn as_fragment(&self) -> Option<&FragmentRef> {
        match self {
            Reference::Fragment(f) => Some(f),
            Reference::Digest(_) => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Fragment(r) => r.fmt(f),
            Reference::Digest(d) => d.fmt(f),
        }
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Reference::Fragment(r) => serializer.serialize_str(&r.0.to_string_lossy()),
            Reference::Digest(d) => serializer.serialize_str(d.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.starts_with(ContentDigest::PREFIX) {
            Ok(Reference::Digest(ContentDigest(s)))
        } else {
            Ok(Reference::Fragment(FragmentRef(PathBuf::from(s))))
        }
    }
}

/// A node's reference to one output of another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    #[serde(rename = "digest")]
    pub reference: Reference,
    #[serde(default)]
    pub index: i64,
}

/// One unit of the operation graph: a tagged variant or an alias (no
/// variant), plus an ordered list of input references.
///
/// The empty state is first-class: an alias node stands only for its inputs
/// and every consumer must handle it explicitly.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Op {
    pub kind: Option<OpKind>,
    pub inputs: Vec<Input>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Source(SourceOp),
    Exec(ExecOp),
    File(FileOp),
    Merge(MergeOp),
}

impl Op {
    /// Canonical serialized bytes of this node. These bytes define the
    /// node's content digest.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Content digest of the node's current bytes.
    pub fn digest(&self) -> Result<ContentDigest> {
        Ok(ContentDigest::from_bytes(&self.marshal()?))
    }
}

// The wire shape flattens the variant into the op object itself
// (`{"source": {...}, "inputs": [...]}`), so (de)serialization goes through
// a shadow struct with one optional field per variant.
#[derive(Serialize, Deserialize, Default)]
struct RawOp {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<SourceOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exec: Option<ExecOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<FileOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    merge: Option<MergeOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    inputs: Vec<Input>,
}

impl Serialize for Op {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut raw = RawOp { inputs: self.inputs.clone(), ..Default::default() };
        match self.kind.clone() {
            Some(OpKind::Source(op)) => raw.source = Some(op),
            Some(OpKind::Exec(op)) => raw.exec = Some(op),
            Some(OpKind::File(op)) => raw.file = Some(op),
            Some(OpKind::Merge(op)) => raw.merge = Some(op),
            None => {}
        }
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Op {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawOp::deserialize(deserializer)?;
        let set = [raw.source.is_some(), raw.exec.is_some(), raw.file.is_some(), raw.merge.is_some()]
            .iter()
            .filter(|b| **b)
            .count();
        if set > 1 {
            return Err(serde::de::Error::custom("more than one operation variant set"));
        }
        let kind = if let Some(op) = raw.source {
            Some(OpKind::Source(op))
        } else if let Some(op) = raw.exec {
            Some(OpKind::Exec(op))
        } else if let Some(op) = raw.file {
            Some(OpKind::File(op))
        } else {
            raw.merge.map(OpKind::Merge)
        };
        Ok(Op { kind, inputs: raw.inputs })
    }
}

/// An external source reference plus scheme-qualified attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceOp {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

/// A process invocation with its execution-environment mounts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecOp {
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
}

/// Binding of an input (or fresh scratch space) to a path inside an exec
/// operation's environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub dest: String,
    pub mount_type: MountType,
    pub input: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,
    pub output: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub readonly: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_opt: Option<CacheOpt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpfs_opt: Option<TmpfsOpt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MountType {
    Bind,
    Tmpfs,
    Cache,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheOpt {}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TmpfsOpt {}

/// A linear chain of filesystem edit actions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileOp {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<FileAction>,
}

/// One filesystem edit. `input` and `secondary_input` index into the node's
/// inputs; values at or beyond the input count refer to outputs of earlier
/// actions in the chain. -1 means unset.
#[derive(Debug, Clone, PartialEq)]
pub struct FileAction {
    pub input: i64,
    pub secondary_input: i64,
    pub output: i64,
    pub kind: FileActionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileActionKind {
    Copy(FileActionCopy),
    Mkfile(FileActionMkFile),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFileAction {
    input: i64,
    secondary_input: i64,
    output: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    copy: Option<FileActionCopy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mkfile: Option<FileActionMkFile>,
}

impl Serialize for FileAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut raw = RawFileAction {
            input: self.input,
            secondary_input: self.secondary_input,
            output: self.output,
            copy: None,
            mkfile: None,
        };
        match self.kind.clone() {
            FileActionKind::Copy(c) => raw.copy = Some(c),
            FileActionKind::Mkfile(m) => raw.mkfile = Some(m),
        }
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawFileAction::deserialize(deserializer)?;
        let kind = match (raw.copy, raw.mkfile) {
            (Some(c), None) => FileActionKind::Copy(c),
            (None, Some(m)) => FileActionKind::Mkfile(m),
            (None, None) => return Err(serde::de::Error::custom("file action without a variant")),
            (Some(_), Some(_)) => {
                return Err(serde::de::Error::custom("more than one file action variant set"))
            }
        };
        Ok(FileAction {
            input: raw.input,
            secondary_input: raw.secondary_input,
            output: raw.output,
            kind,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileActionCopy {
    pub src: String,
    pub dest: String,
    pub mode: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileActionMkFile {
    pub path: String,
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    pub mode: u32,
}

/// Layered filesystem union of its inputs, lowest first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergeOp {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<MergeInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeInput {
    pub input: i64,
}

/// Descriptive metadata carried alongside a node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OpMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub description: BTreeMap<String, String>,
}

/// The wire hand-off format: serialized op byte-strings in dependency order
/// plus a digest-keyed metadata map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Definition {
    #[serde(with = "base64_def", default, skip_serializing_if = "Vec::is_empty")]
    pub def: Vec<Vec<u8>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<ContentDigest, OpMetadata>,
}

impl Definition {
    /// Re-expand each serialized op into its structured JSON form, pretty
    /// printed, for inspection.
    pub fn to_debug_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct DebugDefinition<'a> {
            def: Vec<serde_json::Value>,
            metadata: &'a BTreeMap<ContentDigest, OpMetadata>,
        }

        let mut def = Vec::with_capacity(self.def.len());
        for bytes in &self.def {
            let op: Op = serde_json::from_slice(bytes)?;
            def.push(serde_json::to_value(&op)?);
        }
        Ok(serde_json::to_string_pretty(&DebugDefinition { def, metadata: &self.metadata })?)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        data: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod base64_def {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        def: &[Vec<u8>],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(def.len()))?;
        for bytes in def {
            seq.serialize_element(&STANDARD.encode(bytes))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded.into_iter().map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_roundtrip() {
        let frag = Reference::Fragment(FragmentRef::new("/build/a/vertex.json"));
        let json = serde_json::to_string(&frag).unwrap();
        assert_eq!(json, "\"/build/a/vertex.json\"");
        assert_eq!(serde_json::from_str::<Reference>(&json).unwrap(), frag);

        let dgst = Reference::Digest(ContentDigest::from_bytes(b"hello"));
        let json = serde_json::to_string(&dgst).unwrap();
        assert!(json.starts_with("\"sha256:"));
        assert_eq!(serde_json::from_str::<Reference>(&json).unwrap(), dgst);
    }

    #[test]
    fn test_op_variant_wire_shape() {
        let op = Op {
            kind: Some(OpKind::Source(SourceOp {
                identifier: "docker-image://alpine".to_string(),
                attrs: BTreeMap::new(),
            })),
            inputs: Vec::new(),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["source"]["identifier"], "docker-image://alpine");
        assert!(value.get("exec").is_none());
        assert!(value.get("inputs").is_none());
    }

    #[test]
    fn test_alias_op_roundtrip() {
        let op = Op {
            kind: None,
            inputs: vec![Input {
                reference: Reference::Fragment(FragmentRef::new("b/vertex.json")),
                index: 2,
            }],
        };
        let bytes = op.marshal().unwrap();
        let back: Op = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, op);
        assert!(back.kind.is_none());
    }

    #[test]
    fn test_marshal_deterministic() {
        let op = Op {
            kind: Some(OpKind::Exec(ExecOp {
                meta: Meta {
                    args: vec!["sh".to_string(), "-c".to_string(), "true".to_string()],
                    env: vec!["PATH=/bin".to_string()],
                    cwd: "/work".to_string(),
                    user: String::new(),
                },
                mounts: vec![Mount {
                    dest: "/".to_string(),
                    mount_type: MountType::Bind,
                    input: 0,
                    selector: String::new(),
                    output: 0,
                    readonly: false,
                    cache_opt: None,
                    tmpfs_opt: None,
                }],
            })),
            inputs: vec![Input {
                reference: Reference::Digest(ContentDigest::from_bytes(b"base")),
                index: 0,
            }],
        };

        // Digest-relevant bytes must survive a decode/encode cycle.
        let bytes = op.marshal().unwrap();
        let back: Op = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.marshal().unwrap(), bytes);
        assert_eq!(back.digest().unwrap(), op.digest().unwrap());
    }

    #[test]
    fn test_mkfile_data_is_base64() {
        let action = FileAction {
            input: -1,
            secondary_input: -1,
            output: 0,
            kind: FileActionKind::Mkfile(FileActionMkFile {
                path: "/a.txt".to_string(),
                data: b"hi".to_vec(),
                mode: 0o644,
            }),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["mkfile"]["data"], "aGk=");
        let back: FileAction = serde_json::from_value(value).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn test_definition_roundtrip() {
        let op = Op { kind: Some(OpKind::Source(SourceOp::default())), inputs: Vec::new() };
        let bytes = op.marshal().unwrap();
        let dgst = ContentDigest::from_bytes(&bytes);

        let mut metadata = BTreeMap::new();
        metadata.insert(
            dgst.clone(),
            OpMetadata {
                description: BTreeMap::from([("k".to_string(), "v".to_string())]),
            },
        );
        let def = Definition { def: vec![bytes], metadata };

        let json = serde_json::to_string(&def).unwrap();
        let back: Definition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
        assert_eq!(ContentDigest::from_bytes(&back.def[0]), dgst);
    }

    #[test]
    fn test_debug_json_expands_ops() {
        let op = Op {
            kind: Some(OpKind::Source(SourceOp {
                identifier: "docker-image://alpine".to_string(),
                attrs: BTreeMap::new(),
            })),
            inputs: Vec::new(),
        };
        let def = Definition { def: vec![op.marshal().unwrap()], metadata: BTreeMap::new() };
        let debug = def.to_debug_json().unwrap();
        assert!(debug.contains("docker-image://alpine"));
    }
}
