//! OpSpec to IR node conversion.
//!
//! One conversion per spec variant. Mounts and file locations are processed
//! in sorted path order because the resulting node bytes feed the content
//! digest; output index assignment must be reproducible for identical input.

use crate::error::{Result, StrataError};
use crate::llb::{
    CacheOpt, ExecOp, FileAction, FileActionCopy, FileActionKind, FileActionMkFile, FileOp, Meta,
    MergeOp as LlbMergeOp, MergeInput as LlbMergeInput, Mount, MountType, Op, OpKind, SourceOp,
    TmpfsOpt, EMPTY_INPUT,
};
use crate::opspec::{ExecSpec, FileSpec, MergeSpec, MountKind, OpSpec, SourceSpec};
use crate::resolve::resolve_input;
use std::path::Path;
use url::Url;

/// Builder-only handle for an already-registered node input: the input index
/// and the filesystem sub-path within that input.
#[derive(Debug, Clone)]
struct MergeInput {
    index: i64,
    subpath: String,
}

/// Convert one OpSpec into one IR node. Fails with `InvalidOperation` when no
/// variant is set.
pub fn convert(spec: &OpSpec) -> Result<Op> {
    if let Some(source) = &spec.source {
        convert_source_op(source)
    } else if let Some(exec) = &spec.exec {
        convert_exec_op(exec)
    } else if let Some(file) = &spec.file {
        convert_file_op(file)
    } else if let Some(merge) = &spec.merge {
        convert_merge_op(merge)
    } else {
        Err(StrataError::InvalidOperation { reason: "no operation variant set".to_string() })
    }
}

/// Source conversion: identifier copied verbatim; attribute keys are
/// namespaced by the identifier's URI scheme.
pub fn convert_source_op(spec: &SourceSpec) -> Result<Op> {
    let mut source = SourceOp { identifier: spec.identifier.clone(), ..Default::default() };

    if !spec.attributes.is_empty() {
        let url = Url::parse(&spec.identifier).map_err(|e| StrataError::InvalidSource {
            identifier: spec.identifier.clone(),
            reason: e.to_string(),
        })?;
        for (key, value) in &spec.attributes {
            source.attrs.insert(format!("{}.{}", url.scheme(), key), value.clone());
        }
    }

    Ok(Op { kind: Some(OpKind::Source(source)), inputs: Vec::new() })
}

/// Exec conversion: one mount per spec entry in sorted path order. The root
/// mount always owns output 0; every other writable bind mount is assigned
/// the next unused positive output index. Cache and tmpfs mounts never
/// produce an output.
pub fn convert_exec_op(spec: &ExecSpec) -> Result<Op> {
    let mut op = Op::default();
    let mut exec = ExecOp {
        meta: Meta {
            args: spec.command.clone(),
            env: spec.env.clone(),
            cwd: spec.workdir.clone(),
            user: String::new(),
        },
        mounts: Vec::new(),
    };

    let mut num_outputs = 0;
    for (path, mount_spec) in &spec.mounts {
        let mount_type = match mount_spec.kind {
            MountKind::Tmpfs => MountType::Tmpfs,
            MountKind::Cache => MountType::Cache,
            MountKind::Bind => MountType::Bind,
        };

        let (input, selector) = match &mount_spec.input {
            Some(source) => resolve_input(&mut op, Path::new(source))?,
            None => (EMPTY_INPUT, String::new()),
        };

        let mut mount = Mount {
            dest: path.clone(),
            mount_type,
            input,
            selector,
            output: if path == "/" { 0 } else { -1 },
            readonly: mount_spec.readonly,
            cache_opt: None,
            tmpfs_opt: None,
        };

        match mount.mount_type {
            MountType::Tmpfs => mount.tmpfs_opt = Some(TmpfsOpt {}),
            MountType::Cache => mount.cache_opt = Some(CacheOpt {}),
            MountType::Bind => {
                if !mount.readonly && mount.output < 0 {
                    num_outputs += 1;
                    mount.output = num_outputs;
                }
            }
        }
        exec.mounts.push(mount);
    }

    op.kind = Some(OpKind::Exec(exec));
    Ok(op)
}

/// File conversion: a linear chain of actions over the sorted destination
/// paths, optionally seeded by a whole-tree copy of the resolved target.
/// Only the final action produces the graph-visible output.
pub fn convert_file_op(spec: &FileSpec) -> Result<Op> {
    let mut op = Op::default();

    let mut inp = MergeInput { index: -1, subpath: String::new() };
    if let Some(target) = &spec.target {
        let (index, subpath) = resolve_input(&mut op, Path::new(target))?;
        inp = MergeInput { index, subpath };
    }

    // Resolve every copy source up front so the op's input list is complete
    // before action indices are assigned.
    let mut sources = std::collections::BTreeMap::new();
    for entry in spec.locations.values() {
        if let Some(source) = nonempty(&entry.source) {
            let (index, subpath) = resolve_input(&mut op, Path::new(source))?;
            sources.insert(source.to_string(), MergeInput { index, subpath });
        }
    }

    let mut actions: Vec<FileAction> = Vec::new();

    if !inp.subpath.is_empty() {
        // Start from the target's existing filesystem, then apply edits.
        actions.push(FileAction {
            input: -1,
            secondary_input: inp.index,
            output: -1,
            kind: FileActionKind::Copy(FileActionCopy {
                src: inp.subpath.clone(),
                dest: "/".to_string(),
                mode: -1,
            }),
        });
        inp.index = op.inputs.len() as i64 + actions.len() as i64 - 1;
        inp.subpath.clear();
    }

    for (path, entry) in &spec.locations {
        let kind = if let Some(source) = nonempty(&entry.source) {
            let src = &sources[source];
            Some((
                src.index,
                FileActionKind::Copy(FileActionCopy {
                    src: src.subpath.clone(),
                    dest: path.clone(),
                    mode: 0,
                }),
            ))
        } else {
            nonempty(&entry.text).map(|text| {
                (
                    -1,
                    FileActionKind::Mkfile(FileActionMkFile {
                        path: path.clone(),
                        data: text.as_bytes().to_vec(),
                        mode: 0o644,
                    }),
                )
            })
        };

        if let Some((secondary_input, kind)) = kind {
            actions.push(FileAction { input: inp.index, secondary_input, output: -1, kind });
            inp.index = op.inputs.len() as i64 + actions.len() as i64 - 1;
        }
    }

    if let Some(last) = actions.last_mut() {
        last.output = 0;
    }

    op.kind = Some(OpKind::File(FileOp { actions }));
    Ok(op)
}

/// Merge conversion. When the target and every input resolve to root-level
/// references the engine's native merge primitive applies; any non-root
/// sub-path forces lowering to a chain of copy actions, because the native
/// merge operates on whole filesystem roots only.
pub fn convert_merge_op(spec: &MergeSpec) -> Result<Op> {
    let mut op = Op::default();

    let mut target = MergeInput { index: -1, subpath: String::new() };
    if let Some(t) = &spec.target {
        let (index, subpath) = resolve_input(&mut op, Path::new(t))?;
        target = MergeInput { index, subpath };
    }

    let mut inputs = Vec::with_capacity(spec.inputs.len());
    for input in &spec.inputs {
        let (index, subpath) = resolve_input(&mut op, Path::new(input))?;
        inputs.push(MergeInput { index, subpath });
    }

    if inputs.is_empty() {
        // Nothing to layer; the node stands as an alias for its target.
        return Ok(op);
    } else if can_merge(&target, &inputs) {
        return Ok(mk_merge(op, target.index, &inputs));
    }

    if target.subpath.is_empty() {
        target.subpath = "/".to_string();
    }

    let mut file = FileOp::default();
    let offset = op.inputs.len() as i64;
    let count = inputs.len();
    for (i, input) in inputs.iter().enumerate() {
        let src = if input.subpath.is_empty() { "/" } else { &input.subpath };
        let action = FileAction {
            input: target.index,
            secondary_input: input.index,
            output: if i + 1 == count { 0 } else { -1 },
            kind: FileActionKind::Copy(FileActionCopy {
                src: src.to_string(),
                dest: target.subpath.clone(),
                mode: -1,
            }),
        };
        target.index = file.actions.len() as i64 + offset;
        file.actions.push(action);
    }

    op.kind = Some(OpKind::File(file));
    Ok(op)
}

fn can_merge(target: &MergeInput, inputs: &[MergeInput]) -> bool {
    if target.index < 0 || !target.subpath.is_empty() {
        return false;
    }
    inputs.iter().all(|input| input.subpath.is_empty())
}

fn mk_merge(mut op: Op, target: i64, inputs: &[MergeInput]) -> Op {
    let mut merge = LlbMergeOp { inputs: Vec::with_capacity(inputs.len() + 1) };
    merge.inputs.push(LlbMergeInput { input: target });
    for input in inputs {
        merge.inputs.push(LlbMergeInput { input: input.index });
    }
    op.kind = Some(OpKind::Merge(merge));
    op
}

fn nonempty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}
