//! Path resolution against the fragment store.
//!
//! A filesystem path is resolved by walking upward until a directory with an
//! `index.json` side-file is found. The index maps published sub-path
//! prefixes to fragment references; the longest matching prefix wins and the
//! remainder becomes the selector inside the referenced node. Each fragment
//! publishes its own mini-index of externally visible mount points, so
//! fragments compose across directory boundaries without a global namespace.

use crate::error::{Result, StrataError};
use crate::llb::{FragmentRef, Input, Op, Reference};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Side-file name consulted during resolution.
pub const INDEX_FILE: &str = "index.json";

/// Walk upward from `fpath` to the nearest directory holding an index
/// side-file. Returns that directory and the sub-path of `fpath` below it
/// (always `/`-prefixed, `/` for the directory itself).
fn locate_index(fpath: &Path) -> Result<(PathBuf, String)> {
    let mut dir = fpath.to_path_buf();
    let mut mount_path = String::new();

    while dir != Path::new("/") && !dir.as_os_str().is_empty() {
        if dir.join(INDEX_FILE).is_file() {
            if mount_path.is_empty() {
                mount_path.push('/');
            }
            return Ok((dir, mount_path));
        }

        let name = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        mount_path = format!("/{}{}", name, mount_path);
        dir = dir.parent().map(Path::to_path_buf).unwrap_or_default();
    }

    Err(StrataError::NotFound {
        path: fpath.to_path_buf(),
        reason: format!("no {} between path and filesystem root", INDEX_FILE),
    })
}

/// Resolve `fpath` to a fragment reference and the remaining sub-path within
/// that fragment's filesystem.
///
/// Fails with `NotFound` when no index side-file exists above `fpath` or when
/// no index entry's prefix matches the requested sub-path.
pub fn resolve(fpath: &Path) -> Result<(FragmentRef, String)> {
    let (dir, mount_path) = locate_index(fpath)?;

    let index_path = dir.join(INDEX_FILE);
    let data = std::fs::read(&index_path).map_err(|e| StrataError::from_io(&index_path, e))?;
    let index: BTreeMap<String, String> = serde_json::from_slice(&data)?;

    let mut sel = "";
    for key in index.keys() {
        if mount_path.starts_with(key.as_str()) && key.len() > sel.len() {
            sel = key;
        }
    }
    if sel.is_empty() {
        return Err(StrataError::NotFound {
            path: fpath.to_path_buf(),
            reason: format!("no index entry matches {:?} in {}", mount_path, dir.display()),
        });
    }

    let value = &index[sel];
    let remaining = if sel == "/" {
        mount_path
    } else {
        mount_path.strip_prefix(sel).unwrap_or_default().to_string()
    };

    let target = Path::new(value);
    if target.is_dir() {
        // The entry points at another fragment tree; resolve the remainder
        // against its own index.
        return resolve(&target.join(remaining.trim_start_matches('/')));
    }
    Ok((FragmentRef::new(target), remaining))
}

/// Resolve `fpath` and register the result as an input of `op`, reusing an
/// existing input slot when the same fragment is already referenced.
///
/// Returns the input index and the selector sub-path.
pub fn resolve_input(op: &mut Op, fpath: &Path) -> Result<(i64, String)> {
    let (fragment, subpath) = resolve(fpath)?;
    let reference = Reference::Fragment(fragment);

    if let Some(i) = op.inputs.iter().position(|inp| inp.reference == reference) {
        return Ok((i as i64, subpath));
    }
    op.inputs.push(Input { reference, index: 0 });
    Ok((op.inputs.len() as i64 - 1, subpath))
}
