//! Patch sets: ordered `add`/`remove`/`replace` edits to a template.
//!
//! Operations apply strictly in order, each one to the result of the
//! previous one. A patch set applies as a whole or not at all: the input
//! document is never modified, and the first failing operation aborts the
//! call with its index.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::{
    document,
    pointer::{parse_list_token, resolve_mut, ListIndex, ParentMut, Pointer, PointerError},
};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: Pointer, value: Value },
    Remove { path: Pointer },
    Replace { path: Pointer, value: Value },
}

impl PatchOperation {
    pub fn path(&self) -> &Pointer {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Remove { path }
            | PatchOperation::Replace { path, .. } => path,
        }
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            PatchOperation::Add { .. } => "add",
            PatchOperation::Remove { .. } => "remove",
            PatchOperation::Replace { .. } => "replace",
        }
    }
}

/// Why a single operation could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchFailure {
    #[error(transparent)]
    Pointer(#[from] PointerError),
    #[error("index {index} is out of bounds for a list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("the document root cannot be removed")]
    RemoveRoot,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("patch operation {index} ({op} {path}) failed: {source}")]
pub struct PatchError {
    /// 0-based position of the failing operation in the patch set
    pub index: usize,
    pub op: &'static str,
    pub path: String,
    #[source]
    pub source: PatchFailure,
}

pub fn apply_patch_set(document: &Value, patch_set: &[PatchOperation]) -> Result<Value, PatchError> {
    let mut working = document.clone();
    for (index, operation) in patch_set.iter().enumerate() {
        apply_operation(&mut working, operation).map_err(|source| PatchError {
            index,
            op: operation.op_name(),
            path: operation.path().to_string(),
            source,
        })?;
    }
    Ok(working)
}

fn apply_operation(document: &mut Value, operation: &PatchOperation) -> Result<(), PatchFailure> {
    match operation {
        PatchOperation::Add { path, value } => add(document, path, value.clone()),
        PatchOperation::Remove { path } => remove(document, path),
        PatchOperation::Replace { path, value } => replace(document, path, value.clone()),
    }
}

fn add(document: &mut Value, path: &Pointer, value: Value) -> Result<(), PatchFailure> {
    if path.is_root() {
        *document = value;
        return Ok(());
    }
    match resolve_mut(document, path)? {
        (ParentMut::Map(map), token) => {
            map.insert(token.to_string(), value);
        }
        (ParentMut::List(list), token) => match parse_list_token(path, token)? {
            ListIndex::Append => list.push(value),
            ListIndex::At(index) if index <= list.len() => list.insert(index, value),
            ListIndex::At(index) => {
                return Err(PatchFailure::IndexOutOfBounds {
                    index,
                    len: list.len(),
                })
            }
        },
    }
    Ok(())
}

fn remove(document: &mut Value, path: &Pointer) -> Result<(), PatchFailure> {
    if path.is_root() {
        return Err(PatchFailure::RemoveRoot);
    }
    match resolve_mut(document, path)? {
        (ParentMut::Map(map), token) => {
            map.shift_remove(token)
                .ok_or_else(|| path.path_not_found(token))?;
        }
        (ParentMut::List(list), token) => match parse_list_token(path, token)? {
            ListIndex::At(index) if index < list.len() => {
                list.remove(index);
            }
            _ => return Err(path.path_not_found(token).into()),
        },
    }
    Ok(())
}

fn replace(document: &mut Value, path: &Pointer, value: Value) -> Result<(), PatchFailure> {
    if path.is_root() {
        *document = value;
        return Ok(());
    }
    let slot = match resolve_mut(document, path)? {
        (ParentMut::Map(map), token) => map.get_mut(token).ok_or_else(|| path.path_not_found(token))?,
        (ParentMut::List(list), token) => match parse_list_token(path, token)? {
            ListIndex::At(index) => list
                .get_mut(index)
                .ok_or_else(|| path.path_not_found(token))?,
            ListIndex::Append => return Err(path.path_not_found(token).into()),
        },
    };
    *slot = value;
    Ok(())
}

/// Load a patch set file. JSON and YAML are both accepted; YAML values may
/// use short-form intrinsic tags.
pub fn load_patch_set(path: &Path) -> Result<Vec<PatchOperation>> {
    let value = document::load_document(path)?;
    serde_json::from_value(value)
        .with_context(|| format!("{} is not a list of patch operations", path.display()))
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("unsupported JSON Patch operation {0:?}; only add, remove and replace are supported")]
    Unsupported(&'static str),
    #[error(transparent)]
    Pointer(#[from] PointerError),
}

/// Accept RFC 6902 operations from `json_patch` documents, as long as they
/// stay within the subset this engine implements.
impl TryFrom<json_patch::PatchOperation> for PatchOperation {
    type Error = ConvertError;

    fn try_from(operation: json_patch::PatchOperation) -> Result<Self, Self::Error> {
        Ok(match operation {
            json_patch::PatchOperation::Add(op) => PatchOperation::Add {
                path: op.path.to_string().parse()?,
                value: op.value,
            },
            json_patch::PatchOperation::Remove(op) => PatchOperation::Remove {
                path: op.path.to_string().parse()?,
            },
            json_patch::PatchOperation::Replace(op) => PatchOperation::Replace {
                path: op.path.to_string().parse()?,
                value: op.value,
            },
            json_patch::PatchOperation::Move(_) => return Err(ConvertError::Unsupported("move")),
            json_patch::PatchOperation::Copy(_) => return Err(ConvertError::Unsupported("copy")),
            json_patch::PatchOperation::Test(_) => return Err(ConvertError::Unsupported("test")),
        })
    }
}

pub fn from_json_patch(patch: json_patch::Patch) -> Result<Vec<PatchOperation>, ConvertError> {
    patch.0.into_iter().map(PatchOperation::try_from).collect()
}
