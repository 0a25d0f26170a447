//! Versioned configuration snapshots and the diffs that derive them
//!
//! A [`Configuration`] is an immutable snapshot of every tunable parameter
//! (routing tables, weight coefficients, retrieval thresholds, prompt
//! templates) stored as a JSON document. New versions only come into
//! existence by applying a [`ConfigDiff`] to an existing snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::hash::{ContentHash, HashError};
use crate::proposal::ProposalId;

/// Monotonically increasing configuration version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub u64);

impl VersionId {
    /// Version assigned to the bootstrap configuration
    pub const GENESIS: Self = Self(1);

    /// The version that follows this one
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for VersionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Immutable configuration snapshot
///
/// Identified by both its version and the canonical hash of its parameters.
/// Never mutated in place; see [`ConfigDiff::apply_to`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    version: VersionId,
    hash: ContentHash,
    params: JsonValue,
    parent: Option<VersionId>,
    origin: Option<ProposalId>,
    created_at: DateTime<Utc>,
}

impl Configuration {
    /// Bootstrap configuration (version 1, no parent)
    ///
    /// # Errors
    /// Returns error if `params` is not a JSON object
    pub fn genesis(params: JsonValue) -> Result<Self, DiffError> {
        Self::new(VersionId::GENESIS, params, None, None)
    }

    /// Build a snapshot for an explicit version
    ///
    /// # Errors
    /// Returns error if `params` is not a JSON object
    pub fn new(
        version: VersionId,
        params: JsonValue,
        parent: Option<VersionId>,
        origin: Option<ProposalId>,
    ) -> Result<Self, DiffError> {
        if !params.is_object() {
            return Err(DiffError::RootNotObject);
        }
        Ok(Self {
            version,
            hash: ContentHash::of_json(&params),
            params,
            parent,
            origin,
            created_at: Utc::now(),
        })
    }

    #[inline]
    #[must_use]
    pub fn version(&self) -> VersionId {
        self.version
    }

    #[inline]
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    #[inline]
    #[must_use]
    pub fn params(&self) -> &JsonValue {
        &self.params
    }

    /// Version this snapshot was derived from
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<VersionId> {
        self.parent
    }

    /// Proposal whose promotion produced this snapshot
    #[inline]
    #[must_use]
    pub fn origin(&self) -> Option<ProposalId> {
        self.origin
    }

    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Look up a parameter by JSON pointer
    #[inline]
    #[must_use]
    pub fn get(&self, pointer: &str) -> Option<&JsonValue> {
        self.params.pointer(pointer)
    }

    /// Recompute the content hash and compare with the stored one
    #[must_use]
    pub fn verify_hash(&self) -> bool {
        ContentHash::of_json(&self.params) == self.hash
    }
}

/// A single structural edit addressed by JSON pointer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiffOp {
    /// Insert or replace the value at `path`; the parent must exist
    Set { path: String, value: JsonValue },
    /// Remove the value at `path`; the target must exist
    Remove { path: String },
    /// Deep-merge `value` into the value at `path` (inserted if absent)
    Merge { path: String, value: JsonValue },
}

impl DiffOp {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Set { path, .. } | Self::Remove { path } | Self::Merge { path, .. } => path,
        }
    }
}

/// Ordered list of edits against a base configuration
///
/// When `base_hash` is present the diff only applies to a configuration with
/// exactly that content hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDiff {
    ops: Vec<DiffOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    base_hash: Option<ContentHash>,
}

impl ConfigDiff {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of operations
    #[inline]
    #[must_use]
    pub fn from_ops(ops: Vec<DiffOp>) -> Self {
        Self {
            ops,
            base_hash: None,
        }
    }

    /// Append a `Set` operation
    #[inline]
    #[must_use]
    pub fn set(mut self, path: impl Into<String>, value: JsonValue) -> Self {
        self.ops.push(DiffOp::Set {
            path: path.into(),
            value,
        });
        self
    }

    /// Append a `Remove` operation
    #[inline]
    #[must_use]
    pub fn remove(mut self, path: impl Into<String>) -> Self {
        self.ops.push(DiffOp::Remove { path: path.into() });
        self
    }

    /// Append a `Merge` operation
    #[inline]
    #[must_use]
    pub fn merge(mut self, path: impl Into<String>, value: JsonValue) -> Self {
        self.ops.push(DiffOp::Merge {
            path: path.into(),
            value,
        });
        self
    }

    /// Pin the diff to a base configuration hash
    #[inline]
    #[must_use]
    pub fn with_base(mut self, hash: ContentHash) -> Self {
        self.base_hash = Some(hash);
        self
    }

    #[inline]
    #[must_use]
    pub fn ops(&self) -> &[DiffOp] {
        &self.ops
    }

    #[inline]
    #[must_use]
    pub fn base_hash(&self) -> Option<ContentHash> {
        self.base_hash
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Canonical hash of the diff (used to bind signed mandates)
    ///
    /// # Errors
    /// Returns error if the diff cannot be encoded as JSON
    pub fn hash(&self) -> Result<ContentHash, HashError> {
        ContentHash::of_serializable(self)
    }

    /// Syntactic validation independent of any base
    ///
    /// # Errors
    /// Returns error for an empty diff or a malformed pointer
    pub fn validate(&self) -> Result<(), DiffError> {
        if self.ops.is_empty() {
            return Err(DiffError::Empty);
        }
        for op in &self.ops {
            let tokens = parse_pointer(op.path())?;
            if tokens.is_empty() && !matches!(op, DiffOp::Merge { .. }) {
                return Err(DiffError::InvalidPointer(op.path().to_string()));
            }
        }
        Ok(())
    }

    /// Apply to a configuration snapshot, honouring the pinned base hash
    ///
    /// # Errors
    /// Returns error if the base hash does not match or any edit fails
    pub fn apply_to(&self, config: &Configuration) -> Result<JsonValue, DiffError> {
        if let Some(expected) = self.base_hash {
            if expected != config.hash() {
                return Err(DiffError::BaseMismatch {
                    expected,
                    actual: config.hash(),
                });
            }
        }
        self.apply(config.params())
    }

    /// Apply all edits in order to a copy of `base`
    ///
    /// # Errors
    /// Returns error if any edit cannot be applied
    pub fn apply(&self, base: &JsonValue) -> Result<JsonValue, DiffError> {
        self.validate()?;
        let mut doc = base.clone();
        for op in &self.ops {
            apply_op(&mut doc, op)?;
        }
        if !doc.is_object() {
            return Err(DiffError::RootNotObject);
        }
        Ok(doc)
    }
}

fn apply_op(doc: &mut JsonValue, op: &DiffOp) -> Result<(), DiffError> {
    let path = op.path();
    let tokens = parse_pointer(path)?;

    let Some((last, parent_tokens)) = tokens.split_last() else {
        // Root merge
        if let DiffOp::Merge { value, .. } = op {
            *doc = merge_json(doc, value);
        }
        return Ok(());
    };

    let parent = resolve_mut(doc, parent_tokens)
        .ok_or_else(|| DiffError::MissingParent(path.to_string()))?;

    match (parent, op) {
        (JsonValue::Object(map), DiffOp::Set { value, .. }) => {
            map.insert(last.clone(), value.clone());
        }
        (JsonValue::Object(map), DiffOp::Remove { .. }) => {
            if map.remove(last).is_none() {
                return Err(DiffError::MissingTarget(path.to_string()));
            }
        }
        (JsonValue::Object(map), DiffOp::Merge { value, .. }) => {
            let merged = match map.get(last) {
                Some(existing) => merge_json(existing, value),
                None => value.clone(),
            };
            map.insert(last.clone(), merged);
        }
        (JsonValue::Array(arr), op) => {
            let len = arr.len();
            let index = if last == "-" {
                len
            } else {
                last.parse::<usize>()
                    .map_err(|_| DiffError::InvalidPointer(path.to_string()))?
            };
            match op {
                DiffOp::Set { value, .. } if index == len => arr.push(value.clone()),
                DiffOp::Set { value, .. } if index < len => arr[index] = value.clone(),
                DiffOp::Remove { .. } if index < len => {
                    arr.remove(index);
                }
                DiffOp::Merge { value, .. } if index < len => {
                    arr[index] = merge_json(&arr[index], value);
                }
                _ => {
                    return Err(DiffError::IndexOutOfBounds {
                        path: path.to_string(),
                        index,
                        len,
                    })
                }
            }
        }
        _ => return Err(DiffError::NotAContainer(path.to_string())),
    }
    Ok(())
}

fn resolve_mut<'a>(doc: &'a mut JsonValue, tokens: &[String]) -> Option<&'a mut JsonValue> {
    tokens.iter().try_fold(doc, |node, token| match node {
        JsonValue::Object(map) => map.get_mut(token),
        JsonValue::Array(arr) => token.parse::<usize>().ok().and_then(|i| arr.get_mut(i)),
        _ => None,
    })
}

/// Split an RFC 6901 pointer into unescaped reference tokens
fn parse_pointer(pointer: &str) -> Result<Vec<String>, DiffError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(DiffError::InvalidPointer(pointer.to_string()));
    };
    Ok(rest
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Merge two JSON values (deep merge for objects)
///
/// Arrays are concatenated; for scalars `b` wins.
#[must_use]
pub fn merge_json(a: &JsonValue, b: &JsonValue) -> JsonValue {
    match (a, b) {
        (JsonValue::Object(a_map), JsonValue::Object(b_map)) => {
            let mut result = a_map.clone();
            for (key, b_val) in b_map {
                let merged = match result.get(key) {
                    Some(a_val) => merge_json(a_val, b_val),
                    None => b_val.clone(),
                };
                result.insert(key.clone(), merged);
            }
            JsonValue::Object(result)
        }
        (JsonValue::Array(a_arr), JsonValue::Array(b_arr)) => {
            let mut result = a_arr.clone();
            result.extend(b_arr.iter().cloned());
            JsonValue::Array(result)
        }
        (_, b_val) => b_val.clone(),
    }
}

/// Generate canonical JSON (sorted keys, no whitespace)
#[must_use]
pub fn canonical_json(value: &JsonValue) -> String {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();

            let parts: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{}:{}", JsonValue::from(key.as_str()), canonical_json(&map[key])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        JsonValue::Array(arr) => {
            let parts: Vec<_> = arr.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// Diff application errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiffError {
    #[error("diff contains no operations")]
    Empty,

    #[error("invalid JSON pointer: '{0}'")]
    InvalidPointer(String),

    #[error("parent of '{0}' does not exist")]
    MissingParent(String),

    #[error("target '{0}' does not exist")]
    MissingTarget(String),

    #[error("'{0}' does not address an object or array")]
    NotAContainer(String),

    #[error("index {index} out of bounds at '{path}' (len {len})")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("configuration root must be an object")]
    RootNotObject,

    #[error("base hash mismatch: diff expects {expected}, configuration is {actual}")]
    BaseMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
}
