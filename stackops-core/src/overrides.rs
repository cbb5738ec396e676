//! Legacy path overrides.
//!
//! The predecessor of patch sets, kept so that existing override files keep
//! working. A rule sets a value at a dotted path such as
//! `ContainerDefinitions[0].Ulimits[-].Name`. Missing maps and lists along
//! the path are created; there is no removal.
//!
//! Some paths identify the compiled resource (for example the task
//! definition family) and are refused outright, whether or not they exist.

use std::{fmt::Display, path::Path};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::document;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OverrideRule {
    pub path: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
    /// `[-]`
    Append,
}

impl Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Key(k) => write!(f, "{}", k),
            Segment::Index(i) => write!(f, "[{}]", i),
            Segment::Append => write!(f, "[-]"),
        }
    }
}

/// Parse a dotted override path into its segments.
pub fn parse_path(path: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut rest = path;
    let mut expect_key = true;
    loop {
        if expect_key {
            let end = rest
                .find(|c: char| matches!(c, '.' | '[' | ']'))
                .unwrap_or(rest.len());
            if end == 0 {
                return Err(format!(
                    "expected a key at offset {}",
                    path.len() - rest.len()
                ));
            }
            segments.push(Segment::Key(rest[..end].to_string()));
            rest = &rest[end..];
        }
        match rest.chars().next() {
            None => return Ok(segments),
            Some('.') => {
                rest = &rest[1..];
                expect_key = true;
            }
            Some('[') => {
                let close = rest
                    .find(']')
                    .ok_or_else(|| format!("unterminated '[' at offset {}", path.len() - rest.len()))?;
                segments.push(parse_index(&rest[1..close])?);
                rest = &rest[close + 1..];
                expect_key = false;
            }
            Some(c) => {
                return Err(format!(
                    "unexpected {:?} at offset {}",
                    c,
                    path.len() - rest.len()
                ))
            }
        }
    }
}

fn parse_index(inner: &str) -> Result<Segment, String> {
    if inner == "-" {
        return Ok(Segment::Append);
    }
    if inner.is_empty() || !inner.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid list index [{}]", inner));
    }
    inner
        .parse()
        .map(Segment::Index)
        .map_err(|_| format!("invalid list index [{}]", inner))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DenySegment {
    Key(&'static str),
    AnyIndex,
}

/// Paths that overrides may not touch. A rule is refused when its path
/// starts with a denied path, or when it replaces an ancestor of one.
/// Appending a new list element is not a replacement.
#[derive(Debug, Clone, Default)]
pub struct Denylist {
    paths: Vec<Vec<DenySegment>>,
}

impl Denylist {
    pub fn empty() -> Self {
        Denylist::default()
    }

    /// Identity fields of a compiled task definition: the family and the
    /// container names, which the stack service uses to correlate resources
    /// across deployments.
    pub fn task_definition() -> Self {
        Denylist {
            paths: vec![
                vec![DenySegment::Key("Family")],
                vec![
                    DenySegment::Key("ContainerDefinitions"),
                    DenySegment::AnyIndex,
                    DenySegment::Key("Name"),
                ],
            ],
        }
    }

    pub fn is_denied(&self, segments: &[Segment]) -> bool {
        self.paths.iter().any(|denied| {
            let overlaps = denied.iter().zip(segments).all(|(d, s)| match (d, s) {
                (DenySegment::Key(k), Segment::Key(key)) => *k == key.as_str(),
                (DenySegment::AnyIndex, Segment::Index(_) | Segment::Append) => true,
                _ => false,
            });
            overlaps && (denied.len() <= segments.len() || !segments.contains(&Segment::Append))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OverrideError {
    #[error("override rule {index}: invalid path {path:?}: {reason}")]
    Syntax {
        index: usize,
        path: String,
        reason: String,
    },
    #[error("override rule {index}: {path:?} identifies the resource and cannot be overridden")]
    ForbiddenPath { index: usize, path: String },
    #[error("override rule {index}: cannot apply {segment} in {path:?} because the value there is a scalar")]
    NotAContainer {
        index: usize,
        path: String,
        segment: String,
    },
    #[error("override rule {index}: {segment} in {path:?} is out of bounds for a list of length {len}")]
    IndexOutOfBounds {
        index: usize,
        path: String,
        segment: String,
        len: usize,
    },
}

enum Failure {
    NotAContainer(Segment),
    IndexOutOfBounds(Segment, usize),
}

/// Apply override rules in order. Like patch sets, the rules apply as a
/// whole or not at all.
pub fn apply_overrides(
    document: &Value,
    rules: &[OverrideRule],
    denylist: &Denylist,
) -> Result<Value, OverrideError> {
    let mut working = document.clone();
    for (index, rule) in rules.iter().enumerate() {
        let segments = parse_path(&rule.path).map_err(|reason| OverrideError::Syntax {
            index,
            path: rule.path.clone(),
            reason,
        })?;
        if denylist.is_denied(&segments) {
            return Err(OverrideError::ForbiddenPath {
                index,
                path: rule.path.clone(),
            });
        }
        set_path(&mut working, &segments, rule.value.clone()).map_err(|failure| match failure {
            Failure::NotAContainer(segment) => OverrideError::NotAContainer {
                index,
                path: rule.path.clone(),
                segment: segment.to_string(),
            },
            Failure::IndexOutOfBounds(segment, len) => OverrideError::IndexOutOfBounds {
                index,
                path: rule.path.clone(),
                segment: segment.to_string(),
                len,
            },
        })?;
    }
    Ok(working)
}

fn set_path(node: &mut Value, segments: &[Segment], value: Value) -> Result<(), Failure> {
    match segments.split_first() {
        None => {
            *node = value;
            Ok(())
        }
        Some((segment, rest)) => {
            let child = child_slot(node, segment, rest.first())?;
            set_path(child, rest, value)
        }
    }
}

/// Find or create the slot for `segment` in `node`. `next` decides what kind
/// of container a newly created slot starts out as.
fn child_slot<'a>(
    node: &'a mut Value,
    segment: &Segment,
    next: Option<&Segment>,
) -> Result<&'a mut Value, Failure> {
    match (node, segment) {
        (Value::Object(map), Segment::Key(key)) => {
            Ok(map.entry(key.clone()).or_insert_with(|| vivify(next)))
        }
        (Value::Array(list), Segment::Index(i)) => {
            let len = list.len();
            if *i < len {
                Ok(&mut list[*i])
            } else if *i == len && next.is_none() {
                list.push(Value::Null);
                Ok(&mut list[len])
            } else {
                Err(Failure::IndexOutOfBounds(segment.clone(), len))
            }
        }
        (Value::Array(list), Segment::Append) => {
            list.push(vivify(next));
            let last = list.len() - 1;
            Ok(&mut list[last])
        }
        _ => Err(Failure::NotAContainer(segment.clone())),
    }
}

fn vivify(next: Option<&Segment>) -> Value {
    match next {
        Some(Segment::Key(_)) => Value::Object(Map::new()),
        Some(Segment::Index(_) | Segment::Append) => Value::Array(Vec::new()),
        None => Value::Null,
    }
}

pub fn load_override_rules(path: &Path) -> Result<Vec<OverrideRule>> {
    let value = document::load_document(path)?;
    serde_json::from_value(value)
        .with_context(|| format!("{} is not a list of override rules", path.display()))
}
