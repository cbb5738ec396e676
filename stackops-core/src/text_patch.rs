//! Splicing text into a deployed template.
//!
//! Some fixes have to be applied to a template that is owned by the stack
//! service rather than compiled by us, for instance granting a permission
//! that older versions of the environment template lacked. Round-tripping
//! such a document through a parser would drop its comments and
//! formatting, so instead this module works in two phases:
//!
//! 1. [`locate`] parses the text only to learn the line of an anchor field;
//! 2. [`splice`] inserts a fragment before that line as plain text.
//!
//! This is deliberately separate from the structural patch engine, which
//! is the right tool whenever we own the template.

use std::{cmp::Ordering, fmt::Display, str::FromStr};

use marked_yaml::Node;

use crate::overrides::{parse_path, Segment};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextPatchError {
    #[error("template metadata is unreadable: {reason}")]
    MetadataUnreadable { reason: String },
    #[error("anchor {anchor} not found in the template; refusing to patch a template of unexpected shape")]
    AnchorNotFound { anchor: String },
    #[error("invalid anchor {anchor:?}: {reason}")]
    InvalidAnchor { anchor: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('v').unwrap_or(s);
        let parts: Vec<&str> = digits.split('.').collect();
        let [major, minor, patch] = parts.as_slice() else {
            return Err(format!("{:?} is not of the form vMAJOR.MINOR.PATCH", s));
        };
        let number = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| format!("{:?} is not of the form vMAJOR.MINOR.PATCH", s))
        };
        Ok(Version {
            major: number(major)?,
            minor: number(minor)?,
            patch: number(patch)?,
        })
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The version a deployed template declares in `Metadata.Version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateVersion {
    /// Written by the bootstrap flow, which always carries current permissions.
    Bootstrap,
    Release(Version),
}

pub const BOOTSTRAP_VERSION: &str = "bootstrap";

/// Templates at or above `threshold` already contain the fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionGate {
    pub threshold: Version,
}

impl VersionGate {
    pub fn is_satisfied_by(&self, version: &TemplateVersion) -> bool {
        match version {
            TemplateVersion::Bootstrap => true,
            TemplateVersion::Release(v) => v.cmp(&self.threshold) != Ordering::Less,
        }
    }
}

/// A structural path into the template, written like an override path
/// without `[-]`: `Resources.Role.Properties.Policies[0]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    segments: Vec<Segment>,
}

impl FromStr for Anchor {
    type Err = TextPatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| TextPatchError::InvalidAnchor {
            anchor: s.to_string(),
            reason,
        };
        let segments = parse_path(s).map_err(invalid)?;
        if segments.contains(&Segment::Append) {
            return Err(invalid("[-] does not address an existing field".to_string()));
        }
        Ok(Anchor { segments })
    }
}

impl Display for Anchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 && matches!(segment, Segment::Key(_)) {
                write!(f, ".")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

/// 1-based position of a field in the serialized template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coordinate {
    pub line: usize,
    pub column: usize,
}

/// A text fix and the template versions that need it.
#[derive(Debug, Clone)]
pub struct PermissionPatch {
    pub gate: VersionGate,
    pub anchor: Anchor,
    /// YAML lines written at column 0, inserted at the anchor's indentation.
    pub fragment: String,
}

impl PermissionPatch {
    /// Insert a policy statement in front of the first statement of the
    /// environment manager role's first inline policy.
    pub fn environment_manager_statement(threshold: Version, statement: &str) -> Self {
        PermissionPatch {
            gate: VersionGate { threshold },
            anchor: Anchor {
                segments: vec![
                    Segment::Key("Resources".to_string()),
                    Segment::Key("EnvironmentManagerRole".to_string()),
                    Segment::Key("Properties".to_string()),
                    Segment::Key("Policies".to_string()),
                    Segment::Index(0),
                    Segment::Key("PolicyDocument".to_string()),
                    Segment::Key("Statement".to_string()),
                    Segment::Index(0),
                ],
            },
            fragment: statement.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextPatch {
    /// The template already has the fix. Do not submit an update.
    Noop,
    Updated(String),
}

pub fn ensure_permission(body: &str, patch: &PermissionPatch) -> Result<TextPatch, TextPatchError> {
    let root = parse_tree(body)?;
    if patch.gate.is_satisfied_by(&version_of(&root)?) {
        return Ok(TextPatch::Noop);
    }
    let coordinate = coordinate_of(&root, &patch.anchor)?;
    splice(body, coordinate, &patch.fragment).map(TextPatch::Updated)
}

pub fn read_version(body: &str) -> Result<TemplateVersion, TextPatchError> {
    version_of(&parse_tree(body)?)
}

/// Find where the anchor field starts, without deserializing anything else.
pub fn locate(body: &str, anchor: &Anchor) -> Result<Coordinate, TextPatchError> {
    coordinate_of(&parse_tree(body)?, anchor)
}

/// Insert `fragment` before the coordinate's line, indenting each fragment
/// line by the indentation of that line.
pub fn splice(body: &str, coordinate: Coordinate, fragment: &str) -> Result<String, TextPatchError> {
    let newline = if body.contains("\r\n") { "\r\n" } else { "\n" };
    let mut out = String::with_capacity(body.len() + fragment.len() * 2);
    let mut inserted = false;
    for (n, line) in body.split_inclusive('\n').enumerate() {
        if n + 1 == coordinate.line {
            let indent_len = line.len() - line.trim_start_matches(' ').len();
            let indent = &line[..indent_len];
            for fragment_line in fragment.lines() {
                if !fragment_line.trim().is_empty() {
                    out.push_str(indent);
                    out.push_str(fragment_line);
                }
                out.push_str(newline);
            }
            inserted = true;
        }
        out.push_str(line);
    }
    if !inserted {
        return Err(TextPatchError::AnchorNotFound {
            anchor: format!("line {}", coordinate.line),
        });
    }
    Ok(out)
}

fn parse_tree(body: &str) -> Result<Node, TextPatchError> {
    marked_yaml::parse_yaml(0, mask_tags(body)).map_err(|e| TextPatchError::MetadataUnreadable {
        reason: e.to_string(),
    })
}

/// Blank out node tags (`!Ref`, `!Sub`, `!!str`) so the span parser, which
/// rejects tags, accepts the document. Tags are replaced by spaces of the
/// same length, so every line and column stays where it was.
fn mask_tags(body: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Plain,
        Single,
        Double,
        Comment,
    }

    let bytes = body.as_bytes();
    let mut out = bytes.to_vec();
    let mut state = State::Plain;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let at_token_start = i == 0 || matches!(bytes[i - 1], b' ' | b'\t' | b'\n' | b'\r' | b'[' | b'{' | b',');
        match state {
            State::Comment if c == b'\n' => state = State::Plain,
            State::Comment => {}
            State::Single if c == b'\'' => {
                // '' is an escaped quote
                if bytes.get(i + 1) == Some(&b'\'') {
                    i += 1;
                } else {
                    state = State::Plain;
                }
            }
            State::Single => {}
            State::Double if c == b'\\' => i += 1,
            State::Double if c == b'"' => state = State::Plain,
            State::Double => {}
            State::Plain if c == b'#' && at_token_start => state = State::Comment,
            State::Plain if c == b'\'' && at_token_start => state = State::Single,
            State::Plain if c == b'"' && at_token_start => state = State::Double,
            State::Plain if c == b'!' && at_token_start => {
                let end = bytes[i..]
                    .iter()
                    .position(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b',' | b']' | b'}'))
                    .map_or(bytes.len(), |n| i + n);
                out[i..end].fill(b' ');
                i = end;
                continue;
            }
            State::Plain => {}
        }
        i += 1;
    }
    // Tags end at an ASCII delimiter, so whole characters were blanked.
    String::from_utf8(out).unwrap_or_else(|_| body.to_string())
}

fn version_of(root: &Node) -> Result<TemplateVersion, TextPatchError> {
    let unreadable = |reason: &str| TextPatchError::MetadataUnreadable {
        reason: reason.to_string(),
    };
    let metadata = match root.as_mapping().and_then(|m| m.get_node("Metadata")) {
        None => None,
        Some(Node::Mapping(metadata)) => Some(metadata),
        Some(_) => return Err(unreadable("Metadata is not a mapping")),
    };
    let version = match metadata.and_then(|m| m.get_node("Version")) {
        None => None,
        Some(Node::Scalar(version)) => Some(version),
        Some(_) => return Err(unreadable("Metadata.Version is not a scalar")),
    };
    match version.map(|v| v.as_str()) {
        None => Ok(TemplateVersion::Release(Version {
            major: 0,
            minor: 0,
            patch: 0,
        })),
        Some(BOOTSTRAP_VERSION) => Ok(TemplateVersion::Bootstrap),
        Some(v) => v
            .parse()
            .map(TemplateVersion::Release)
            .map_err(|reason| TextPatchError::MetadataUnreadable { reason }),
    }
}

fn coordinate_of(root: &Node, anchor: &Anchor) -> Result<Coordinate, TextPatchError> {
    let not_found = || TextPatchError::AnchorNotFound {
        anchor: anchor.to_string(),
    };
    let mut node = root;
    for segment in &anchor.segments {
        let next = match (segment, node) {
            (Segment::Key(key), Node::Mapping(mapping)) => mapping.get_node(key),
            (Segment::Index(i), Node::Sequence(sequence)) => sequence.get_node(*i),
            _ => None,
        };
        node = next.ok_or_else(not_found)?;
    }
    let start = node.span().start().ok_or_else(not_found)?;
    Ok(Coordinate {
        line: start.line(),
        column: start.column(),
    })
}
