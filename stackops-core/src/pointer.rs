//! Slash-delimited pointers into a template, in the syntax of RFC 6901.

use std::{fmt::Display, str::FromStr};

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PointerError {
    #[error("invalid pointer {pointer:?}: {reason}")]
    Syntax { pointer: String, reason: String },
    #[error("path not found: {pointer} has no {token:?}")]
    PathNotFound { pointer: String, token: String },
    #[error("not a container: {pointer} cannot descend into {token:?} because its parent is a scalar")]
    NotAContainer { pointer: String, token: String },
    #[error("invalid list index {token:?} in {pointer}")]
    InvalidIndex { pointer: String, token: String },
}

/// A parsed pointer. The empty string is the root pointer, which has no
/// tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pointer {
    tokens: Vec<String>,
}

impl Pointer {
    pub fn root() -> Self {
        Pointer { tokens: Vec::new() }
    }

    pub fn parse(s: &str) -> Result<Self, PointerError> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        let rest = s.strip_prefix('/').ok_or_else(|| PointerError::Syntax {
            pointer: s.to_string(),
            reason: "must be empty or start with '/'".to_string(),
        })?;
        let tokens = rest
            .split('/')
            .map(|raw| unescape(raw).ok_or_else(|| PointerError::Syntax {
                pointer: s.to_string(),
                reason: format!("bad escape in token {:?}", raw),
            }))
            .collect::<Result<_, _>>()?;
        Ok(Pointer { tokens })
    }

    pub fn from_tokens<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Pointer {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_root(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn join(&self, other: &Pointer) -> Pointer {
        Pointer {
            tokens: self.tokens.iter().chain(other.tokens.iter()).cloned().collect(),
        }
    }

    pub(crate) fn path_not_found(&self, token: &str) -> PointerError {
        PointerError::PathNotFound {
            pointer: self.to_string(),
            token: token.to_string(),
        }
    }
}

fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

impl Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for token in &self.tokens {
            write!(f, "/{}", token.replace('~', "~0").replace('/', "~1"))?;
        }
        Ok(())
    }
}

impl FromStr for Pointer {
    type Err = PointerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pointer::parse(s)
    }
}

impl TryFrom<String> for Pointer {
    type Error = PointerError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Pointer::parse(&s)
    }
}

impl From<Pointer> for String {
    fn from(pointer: Pointer) -> Self {
        pointer.to_string()
    }
}

/// Where a list token points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListIndex {
    At(usize),
    /// The `-` token: one past the last element.
    Append,
}

/// Parse a token that addresses a list element: a base-10 non-negative
/// integer without leading zeros, or `-`.
pub fn parse_list_token(pointer: &Pointer, token: &str) -> Result<ListIndex, PointerError> {
    if token == "-" {
        return Ok(ListIndex::Append);
    }
    let invalid = || PointerError::InvalidIndex {
        pointer: pointer.to_string(),
        token: token.to_string(),
    };
    if token.is_empty()
        || !token.bytes().all(|b| b.is_ascii_digit())
        || (token.len() > 1 && token.starts_with('0'))
    {
        return Err(invalid());
    }
    token.parse::<usize>().map(ListIndex::At).map_err(|_| invalid())
}

/// The container that holds the element a pointer addresses.
#[derive(Debug)]
pub enum Parent<'a> {
    Map(&'a Map<String, Value>),
    List(&'a Vec<Value>),
}

#[derive(Debug)]
pub enum ParentMut<'a> {
    Map(&'a mut Map<String, Value>),
    List(&'a mut Vec<Value>),
}

/// Walk every token but the last, returning the parent container and the
/// final token.
///
/// Fails with `PathNotFound` when an intermediate token does not exist and
/// with `NotAContainer` when a token has to be looked up in a scalar.
pub fn resolve<'a, 'p>(
    document: &'a Value,
    pointer: &'p Pointer,
) -> Result<(Parent<'a>, &'p str), PointerError> {
    let (last, parents) = pointer
        .tokens
        .split_last()
        .ok_or_else(|| pointer.path_not_found(""))?;
    let mut current = document;
    for token in parents {
        current = match current {
            Value::Object(map) => map.get(token).ok_or_else(|| pointer.path_not_found(token))?,
            Value::Array(list) => match parse_list_token(pointer, token)? {
                ListIndex::At(i) => list.get(i).ok_or_else(|| pointer.path_not_found(token))?,
                ListIndex::Append => return Err(pointer.path_not_found(token)),
            },
            _ => return Err(not_a_container(pointer, token)),
        };
    }
    match current {
        Value::Object(map) => Ok((Parent::Map(map), last)),
        Value::Array(list) => Ok((Parent::List(list), last)),
        _ => Err(not_a_container(pointer, last)),
    }
}

/// Mutable counterpart of [`resolve`].
pub fn resolve_mut<'a, 'p>(
    document: &'a mut Value,
    pointer: &'p Pointer,
) -> Result<(ParentMut<'a>, &'p str), PointerError> {
    let (last, parents) = pointer
        .tokens
        .split_last()
        .ok_or_else(|| pointer.path_not_found(""))?;
    let mut current = document;
    for token in parents {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| pointer.path_not_found(token))?,
            Value::Array(list) => match parse_list_token(pointer, token)? {
                ListIndex::At(i) => list.get_mut(i).ok_or_else(|| pointer.path_not_found(token))?,
                ListIndex::Append => return Err(pointer.path_not_found(token)),
            },
            _ => return Err(not_a_container(pointer, token)),
        };
    }
    match current {
        Value::Object(map) => Ok((ParentMut::Map(map), last)),
        Value::Array(list) => Ok((ParentMut::List(list), last)),
        _ => Err(not_a_container(pointer, last)),
    }
}

/// Look up the value a pointer addresses.
pub fn get<'a>(document: &'a Value, pointer: &Pointer) -> Result<&'a Value, PointerError> {
    if pointer.is_root() {
        return Ok(document);
    }
    let (parent, token) = resolve(document, pointer)?;
    let found = match parent {
        Parent::Map(map) => map.get(token),
        Parent::List(list) => match parse_list_token(pointer, token)? {
            ListIndex::At(i) => list.get(i),
            ListIndex::Append => None,
        },
    };
    found.ok_or_else(|| pointer.path_not_found(token))
}

fn not_a_container(pointer: &Pointer, token: &str) -> PointerError {
    PointerError::NotAContainer {
        pointer: pointer.to_string(),
        token: token.to_string(),
    }
}
