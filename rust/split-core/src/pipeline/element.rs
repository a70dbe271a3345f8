// rust/split-core/src/pipeline/element.rs

use std::fmt;

use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::error::{Result, SplitError};

/// A single value flowing through a pipeline.
///
/// Elements are totally ordered so that tests and callers can compare
/// unordered outputs as sorted multisets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Element {
    Int(i64),
    Bytes(Vec<u8>),
    Tuple(Vec<Element>),
}

impl Element {
    /// Returns the integer payload, or an execution error for other variants.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Element::Int(v) => Ok(*v),
            other => Err(SplitError::execution(format!(
                "expected an integer element, got {other}"
            ))),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Element::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn tuple(items: impl IntoIterator<Item = Element>) -> Self {
        Element::Tuple(items.into_iter().collect())
    }
}

impl From<i64> for Element {
    fn from(v: i64) -> Self {
        Element::Int(v)
    }
}

impl From<&str> for Element {
    fn from(v: &str) -> Self {
        Element::Bytes(v.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Element {
    fn from(v: &[u8]) -> Self {
        Element::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Element {
    fn from(v: Vec<u8>) -> Self {
        Element::Bytes(v)
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Int(v) => write!(f, "{v}"),
            Element::Bytes(b) => write!(f, "b\"{}\"", String::from_utf8_lossy(b)),
            Element::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

// Integers as numbers, bytes as (lossy) strings, tuples as arrays.
impl Serialize for Element {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Element::Int(v) => serializer.serialize_i64(*v),
            Element::Bytes(b) => serializer.serialize_str(&String::from_utf8_lossy(b)),
            Element::Tuple(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_int() {
        assert_eq!(Element::Int(7).as_int().unwrap(), 7);
        assert!(Element::from("foo").as_int().is_err());
    }

    #[test]
    fn test_display_nested_tuple() {
        let e = Element::tuple([Element::Int(1), Element::tuple([Element::Int(2), "x".into()])]);
        assert_eq!(e.to_string(), "(1, (2, b\"x\"))");
    }

    #[test]
    fn test_serialize_json() {
        let e = Element::tuple([Element::Int(3), Element::from("bar")]);
        assert_eq!(serde_json::to_string(&e).unwrap(), r#"[3,"bar"]"#);
    }

    #[test]
    fn test_ordering_allows_multiset_compare() {
        let mut a = vec![Element::Int(3), Element::Int(1), Element::Int(2)];
        a.sort();
        assert_eq!(a, vec![Element::Int(1), Element::Int(2), Element::Int(3)]);
    }
}
