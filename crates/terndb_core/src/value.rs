//! The dynamic value type used by the object API.

use crate::keys::ObjKey;
use crate::schema::ColumnType;
use std::fmt;

/// A dynamically typed cell value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    /// Null.
    Null,
    /// 64-bit signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    String(String),
    /// Byte blob.
    Binary(Vec<u8>),
    /// Link to an object.
    Link(ObjKey),
}

impl Value {
    /// True if this is [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// True if this value is storable in a column of `col_type`.
    #[must_use]
    pub fn fits(&self, col_type: ColumnType) -> bool {
        matches!(
            (self, col_type),
            (Self::Null, _)
                | (Self::Int(_), ColumnType::Int)
                | (Self::Bool(_), ColumnType::Bool)
                | (Self::String(_), ColumnType::String)
                | (Self::Binary(_), ColumnType::Binary)
                | (Self::Link(_), ColumnType::Link)
        )
    }

    /// The integer payload, if any.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The boolean payload, if any.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// The string payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// The binary payload, if any.
    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(value) => Some(value),
            _ => None,
        }
    }

    /// The link payload, if any.
    #[must_use]
    pub fn as_link(&self) -> Option<ObjKey> {
        match self {
            Self::Link(key) => Some(*key),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Binary(value) => write!(f, "<{} bytes>", value.len()),
            Self::Link(key) => write!(f, "{key}"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<ObjKey> for Value {
    fn from(key: ObjKey) -> Self {
        Self::Link(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_by_type() {
        assert!(Value::Int(3).fits(ColumnType::Int));
        assert!(!Value::Int(3).fits(ColumnType::String));
        assert!(Value::Null.fits(ColumnType::Int));
        assert!(Value::Link(ObjKey::new(1)).fits(ColumnType::Link));
    }

    #[test]
    fn accessors() {
        assert_eq!(Value::Int(5).as_int(), Some(5));
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::Null.as_int(), None);
    }
}
