//! Owned property values.

use std::collections::HashMap;

use zbus::zvariant;

/// The current properties of one interface on one object, keyed by property name.
pub type PropertyBag = HashMap<String, Value>;

/// An owned D-Bus property value.
///
/// BlueZ properties only use a handful of D-Bus types; anything else is kept around as
/// [`Value::Other`] holding a debug rendering, since this library never inspects it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    String(String),
    ObjectPath(String),
    Bytes(Vec<u8>),
    Strings(Vec<String>),
    Other(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            Self::Strings(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            Self::Int16(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Self::UInt16(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts to a [`zvariant::Value`] for writing. [`Value::Other`] can't be written back.
    pub(crate) fn to_zvariant(&self) -> Option<zvariant::Value<'_>> {
        Some(match self {
            Self::Bool(v) => zvariant::Value::Bool(*v),
            Self::Byte(v) => zvariant::Value::U8(*v),
            Self::Int16(v) => zvariant::Value::I16(*v),
            Self::UInt16(v) => zvariant::Value::U16(*v),
            Self::Int32(v) => zvariant::Value::I32(*v),
            Self::UInt32(v) => zvariant::Value::U32(*v),
            Self::String(s) => zvariant::Value::from(s.as_str()),
            Self::ObjectPath(s) => zvariant::ObjectPath::try_from(s.as_str()).ok()?.into(),
            Self::Bytes(b) => zvariant::Value::from(b.clone()),
            Self::Strings(s) => zvariant::Value::from(s.clone()),
            Self::Other(_) => return None,
        })
    }
}

impl From<&zvariant::Value<'_>> for Value {
    fn from(value: &zvariant::Value<'_>) -> Self {
        match value {
            zvariant::Value::Bool(v) => Self::Bool(*v),
            zvariant::Value::U8(v) => Self::Byte(*v),
            zvariant::Value::I16(v) => Self::Int16(*v),
            zvariant::Value::U16(v) => Self::UInt16(*v),
            zvariant::Value::I32(v) => Self::Int32(*v),
            zvariant::Value::U32(v) => Self::UInt32(*v),
            zvariant::Value::Str(s) => Self::String(s.as_str().to_string()),
            zvariant::Value::ObjectPath(p) => Self::ObjectPath(p.as_str().to_string()),
            zvariant::Value::Value(inner) => Self::from(&**inner),
            zvariant::Value::Array(array) => {
                let items = array.get();
                let converted = match array.element_signature().as_str() {
                    "y" => items
                        .iter()
                        .map(|v| match v {
                            zvariant::Value::U8(b) => Some(*b),
                            _ => None,
                        })
                        .collect::<Option<Vec<_>>>()
                        .map(Self::Bytes),
                    "s" => items
                        .iter()
                        .map(|v| match v {
                            zvariant::Value::Str(s) => Some(s.as_str().to_string()),
                            _ => None,
                        })
                        .collect::<Option<Vec<_>>>()
                        .map(Self::Strings),
                    _ => None,
                };
                converted.unwrap_or_else(|| Self::Other(format!("{:?}", value)))
            }
            other => Self::Other(format!("{:?}", other)),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Self::Int16(value)
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Self::UInt16(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Self::Strings(value)
    }
}
