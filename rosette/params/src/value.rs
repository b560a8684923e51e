use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar value held by the parameter store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
}

impl ParamValue {
    /// Short name of the stored kind, used in diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Rust types that can be read back from a [`ParamValue`].
///
/// Conversions are strict: an `Int` is not returned as a float and a `Text`
/// is never parsed. Narrower integer types accept an `Int` only when it fits.
pub trait ParamType: Sized {
    /// Extracts `Self` when the stored kind matches.
    fn from_param(value: &ParamValue) -> Option<Self>;
}

impl ParamType for bool {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl ParamType for i64 {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

macro_rules! narrow_int {
    ($($ty:ty),*) => {
        $(
            impl ParamType for $ty {
                fn from_param(value: &ParamValue) -> Option<Self> {
                    match value {
                        ParamValue::Int(i) => <$ty>::try_from(*i).ok(),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for ParamValue {
                fn from(value: $ty) -> Self {
                    Self::Int(i64::from(value))
                }
            }
        )*
    };
}

narrow_int!(i32, u32, u16, u8);

impl ParamType for u64 {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Int(i) => Self::try_from(*i).ok(),
            _ => None,
        }
    }
}

impl ParamType for f64 {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Float(x) => Some(*x),
            _ => None,
        }
    }
}

impl ParamType for String {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl ParamType for ParamValue {
    fn from_param(value: &ParamValue) -> Option<Self> {
        Some(value.clone())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}
