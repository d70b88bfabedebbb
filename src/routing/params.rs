//! Typed route parameters.
//!
//! # Responsibilities
//! - Name the placeholder types a template may declare
//! - Convert raw path segments into typed values
//! - Expose the bound values to handlers by name
//!
//! # Design Decisions
//! - Unknown type tags are rejected when the template is compiled, never per request
//! - Conversion errors carry the parameter name, the expected type and the raw value

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use uuid::Uuid;

/// Placeholder type declared in a route template (`<type:name>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    String,
    Int,
    Long,
    Uuid,
    Decimal,
    Bool,
}

impl ParamType {
    /// Resolve a type tag. `guid` is accepted as an alias of `uuid`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "string" => Some(Self::String),
            "int" => Some(Self::Int),
            "long" => Some(Self::Long),
            "uuid" | "guid" => Some(Self::Uuid),
            "decimal" => Some(Self::Decimal),
            "bool" => Some(Self::Bool),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Long => "long",
            Self::Uuid => "uuid",
            Self::Decimal => "decimal",
            Self::Bool => "bool",
        }
    }

    /// Convert a decoded path segment into a value of this type.
    pub fn convert(&self, raw: &str) -> Option<ParamValue> {
        match self {
            Self::String => Some(ParamValue::String(raw.to_string())),
            Self::Int => raw.parse().ok().map(ParamValue::Int),
            Self::Long => raw.parse().ok().map(ParamValue::Long),
            Self::Uuid => Uuid::parse_str(raw).ok().map(ParamValue::Uuid),
            Self::Decimal => Decimal::from_str(raw).ok().map(ParamValue::Decimal),
            Self::Bool => {
                if raw.eq_ignore_ascii_case("true") {
                    Some(ParamValue::Bool(true))
                } else if raw.eq_ignore_ascii_case("false") {
                    Some(ParamValue::Bool(false))
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A converted parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    Int(i32),
    Long(i64),
    Uuid(Uuid),
    Decimal(Decimal),
    Bool(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => f.write_str(v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}", v),
            Self::Uuid(v) => write!(f, "{}", v),
            Self::Decimal(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// Conversion failure for a single path parameter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid value '{raw}' for parameter '{name}' of type {param_type}")]
pub struct ParamError {
    pub name: String,
    pub param_type: ParamType,
    pub raw: String,
}

/// Extraction of a typed value out of a [`ParamValue`].
pub trait FromParamValue<'a>: Sized {
    fn from_param(value: &'a ParamValue) -> Option<Self>;
}

impl<'a> FromParamValue<'a> for &'a str {
    fn from_param(value: &'a ParamValue) -> Option<Self> {
        match value {
            ParamValue::String(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl FromParamValue<'_> for String {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::String(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromParamValue<'_> for i32 {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromParamValue<'_> for i64 {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Long(v) => Some(*v),
            ParamValue::Int(v) => Some(i64::from(*v)),
            _ => None,
        }
    }
}

impl FromParamValue<'_> for Uuid {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Uuid(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromParamValue<'_> for Decimal {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Decimal(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromParamValue<'_> for bool {
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Parameters bound by the winning route for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteParams {
    values: HashMap<String, ParamValue>,
}

impl RouteParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// Typed lookup. Returns `None` if the parameter is absent or of another type.
    pub fn get_as<'a, T: FromParamValue<'a>>(&'a self, name: &str) -> Option<T> {
        self.values.get(name).and_then(T::from_param)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}
