//! Static (non-tensor) operator arguments.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Result};

/// Declared kind of a static argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKind {
    Bool,
    Int,
    Float,
    /// A float that may be left unset (`AttrValue::None`).
    OptionalFloat,
}

impl AttrKind {
    /// Whether a value of this kind can be bound from `value`.
    ///
    /// Integers widen into float slots; `None` only fits optional slots.
    pub fn accepts(self, value: &AttrValue) -> bool {
        matches!(
            (self, value),
            (AttrKind::Bool, AttrValue::Bool(_))
                | (AttrKind::Int, AttrValue::Int(_))
                | (AttrKind::Float, AttrValue::Float(_) | AttrValue::Int(_))
                | (
                    AttrKind::OptionalFloat,
                    AttrValue::Float(_) | AttrValue::Int(_) | AttrValue::None
                )
        )
    }
}

/// A static argument value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    None,
}

impl AttrValue {
    pub fn kind(&self) -> AttrKind {
        match self {
            AttrValue::Bool(_) => AttrKind::Bool,
            AttrValue::Int(_) => AttrKind::Int,
            AttrValue::Float(_) => AttrKind::Float,
            AttrValue::None => AttrKind::OptionalFloat,
        }
    }

    /// Normalises the value for a slot of `kind` (int → float widening).
    pub(crate) fn coerce(self, kind: AttrKind) -> AttrValue {
        match (kind, self) {
            (AttrKind::Float | AttrKind::OptionalFloat, AttrValue::Int(v)) => {
                AttrValue::Float(v as f64)
            }
            (_, value) => value,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<f32> for AttrValue {
    fn from(value: f32) -> Self {
        AttrValue::Float(value as f64)
    }
}

impl<T: Into<AttrValue>> From<Option<T>> for AttrValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(AttrValue::None)
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::None => f.write_str("none"),
        }
    }
}

/// Named static arguments of a single operator invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attrs {
    values: BTreeMap<String, AttrValue>,
}

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<AttrValue>) {
        self.values.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        match self.values.get(name) {
            Some(AttrValue::Bool(v)) => Ok(*v),
            other => Err(anyhow!("static argument '{name}' is not a bool: {other:?}")),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        match self.values.get(name) {
            Some(AttrValue::Int(v)) => Ok(*v),
            other => Err(anyhow!("static argument '{name}' is not an int: {other:?}")),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64> {
        match self.values.get(name) {
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(AttrValue::Int(v)) => Ok(*v as f64),
            other => Err(anyhow!("static argument '{name}' is not a float: {other:?}")),
        }
    }

    /// Reads an optional float; a missing entry and an explicit `None` both read as `None`.
    pub fn opt_float(&self, name: &str) -> Result<Option<f64>> {
        match self.values.get(name) {
            None | Some(AttrValue::None) => Ok(None),
            Some(AttrValue::Float(v)) => Ok(Some(*v)),
            Some(AttrValue::Int(v)) => Ok(Some(*v as f64)),
            Some(other) => Err(anyhow!(
                "static argument '{name}' is not an optional float: {other:?}"
            )),
        }
    }
}

impl fmt::Display for Attrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, (name, value)) in self.values.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}
