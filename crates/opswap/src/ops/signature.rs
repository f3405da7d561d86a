//! Operator signatures and the argument view handed to meta, impl, and checker functions.
//!
//! A single [`Signature`] is shared by an operator's meta and impl functions, so both accept
//! identical static arguments by construction. Binding validates what the caller supplied and
//! fills declared defaults before either function runs.

use anyhow::{anyhow, Result};

use super::attrs::{AttrKind, AttrValue, Attrs};
use crate::error::SignatureError;

/// A tensor operand slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorParam {
    pub name: &'static str,
    pub optional: bool,
}

/// A static argument slot.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrParam {
    pub name: &'static str,
    pub kind: AttrKind,
    pub default: Option<AttrValue>,
}

/// Ordered tensor operands plus named static arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    tensors: Vec<TensorParam>,
    attrs: Vec<AttrParam>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tensor(mut self, name: &'static str) -> Self {
        self.tensors.push(TensorParam {
            name,
            optional: false,
        });
        self
    }

    pub fn optional_tensor(mut self, name: &'static str) -> Self {
        self.tensors.push(TensorParam {
            name,
            optional: true,
        });
        self
    }

    /// Declares a static argument with a default used when the caller omits it.
    pub fn attr(mut self, name: &'static str, kind: AttrKind, default: AttrValue) -> Self {
        self.attrs.push(AttrParam {
            name,
            kind,
            default: Some(default.coerce(kind)),
        });
        self
    }

    /// Declares a static argument the caller must always supply.
    pub fn required_attr(mut self, name: &'static str, kind: AttrKind) -> Self {
        self.attrs.push(AttrParam {
            name,
            kind,
            default: None,
        });
        self
    }

    pub fn tensors(&self) -> &[TensorParam] {
        &self.tensors
    }

    pub fn attrs(&self) -> &[AttrParam] {
        &self.attrs
    }

    /// Validates static arguments and returns them with defaults filled in.
    pub fn bind_attrs(&self, op: &str, attrs: &Attrs) -> Result<Attrs, SignatureError> {
        for (name, _) in attrs.iter() {
            if !self.attrs.iter().any(|param| param.name == name) {
                return Err(SignatureError::UnknownAttr {
                    op: op.to_string(),
                    attr: name.to_string(),
                });
            }
        }

        let mut bound = Attrs::new();
        for param in &self.attrs {
            let value = match attrs.get(param.name) {
                Some(value) => {
                    if !param.kind.accepts(value) {
                        return Err(SignatureError::AttrKindMismatch {
                            op: op.to_string(),
                            attr: param.name.to_string(),
                            expected: param.kind,
                            found: value.kind(),
                        });
                    }
                    value.coerce(param.kind)
                }
                None => param.default.ok_or_else(|| SignatureError::MissingAttr {
                    op: op.to_string(),
                    attr: param.name.to_string(),
                })?,
            };
            bound.set(param.name, value);
        }
        Ok(bound)
    }

    /// Validates operand count and presence of required tensors.
    pub fn check_operands<T>(&self, op: &str, operands: &[Option<T>]) -> Result<(), SignatureError> {
        if operands.len() != self.tensors.len() {
            return Err(SignatureError::TensorArity {
                op: op.to_string(),
                expected: self.tensors.len(),
                found: operands.len(),
            });
        }
        for (param, operand) in self.tensors.iter().zip(operands) {
            if operand.is_none() && !param.optional {
                return Err(SignatureError::MissingTensor {
                    op: op.to_string(),
                    name: param.name.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Positional tensor operands (absent optionals are `None`) plus bound static arguments.
///
/// `T` is [`TensorMeta`](crate::tensor::TensorMeta) for meta functions,
/// [`SymbolicTensor`](crate::tensor::SymbolicTensor) for checkers and transforms, and
/// [`Tensor`](crate::tensor::Tensor) for implementations.
#[derive(Debug, Clone, Copy)]
pub struct OpArgs<'a, T> {
    op: &'a str,
    tensors: &'a [Option<T>],
    attrs: &'a Attrs,
}

impl<'a, T> OpArgs<'a, T> {
    pub fn new(op: &'a str, tensors: &'a [Option<T>], attrs: &'a Attrs) -> Self {
        Self { op, tensors, attrs }
    }

    pub fn op_name(&self) -> &'a str {
        self.op
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Returns a required operand, failing when it is absent.
    pub fn tensor(&self, index: usize) -> Result<&'a T> {
        self.tensors
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| anyhow!("{}: tensor operand {} is absent", self.op, index))
    }

    /// Returns an optional operand; never fails, suitable for checkers.
    pub fn optional(&self, index: usize) -> Option<&'a T> {
        self.tensors.get(index).and_then(Option::as_ref)
    }

    pub fn tensors(&self) -> &'a [Option<T>] {
        self.tensors
    }

    pub fn attrs(&self) -> &'a Attrs {
        self.attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature() -> Signature {
        Signature::new()
            .tensor("x")
            .optional_tensor("mask")
            .attr("causal", AttrKind::Bool, AttrValue::Bool(false))
            .attr("scale", AttrKind::OptionalFloat, AttrValue::None)
            .required_attr("p", AttrKind::Float)
    }

    #[test]
    fn bind_fills_defaults_and_widens_ints() {
        let bound = signature()
            .bind_attrs("op", &Attrs::new().with("p", 1i64))
            .unwrap();
        assert_eq!(bound.get("causal"), Some(&AttrValue::Bool(false)));
        assert_eq!(bound.get("scale"), Some(&AttrValue::None));
        assert_eq!(bound.get("p"), Some(&AttrValue::Float(1.0)));
    }

    #[test]
    fn bind_rejects_unknown_missing_and_mismatched() {
        let sig = signature();
        let unknown = sig
            .bind_attrs("op", &Attrs::new().with("p", 0.0).with("bogus", true))
            .unwrap_err();
        assert!(matches!(unknown, SignatureError::UnknownAttr { .. }));

        let missing = sig.bind_attrs("op", &Attrs::new()).unwrap_err();
        assert!(matches!(missing, SignatureError::MissingAttr { .. }));

        let mismatched = sig
            .bind_attrs("op", &Attrs::new().with("p", 0.0).with("causal", 1.5))
            .unwrap_err();
        assert!(matches!(
            mismatched,
            SignatureError::AttrKindMismatch {
                expected: AttrKind::Bool,
                found: AttrKind::Float,
                ..
            }
        ));
    }

    #[test]
    fn operands_require_non_optional_slots() {
        let sig = signature();
        assert!(sig.check_operands::<u8>("op", &[Some(1), None]).is_ok());
        assert!(matches!(
            sig.check_operands::<u8>("op", &[None, Some(1)]),
            Err(SignatureError::MissingTensor { .. })
        ));
        assert!(matches!(
            sig.check_operands::<u8>("op", &[Some(1)]),
            Err(SignatureError::TensorArity { .. })
        ));
    }
}
