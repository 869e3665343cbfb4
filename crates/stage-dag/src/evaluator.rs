//! The pluggable transaction-function evaluator.

use stage_types::{Params, TransFnId, Value};

use crate::error::DagError;

/// Resolves a [`TransFnId`] into a pure `(value, params) -> value` mapping
/// and applies it.
///
/// Kept as a trait object so a deployment can register additional
/// transaction functions (or resolve `TransFnId`s that are themselves
/// content addresses of stored function source) without touching the
/// materializer.
pub trait Evaluator: Send + Sync {
    /// A short, stable name identifying this evaluator's function set. Used
    /// as part of the [`crate::cache::CommitValueCache`] key so that two
    /// evaluators never share memoized values.
    fn name(&self) -> &str;

    /// Apply `trans_fn` to `value` with `params`, producing the next value.
    fn apply(&self, trans_fn: &TransFnId, value: &Value, params: &Params) -> Result<Value, DagError>;
}

/// The evaluator shipped by default: the two built-in transaction
/// functions, `"set"` and `"merge"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEvaluator;

impl BuiltinEvaluator {
    /// Construct the built-in evaluator.
    pub fn new() -> Self {
        Self
    }

    fn set(_value: &Value, params: &Params) -> Value {
        params.clone()
    }

    fn merge(value: &Value, params: &Params) -> Value {
        match (value, params) {
            (Value::Object(base), Value::Object(overlay)) => {
                let mut merged = base.clone();
                for (k, v) in overlay {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            (_, overlay) => overlay.clone(),
        }
    }
}

impl Evaluator for BuiltinEvaluator {
    fn name(&self) -> &str {
        "builtin"
    }

    fn apply(&self, trans_fn: &TransFnId, value: &Value, params: &Params) -> Result<Value, DagError> {
        match trans_fn.0.as_str() {
            "set" => Ok(Self::set(value, params)),
            "merge" => Ok(Self::merge(value, params)),
            _ => Err(DagError::UnknownTransFn(trans_fn.clone())),
        }
    }
}
