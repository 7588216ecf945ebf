//! Script evaluation backend.
//!
//! The dispatcher only knows the `Evaluator` trait: run a snippet in a
//! shared global scope and hand back a value or a failure. `JsContext` is
//! the QuickJS-backed implementation that owns the process-wide namespace.

pub mod inspect;
mod quickjs;

pub use quickjs::{EngineConfig, JsContext};

use serde_json::Value;
use thiserror::Error;

/// A failure raised while running a snippet.
///
/// `name` is the failure category (`ReferenceError`, `SyntaxError`, ...),
/// `message` its description. Both end up in the error response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct EvalError {
    pub name: String,
    pub message: String,
}

impl EvalError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Failure of the engine itself rather than of the script.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("InternalError", message)
    }
}

/// A persistent evaluation scope.
///
/// Every call may mutate the scope, and those mutations are visible to
/// all later calls. Implementations run each call to completion before
/// returning.
pub trait Evaluator {
    /// Run `code` for its side effects, discarding the completion value.
    fn execute(&mut self, code: &str) -> Result<(), EvalError>;

    /// Run `code` and return its completion value as JSON.
    ///
    /// Values JSON has no representation for (`undefined`, functions)
    /// come back as `null`; values JSON cannot encode (cycles) are errors.
    fn evaluate(&mut self, code: &str) -> Result<Value, EvalError>;

    /// Run `code` and return a human-readable rendering of its value.
    fn evaluate_rendered(&mut self, code: &str) -> Result<String, EvalError>;

    /// Bind `name` to `value` as a global variable.
    fn bind(&mut self, name: &str, value: &Value) -> Result<(), EvalError>;
}

/// Whether `name` can be declared with `var`.
///
/// Reserved words pass this check; the engine rejects them itself.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_' || first == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_identifier("x"));
        assert!(is_identifier("_private"));
        assert!(is_identifier("$el"));
        assert!(is_identifier("café2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("a.b"));
        assert!(!is_identifier("x = 1; y"));
        assert!(!is_identifier("a-b"));
    }

    #[test]
    fn eval_error_display() {
        let err = EvalError::new("TypeError", "x is not a function");
        assert_eq!(err.to_string(), "TypeError: x is not a function");
        assert_eq!(EvalError::internal("boom").name, "InternalError");
    }
}
