//! Error types for the tierjit engine
//!
//! Two families of errors leave the engine. User-level errors (a thrown value,
//! a `TypeError` raised by the language semantics) propagate identically out of
//! both tiers. Fatal errors indicate a bug in the engine itself: malformed
//! bytecode or an optimized frame the deoptimizer cannot reconstruct.
//! Guard failures and compile failures are handled internally and never show
//! up here.

use crate::engine::FunctionId;
use crate::runtime::Value;
use std::fmt;
use thiserror::Error;

/// Main error type for tierjit
#[derive(Error, Debug)]
pub enum Error {
    /// A value thrown by the executed program
    #[error("Uncaught {0}")]
    Exception(Value),

    /// TypeError, ReferenceError, RangeError raised by the language semantics
    #[error("{kind}: {message}")]
    RuntimeError { kind: ErrorKind, message: String },

    /// The deoptimizer or the optimized tier observed an impossible state
    #[error("InvariantViolation: {0}")]
    InvariantViolation(String),

    /// Bytecode that cannot be decoded or executed
    #[error("MalformedBytecode: {message} at offset {offset}")]
    MalformedBytecode { offset: usize, message: String },

    /// The host referenced a function that was never defined
    #[error("UnknownFunction: {0}")]
    UnknownFunction(FunctionId),

    /// `generator_next` was called on something that is not a generator
    #[error("TypeError: not a generator object")]
    NotAGenerator,

    /// A generator was resumed while it was already executing
    #[error("TypeError: generator is already running")]
    GeneratorRunning,

    /// Invalid engine configuration
    #[error("ConfigError: {0}")]
    Config(String),

    /// IO error while loading configuration
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Language-level error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum ErrorKind {
    /// TypeError - wrong type for operation
    TypeError,
    /// ReferenceError - undefined global
    ReferenceError,
    /// RangeError - value out of range, stack overflow
    RangeError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::TypeError => write!(f, "TypeError"),
            ErrorKind::ReferenceError => write!(f, "ReferenceError"),
            ErrorKind::RangeError => write!(f, "RangeError"),
        }
    }
}

impl Error {
    /// Create a TypeError
    pub fn type_error(message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind: ErrorKind::TypeError,
            message: message.into(),
        }
    }

    /// Create a ReferenceError
    pub fn reference_error(message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind: ErrorKind::ReferenceError,
            message: message.into(),
        }
    }

    /// Create a RangeError
    pub fn range_error(message: impl Into<String>) -> Self {
        Error::RuntimeError {
            kind: ErrorKind::RangeError,
            message: message.into(),
        }
    }

    /// Create a malformed-bytecode error
    pub fn malformed(offset: usize, message: impl Into<String>) -> Self {
        Error::MalformedBytecode {
            offset,
            message: message.into(),
        }
    }

    /// Create an invariant violation
    pub fn invariant(message: impl Into<String>) -> Self {
        Error::InvariantViolation(message.into())
    }

    /// Whether this error belongs to the fatal class.
    ///
    /// Fatal errors mean the engine has no safe continuation; user-level
    /// errors are ordinary program behavior.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvariantViolation(_) | Error::MalformedBytecode { .. }
        )
    }

    /// Whether this error is observable program behavior (a throw)
    pub fn is_user_level(&self) -> bool {
        matches!(self, Error::Exception(_) | Error::RuntimeError { .. })
    }
}

/// Result type alias for tierjit operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::type_error("Cannot read properties of undefined (reading 'x')");
        assert_eq!(
            err.to_string(),
            "TypeError: Cannot read properties of undefined (reading 'x')"
        );

        let err = Error::Exception(Value::Number(42.0));
        assert_eq!(err.to_string(), "Uncaught 42");
    }

    #[test]
    fn test_error_classes() {
        assert!(Error::invariant("lost register").is_fatal());
        assert!(Error::malformed(3, "bad opcode").is_fatal());
        assert!(!Error::range_error("too deep").is_fatal());
        assert!(Error::range_error("too deep").is_user_level());
        assert!(!Error::NotAGenerator.is_user_level());
    }
}
