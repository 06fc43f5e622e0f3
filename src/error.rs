//! Error types for the bytecode execution core

use thiserror::Error;

use crate::value::TVal;

/// Main error type for the executor.
///
/// Script-level throws carry the thrown value in `Thrown`; the other variants
/// are raised by the core itself and are converted into plain error objects
/// when a `try` catcher receives them.
#[derive(Debug, Error)]
pub enum JsError {
    #[error("TypeError: {message}")]
    TypeError { message: String },

    #[error("ReferenceError: {message}")]
    ReferenceError { message: String },

    #[error("RangeError: {message}")]
    RangeError { message: String },

    #[error("InternalError: {message}")]
    Internal { message: String },

    /// A script value was thrown (via the THROW opcode, a getter, a coercion,
    /// or across a thread boundary).
    #[error("uncaught: {value:?}")]
    Thrown { value: TVal },

    /// Sentinel: the heap's longjmp state has been armed and the executor
    /// loop must dispatch it through the unwinder.  Never escapes `execute`.
    #[error("unwind in progress")]
    Unwind,
}

impl JsError {
    pub fn type_error(message: impl Into<String>) -> Self {
        JsError::TypeError {
            message: message.into(),
        }
    }

    pub fn reference_error(message: impl Into<String>) -> Self {
        JsError::ReferenceError {
            message: message.into(),
        }
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        JsError::RangeError {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        JsError::Internal {
            message: message.into(),
        }
    }

    pub fn thrown(value: TVal) -> Self {
        JsError::Thrown { value }
    }

    /// The `name` property of the error object this error converts to.
    pub fn error_name(&self) -> &'static str {
        match self {
            JsError::TypeError { .. } => "TypeError",
            JsError::ReferenceError { .. } => "ReferenceError",
            JsError::RangeError { .. } => "RangeError",
            JsError::Internal { .. } => "InternalError",
            JsError::Thrown { .. } | JsError::Unwind => "Error",
        }
    }

    /// The `message` property of the error object this error converts to.
    pub fn error_message(&self) -> &str {
        match self {
            JsError::TypeError { message }
            | JsError::ReferenceError { message }
            | JsError::RangeError { message }
            | JsError::Internal { message } => message,
            JsError::Thrown { .. } | JsError::Unwind => "",
        }
    }
}
