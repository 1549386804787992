//! FFI errors
//!
//! Two classes: declaration-time errors, raised while a binding is built and
//! never deferred, and call-time errors returned from an individual call.

use thiserror::Error;

use super::binding::ParamKind;
use super::types::FfiType;

/// Error type for FFI operations
#[derive(Debug, Clone, Error)]
pub enum FfiError {
    // -- declaration time: signature syntax -------------------------------
    /// Parameter kind that cannot be marshaled positionally
    #[error("parameter {name} must not be a {} parameter", .kind.description())]
    DisallowedParameter { name: String, kind: ParamKind },

    /// Parameter without a native type
    #[error("parameter {name} must have an annotation")]
    MissingAnnotation { name: String },

    /// Two parameters share a name, or two variadic parameters were declared
    #[error("duplicate parameter {name}")]
    DuplicateParameter { name: String },

    /// Parameter kinds out of order (positional-only, then positional or
    /// keyword, then variadic positional)
    #[error("{} parameter {name} follows {} parameter", .kind.description(), .after.description())]
    MisorderedParameter {
        name: String,
        kind: ParamKind,
        after: ParamKind,
    },

    /// A parameter without a default follows one with a default
    #[error("non-default parameter {name} follows default parameter")]
    NonTrailingDefault { name: String },

    /// C-style signature text could not be parsed
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    // -- declaration time: lookup -----------------------------------------
    /// Calling convention tag is not recognized
    #[error("unknown calling convention: {0}")]
    UnknownCallingConvention(String),

    /// Failed to load a library
    #[error("Load error: {0}")]
    LoadError(String),

    /// Symbol not found in library
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// Invalid symbol name
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    // -- call time --------------------------------------------------------
    /// Invalid argument count
    #[error("Invalid argument count: expected {expected}, got {got}")]
    InvalidArgCount { expected: usize, got: usize },

    /// A parameter received no positional, keyword, or default value
    #[error("missing argument for parameter {name} (position {position})")]
    MissingArgument { name: String, position: usize },

    /// Keyword argument names no parameter (strict keyword mode only)
    #[error("unexpected keyword argument {0}")]
    UnknownKeyword(String),

    /// Invalid argument type
    #[error("Invalid argument type: expected {expected}, got {got}")]
    InvalidArgType { expected: FfiType, got: FfiType },

    /// Too many arguments of one register class
    #[error("Too many {class} arguments: {count} (max {max})")]
    TooManyArgs {
        class: &'static str,
        count: usize,
        max: usize,
    },

    /// Argument layout the native call layer cannot express on this target
    #[error("Unsupported signature: {0}")]
    UnsupportedSignature(String),

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    ConversionError(String),
}

impl FfiError {
    /// Whether this error is raised while building a binding
    pub fn is_declaration_error(&self) -> bool {
        matches!(
            self,
            FfiError::DisallowedParameter { .. }
                | FfiError::MissingAnnotation { .. }
                | FfiError::DuplicateParameter { .. }
                | FfiError::MisorderedParameter { .. }
                | FfiError::NonTrailingDefault { .. }
                | FfiError::InvalidSignature(_)
                | FfiError::UnknownCallingConvention(_)
                | FfiError::LoadError(_)
                | FfiError::SymbolNotFound(_)
                | FfiError::InvalidSymbol(_)
        )
    }

    /// Whether this is a lookup failure (convention, library, or symbol)
    pub fn is_lookup_error(&self) -> bool {
        matches!(
            self,
            FfiError::UnknownCallingConvention(_)
                | FfiError::LoadError(_)
                | FfiError::SymbolNotFound(_)
                | FfiError::InvalidSymbol(_)
        )
    }
}

/// Result type for FFI operations
pub type FfiResult<T> = Result<T, FfiError>;
