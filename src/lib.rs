//! extern-bind - typed bindings to native library entry points
//!
//! Declare a foreign function once (its parameters, their native types and
//! defaults, its return type and an optional result transform) and get back a
//! callable that marshals positional and keyword arguments into a native call.
//!
//! # Example
//!
//! ```no_run
//! use extern_bind::{bind, CallArgs, ExternDecl, FfiType, FfiValue, Param};
//!
//! // double pow(double x, double y = 2.0)
//! let pow = bind("libm.so.6")
//!     .build(
//!         ExternDecl::new("pow")
//!             .param(Param::new("x", FfiType::F64))
//!             .param(Param::new("y", FfiType::F64).with_default(2.0))
//!             .returns(FfiType::F64),
//!     )
//!     .unwrap();
//!
//! assert_eq!(pow.call(CallArgs::new().arg(3.0)).unwrap(), FfiValue::Float(9.0));
//! assert_eq!(
//!     pow.call(CallArgs::new().arg(2.0).kwarg("y", 10)).unwrap(),
//!     FfiValue::Float(1024.0)
//! );
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────────┐
//! │  ExternDecl      │   │  bindings.toml   │
//! │  (in code)       │   │  (config)        │
//! └────────┬─────────┘   └────────┬─────────┘
//!          └──────────┬───────────┘
//!                     ▼
//!          ┌──────────────────────┐
//!          │  Binder::build       │  signature, library, symbol
//!          └──────────┬───────────┘
//!                     ▼
//!          ┌──────────────────────┐
//!          │  ExternFn::call      │  defaults, keywords, native call
//!          └──────────────────────┘
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod ffi;

pub use config::{BindingManifest, ConfigError};
pub use ffi::{
    bind, Binder, CallArgs, CallSignature, CallingConvention, ExternDecl, ExternFn, FfiError,
    FfiType, FfiValue, LibraryCache, Param, ParamKind, ResultTransform,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
