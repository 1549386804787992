//! FFI Module
//!
//! Typed bindings to entry points in native shared libraries.
//!
//! # Architecture
//!
//! ```text
//! ExternDecl (params, return type, transform)
//!       │
//!       ▼
//! Binder::build ── CallSignature (types, defaults, name → position)
//!       │
//!       ▼
//! LibraryCache (libloading, opened once per name)
//!       │
//!       ▼
//! ExternFn::call ── bind args ── lower frame ── native call ── transform
//! ```
//!
//! # Example
//!
//! ```no_run
//! use extern_bind::ffi::{bind, CallArgs, ExternDecl, FfiType, FfiValue, Param};
//!
//! let abs = bind("libc.so.6")
//!     .build(
//!         ExternDecl::new("abs")
//!             .param(Param::new("x", FfiType::I32))
//!             .returns(FfiType::I32),
//!     )
//!     .unwrap();
//!
//! assert_eq!(abs.call(CallArgs::new().arg(-7)).unwrap(), FfiValue::Int(7));
//! ```

mod binding;
mod error;
mod loader;
mod types;

pub use binding::{
    bind, Binder, CallArgs, CallSignature, ExternDecl, ExternFn, Param, ParamKind,
    ResultTransform,
};
pub use error::{FfiError, FfiResult};
pub use loader::{
    CallingConvention, DynamicLibrary, LibraryCache, MAX_FLOAT_ARGS, MAX_INT_ARGS,
};
pub use types::{FfiSignature, FfiType, FfiValue};
