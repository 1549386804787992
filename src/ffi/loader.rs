//! Dynamic Library Loader
//!
//! Opens shared libraries through libloading, keeps every handle in a
//! process-wide cache, and performs the raw native call for a bound entry
//! point.

use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libloading::{Library, Symbol};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::types::narrow_integer;
use super::{FfiError, FfiResult, FfiType, FfiValue};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("the native call frame assumes 64-bit argument slots");

/// Integer-class arguments (integers, pointers, strings) per call
pub const MAX_INT_ARGS: usize = 8;

/// Floating-point arguments per call
pub const MAX_FLOAT_ARGS: usize = 8;

// =============================================================================
// Calling conventions
// =============================================================================

/// ABI used to call a bound entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CallingConvention {
    /// Platform default C convention (caller cleans the stack)
    #[default]
    #[serde(rename = "__cdecl")]
    Cdecl,
    /// Callee cleans the stack. Only distinct from `Cdecl` on 32-bit Windows;
    /// everywhere else it is the system ABI.
    #[serde(rename = "__stdcall")]
    Stdcall,
}

impl CallingConvention {
    /// Recognized tags
    pub const TAGS: [&'static str; 2] = ["__cdecl", "__stdcall"];

    pub fn tag(&self) -> &'static str {
        match self {
            CallingConvention::Cdecl => "__cdecl",
            CallingConvention::Stdcall => "__stdcall",
        }
    }
}

impl FromStr for CallingConvention {
    type Err = FfiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "__cdecl" => Ok(CallingConvention::Cdecl),
            "__stdcall" => Ok(CallingConvention::Stdcall),
            other => Err(FfiError::UnknownCallingConvention(other.to_string())),
        }
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// =============================================================================
// Libraries
// =============================================================================

/// A dynamically loaded library
pub struct DynamicLibrary {
    /// Name the library was opened with
    name: String,
    /// The loaded library handle
    library: Library,
}

impl DynamicLibrary {
    /// Open a library by name or path using the OS dynamic loader search.
    pub fn open(name: &str) -> FfiResult<Self> {
        // Safety: loading a library runs its initializers. We trust the
        // caller-provided name the same way the OS loader would.
        let library = unsafe {
            Library::new(name).map_err(|e| {
                FfiError::LoadError(format!("Failed to load library '{}': {}", name, e))
            })?
        };

        Ok(Self {
            name: name.to_string(),
            library,
        })
    }

    /// Get the name this library was opened with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve a symbol to its address
    pub fn get_symbol(&self, name: &str) -> FfiResult<usize> {
        let c_name = CString::new(name)
            .map_err(|_| FfiError::InvalidSymbol(format!("Invalid symbol name: {}", name)))?;

        // Safety: the symbol is only read as an address here. Its type is
        // asserted later by the binding's declared signature.
        let symbol: Symbol<*const ()> = unsafe {
            self.library.get(c_name.as_bytes_with_nul()).map_err(|e| {
                FfiError::SymbolNotFound(format!(
                    "Symbol '{}' not found in '{}': {}",
                    name, self.name, e
                ))
            })?
        };

        let addr = *symbol as usize;
        if addr == 0 {
            return Err(FfiError::SymbolNotFound(format!(
                "Symbol '{}' in '{}' resolves to null",
                name, self.name
            )));
        }
        Ok(addr)
    }
}

impl fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicLibrary")
            .field("name", &self.name)
            .finish()
    }
}

static GLOBAL_CACHE: Lazy<Arc<LibraryCache>> = Lazy::new(|| Arc::new(LibraryCache::new()));

/// Library handles keyed by the name they were requested with.
///
/// Entries are never removed; a handle lives as long as the cache. The lock is
/// held across the open so concurrent first use of a name opens it once.
#[derive(Debug, Default)]
pub struct LibraryCache {
    /// Loaded libraries
    libraries: Mutex<HashMap<String, Arc<DynamicLibrary>>>,
    /// Successful opens, for diagnostics
    opens: AtomicUsize,
}

impl LibraryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache used by default
    pub fn global() -> Arc<LibraryCache> {
        Arc::clone(&GLOBAL_CACHE)
    }

    /// Return the cached handle for `name`, opening it on first use
    pub fn get_or_open(&self, name: &str) -> FfiResult<Arc<DynamicLibrary>> {
        let mut libraries = self.libraries.lock();
        if let Some(lib) = libraries.get(name) {
            return Ok(Arc::clone(lib));
        }

        let lib = Arc::new(DynamicLibrary::open(name)?);
        self.opens.fetch_add(1, Ordering::Relaxed);
        libraries.insert(name.to_string(), Arc::clone(&lib));
        Ok(lib)
    }

    /// Number of libraries actually opened through this cache
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    /// List loaded libraries
    pub fn loaded_libraries(&self) -> Vec<String> {
        let mut names: Vec<String> = self.libraries.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

// =============================================================================
// Native calls
// =============================================================================
//
// Every call goes through one fixed-width frame: eight integer-register slots
// and eight float-register slots, zero-padded. On the System V and AAPCS64
// ABIs the two register files are assigned independently and in order, and
// the caller cleans up, so unused trailing slots are ignored by the callee.
// Windows x64 assigns slots by position, so there a frame holds one class only.

type IntsFirstC<R> = unsafe extern "C" fn(
    u64, u64, u64, u64, u64, u64, u64, u64,
    f64, f64, f64, f64, f64, f64, f64, f64,
) -> R;

type FloatsFirstC<R> = unsafe extern "C" fn(
    f64, f64, f64, f64, f64, f64, f64, f64,
    u64, u64, u64, u64, u64, u64, u64, u64,
) -> R;

type IntsFirstSystem<R> = unsafe extern "system" fn(
    u64, u64, u64, u64, u64, u64, u64, u64,
    f64, f64, f64, f64, f64, f64, f64, f64,
) -> R;

type FloatsFirstSystem<R> = unsafe extern "system" fn(
    f64, f64, f64, f64, f64, f64, f64, f64,
    u64, u64, u64, u64, u64, u64, u64, u64,
) -> R;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameLayout {
    IntsFirst,
    FloatsFirst,
}

/// Arguments lowered into register classes, ready for a native call.
///
/// Borrows the argument values so buffer pointers stay valid, and owns the
/// NUL-terminated copies of any strings.
pub(crate) struct NativeFrame<'a> {
    ints: [u64; MAX_INT_ARGS],
    floats: [f64; MAX_FLOAT_ARGS],
    int_count: usize,
    float_count: usize,
    layout: FrameLayout,
    _strings: Vec<CString>,
    _args: PhantomData<&'a [FfiValue]>,
}

impl<'a> NativeFrame<'a> {
    /// Lower `args` using `types` for the declared positions; extra trailing
    /// arguments use their own natural type.
    pub(crate) fn lower(args: &'a [FfiValue], types: &[FfiType]) -> FfiResult<Self> {
        let arg_type = |i: usize, value: &FfiValue| types.get(i).copied().unwrap_or(value.get_type());

        let float_total = args
            .iter()
            .enumerate()
            .filter(|(i, v)| arg_type(*i, v).is_float())
            .count();
        let int_total = args.len() - float_total;
        if int_total > MAX_INT_ARGS {
            return Err(FfiError::TooManyArgs {
                class: "integer",
                count: int_total,
                max: MAX_INT_ARGS,
            });
        }
        if float_total > MAX_FLOAT_ARGS {
            return Err(FfiError::TooManyArgs {
                class: "float",
                count: float_total,
                max: MAX_FLOAT_ARGS,
            });
        }

        let mut frame = Self {
            ints: [0; MAX_INT_ARGS],
            floats: [0.0; MAX_FLOAT_ARGS],
            int_count: 0,
            float_count: 0,
            layout: frame_layout(int_total, float_total)?,
            _strings: Vec::new(),
            _args: PhantomData,
        };

        for (i, value) in args.iter().enumerate() {
            let ty = arg_type(i, value);
            let mismatch = || FfiError::InvalidArgType {
                expected: ty,
                got: value.get_type(),
            };

            if ty.is_float() {
                let v = value.as_f64().ok_or_else(mismatch)?;
                // f32 travels in the low 32 bits of the float register
                frame.floats[frame.float_count] = if ty == FfiType::F32 {
                    f64::from_bits((v as f32).to_bits() as u64)
                } else {
                    v
                };
                frame.float_count += 1;
                continue;
            }

            let word = match value {
                FfiValue::Int(v) => *v as u64,
                FfiValue::UInt(v) => *v,
                FfiValue::Pointer(p) => *p as u64,
                FfiValue::String(s) => {
                    let c_string = CString::new(s.as_str())
                        .map_err(|e| FfiError::ConversionError(e.to_string()))?;
                    let ptr = c_string.as_ptr() as u64;
                    frame._strings.push(c_string);
                    ptr
                }
                FfiValue::Buffer(bytes) => bytes.as_ptr() as u64,
                FfiValue::Float(_) | FfiValue::Void => return Err(mismatch()),
            };
            frame.ints[frame.int_count] = word;
            frame.int_count += 1;
        }

        Ok(frame)
    }

    #[cfg_attr(not(feature = "trace"), allow(dead_code))]
    pub(crate) fn int_count(&self) -> usize {
        self.int_count
    }

    #[cfg_attr(not(feature = "trace"), allow(dead_code))]
    pub(crate) fn float_count(&self) -> usize {
        self.float_count
    }
}

fn frame_layout(int_count: usize, float_count: usize) -> FfiResult<FrameLayout> {
    if cfg!(windows) {
        match (int_count, float_count) {
            (_, 0) => Ok(FrameLayout::IntsFirst),
            (0, _) => Ok(FrameLayout::FloatsFirst),
            _ => Err(FfiError::UnsupportedSignature(
                "mixed integer and floating point arguments".to_string(),
            )),
        }
    } else {
        Ok(FrameLayout::IntsFirst)
    }
}

macro_rules! invoke_frame {
    ($f:expr, ints_first, $i:expr, $x:expr) => {
        $f(
            $i[0], $i[1], $i[2], $i[3], $i[4], $i[5], $i[6], $i[7],
            $x[0], $x[1], $x[2], $x[3], $x[4], $x[5], $x[6], $x[7],
        )
    };
    ($f:expr, floats_first, $i:expr, $x:expr) => {
        $f(
            $x[0], $x[1], $x[2], $x[3], $x[4], $x[5], $x[6], $x[7],
            $i[0], $i[1], $i[2], $i[3], $i[4], $i[5], $i[6], $i[7],
        )
    };
}

macro_rules! native_caller {
    ($name:ident, $ret:ty) => {
        unsafe fn $name(address: usize, convention: CallingConvention, frame: &NativeFrame<'_>) -> $ret {
            let (i, x) = (&frame.ints, &frame.floats);
            match (convention, frame.layout) {
                (CallingConvention::Cdecl, FrameLayout::IntsFirst) => {
                    let f = std::mem::transmute::<usize, IntsFirstC<$ret>>(address);
                    invoke_frame!(f, ints_first, i, x)
                }
                (CallingConvention::Cdecl, FrameLayout::FloatsFirst) => {
                    let f = std::mem::transmute::<usize, FloatsFirstC<$ret>>(address);
                    invoke_frame!(f, floats_first, i, x)
                }
                (CallingConvention::Stdcall, FrameLayout::IntsFirst) => {
                    let f = std::mem::transmute::<usize, IntsFirstSystem<$ret>>(address);
                    invoke_frame!(f, ints_first, i, x)
                }
                (CallingConvention::Stdcall, FrameLayout::FloatsFirst) => {
                    let f = std::mem::transmute::<usize, FloatsFirstSystem<$ret>>(address);
                    invoke_frame!(f, floats_first, i, x)
                }
            }
        }
    };
}

native_caller!(call_returning_word, u64);
native_caller!(call_returning_float, f64);

/// Call the function at `address` and decode its result as `return_type`.
///
/// # Safety
///
/// `address` must point to a function whose parameters match the lowered
/// frame, whose return type matches `return_type`, and which follows
/// `convention`. A `cstr` result must be null or a valid C string.
pub(crate) unsafe fn invoke(
    address: usize,
    convention: CallingConvention,
    frame: &NativeFrame<'_>,
    return_type: FfiType,
) -> FfiValue {
    if return_type.is_float() {
        let raw = call_returning_float(address, convention, frame);
        if return_type == FfiType::F32 {
            FfiValue::Float(f32::from_bits(raw.to_bits() as u32) as f64)
        } else {
            FfiValue::Float(raw)
        }
    } else {
        let raw = call_returning_word(address, convention, frame);
        decode_word(raw, return_type)
    }
}

/// Decode an integer-register result.
///
/// # Safety
///
/// For `cstr`, `raw` must be null or point to a NUL-terminated string.
unsafe fn decode_word(raw: u64, return_type: FfiType) -> FfiValue {
    match return_type {
        FfiType::Void => FfiValue::Void,
        t if t.is_integer() => narrow_integer(raw, t),
        FfiType::CStr => {
            let ptr = raw as usize as *const c_char;
            if ptr.is_null() {
                FfiValue::Pointer(0)
            } else {
                FfiValue::String(CStr::from_ptr(ptr).to_string_lossy().into_owned())
            }
        }
        _ => FfiValue::Pointer(raw as usize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn add_i32(a: i32, b: i32) -> i32 {
        a.wrapping_add(b)
    }

    extern "C" fn negate_i8(a: i8) -> i8 {
        a.wrapping_neg()
    }

    extern "C" fn hypot_f64(a: f64, b: f64) -> f64 {
        (a * a + b * b).sqrt()
    }

    extern "C" fn halve_f32(a: f32) -> f32 {
        a / 2.0
    }

    extern "C" fn sum8(a: u64, b: u64, c: u64, d: u64, e: u64, f: u64, g: u64, h: u64) -> u64 {
        a + b + c + d + e + f + g + h
    }

    extern "C" fn c_strlen(s: *const c_char) -> usize {
        unsafe { CStr::from_ptr(s) }.to_bytes().len()
    }

    #[cfg(not(windows))]
    extern "C" fn scale(x: f64, times: i32, y: f32) -> f64 {
        x * times as f64 + y as f64
    }

    fn call(address: usize, args: &[FfiValue], types: &[FfiType], ret: FfiType) -> FfiValue {
        let frame = NativeFrame::lower(args, types).expect("lower");
        unsafe { invoke(address, CallingConvention::Cdecl, &frame, ret) }
    }

    #[test]
    fn test_calling_convention_tags() {
        assert_eq!(
            "__cdecl".parse::<CallingConvention>().unwrap(),
            CallingConvention::Cdecl
        );
        assert_eq!(
            "__stdcall".parse::<CallingConvention>().unwrap(),
            CallingConvention::Stdcall
        );
        assert!(matches!(
            "__fastcall".parse::<CallingConvention>(),
            Err(FfiError::UnknownCallingConvention(tag)) if tag == "__fastcall"
        ));
        assert_eq!(CallingConvention::default().to_string(), "__cdecl");
    }

    #[test]
    fn test_integer_call() {
        let result = call(
            add_i32 as usize,
            &[FfiValue::Int(40), FfiValue::Int(2)],
            &[FfiType::I32, FfiType::I32],
            FfiType::I32,
        );
        assert_eq!(result, FfiValue::Int(42));
    }

    #[test]
    fn test_narrow_result_is_sign_extended() {
        let result = call(
            negate_i8 as usize,
            &[FfiValue::Int(5)],
            &[FfiType::I8],
            FfiType::I8,
        );
        assert_eq!(result, FfiValue::Int(-5));
    }

    #[test]
    fn test_float_calls() {
        let result = call(
            hypot_f64 as usize,
            &[FfiValue::Float(3.0), FfiValue::Float(4.0)],
            &[FfiType::F64, FfiType::F64],
            FfiType::F64,
        );
        assert_eq!(result, FfiValue::Float(5.0));

        let result = call(
            halve_f32 as usize,
            &[FfiValue::Float(3.0)],
            &[FfiType::F32],
            FfiType::F32,
        );
        assert_eq!(result, FfiValue::Float(1.5));
    }

    #[test]
    fn test_full_integer_frame() {
        let args: Vec<FfiValue> = (1..=8u64).map(FfiValue::UInt).collect();
        let result = call(sum8 as usize, &args, &[FfiType::U64; 8], FfiType::U64);
        assert_eq!(result, FfiValue::UInt(36));
    }

    #[test]
    fn test_string_argument_is_nul_terminated() {
        let result = call(
            c_strlen as usize,
            &[FfiValue::String("hello".to_string())],
            &[FfiType::CStr],
            FfiType::U64,
        );
        assert_eq!(result, FfiValue::UInt(5));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_mixed_register_classes() {
        let result = call(
            scale as usize,
            &[FfiValue::Float(1.5), FfiValue::Int(4), FfiValue::Float(0.25)],
            &[FfiType::F64, FfiType::I32, FfiType::F32],
            FfiType::F64,
        );
        assert_eq!(result, FfiValue::Float(6.25));
    }

    #[test]
    fn test_lower_counts_classes() {
        let args = [
            FfiValue::Int(1),
            FfiValue::Float(2.0),
            FfiValue::Pointer(0x10),
        ];
        let types = [FfiType::I32, FfiType::F64];
        if cfg!(windows) {
            assert!(NativeFrame::lower(&args, &types).is_err());
        } else {
            let frame = NativeFrame::lower(&args, &types).unwrap();
            assert_eq!(frame.int_count(), 2);
            assert_eq!(frame.float_count(), 1);
        }
    }

    #[test]
    fn test_lower_rejects_too_many_ints() {
        let args: Vec<FfiValue> = (0..9).map(FfiValue::Int).collect();
        let err = NativeFrame::lower(&args, &[FfiType::I64; 9])
            .err()
            .expect("nine integer arguments must not fit");
        assert!(matches!(
            err,
            FfiError::TooManyArgs {
                class: "integer",
                count: 9,
                max: MAX_INT_ARGS
            }
        ));
    }

    #[test]
    fn test_lower_rejects_float_for_pointer() {
        let args = [FfiValue::Float(1.0)];
        assert!(matches!(
            NativeFrame::lower(&args, &[FfiType::Ptr]),
            Err(FfiError::InvalidArgType { .. })
        ));
    }

    #[test]
    fn test_decode_word() {
        unsafe {
            assert_eq!(decode_word(0xdead, FfiType::Void), FfiValue::Void);
            assert_eq!(
                decode_word(0xffff_ffff, FfiType::I32),
                FfiValue::Int(-1)
            );
            assert_eq!(
                decode_word(0x1_0000_0007, FfiType::U32),
                FfiValue::UInt(7)
            );
            assert_eq!(decode_word(0, FfiType::CStr), FfiValue::Pointer(0));
            assert_eq!(decode_word(0x40, FfiType::Ptr), FfiValue::Pointer(0x40));
        }
    }

    #[test]
    fn test_cache_does_not_keep_failed_opens() {
        let cache = LibraryCache::new();
        let err = cache
            .get_or_open("libdefinitely-not-a-real-library.so.0")
            .unwrap_err();
        assert!(matches!(err, FfiError::LoadError(_)));
        assert_eq!(cache.open_count(), 0);
        assert!(cache.loaded_libraries().is_empty());
    }
}
