//! FFI Type System
//!
//! Native types understood by the binding layer, the runtime values that flow
//! through a binding, and C-style signature text.

use std::fmt;

use super::{FfiError, FfiResult};

/// Native value types supported for parameters and return values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FfiType {
    /// Void (no value)
    Void,
    /// 8-bit unsigned integer
    U8,
    /// 16-bit unsigned integer
    U16,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit unsigned integer
    U64,
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
    /// Pointer (usize, platform-dependent)
    Ptr,
    /// Null-terminated C string (const char*)
    CStr,
    /// Byte buffer passed by pointer (const uint8_t*)
    Buffer,
}

impl FfiType {
    /// Every type, in declaration order
    pub const ALL: [FfiType; 14] = [
        FfiType::Void,
        FfiType::U8,
        FfiType::U16,
        FfiType::U32,
        FfiType::U64,
        FfiType::I8,
        FfiType::I16,
        FfiType::I32,
        FfiType::I64,
        FfiType::F32,
        FfiType::F64,
        FfiType::Ptr,
        FfiType::CStr,
        FfiType::Buffer,
    ];

    /// Get the size in bytes of this type
    pub fn size(&self) -> usize {
        match self {
            FfiType::Void => 0,
            FfiType::U8 | FfiType::I8 => 1,
            FfiType::U16 | FfiType::I16 => 2,
            FfiType::U32 | FfiType::I32 | FfiType::F32 => 4,
            FfiType::U64 | FfiType::I64 | FfiType::F64 => 8,
            FfiType::Ptr | FfiType::CStr | FfiType::Buffer => std::mem::size_of::<usize>(),
        }
    }

    /// Check if this type is an integer type
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            FfiType::U8
                | FfiType::U16
                | FfiType::U32
                | FfiType::U64
                | FfiType::I8
                | FfiType::I16
                | FfiType::I32
                | FfiType::I64
        )
    }

    /// Check if this type is a signed integer type
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            FfiType::I8 | FfiType::I16 | FfiType::I32 | FfiType::I64
        )
    }

    /// Check if this type is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, FfiType::F32 | FfiType::F64)
    }

    /// Check if this type is a pointer type
    pub fn is_pointer(&self) -> bool {
        matches!(self, FfiType::Ptr | FfiType::CStr | FfiType::Buffer)
    }

    /// Parse from a string representation (Rust or C spelling)
    pub fn from_str(s: &str) -> Option<Self> {
        let normalized: String = s
            .trim()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .replace(" *", "*")
            .to_lowercase();
        match normalized.as_str() {
            "void" => Some(FfiType::Void),
            "u8" | "uint8" | "uint8_t" | "byte" | "unsigned char" => Some(FfiType::U8),
            "u16" | "uint16" | "uint16_t" | "unsigned short" => Some(FfiType::U16),
            "u32" | "uint32" | "uint32_t" | "unsigned" | "unsigned int" => Some(FfiType::U32),
            "u64" | "uint64" | "uint64_t" | "ulong" | "unsigned long" | "size_t" | "usize" => {
                Some(FfiType::U64)
            }
            "i8" | "int8" | "int8_t" | "char" | "signed char" => Some(FfiType::I8),
            "i16" | "int16" | "int16_t" | "short" => Some(FfiType::I16),
            "i32" | "int32" | "int32_t" | "int" => Some(FfiType::I32),
            "i64" | "int64" | "int64_t" | "long" | "long long" | "ssize_t" | "isize" => {
                Some(FfiType::I64)
            }
            "f32" | "float" => Some(FfiType::F32),
            "f64" | "double" => Some(FfiType::F64),
            "ptr" | "pointer" | "void*" | "const void*" => Some(FfiType::Ptr),
            "cstr" | "string" | "char*" | "const char*" => Some(FfiType::CStr),
            "buffer" | "bytes" | "uint8_t*" | "const uint8_t*" => Some(FfiType::Buffer),
            _ => None,
        }
    }
}

impl fmt::Display for FfiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfiType::Void => write!(f, "void"),
            FfiType::U8 => write!(f, "u8"),
            FfiType::U16 => write!(f, "u16"),
            FfiType::U32 => write!(f, "u32"),
            FfiType::U64 => write!(f, "u64"),
            FfiType::I8 => write!(f, "i8"),
            FfiType::I16 => write!(f, "i16"),
            FfiType::I32 => write!(f, "i32"),
            FfiType::I64 => write!(f, "i64"),
            FfiType::F32 => write!(f, "f32"),
            FfiType::F64 => write!(f, "f64"),
            FfiType::Ptr => write!(f, "ptr"),
            FfiType::CStr => write!(f, "cstr"),
            FfiType::Buffer => write!(f, "buffer"),
        }
    }
}

/// A value passed to or returned from a bound function
#[derive(Debug, Clone, PartialEq)]
pub enum FfiValue {
    /// No value
    Void,
    /// Signed integer (covers all signed integer types)
    Int(i64),
    /// Unsigned integer (covers all unsigned integer types)
    UInt(u64),
    /// Floating point (covers f32 and f64)
    Float(f64),
    /// Raw pointer value
    Pointer(usize),
    /// Owned string (for CStr)
    String(String),
    /// Owned buffer (for Buffer)
    Buffer(Vec<u8>),
}

impl FfiValue {
    /// Get the natural type of this value
    pub fn get_type(&self) -> FfiType {
        match self {
            FfiValue::Void => FfiType::Void,
            FfiValue::Int(_) => FfiType::I64,
            FfiValue::UInt(_) => FfiType::U64,
            FfiValue::Float(_) => FfiType::F64,
            FfiValue::Pointer(_) => FfiType::Ptr,
            FfiValue::String(_) => FfiType::CStr,
            FfiValue::Buffer(_) => FfiType::Buffer,
        }
    }

    /// Check if this is a void value
    pub fn is_void(&self) -> bool {
        matches!(self, FfiValue::Void)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FfiValue::Int(v) => Some(*v),
            FfiValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FfiValue::Float(v) => Some(*v),
            FfiValue::Int(v) => Some(*v as f64),
            FfiValue::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Convert this value to the declared parameter type.
    ///
    /// Integers convert between widths (wrapping, as C does), integers and
    /// floats convert into each other, and integers become pointers. Anything
    /// else is a type mismatch.
    pub fn coerce(self, ty: FfiType) -> FfiResult<FfiValue> {
        let mismatch = |value: &FfiValue| FfiError::InvalidArgType {
            expected: ty,
            got: value.get_type(),
        };

        match ty {
            FfiType::Void => Err(mismatch(&self)),
            t if t.is_integer() => {
                let bits = match &self {
                    FfiValue::Int(v) => *v as u64,
                    FfiValue::UInt(v) => *v,
                    FfiValue::Float(v) if t.is_signed() => *v as i64 as u64,
                    FfiValue::Float(v) => *v as u64,
                    FfiValue::Pointer(p) => *p as u64,
                    _ => return Err(mismatch(&self)),
                };
                Ok(narrow_integer(bits, t))
            }
            FfiType::F32 | FfiType::F64 => match self.as_f64() {
                Some(v) if ty == FfiType::F32 => Ok(FfiValue::Float(v as f32 as f64)),
                Some(v) => Ok(FfiValue::Float(v)),
                None => Err(mismatch(&self)),
            },
            FfiType::Ptr => match self {
                FfiValue::Pointer(_) | FfiValue::String(_) | FfiValue::Buffer(_) => Ok(self),
                FfiValue::Int(v) => Ok(FfiValue::Pointer(v as usize)),
                FfiValue::UInt(v) => Ok(FfiValue::Pointer(v as usize)),
                other => Err(mismatch(&other)),
            },
            FfiType::CStr => match self {
                FfiValue::String(_) | FfiValue::Pointer(_) => Ok(self),
                FfiValue::Buffer(bytes) => String::from_utf8(bytes)
                    .map(FfiValue::String)
                    .map_err(|e| FfiError::ConversionError(e.to_string())),
                FfiValue::Int(0) | FfiValue::UInt(0) => Ok(FfiValue::Pointer(0)),
                other => Err(mismatch(&other)),
            },
            FfiType::Buffer => match self {
                FfiValue::Buffer(_) | FfiValue::Pointer(_) => Ok(self),
                FfiValue::String(s) => Ok(FfiValue::Buffer(s.into_bytes())),
                FfiValue::Int(0) | FfiValue::UInt(0) => Ok(FfiValue::Pointer(0)),
                other => Err(mismatch(&other)),
            },
            _ => Err(mismatch(&self)),
        }
    }

    /// Parse a command-line literal.
    ///
    /// `0x`-prefixed values are pointers, then integers, then floats; anything
    /// else is taken as a string. A surrounding pair of double quotes forces a
    /// string.
    pub fn parse_literal(text: &str) -> FfiValue {
        let text = text.trim();
        if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
            return FfiValue::String(text[1..text.len() - 1].to_string());
        }
        if let Some(hex) = text.strip_prefix("0x") {
            if let Ok(p) = usize::from_str_radix(hex, 16) {
                return FfiValue::Pointer(p);
            }
        }
        if let Ok(v) = text.parse::<i64>() {
            return FfiValue::Int(v);
        }
        if let Ok(v) = text.parse::<u64>() {
            return FfiValue::UInt(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            return FfiValue::Float(v);
        }
        FfiValue::String(text.to_string())
    }
}

/// Truncate and re-extend raw integer bits to the width of `ty`
pub(crate) fn narrow_integer(bits: u64, ty: FfiType) -> FfiValue {
    match ty {
        FfiType::U8 => FfiValue::UInt(bits as u8 as u64),
        FfiType::U16 => FfiValue::UInt(bits as u16 as u64),
        FfiType::U32 => FfiValue::UInt(bits as u32 as u64),
        FfiType::U64 => FfiValue::UInt(bits),
        FfiType::I8 => FfiValue::Int(bits as i8 as i64),
        FfiType::I16 => FfiValue::Int(bits as i16 as i64),
        FfiType::I32 => FfiValue::Int(bits as i32 as i64),
        _ => FfiValue::Int(bits as i64),
    }
}

impl fmt::Display for FfiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfiValue::Void => write!(f, "None"),
            FfiValue::Int(v) => write!(f, "{}", v),
            FfiValue::UInt(v) => write!(f, "{}", v),
            FfiValue::Float(v) => write!(f, "{}", v),
            FfiValue::Pointer(p) => write!(f, "{:#x}", p),
            FfiValue::String(s) => write!(f, "{:?}", s),
            FfiValue::Buffer(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i8> for FfiValue {
    fn from(v: i8) -> Self {
        FfiValue::Int(v as i64)
    }
}

impl From<i16> for FfiValue {
    fn from(v: i16) -> Self {
        FfiValue::Int(v as i64)
    }
}

impl From<i32> for FfiValue {
    fn from(v: i32) -> Self {
        FfiValue::Int(v as i64)
    }
}

impl From<i64> for FfiValue {
    fn from(v: i64) -> Self {
        FfiValue::Int(v)
    }
}

impl From<u8> for FfiValue {
    fn from(v: u8) -> Self {
        FfiValue::UInt(v as u64)
    }
}

impl From<u16> for FfiValue {
    fn from(v: u16) -> Self {
        FfiValue::UInt(v as u64)
    }
}

impl From<u32> for FfiValue {
    fn from(v: u32) -> Self {
        FfiValue::UInt(v as u64)
    }
}

impl From<u64> for FfiValue {
    fn from(v: u64) -> Self {
        FfiValue::UInt(v)
    }
}

impl From<f32> for FfiValue {
    fn from(v: f32) -> Self {
        FfiValue::Float(v as f64)
    }
}

impl From<f64> for FfiValue {
    fn from(v: f64) -> Self {
        FfiValue::Float(v)
    }
}

impl From<&str> for FfiValue {
    fn from(v: &str) -> Self {
        FfiValue::String(v.to_string())
    }
}

impl From<String> for FfiValue {
    fn from(v: String) -> Self {
        FfiValue::String(v)
    }
}

impl From<Vec<u8>> for FfiValue {
    fn from(v: Vec<u8>) -> Self {
        FfiValue::Buffer(v)
    }
}

/// Function signature parsed from C-style text
#[derive(Debug, Clone)]
pub struct FfiSignature {
    /// Function name
    pub name: String,
    /// Parameter types
    pub params: Vec<FfiType>,
    /// Parameter names (`argN` when the text omits one)
    pub param_names: Vec<String>,
    /// Return type
    pub return_type: FfiType,
    /// Whether the parameter list ends in `...`
    pub variadic: bool,
}

impl FfiSignature {
    /// Create a new function signature
    pub fn new(name: impl Into<String>, params: Vec<FfiType>, return_type: FfiType) -> Self {
        let param_names = (0..params.len()).map(|i| format!("arg{}", i)).collect();
        Self {
            name: name.into(),
            params,
            param_names,
            return_type,
            variadic: false,
        }
    }

    /// Create a variadic function signature
    pub fn variadic(name: impl Into<String>, params: Vec<FfiType>, return_type: FfiType) -> Self {
        Self {
            variadic: true,
            ..Self::new(name, params, return_type)
        }
    }

    /// Validate argument count
    pub fn validate_args(&self, arg_count: usize) -> bool {
        if self.variadic {
            arg_count >= self.params.len()
        } else {
            arg_count == self.params.len()
        }
    }

    /// Parse from a C-style signature string
    /// Format: "return_type function_name(param1_type name1, param2_type, ...)"
    pub fn parse(signature: &str) -> Option<Self> {
        let signature = signature.trim().trim_end_matches(';');

        let paren_pos = signature.find('(')?;
        let close_pos = signature.rfind(')')?;
        if close_pos < paren_pos {
            return None;
        }
        let before_paren = signature[..paren_pos].trim();
        let inside = signature[paren_pos + 1..close_pos].trim();

        let (return_type_str, name) = split_type_and_name(before_paren)?;
        let name = name?;
        let return_type = FfiType::from_str(&return_type_str)?;

        let mut params = Vec::new();
        let mut param_names = Vec::new();
        let mut variadic = false;

        for param in inside.split(',') {
            let param = param.trim();
            if param.is_empty() || (param == "void" && inside == "void") {
                continue;
            }
            if param == "..." {
                variadic = true;
                continue;
            }
            let (type_str, param_name) = split_type_and_name(param)?;
            let param_type = FfiType::from_str(&type_str)?;
            if param_type == FfiType::Void {
                return None;
            }
            param_names.push(param_name.unwrap_or_else(|| format!("arg{}", params.len())));
            params.push(param_type);
        }

        Some(Self {
            name: name.to_string(),
            params,
            param_names,
            return_type,
            variadic,
        })
    }
}

/// Split `"const char *s"` into `("const char*", Some("s"))`.
///
/// A single word is a bare type. A trailing word is a name only when the
/// remainder still parses as a type, so `unsigned int` stays a type.
fn split_type_and_name(text: &str) -> Option<(String, Option<String>)> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if FfiType::from_str(text).is_some() {
        return Some((text.to_string(), None));
    }

    let (split_at, sep) = text
        .char_indices()
        .rev()
        .find(|&(_, c)| c.is_whitespace() || c == '*')?;
    let (ty, name) = text.split_at(split_at + sep.len_utf8());
    let name = name.trim();
    let is_ident = !name.is_empty()
        && name.chars().all(|c| c.is_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !is_ident || FfiType::from_str(ty).is_none() {
        return None;
    }
    Some((ty.trim().to_string(), Some(name.to_string())))
}

impl fmt::Display for FfiSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.return_type, self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        if self.variadic {
            if !self.params.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ")")
    }
}
