//! Native Binding Tests
//!
//! Binds real libc and libm entry points through the public API and checks
//! argument defaulting, keyword rebinding, transforms and library caching.

#![cfg(all(target_os = "linux", target_env = "gnu"))]

use std::sync::Arc;

use extern_bind::ffi::FfiSignature;
use extern_bind::{
    bind, CallArgs, ExternDecl, FfiError, FfiType, FfiValue, LibraryCache, Param,
    ResultTransform,
};

const LIBC: &str = "libc.so.6";
const LIBM: &str = "libm.so.6";

fn float(value: FfiValue) -> f64 {
    value.as_f64().expect("float result")
}

// ============================================================================
// Defaults and keywords
// ============================================================================

#[test]
fn test_pow_default_exponent() {
    let pow = bind(LIBM)
        .build(
            ExternDecl::new("pow")
                .param(Param::new("x", FfiType::F64))
                .param(Param::new("y", FfiType::F64).with_default(2.0))
                .returns(FfiType::F64),
        )
        .unwrap();

    assert_eq!(float(pow.call(CallArgs::new().arg(7.0)).unwrap()), 49.0);
    assert_eq!(float(pow.call(CallArgs::new().arg(2.0).arg(3.0)).unwrap()), 8.0);
    assert_eq!(
        float(pow.call(CallArgs::new().arg(2.0).kwarg("y", 5)).unwrap()),
        32.0
    );
    assert_eq!(
        float(pow.call(CallArgs::new().kwarg("y", 3).kwarg("x", 10)).unwrap()),
        1000.0
    );
}

#[test]
fn test_keyword_overrides_positional() {
    let pow = bind(LIBM)
        .build(ExternDecl::from_c_signature("double pow(double x, double y)").unwrap())
        .unwrap();

    let result = pow
        .call(CallArgs::new().arg(3.0).arg(100.0).kwarg("y", 2.0))
        .unwrap();
    assert_eq!(float(result), 9.0);
}

#[test]
fn test_mixed_integer_and_float_arguments() {
    let ldexp = bind(LIBM)
        .build(ExternDecl::from_c_signature("double ldexp(double x, int exp)").unwrap())
        .unwrap();
    assert_eq!(
        float(ldexp.invoke([FfiValue::Float(1.5), FfiValue::Int(4)]).unwrap()),
        24.0
    );
}

#[test]
fn test_single_precision() {
    let sqrtf = bind(LIBM)
        .build(
            ExternDecl::new("sqrtf")
                .param(Param::new("x", FfiType::F32))
                .returns(FfiType::F32),
        )
        .unwrap();
    assert_eq!(float(sqrtf.invoke([FfiValue::Float(6.25)]).unwrap()), 2.5);
}

#[test]
fn test_string_arguments_and_results() {
    let strlen = bind(LIBC)
        .build(ExternDecl::from_c_signature("size_t strlen(const char* s)").unwrap())
        .unwrap();
    assert_eq!(
        strlen.invoke([FfiValue::from("native")]).unwrap(),
        FfiValue::UInt(6)
    );

    let atoi = bind(LIBC)
        .build(ExternDecl::from_c_signature("int atoi(const char* s)").unwrap())
        .unwrap();
    assert_eq!(atoi.invoke([FfiValue::from("-321")]).unwrap(), FfiValue::Int(-321));
}

#[test]
fn test_no_argument_function() {
    let getpid = bind(LIBC)
        .build(ExternDecl::from_c_signature("int getpid(void)").unwrap())
        .unwrap();
    assert_eq!(getpid.signature().arg_count(), 0);
    assert_eq!(
        getpid.call(CallArgs::new()).unwrap(),
        FfiValue::Int(std::process::id() as i64)
    );
}

#[test]
fn test_void_return() {
    let srand = bind(LIBC)
        .build(ExternDecl::new("srand").param(Param::new("seed", FfiType::U32)))
        .unwrap();
    assert_eq!(srand.return_type(), FfiType::Void);
    assert_eq!(srand.invoke([FfiValue::UInt(7)]).unwrap(), FfiValue::Void);
}

// ============================================================================
// Transforms
// ============================================================================

#[test]
fn test_transform_builds_higher_level_value() {
    let isdigit = bind(LIBC)
        .build(
            ExternDecl::new("isdigit")
                .param(Param::new("c", FfiType::I32))
                .returns(FfiType::I32)
                .transform(ResultTransform::labeled("to_bool", |v| {
                    FfiValue::from(if v.as_i64() == Some(0) { "no" } else { "yes" })
                })),
        )
        .unwrap();

    assert_eq!(isdigit.transform().to_string(), "to_bool");
    assert_eq!(isdigit.invoke([FfiValue::Int('7' as i64)]).unwrap(), FfiValue::from("yes"));
    assert_eq!(isdigit.invoke([FfiValue::Int('x' as i64)]).unwrap(), FfiValue::from("no"));
}

#[test]
fn test_constant_transform_is_ignored() {
    let abs = bind(LIBC)
        .build(
            ExternDecl::new("abs")
                .param(Param::new("x", FfiType::I32))
                .returns(FfiType::I32)
                .transform_factory(|_| ResultTransform::Constant(FfiValue::Void)),
        )
        .unwrap();
    assert_eq!(abs.invoke([FfiValue::Int(-9)]).unwrap(), FfiValue::Int(9));
}

// ============================================================================
// Caching and errors
// ============================================================================

#[test]
fn test_one_open_per_library_name() {
    let cache = Arc::new(LibraryCache::new());

    let cos = bind(LIBM)
        .with_cache(Arc::clone(&cache))
        .build(ExternDecl::from_c_signature("double cos(double x)").unwrap())
        .unwrap();
    let sin = bind(LIBM)
        .with_cache(Arc::clone(&cache))
        .build(ExternDecl::from_c_signature("double sin(double x)").unwrap())
        .unwrap();

    assert!(Arc::ptr_eq(cos.library(), sin.library()));
    assert_eq!(cache.open_count(), 1);
    assert_eq!(float(cos.invoke([FfiValue::Float(0.0)]).unwrap()), 1.0);
}

#[test]
fn test_call_time_type_error() {
    let abs = bind(LIBC)
        .build(ExternDecl::from_c_signature("int abs(int x)").unwrap())
        .unwrap();
    let err = abs.invoke([FfiValue::from("ten")]).unwrap_err();
    assert!(matches!(err, FfiError::InvalidArgType { .. }));
    assert!(!err.is_declaration_error());
}

#[test]
fn test_bindings_are_shareable_across_threads() {
    let labs = Arc::new(
        bind(LIBC)
            .build(ExternDecl::from_c_signature("long labs(long x)").unwrap())
            .unwrap(),
    );

    let handles: Vec<_> = (0..4i64)
        .map(|i| {
            let labs = Arc::clone(&labs);
            std::thread::spawn(move || labs.invoke([FfiValue::Int(-i)]).unwrap())
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), FfiValue::Int(i as i64));
    }
}

#[test]
fn test_signature_text_roundtrips_through_display() {
    let sig = FfiSignature::parse("double fma(double x, double y, double z)").unwrap();
    let fma = bind(LIBM).build(ExternDecl::from(sig)).unwrap();
    assert_eq!(fma.to_string(), "f64 fma(f64 x, f64 y, f64 z)");
    assert_eq!(
        float(fma.invoke([2.0, 3.0, 1.0].map(FfiValue::Float)).unwrap()),
        7.0
    );
}
