//! Extern Function Bindings
//!
//! Turns an [`ExternDecl`] into an [`ExternFn`]: a callable bound to a named
//! entry point in a native library.
//!
//! ```text
//! ExternDecl ──► CallSignature ──► LibraryCache ──► symbol ──► ExternFn
//!  (params)      (types, defaults,   (open once)    (address)   (call)
//!                 name → position)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::loader::{self, CallingConvention, DynamicLibrary, LibraryCache, NativeFrame};
use super::types::{FfiSignature, FfiType, FfiValue};
use super::{FfiError, FfiResult};

// =============================================================================
// Declarations
// =============================================================================

/// How a declared parameter may be supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    PositionalOnly,
    PositionalOrKeyword,
    VarPositional,
    KeywordOnly,
    VarKeyword,
}

impl ParamKind {
    pub fn description(&self) -> &'static str {
        match self {
            ParamKind::PositionalOnly => "positional-only",
            ParamKind::PositionalOrKeyword => "positional or keyword",
            ParamKind::VarPositional => "variadic positional",
            ParamKind::KeywordOnly => "keyword-only",
            ParamKind::VarKeyword => "variadic keyword",
        }
    }

    /// Declaration order among the kinds that can be marshaled
    fn rank(&self) -> u8 {
        match self {
            ParamKind::PositionalOnly => 0,
            ParamKind::PositionalOrKeyword => 1,
            ParamKind::VarPositional => 2,
            ParamKind::KeywordOnly => 3,
            ParamKind::VarKeyword => 4,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "positional_only" => Some(ParamKind::PositionalOnly),
            "positional_or_keyword" => Some(ParamKind::PositionalOrKeyword),
            "var_positional" | "variadic_positional" => Some(ParamKind::VarPositional),
            "keyword_only" => Some(ParamKind::KeywordOnly),
            "var_keyword" | "variadic_keyword" => Some(ParamKind::VarKeyword),
            _ => None,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A declared parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    /// Native type; `None` is rejected when the binding is built
    pub ty: Option<FfiType>,
    pub default: Option<FfiValue>,
    pub kind: ParamKind,
}

impl Param {
    /// A typed positional-or-keyword parameter
    pub fn new(name: impl Into<String>, ty: FfiType) -> Self {
        Self {
            name: name.into(),
            ty: Some(ty),
            default: None,
            kind: ParamKind::PositionalOrKeyword,
        }
    }

    /// A positional-or-keyword parameter with no type
    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            ty: None,
            ..Self::new(name, FfiType::Void)
        }
    }

    pub fn positional_only(name: impl Into<String>, ty: FfiType) -> Self {
        Self::new(name, ty).kind(ParamKind::PositionalOnly)
    }

    pub fn keyword_only(name: impl Into<String>, ty: FfiType) -> Self {
        Self::new(name, ty).kind(ParamKind::KeywordOnly)
    }

    /// Trailing `*args`: accepts extra positional arguments, typed by value
    pub fn var_positional(name: impl Into<String>) -> Self {
        Self::untyped(name).kind(ParamKind::VarPositional)
    }

    pub fn var_keyword(name: impl Into<String>) -> Self {
        Self::untyped(name).kind(ParamKind::VarKeyword)
    }

    pub fn kind(mut self, kind: ParamKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_default(mut self, value: impl Into<FfiValue>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Post-processing applied to every raw native result.
///
/// Only `Callable` changes the result; `None` and `Constant` return the raw
/// value unchanged.
#[derive(Clone, Default)]
pub enum ResultTransform {
    #[default]
    None,
    /// A non-callable value; kept for display, never applied
    Constant(FfiValue),
    Callable {
        label: String,
        func: Arc<dyn Fn(FfiValue) -> FfiValue + Send + Sync>,
    },
}

impl ResultTransform {
    pub fn callable<F>(func: F) -> Self
    where
        F: Fn(FfiValue) -> FfiValue + Send + Sync + 'static,
    {
        Self::labeled("<transform>", func)
    }

    pub fn labeled<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(FfiValue) -> FfiValue + Send + Sync + 'static,
    {
        ResultTransform::Callable {
            label: label.into(),
            func: Arc::new(func),
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, ResultTransform::Callable { .. })
    }

    pub fn apply(&self, raw: FfiValue) -> FfiValue {
        match self {
            ResultTransform::Callable { func, .. } => func(raw),
            ResultTransform::None | ResultTransform::Constant(_) => raw,
        }
    }
}

impl fmt::Display for ResultTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultTransform::None => write!(f, "None"),
            ResultTransform::Constant(value) => write!(f, "{}", value),
            ResultTransform::Callable { label, .. } => write!(f, "{}", label),
        }
    }
}

impl fmt::Debug for ResultTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultTransform::None => write!(f, "None"),
            ResultTransform::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            ResultTransform::Callable { label, .. } => {
                f.debug_struct("Callable").field("label", label).finish()
            }
        }
    }
}

type TransformFactory = Arc<dyn Fn(&[usize]) -> ResultTransform + Send + Sync>;

#[derive(Clone)]
enum TransformSource {
    Fixed(ResultTransform),
    /// Evaluated once at bind time with the argument positions `0..argcount`
    Factory(TransformFactory),
}

impl TransformSource {
    fn resolve(&self, arg_count: usize) -> ResultTransform {
        match self {
            TransformSource::Fixed(transform) => transform.clone(),
            TransformSource::Factory(factory) => {
                let positions: Vec<usize> = (0..arg_count).collect();
                factory(&positions)
            }
        }
    }
}

/// Declaration of a foreign function: its name, parameters, return type and
/// result transform.
#[derive(Clone)]
pub struct ExternDecl {
    name: String,
    doc: Option<String>,
    params: Vec<Param>,
    returns: Option<FfiType>,
    transform: TransformSource,
}

impl ExternDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            doc: None,
            params: Vec::new(),
            returns: None,
            transform: TransformSource::Fixed(ResultTransform::None),
        }
    }

    /// Build a declaration from C-style text such as `int abs(int x)`.
    pub fn from_c_signature(signature: &str) -> FfiResult<Self> {
        let sig = FfiSignature::parse(signature)
            .ok_or_else(|| FfiError::InvalidSignature(signature.trim().to_string()))?;
        Ok(Self::from(sig))
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        self.params.extend(params);
        self
    }

    /// Declared return type; without one the entry point returns nothing
    pub fn returns(mut self, ty: FfiType) -> Self {
        self.returns = Some(ty);
        self
    }

    pub fn transform(mut self, transform: ResultTransform) -> Self {
        self.transform = TransformSource::Fixed(transform);
        self
    }

    /// Shorthand for a callable transform
    pub fn map_result<F>(self, func: F) -> Self
    where
        F: Fn(FfiValue) -> FfiValue + Send + Sync + 'static,
    {
        self.transform(ResultTransform::callable(func))
    }

    /// Derive the transform when the binding is built.
    ///
    /// The factory runs exactly once and receives the typed argument
    /// positions (`[]` for a function without typed parameters).
    pub fn transform_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&[usize]) -> ResultTransform + Send + Sync + 'static,
    {
        self.transform = TransformSource::Factory(Arc::new(factory));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_params(&self) -> &[Param] {
        &self.params
    }
}

impl From<FfiSignature> for ExternDecl {
    fn from(sig: FfiSignature) -> Self {
        let mut decl = ExternDecl::new(sig.name.clone()).params(
            sig.param_names
                .iter()
                .zip(sig.params.iter())
                .map(|(name, &ty)| Param::new(name.clone(), ty)),
        );
        // "..." is never a C identifier, so it cannot shadow a named parameter
        if sig.variadic {
            decl = decl.param(Param::var_positional("..."));
        }
        if sig.return_type != FfiType::Void {
            decl = decl.returns(sig.return_type);
        }
        decl
    }
}

impl fmt::Debug for ExternDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternDecl")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Call signature
// =============================================================================

/// Marshaling information derived from a parameter list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSignature {
    /// Native type of each typed parameter, in order
    pub arg_types: Vec<FfiType>,
    /// Defaults of positional-or-keyword parameters, in declaration order
    pub defaults: Vec<FfiValue>,
    /// Parameter name → position in `arg_types`
    pub arg_index: HashMap<String, usize>,
    /// Whether a variadic-positional parameter accepts extra arguments
    pub variadic: bool,
}

impl CallSignature {
    /// Derive the signature, rejecting parameters that cannot be marshaled
    pub fn from_params(params: &[Param]) -> FfiResult<Self> {
        let mut sig = CallSignature::default();
        let mut names: Vec<&str> = Vec::with_capacity(params.len());
        let mut seen_default = false;
        let mut last_kind: Option<ParamKind> = None;

        for param in params {
            if matches!(param.kind, ParamKind::KeywordOnly | ParamKind::VarKeyword) {
                return Err(FfiError::DisallowedParameter {
                    name: param.name.clone(),
                    kind: param.kind,
                });
            }
            if names.contains(&param.name.as_str()) {
                return Err(FfiError::DuplicateParameter {
                    name: param.name.clone(),
                });
            }
            names.push(&param.name);

            if let Some(after) = last_kind.filter(|k| k.rank() > param.kind.rank()) {
                return Err(FfiError::MisorderedParameter {
                    name: param.name.clone(),
                    kind: param.kind,
                    after,
                });
            }
            last_kind = Some(param.kind);

            if param.kind == ParamKind::VarPositional {
                if sig.variadic {
                    return Err(FfiError::DuplicateParameter {
                        name: param.name.clone(),
                    });
                }
                sig.variadic = true;
                continue;
            }

            let ty = param.ty.ok_or_else(|| FfiError::MissingAnnotation {
                name: param.name.clone(),
            })?;

            match &param.default {
                Some(_) => seen_default = true,
                None if seen_default => {
                    return Err(FfiError::NonTrailingDefault {
                        name: param.name.clone(),
                    })
                }
                None => {}
            }

            sig.arg_index.insert(param.name.clone(), sig.arg_types.len());
            sig.arg_types.push(ty);

            if param.kind == ParamKind::PositionalOrKeyword {
                if let Some(default) = &param.default {
                    sig.defaults.push(default.clone());
                }
            }
        }

        Ok(sig)
    }

    /// Number of typed parameters
    pub fn arg_count(&self) -> usize {
        self.arg_types.len()
    }

    /// Validate argument count
    pub fn validate_args(&self, arg_count: usize) -> bool {
        if self.variadic {
            arg_count >= self.arg_count()
        } else {
            arg_count == self.arg_count()
        }
    }

    /// Name of the typed parameter at `position`
    pub fn param_name(&self, position: usize) -> Option<&str> {
        self.arg_index
            .iter()
            .find(|(_, &i)| i == position)
            .map(|(name, _)| name.as_str())
    }

    /// Resolve positional and keyword arguments into the final argument list.
    ///
    /// Missing trailing positions are filled from the defaults, keyword
    /// arguments then overwrite the position of their parameter. Unknown
    /// keywords are ignored unless `strict_keywords` is set. Every declared
    /// position must end up with a value, and extra positionals are only
    /// accepted by variadic signatures.
    pub fn bind_args(&self, args: CallArgs, strict_keywords: bool) -> FfiResult<Vec<FfiValue>> {
        let CallArgs {
            mut positional,
            keywords,
        } = args;
        let arg_count = self.arg_count();

        if positional.len() < arg_count {
            // defaults belong to the trailing positions
            let first_default = arg_count - self.defaults.len();
            for position in positional.len()..arg_count {
                let value = position
                    .checked_sub(first_default)
                    .map(|i| self.defaults[i].clone())
                    .unwrap_or(FfiValue::Void);
                positional.push(value);
            }
        }

        for (name, value) in keywords {
            match self.arg_index.get(&name) {
                Some(&position) => positional[position] = value,
                None if strict_keywords => return Err(FfiError::UnknownKeyword(name)),
                None => {}
            }
        }

        if !self.validate_args(positional.len()) {
            return Err(FfiError::InvalidArgCount {
                expected: arg_count,
                got: positional.len(),
            });
        }
        if let Some(position) = positional[..arg_count].iter().position(FfiValue::is_void) {
            return Err(FfiError::MissingArgument {
                name: self.param_name(position).unwrap_or_default().to_string(),
                position,
            });
        }

        positional
            .into_iter()
            .enumerate()
            .map(|(i, value)| match self.arg_types.get(i) {
                Some(&ty) => value.coerce(ty),
                None => Ok(value),
            })
            .collect()
    }
}

/// Positional and keyword arguments for one call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub positional: Vec<FfiValue>,
    pub keywords: Vec<(String, FfiValue)>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: impl IntoIterator<Item = FfiValue>) -> Self {
        Self {
            positional: args.into_iter().collect(),
            keywords: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<FfiValue>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<FfiValue>) -> Self {
        self.keywords.push((name.into(), value.into()));
        self
    }
}

// =============================================================================
// Binding
// =============================================================================

/// Start a binding to `library`
pub fn bind(library: impl Into<String>) -> Binder {
    Binder::new(library)
}

/// Builder for bindings into one library
#[derive(Debug, Clone)]
pub struct Binder {
    library: String,
    entry_point: Option<String>,
    convention: String,
    strict_keywords: bool,
    cache: Arc<LibraryCache>,
}

impl Binder {
    pub fn new(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            entry_point: None,
            convention: CallingConvention::default().tag().to_string(),
            strict_keywords: false,
            cache: LibraryCache::global(),
        }
    }

    /// Symbol to resolve; defaults to the declaration's name
    pub fn entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry_point = Some(name.into());
        self
    }

    /// Calling convention tag, checked when the binding is built
    pub fn calling_convention(mut self, tag: impl Into<String>) -> Self {
        self.convention = tag.into();
        self
    }

    pub fn convention(self, convention: CallingConvention) -> Self {
        self.calling_convention(convention.tag())
    }

    /// Reject keyword arguments that name no parameter
    pub fn strict_keywords(mut self, strict: bool) -> Self {
        self.strict_keywords = strict;
        self
    }

    /// Use `cache` instead of the process-wide library cache
    pub fn with_cache(mut self, cache: Arc<LibraryCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    /// Build the binding.
    ///
    /// All failures happen here, before any call: bad parameter lists,
    /// unknown calling conventions, libraries that fail to open and missing
    /// symbols. On success one line is printed to stdout.
    ///
    /// # Safety
    ///
    /// The declaration is trusted to match the native function. A wrong
    /// parameter list or return type is undefined behavior at call time.
    pub fn build(&self, decl: ExternDecl) -> FfiResult<ExternFn> {
        let signature = CallSignature::from_params(&decl.params)?;

        let convention: CallingConvention = self.convention.parse()?;
        let library = self.cache.get_or_open(&self.library)?;

        let transform = decl.transform.resolve(signature.arg_count());

        let entry_point = self
            .entry_point
            .clone()
            .unwrap_or_else(|| decl.name.clone());
        let address = library.get_symbol(&entry_point)?;

        println!(
            "load extern function: {}, callback: {}",
            entry_point, transform
        );

        Ok(ExternFn {
            name: decl.name,
            doc: decl.doc,
            entry_point,
            convention,
            signature,
            return_type: decl.returns.unwrap_or(FfiType::Void),
            transform,
            strict_keywords: self.strict_keywords,
            library,
            address,
        })
    }
}

/// A callable bound to a native entry point
pub struct ExternFn {
    name: String,
    doc: Option<String>,
    entry_point: String,
    convention: CallingConvention,
    signature: CallSignature,
    return_type: FfiType,
    transform: ResultTransform,
    strict_keywords: bool,
    library: Arc<DynamicLibrary>,
    address: usize,
}

impl ExternFn {
    /// Name of the declaration this binding was built from
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn calling_convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn signature(&self) -> &CallSignature {
        &self.signature
    }

    pub fn return_type(&self) -> FfiType {
        self.return_type
    }

    pub fn transform(&self) -> &ResultTransform {
        &self.transform
    }

    pub fn library(&self) -> &Arc<DynamicLibrary> {
        &self.library
    }

    /// Call with positional and keyword arguments
    pub fn call(&self, args: CallArgs) -> FfiResult<FfiValue> {
        let args = self.signature.bind_args(args, self.strict_keywords)?;
        let frame = NativeFrame::lower(&args, &self.signature.arg_types)?;

        #[cfg(feature = "trace")]
        eprintln!(
            "[ffi] {}!{} ints={} floats={}",
            self.library.name(),
            self.entry_point,
            frame.int_count(),
            frame.float_count()
        );

        // Safety: the address was resolved from a library kept alive by
        // `self.library`, and `Binder::build` documents that the declaration
        // must match the native function.
        let raw = unsafe { loader::invoke(self.address, self.convention, &frame, self.return_type) };

        Ok(self.transform.apply(raw))
    }

    /// Call with positional arguments only
    pub fn invoke(&self, args: impl IntoIterator<Item = FfiValue>) -> FfiResult<FfiValue> {
        self.call(CallArgs::positional(args))
    }
}

impl fmt::Debug for ExternFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternFn")
            .field("name", &self.name)
            .field("entry_point", &self.entry_point)
            .field("library", &self.library.name())
            .field("convention", &self.convention)
            .field("arg_types", &self.signature.arg_types)
            .field("return_type", &self.return_type)
            .field("transform", &self.transform)
            .finish()
    }
}

impl fmt::Display for ExternFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.return_type, self.entry_point)?;
        for (i, ty) in self.signature.arg_types.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match self.signature.param_name(i) {
                Some(name) => write!(f, "{} {}", ty, name)?,
                None => write!(f, "{}", ty)?,
            }
        }
        if self.signature.variadic {
            if !self.signature.arg_types.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ")")
    }
}
