//! Binding Manifest Configuration
//!
//! Handles parsing of `bindings.toml` files that declare extern functions
//! instead of building [`ExternDecl`]s in code.
//!
//! ```toml
//! [defaults]
//! calling_convention = "__cdecl"
//!
//! [[function]]
//! name = "magnitude"
//! library = "libc.so.6"
//! entry_point = "abs"
//! returns = "int"
//! params = [{ name = "x", type = "int" }]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::ffi::{
    bind, Binder, CallingConvention, ExternDecl, ExternFn, FfiError, FfiType, FfiValue, Param,
    ParamKind,
};

/// File name searched for by [`BindingManifest::find_and_load`]
pub const MANIFEST_FILE: &str = "bindings.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("function {function}: unknown type '{ty}'")]
    UnknownType { function: String, ty: String },

    #[error("function {function}: unknown parameter kind '{kind}'")]
    UnknownKind { function: String, kind: String },

    #[error("function {function}: unsupported default for parameter {param}")]
    InvalidDefault { function: String, param: String },

    #[error("function {function}: {source}")]
    Bind {
        function: String,
        #[source]
        source: FfiError,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root structure of a `bindings.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BindingManifest {
    /// Settings applied to every function unless overridden
    #[serde(default)]
    pub defaults: ManifestDefaults,

    /// Declared functions
    #[serde(default, rename = "function")]
    pub functions: Vec<FunctionEntry>,
}

impl BindingManifest {
    /// Load a manifest from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse manifest text.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load the manifest from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load a manifest by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let manifest_path = dir.join(MANIFEST_FILE);
            if manifest_path.exists() {
                return Self::load(&manifest_path);
            }
            if !dir.pop() {
                return Err(ConfigError::NotFound(format!(
                    "{} in {} or any parent",
                    MANIFEST_FILE,
                    start_dir.display()
                )));
            }
        }
    }

    /// Save the manifest to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Turn every entry into a binder and declaration, without loading anything.
    pub fn declarations(&self) -> ConfigResult<Vec<(Binder, ExternDecl)>> {
        self.functions
            .iter()
            .map(|entry| Ok((entry.binder(&self.defaults), entry.to_decl()?)))
            .collect()
    }

    /// Bind every declared function, stopping at the first failure.
    pub fn bind_all(&self) -> ConfigResult<Vec<ExternFn>> {
        self.declarations()?
            .into_iter()
            .map(|(binder, decl)| {
                let function = decl.name().to_string();
                binder
                    .build(decl)
                    .map_err(|source| ConfigError::Bind { function, source })
            })
            .collect()
    }
}

/// Manifest-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDefaults {
    /// Calling convention tag (`__cdecl` or `__stdcall`)
    #[serde(default = "default_convention")]
    pub calling_convention: String,

    /// Reject unknown keyword arguments at call time
    #[serde(default)]
    pub strict_keywords: bool,
}

fn default_convention() -> String {
    CallingConvention::default().tag().to_string()
}

impl Default for ManifestDefaults {
    fn default() -> Self {
        Self {
            calling_convention: default_convention(),
            strict_keywords: false,
        }
    }
}

/// One `[[function]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionEntry {
    /// Name of the binding; also the symbol unless `entry_point` is set
    pub name: String,

    /// Library name or path, resolved by the OS loader
    pub library: String,

    #[serde(default)]
    pub entry_point: Option<String>,

    #[serde(default)]
    pub calling_convention: Option<String>,

    #[serde(default)]
    pub strict_keywords: Option<bool>,

    /// Return type; omitted means no return value
    #[serde(default)]
    pub returns: Option<String>,

    #[serde(default)]
    pub doc: Option<String>,

    #[serde(default)]
    pub params: Vec<ParamEntry>,
}

impl FunctionEntry {
    fn binder(&self, defaults: &ManifestDefaults) -> Binder {
        let mut binder = bind(self.library.clone())
            .calling_convention(
                self.calling_convention
                    .clone()
                    .unwrap_or_else(|| defaults.calling_convention.clone()),
            )
            .strict_keywords(self.strict_keywords.unwrap_or(defaults.strict_keywords));
        if let Some(entry_point) = &self.entry_point {
            binder = binder.entry_point(entry_point.clone());
        }
        binder
    }

    /// Build the declaration described by this entry.
    pub fn to_decl(&self) -> ConfigResult<ExternDecl> {
        let mut decl = ExternDecl::new(self.name.clone());
        if let Some(doc) = &self.doc {
            decl = decl.doc(doc.clone());
        }
        if let Some(returns) = &self.returns {
            decl = decl.returns(self.parse_type(returns)?);
        }
        for param in &self.params {
            decl = decl.param(self.to_param(param)?);
        }
        Ok(decl)
    }

    fn to_param(&self, entry: &ParamEntry) -> ConfigResult<Param> {
        let kind = match &entry.kind {
            Some(kind) => ParamKind::from_str(kind).ok_or_else(|| ConfigError::UnknownKind {
                function: self.name.clone(),
                kind: kind.clone(),
            })?,
            None => ParamKind::PositionalOrKeyword,
        };
        let ty = entry
            .ty
            .as_deref()
            .map(|ty| self.parse_type(ty))
            .transpose()?;
        let default = entry
            .default
            .as_ref()
            .map(|value| {
                toml_to_value(value).ok_or_else(|| ConfigError::InvalidDefault {
                    function: self.name.clone(),
                    param: entry.name.clone(),
                })
            })
            .transpose()?;

        Ok(Param {
            name: entry.name.clone(),
            ty,
            default,
            kind,
        })
    }

    fn parse_type(&self, ty: &str) -> ConfigResult<FfiType> {
        FfiType::from_str(ty).ok_or_else(|| ConfigError::UnknownType {
            function: self.name.clone(),
            ty: ty.to_string(),
        })
    }
}

/// One parameter of a function entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamEntry {
    pub name: String,

    /// Native type name; required unless `kind` is variadic
    #[serde(default, rename = "type")]
    pub ty: Option<String>,

    #[serde(default)]
    pub default: Option<toml::Value>,

    /// `positional_or_keyword` when omitted
    #[serde(default)]
    pub kind: Option<String>,
}

fn toml_to_value(value: &toml::Value) -> Option<FfiValue> {
    match value {
        toml::Value::Integer(v) => Some(FfiValue::Int(*v)),
        toml::Value::Float(v) => Some(FfiValue::Float(*v)),
        toml::Value::String(s) => Some(FfiValue::String(s.clone())),
        toml::Value::Boolean(b) => Some(FfiValue::Int(*b as i64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[defaults]
calling_convention = "__stdcall"

[[function]]
name = "magnitude"
library = "libc.so.6"
entry_point = "abs"
returns = "int"
doc = "Absolute value"
params = [{ name = "x", type = "int" }]

[[function]]
name = "clamp"
library = "libclamp.so"
calling_convention = "__cdecl"
strict_keywords = true
returns = "double"
params = [
    { name = "value", type = "double" },
    { name = "lo", type = "double", default = 0.0 },
    { name = "hi", type = "double", default = 1 },
]
"#;

    #[test]
    fn test_default_manifest() {
        let manifest = BindingManifest::default();
        assert_eq!(manifest.defaults.calling_convention, "__cdecl");
        assert!(!manifest.defaults.strict_keywords);
        assert!(manifest.functions.is_empty());
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = BindingManifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.defaults.calling_convention, "__stdcall");
        assert_eq!(manifest.functions.len(), 2);

        let clamp = &manifest.functions[1];
        assert_eq!(clamp.calling_convention.as_deref(), Some("__cdecl"));
        assert_eq!(clamp.strict_keywords, Some(true));
        assert_eq!(clamp.params[2].default, Some(toml::Value::Integer(1)));
    }

    #[test]
    fn test_entries_become_declarations() {
        let manifest = BindingManifest::parse(MANIFEST).unwrap();
        let decls = manifest.declarations().unwrap();

        let (binder, decl) = &decls[0];
        assert_eq!(binder.library(), "libc.so.6");
        assert_eq!(decl.name(), "magnitude");
        assert_eq!(decl.get_params(), &[Param::new("x", FfiType::I32)]);

        let (_, decl) = &decls[1];
        let params = decl.get_params();
        assert_eq!(params[1].default, Some(FfiValue::Float(0.0)));
        assert_eq!(params[2].default, Some(FfiValue::Int(1)));
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let manifest = BindingManifest::parse(
            r#"
[[function]]
name = "f"
library = "libf.so"
params = [{ name = "x", type = "quaternion" }]
"#,
        )
        .unwrap();
        let err = manifest.declarations().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownType { ref ty, .. } if ty == "quaternion"));
    }

    #[test]
    fn test_keyword_only_entry_fails_to_bind() {
        let manifest = BindingManifest::parse(
            r#"
[[function]]
name = "f"
library = "libf.so"
params = [{ name = "flags", type = "int", kind = "keyword_only" }]
"#,
        )
        .unwrap();
        let err = manifest.bind_all().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Bind {
                source: FfiError::DisallowedParameter { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_save_then_find() {
        let dir = std::env::temp_dir().join("extern_bind_config").join("nested");
        std::fs::create_dir_all(&dir).unwrap();
        let root = dir.parent().unwrap();

        let manifest = BindingManifest::parse(MANIFEST).unwrap();
        manifest.save(&root.join(MANIFEST_FILE)).unwrap();

        let found = BindingManifest::find_and_load(&dir).unwrap();
        assert_eq!(found.functions.len(), 2);
        assert_eq!(found.functions[0].entry_point.as_deref(), Some("abs"));
        assert_eq!(found.functions[1].params[1].default, Some(toml::Value::Float(0.0)));
    }

    #[test]
    fn test_missing_manifest() {
        let err = BindingManifest::load(Path::new("/nonexistent/bindings.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
