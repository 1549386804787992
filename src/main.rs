//! xbind - call native library functions from the command line
//!
//! Binds a function from a C-style signature and calls it once, or binds every
//! function of a `bindings.toml` manifest to check that it resolves.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use extern_bind::config::BindingManifest;
use extern_bind::ffi::{bind, CallArgs, CallingConvention, ExternDecl, FfiType, FfiValue};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xbind")]
#[command(version)]
#[command(about = "Typed bindings to native library entry points", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind one function from a C signature and call it
    Call {
        /// Library name or path (e.g. libm.so.6)
        library: String,

        /// C-style signature, e.g. "double pow(double x, double y)"
        signature: String,

        /// Positional arguments
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,

        /// Keyword argument, repeatable
        #[arg(long = "kw", value_name = "NAME=VALUE")]
        keywords: Vec<String>,

        /// Symbol to resolve instead of the signature's name
        #[arg(long)]
        entry_point: Option<String>,

        /// Use the __stdcall convention
        #[arg(long)]
        stdcall: bool,

        /// Reject keyword arguments that name no parameter
        #[arg(long)]
        strict: bool,
    },

    /// Bind every function in a manifest
    Check {
        /// Manifest path (searches for bindings.toml upwards if omitted)
        manifest: Option<PathBuf>,
    },

    /// List the native type names
    Types,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Call {
            library,
            signature,
            args,
            keywords,
            entry_point,
            stdcall,
            strict,
        } => cmd_call(
            &library,
            &signature,
            &args,
            &keywords,
            entry_point,
            stdcall,
            strict,
        ),
        Commands::Check { manifest } => cmd_check(manifest),
        Commands::Types => {
            for ty in FfiType::ALL {
                println!("{:<8} {} bytes", ty.to_string(), ty.size());
            }
            Ok(())
        }
    }
}

fn cmd_call(
    library: &str,
    signature: &str,
    args: &[String],
    keywords: &[String],
    entry_point: Option<String>,
    stdcall: bool,
    strict: bool,
) -> Result<()> {
    let decl = ExternDecl::from_c_signature(signature)?;

    let mut binder = bind(library).strict_keywords(strict);
    if stdcall {
        binder = binder.convention(CallingConvention::Stdcall);
    }
    if let Some(entry_point) = entry_point {
        binder = binder.entry_point(entry_point);
    }
    let func = binder
        .build(decl)
        .with_context(|| format!("Failed to bind '{}' from {}", signature, library))?;

    let mut call_args = CallArgs::positional(args.iter().map(|a| FfiValue::parse_literal(a)));
    for kw in keywords {
        let Some((name, value)) = kw.split_once('=') else {
            bail!("Keyword argument '{}' must be NAME=VALUE", kw);
        };
        call_args = call_args.kwarg(name.trim(), FfiValue::parse_literal(value));
    }

    let result = func
        .call(call_args)
        .with_context(|| format!("Call to {} failed", func))?;
    println!("{}", result);
    Ok(())
}

fn cmd_check(manifest: Option<PathBuf>) -> Result<()> {
    let manifest = match manifest {
        Some(path) => BindingManifest::load(&path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => BindingManifest::load_from_cwd()?,
    };

    let bound = manifest.bind_all()?;
    for func in &bound {
        println!("  {} -> {}", func.name(), func);
    }
    println!("{} binding(s) OK", bound.len());
    Ok(())
}
