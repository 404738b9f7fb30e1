//! IR lowering for a SPIR-V reader front-end.
//!
//! SPIR-V allows some things the target IR can't express, which have to be
//! lowered away after reading, before the module can be handed off. This crate
//! holds the IR itself ([`ir`]), its [`validate`]or, the lowering passes
//! ([`lower`]), and a reference interpreter ([`interp`]) used to test that the
//! passes preserve behavior.
//!
//! Currently the only pass is [`lower::transpose_row_major`], which removes
//! row-major matrices (`RowMajor` struct member decorations).

pub mod interp;
pub mod ir;
pub mod lower;
pub mod validate;

use std::env::{self, VarError};
use std::io::{self, IsTerminal};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid output format value '{0}': expected one of tree, flat, or json")]
    InvalidFormat(String),

    #[error("invalid log color value '{0}': expected one of always, never, or auto")]
    InvalidColor(String),

    #[error(transparent)]
    SetGlobalDefault(#[from] tracing::subscriber::SetGlobalDefaultError),
}

// Set up logging/tracing, configured through the environment:
// - `SPIRV_LOWER_LOG`: `EnvFilter` directives (e.g. `spirv_reader_lower=trace`)
// - `SPIRV_LOWER_LOG_FORMAT`: one of `tree` (the default), `flat`, or `json`
// - `SPIRV_LOWER_LOG_COLOR`: one of `always`, `never`, or `auto` (the default)
pub fn init_logging() -> Result<(), LoggingError> {
    use tracing_subscriber::layer::SubscriberExt;

    let filter = tracing_subscriber::EnvFilter::from_env("SPIRV_LOWER_LOG");
    let subscriber = tracing_subscriber::Registry::default().with(filter);

    #[derive(Debug, Default)]
    enum OutputFormat {
        #[default]
        Tree,
        Flat,
        Json,
    }

    let output_format = match env::var("SPIRV_LOWER_LOG_FORMAT").as_deref() {
        Ok("tree") | Err(VarError::NotPresent) => OutputFormat::Tree,
        Ok("flat") => OutputFormat::Flat,
        Ok("json") => OutputFormat::Json,
        Ok(value) => return Err(LoggingError::InvalidFormat(value.to_string())),
        Err(VarError::NotUnicode(value)) => {
            return Err(LoggingError::InvalidFormat(
                value.to_string_lossy().into_owned(),
            ));
        }
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = match output_format {
        OutputFormat::Tree => {
            let color_logs = match env::var("SPIRV_LOWER_LOG_COLOR").as_deref() {
                Ok("always") => true,
                Ok("never") => false,
                Ok("auto") | Err(VarError::NotPresent) => io::stderr().is_terminal(),
                Ok(value) => return Err(LoggingError::InvalidColor(value.to_string())),
                Err(VarError::NotUnicode(value)) => {
                    return Err(LoggingError::InvalidColor(
                        value.to_string_lossy().into_owned(),
                    ));
                }
            };

            let tree_layer = tracing_tree::HierarchicalLayer::default()
                .with_writer(io::stderr)
                .with_ansi(color_logs)
                .with_targets(true)
                .with_wraparound(10)
                .with_verbose_exit(true)
                .with_verbose_entry(true)
                .with_indent_amount(2);

            Box::new(subscriber.with(tree_layer))
        }
        OutputFormat::Flat => Box::new(subscriber.with(tracing_subscriber::fmt::layer())),
        OutputFormat::Json => Box::new(subscriber.with(tracing_subscriber::fmt::layer().json())),
    };
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
