//! Lowering passes, bringing the reader's IR closer to the target IR.

mod row_major;

use crate::ir::Module;
use crate::validate::{Capabilities, Capability, Diag, ValidationError, validate};
use tracing::info_span;

/// Capabilities the input of [`transpose_row_major`] is validated with.
pub const REQUIRED_CAPABILITIES: [Capability; 4] = [
    Capability::AllowMultipleEntryPoints,
    Capability::AllowStructMatrixDecorations,
    Capability::AllowNonCoreTypes,
    Capability::AllowOverrides,
];

const PASS_NAME: &str = "transpose_row_major";

pub struct Options {
    /// Capabilities the input module is validated against, before running.
    pub capabilities: Capabilities,

    /// Validate the module again after running, also checking that no
    /// row-major matrices are left.
    pub validate_output: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capabilities: REQUIRED_CAPABILITIES.into_iter().collect(),
            validate_output: false,
        }
    }
}

/// Replaces every row-major matrix struct member with a column-major one
/// (of the transposed type), and fixes up all the accesses to it, so that
/// the module behaves the same.
///
/// Fails (without touching `module`) if `module` doesn't validate with
/// [`REQUIRED_CAPABILITIES`].
pub fn transpose_row_major(module: &mut Module) -> Result<(), ValidationError> {
    run(module, &Options::default())
}

pub fn run(module: &mut Module, options: &Options) -> Result<(), ValidationError> {
    let _span = info_span!("transpose_row_major").entered();

    validate(module, &options.capabilities, PASS_NAME)?;

    row_major::eliminate(module);

    if options.validate_output {
        let _span = info_span!("validate_output").entered();
        validate(module, &options.capabilities, PASS_NAME)?;

        let module = &*module;
        let diags: Vec<Diag> = module
            .referenced_structs()
            .into_iter()
            .flat_map(|s| {
                let def = &module[s];
                def.members
                    .iter()
                    .filter(|member| member.row_major)
                    .map(move |member| Diag {
                        func: None,
                        inst: None,
                        message: format!("`{}.{}` is still row-major", def.name, member.name),
                    })
            })
            .collect();
        if !diags.is_empty() {
            return Err(ValidationError {
                pass: PASS_NAME,
                diags,
            });
        }
    }
    Ok(())
}
