//! Structural and capability validation of a [`Module`].
//!
//! Lowering passes run this on their input (with the set of capabilities they
//! are able to handle), and can optionally run it again on their output.

use crate::ir::{
    ArrayCount, Block, Builtin, Callee, Func, Inst, InstKind, Module, ScalarType, StorageClass,
    Type, TypeDef, Value,
};
use rustc_hash::FxHashSet;
use std::fmt;
use thiserror::Error;

/// Non-core features of the IR, that a module may only use when validated
/// with the corresponding capability.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// More than one entry point in the same module.
    AllowMultipleEntryPoints,
    /// `RowMajor`/`MatrixStride` decorations on struct members.
    AllowStructMatrixDecorations,
    /// Types not expressible in the core IR (e.g. explicitly strided arrays).
    AllowNonCoreTypes,
    /// Pipeline-overridable constants. The IR has no override constants, so
    /// nothing checks for this; it's accepted to match the required set.
    AllowOverrides,
}

pub type Capabilities = FxHashSet<Capability>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diag {
    /// Function the error was found in (if not at module scope).
    pub func: Option<String>,
    pub inst: Option<(Inst, &'static str)>,
    pub message: String,
}

impl fmt::Display for Diag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(func) = &self.func {
            write!(f, "in fn `{func}`: ")?;
        }
        if let Some((inst, kind)) = self.inst {
            write!(f, "`{kind}` (#{}): ", inst.index())?;
        }
        f.write_str(&self.message)
    }
}

#[derive(Debug, Error)]
#[error("{pass}: {}", DisplayDiags(.diags))]
pub struct ValidationError {
    /// Name of the pass that rejected the module.
    pub pass: &'static str,
    pub diags: Vec<Diag>,
}

struct DisplayDiags<'a>(&'a [Diag]);

impl fmt::Display for DisplayDiags<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.len();
        write!(f, "{n} validation error{}", if n == 1 { "" } else { "s" })?;
        for diag in self.0 {
            write!(f, "\n  {diag}")?;
        }
        Ok(())
    }
}

pub fn validate(
    module: &Module,
    capabilities: &Capabilities,
    pass: &'static str,
) -> Result<(), ValidationError> {
    let mut validator = Validator {
        module,
        capabilities,
        func: None,
        diags: vec![],
    };
    validator.validate_module();
    if validator.diags.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            pass,
            diags: validator.diags,
        })
    }
}

struct Validator<'a> {
    module: &'a Module,
    capabilities: &'a Capabilities,

    func: Option<Func>,
    diags: Vec<Diag>,
}

impl Validator<'_> {
    fn error(&mut self, inst: Option<Inst>, message: impl Into<String>) {
        let m = self.module;
        self.diags.push(Diag {
            func: self.func.map(|func| m[func].name.clone()),
            inst: inst.map(|inst| (inst, m[inst].kind.name())),
            message: message.into(),
        });
    }

    fn require(&mut self, cap: Capability, what: impl fmt::Display) {
        if !self.capabilities.contains(&cap) {
            self.error(None, format!("{what} requires capability `{cap:?}`"));
        }
    }

    fn validate_module(&mut self) {
        let m = self.module;

        let entry_points = m.funcs().filter(|&func| m[func].stage.is_some()).count();
        if entry_points > 1 {
            self.require(
                Capability::AllowMultipleEntryPoints,
                format_args!("module with {entry_points} entry points"),
            );
        }

        for ty in m.referenced_types() {
            match m[ty] {
                TypeDef::Array {
                    explicit_stride: true,
                    ..
                } => self.require(
                    Capability::AllowNonCoreTypes,
                    format_args!("explicitly strided `{}`", m.display_type(ty)),
                ),
                TypeDef::Struct(s) => {
                    for member in &m[s].members {
                        let decorated = member.row_major || member.matrix_stride.is_some();
                        if !decorated {
                            continue;
                        }
                        self.require(
                            Capability::AllowStructMatrixDecorations,
                            format_args!(
                                "matrix layout decoration on `{}.{}`",
                                m[s].name, member.name
                            ),
                        );
                        if !self.is_matrix_or_array_of_matrices(member.ty) {
                            self.error(
                                None,
                                format!(
                                    "matrix layout decoration on non-matrix member `{}.{}: {}`",
                                    m[s].name,
                                    member.name,
                                    m.display_type(member.ty)
                                ),
                            );
                        }
                    }
                }
                _ => {}
            }
        }

        for &inst in m[m.root()].insts() {
            if m[inst].kind != InstKind::Var {
                self.error(Some(inst), "only `var`s are allowed at module scope");
                continue;
            }
            self.validate_inst(m.root(), inst);
        }

        for func in m.funcs() {
            self.func = Some(func);
            self.validate_block(m[func].body);
        }
        self.func = None;
    }

    fn is_matrix_or_array_of_matrices(&self, ty: Type) -> bool {
        match self.module[ty] {
            TypeDef::Matrix { .. } => true,
            TypeDef::Array { element, .. } => self.is_matrix_or_array_of_matrices(element),
            _ => false,
        }
    }

    fn validate_block(&mut self, block: Block) {
        for &inst in self.module[block].insts() {
            self.validate_inst(block, inst);
        }
    }

    fn validate_inst(&mut self, block: Block, inst: Inst) {
        let m = self.module;
        let def = &m[inst];

        if def.parent() != Some(block) || !m.is_alive(inst) {
            self.error(Some(inst), "instruction is not properly attached to its block");
        }
        for &input in def.inputs() {
            if let Err(e) = self.check_input(input) {
                self.error(Some(inst), e);
                return;
            }
        }

        let types: Vec<Type> = def.inputs().iter().map(|&v| m.type_of(v)).collect();
        let outputs = def.outputs();
        let result = match def.kind {
            InstKind::Var => self.check_var(&types, outputs),
            InstKind::Let => match (&types[..], outputs) {
                (&[ty], &[out]) if ty == out => Ok(()),
                _ => Err("result type must match the operand type".into()),
            },
            InstKind::Load => match (&types[..], outputs) {
                (&[ptr], &[out]) if m.pointee(ptr) == Some(out) => Ok(()),
                _ => Err(self.mismatch("loaded type must match the pointer's store type", &types)),
            },
            InstKind::Store => match types[..] {
                [ptr, value] if m.pointee(ptr) == Some(value) && outputs.is_empty() => {
                    self.check_writable(ptr)
                }
                _ => Err(self.mismatch("stored type must match the pointer's store type", &types)),
            },
            InstKind::Access => self.check_access(def.inputs(), outputs),
            InstKind::Construct => self.check_construct(&types, outputs),
            InstKind::LoadVectorElement => match (&types[..], outputs) {
                (&[ptr, index], &[out]) => self.check_vector_element(ptr, index, out),
                _ => Err("expected `[ptr, index] -> [element]`".into()),
            },
            InstKind::StoreVectorElement => match (&types[..], outputs) {
                (&[ptr, index, value], &[]) => self
                    .check_vector_element(ptr, index, value)
                    .and_then(|()| self.check_writable(ptr)),
                _ => Err("expected `[ptr, index, element] -> []`".into()),
            },
            InstKind::Call(Callee::Func(callee)) => {
                let sig = &m[callee];
                let expected_outputs: &[Type] = if m[sig.ret] == TypeDef::Void {
                    &[]
                } else {
                    std::slice::from_ref(&sig.ret)
                };
                if types[..] != sig.params[..] || outputs != expected_outputs {
                    Err(self.mismatch(
                        &format!("call does not match the signature of `{}`", sig.name),
                        &types,
                    ))
                } else {
                    Ok(())
                }
            }
            InstKind::Call(Callee::Builtin(Builtin::Transpose)) => match (&types[..], outputs) {
                (&[ty], &[out]) => match m[ty] {
                    TypeDef::Matrix {
                        element,
                        columns,
                        rows,
                    } if m.lookup_type(&TypeDef::Matrix {
                        element,
                        columns: rows,
                        rows: columns,
                    }) == Some(out) =>
                    {
                        Ok(())
                    }
                    _ => Err(self.mismatch("`transpose` result must be the transposed matrix", &types)),
                },
                _ => Err("`transpose` expects one matrix operand".into()),
            },
            InstKind::Convert => match (&types[..], outputs) {
                (&[ty], &[out]) if m.scalar_type(ty).is_some() && m.scalar_type(out).is_some() => {
                    Ok(())
                }
                _ => Err("`convert` is only supported between scalars".into()),
            },
            InstKind::Loop { body, .. } => {
                if self.func.is_none() {
                    Err("`loop` outside of a function".into())
                } else if outputs.len() != 1 || m.scalar_type(outputs[0]) != Some(ScalarType::U32) {
                    Err("loop counter must be `u32`".into())
                } else {
                    self.validate_block(body);
                    Ok(())
                }
            }
            InstKind::Return => match self.func {
                None => Err("`ret` outside of a function".into()),
                Some(func) => {
                    let ret = m[func].ret;
                    let ok = match types[..] {
                        [] => m[ret] == TypeDef::Void,
                        [ty] => ty == ret,
                        _ => false,
                    };
                    if ok {
                        Ok(())
                    } else {
                        Err(format!(
                            "returned value must match the return type `{}`",
                            m.display_type(ret)
                        ))
                    }
                }
            },
        };
        if let Err(e) = result {
            self.error(Some(inst), e);
        }
    }

    fn mismatch(&self, what: &str, types: &[Type]) -> String {
        let m = self.module;
        let types: Vec<String> = types
            .iter()
            .map(|&ty| format!("`{}`", m.display_type(ty)))
            .collect();
        format!("{what} (operand types: {})", types.join(", "))
    }

    fn check_input(&self, input: Value) -> Result<(), String> {
        let m = self.module;
        match input {
            Value::Const(_) => Ok(()),
            Value::InstOutput { inst, output_idx } => {
                if !m.is_alive(inst) {
                    Err(format!("operand refers to removed instruction #{}", inst.index()))
                } else if output_idx as usize >= m[inst].outputs().len() {
                    Err(format!("operand refers to missing output #{output_idx}"))
                } else {
                    Ok(())
                }
            }
            Value::FuncParam { func, param_idx } => {
                if self.func != Some(func) {
                    Err(format!("operand refers to a parameter of `{}`", m[func].name))
                } else if param_idx as usize >= m[func].params.len() {
                    Err(format!("operand refers to missing parameter #{param_idx}"))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn check_var(&self, types: &[Type], outputs: &[Type]) -> Result<(), String> {
        let m = self.module;
        let &[ptr] = outputs else {
            return Err("`var` must have exactly one result".into());
        };
        let TypeDef::Pointer {
            store, addr_space, ..
        } = m[ptr]
        else {
            return Err("`var` result must be a pointer".into());
        };
        let in_function = self.func.is_some();
        if in_function != (addr_space == StorageClass::Function) {
            return Err(format!(
                "`{}` variable not allowed {}",
                m.display_type(ptr),
                if in_function { "in a function" } else { "at module scope" }
            ));
        }
        match types {
            [] => Ok(()),
            &[init] if init == store => Ok(()),
            _ => Err("initializer must match the variable's store type".into()),
        }
    }

    fn check_writable(&self, ptr: Type) -> Result<(), String> {
        match self.module[ptr] {
            TypeDef::Pointer {
                access: crate::ir::AccessMode::Read,
                ..
            } => Err(format!(
                "cannot write through read-only `{}`",
                self.module.display_type(ptr)
            )),
            _ => Ok(()),
        }
    }

    fn check_index(&self, ty: Type) -> Result<(), String> {
        match self.module.scalar_type(ty) {
            Some(s) if s.is_integer() => Ok(()),
            _ => Err(format!(
                "index must be an integer, found `{}`",
                self.module.display_type(ty)
            )),
        }
    }

    fn check_vector_element(&self, ptr: Type, index: Type, elem: Type) -> Result<(), String> {
        let m = self.module;
        self.check_index(index)?;
        match m.pointee(ptr).map(|store| &m[store]) {
            Some(&TypeDef::Vector { element, .. }) if element == elem => Ok(()),
            _ => Err(format!(
                "expected pointer to vector of `{}`, found `{}`",
                m.display_type(elem),
                m.display_type(ptr)
            )),
        }
    }

    fn check_access(&self, inputs: &[Value], outputs: &[Type]) -> Result<(), String> {
        let m = self.module;
        let (&base, indices) = inputs
            .split_first()
            .ok_or_else(|| "`access` requires a base operand".to_string())?;
        let &[out] = outputs else {
            return Err("`access` must have exactly one result".into());
        };

        let base_ty = m.type_of(base);
        let (mut ty, ptr) = match m[base_ty] {
            TypeDef::Pointer {
                store,
                addr_space,
                access,
            } => (store, Some((addr_space, access))),
            _ => (base_ty, None),
        };
        for &index in indices {
            self.check_index(m.type_of(index))?;
            let const_index = match index {
                Value::Const(ct) => m.const_as_index(ct),
                _ => None,
            };
            ty = match m[ty] {
                TypeDef::Vector { element, width } => {
                    if const_index.is_some_and(|i| i >= width) {
                        return Err(format!("index out of bounds for `{}`", m.display_type(ty)));
                    }
                    element
                }
                TypeDef::Array { element, count, .. } => {
                    if let (ArrayCount::Constant(count), Some(i)) = (count, const_index) {
                        if i >= count {
                            return Err(format!(
                                "index out of bounds for `{}`",
                                m.display_type(ty)
                            ));
                        }
                    }
                    element
                }
                TypeDef::Matrix {
                    element,
                    columns,
                    rows,
                } => {
                    if const_index.is_some_and(|i| i >= columns) {
                        return Err(format!("index out of bounds for `{}`", m.display_type(ty)));
                    }
                    m.lookup_type(&TypeDef::Vector {
                        element,
                        width: rows,
                    })
                    .ok_or_else(|| "missing matrix column type".to_string())?
                }
                TypeDef::Struct(s) => {
                    let i = const_index
                        .ok_or_else(|| "struct member index must be a constant".to_string())?;
                    m[s].members
                        .get(i as usize)
                        .ok_or_else(|| format!("`{}` has no member #{i}", m[s].name))?
                        .ty
                }
                TypeDef::Void | TypeDef::Scalar(_) | TypeDef::Pointer { .. } => {
                    return Err(format!("cannot index into `{}`", m.display_type(ty)));
                }
            };
        }
        let expected = match ptr {
            Some((addr_space, access)) => m.lookup_type(&TypeDef::Pointer {
                store: ty,
                addr_space,
                access,
            }),
            None => Some(ty),
        };
        if expected == Some(out) {
            Ok(())
        } else {
            Err(format!(
                "result type `{}` doesn't match the accessed type `{}`",
                m.display_type(out),
                m.display_type(ty)
            ))
        }
    }

    fn check_construct(&self, types: &[Type], outputs: &[Type]) -> Result<(), String> {
        let m = self.module;
        let &[out] = outputs else {
            return Err("`construct` must have exactly one result".into());
        };
        if types.is_empty() {
            return Ok(());
        }
        let expected: Vec<Type> = match m[out] {
            TypeDef::Vector { element, width } => vec![element; width as usize],
            TypeDef::Matrix {
                element,
                columns,
                rows,
            } => {
                let column = m
                    .lookup_type(&TypeDef::Vector {
                        element,
                        width: rows,
                    })
                    .ok_or_else(|| "missing matrix column type".to_string())?;
                vec![column; columns as usize]
            }
            TypeDef::Array {
                element,
                count: ArrayCount::Constant(count),
                ..
            } => vec![element; count as usize],
            TypeDef::Struct(s) => m[s].members.iter().map(|member| member.ty).collect(),
            _ => {
                return Err(format!("cannot construct `{}`", m.display_type(out)));
            }
        };
        if types == &expected[..] {
            Ok(())
        } else {
            Err(self.mismatch(
                &format!("components don't match `{}`", m.display_type(out)),
                types,
            ))
        }
    }
}
