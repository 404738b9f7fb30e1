//! Reference interpreter, executing functions of a [`Module`] over
//! byte-addressed memory laid out with host-shareable layout rules.
//!
//! Memory layout follows the types and decorations exactly (struct member
//! offsets, array strides, explicit or default matrix strides, and the
//! `row_major` member flag), which is what makes it useful for checking that
//! a lowering pass preserves the observable behavior of a module: running the
//! same entry-point before and after the pass, on the same input bytes, must
//! produce the same results and leave the same bytes behind.

use crate::ir::{
    ArrayCount, Block, Builtin, Callee, Const, ConstKind, Func, Inst, InstKind, Module,
    ScalarConst, ScalarType, StorageClass, Type, TypeDef, Value,
};
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("index {index} out of bounds for `{ty}`")]
    IndexOutOfBounds { index: u32, ty: String },

    #[error("{size}-byte access at offset {offset} past the end of a {len}-byte allocation")]
    MemoryOutOfBounds { offset: u32, size: u32, len: usize },

    #[error("{0:?} is not a module-scope variable")]
    NotAGlobal(Value),

    #[error("{0:?} used before being defined")]
    Undefined(Value),

    #[error("`{func}` expects {expected} argument(s), got {found}")]
    ArgCount {
        func: String,
        expected: usize,
        found: usize,
    },

    #[error("`{0}` finished without returning a value")]
    MissingReturn(String),

    #[error("cannot bind {found} bytes to a {expected}-byte variable")]
    BindSize { expected: usize, found: usize },

    #[error("malformed operand: {0}")]
    Malformed(String),
}

type Result<T, E = EvalError> = std::result::Result<T, E>;

/// Runtime value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Val {
    Scalar(ScalarConst),
    /// Vector, matrix (of column vectors), array or struct.
    Composite(Vec<Val>),
    Ptr(Ptr),
}

impl Val {
    pub fn f32(x: f32) -> Self {
        Val::Scalar(ScalarConst::f32(x))
    }

    pub fn u32(x: u32) -> Self {
        Val::Scalar(ScalarConst::U32(x))
    }

    pub fn vec_f32(xs: &[f32]) -> Self {
        Val::Composite(xs.iter().map(|&x| Val::f32(x)).collect())
    }

    /// Matrix value from a list of columns.
    pub fn mat_f32(columns: &[&[f32]]) -> Self {
        Val::Composite(columns.iter().map(|col| Val::vec_f32(col)).collect())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ptr {
    alloc: usize,
    offset: u32,
    layout: Layout,
}

/// Layout information carried by pointers, that isn't part of the pointee
/// type (but rather comes from the decorations of an enclosing struct member).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct Layout {
    row_major: bool,
    matrix_stride: Option<u32>,
    /// Byte stride between the elements of a vector, when they're not tightly
    /// packed (i.e. for logical columns of row-major matrices).
    vector_stride: Option<u32>,
    /// Memory that isn't host-shareable (e.g. `Function` variables), where
    /// explicit array strides can't make elements overlap.
    padded: bool,
}

enum Flow {
    Continue,
    Return(Option<Val>),
}

pub struct Interpreter<'a> {
    module: &'a Module,
    allocs: Vec<Vec<u8>>,
    globals: FxHashMap<Value, Ptr>,
}

impl<'a> Interpreter<'a> {
    /// Allocates (zeroed) memory for every module-scope variable, and runs
    /// their initializers.
    pub fn new(module: &'a Module) -> Result<Self> {
        let mut interp = Self {
            module,
            allocs: vec![],
            globals: FxHashMap::default(),
        };
        let env = FxHashMap::default();
        for &inst in module[module.root()].insts() {
            let ptr = interp.exec_var(&env, inst)?;
            interp.globals.insert(Value::output(inst), ptr);
        }
        Ok(interp)
    }

    /// Replaces the contents of the module-scope variable `var`.
    pub fn bind(&mut self, var: Value, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let ptr = *self.globals.get(&var).ok_or(EvalError::NotAGlobal(var))?;
        let bytes = bytes.into();
        let expected = self.allocs[ptr.alloc].len();
        if bytes.len() < expected {
            return Err(EvalError::BindSize {
                expected,
                found: bytes.len(),
            });
        }
        self.allocs[ptr.alloc] = bytes;
        Ok(())
    }

    pub fn memory(&self, var: Value) -> Result<&[u8]> {
        let ptr = self.globals.get(&var).ok_or(EvalError::NotAGlobal(var))?;
        Ok(&self.allocs[ptr.alloc])
    }

    /// Pointer to the module-scope variable `var`, e.g. for passing to calls.
    pub fn global(&self, var: Value) -> Result<Val> {
        self.globals
            .get(&var)
            .map(|&ptr| Val::Ptr(ptr))
            .ok_or(EvalError::NotAGlobal(var))
    }

    pub fn call(&mut self, func: Func, args: impl IntoIterator<Item = Val>) -> Result<Option<Val>> {
        let m = self.module;
        let def = &m[func];
        let args: Vec<Val> = args.into_iter().collect();
        if args.len() != def.params.len() {
            return Err(EvalError::ArgCount {
                func: def.name.clone(),
                expected: def.params.len(),
                found: args.len(),
            });
        }
        let mut env: FxHashMap<Value, Val> = args
            .into_iter()
            .enumerate()
            .map(|(i, arg)| (m.param(func, i as u32), arg))
            .collect();
        match self.exec_block(&mut env, def.body)? {
            Flow::Return(ret) => Ok(ret),
            Flow::Continue if m[def.ret] == TypeDef::Void => Ok(None),
            Flow::Continue => Err(EvalError::MissingReturn(def.name.clone())),
        }
    }

    fn exec_block(&mut self, env: &mut FxHashMap<Value, Val>, block: Block) -> Result<Flow> {
        let m = self.module;
        for &inst in m[block].insts() {
            if let Flow::Return(ret) = self.exec_inst(env, inst)? {
                return Ok(Flow::Return(ret));
            }
        }
        Ok(Flow::Continue)
    }

    fn exec_inst(&mut self, env: &mut FxHashMap<Value, Val>, inst: Inst) -> Result<Flow> {
        let m = self.module;
        let def = &m[inst];
        let inputs = def.inputs();
        let output = Value::output(inst);

        let result = match def.kind {
            InstKind::Var => Val::Ptr(self.exec_var(env, inst)?),
            InstKind::Let => self.eval(env, inputs[0])?,
            InstKind::Load => {
                let ptr = self.eval_ptr(env, inputs[0])?;
                self.read(def.outputs()[0], ptr)?
            }
            InstKind::Store => {
                let ptr = self.eval_ptr(env, inputs[0])?;
                let value = self.eval(env, inputs[1])?;
                self.write(m.type_of(inputs[1]), ptr, &value)?;
                return Ok(Flow::Continue);
            }
            InstKind::Access => {
                let (&base, indices) = inputs
                    .split_first()
                    .ok_or_else(|| EvalError::Malformed("`access` without a base".into()))?;
                let base_ty = m.type_of(base);
                match (self.eval(env, base)?, m.pointee(base_ty)) {
                    (Val::Ptr(mut ptr), Some(mut ty)) => {
                        for &index in indices {
                            let index = self.eval_index(env, index)?;
                            (ty, ptr) = self.step(ty, ptr, index)?;
                        }
                        Val::Ptr(ptr)
                    }
                    (mut value, None) => {
                        for &index in indices {
                            let index = self.eval_index(env, index)?;
                            value = component(value, index)?;
                        }
                        value
                    }
                    (value, Some(_)) => {
                        return Err(EvalError::Malformed(format!(
                            "expected pointer, found {value:?}"
                        )));
                    }
                }
            }
            InstKind::Construct => {
                if inputs.is_empty() {
                    self.zero(def.outputs()[0])?
                } else {
                    Val::Composite(
                        inputs
                            .iter()
                            .map(|&v| self.eval(env, v))
                            .collect::<Result<_>>()?,
                    )
                }
            }
            InstKind::LoadVectorElement => {
                let ptr = self.eval_ptr(env, inputs[0])?;
                let index = self.eval_index(env, inputs[1])?;
                let (ty, ptr) = self.step(self.pointee(m.type_of(inputs[0]))?, ptr, index)?;
                self.read(ty, ptr)?
            }
            InstKind::StoreVectorElement => {
                let ptr = self.eval_ptr(env, inputs[0])?;
                let index = self.eval_index(env, inputs[1])?;
                let value = self.eval(env, inputs[2])?;
                let (ty, ptr) = self.step(self.pointee(m.type_of(inputs[0]))?, ptr, index)?;
                self.write(ty, ptr, &value)?;
                return Ok(Flow::Continue);
            }
            InstKind::Call(Callee::Func(callee)) => {
                let args = inputs
                    .iter()
                    .map(|&v| self.eval(env, v))
                    .collect::<Result<Vec<_>>>()?;
                match self.call(callee, args)? {
                    Some(ret) => ret,
                    None => return Ok(Flow::Continue),
                }
            }
            InstKind::Call(Callee::Builtin(Builtin::Transpose)) => {
                transpose(self.eval(env, inputs[0])?)?
            }
            InstKind::Convert => {
                let to = m.scalar_type(def.outputs()[0]).ok_or_else(|| {
                    EvalError::Malformed("`convert` to a non-scalar type".into())
                })?;
                match self.eval(env, inputs[0])? {
                    Val::Scalar(x) => Val::Scalar(convert(x, to)?),
                    value => {
                        return Err(EvalError::Malformed(format!(
                            "`convert` of non-scalar {value:?}"
                        )));
                    }
                }
            }
            InstKind::Loop { count, body } => {
                for i in 0..count {
                    env.insert(output, Val::u32(i));
                    if let Flow::Return(ret) = self.exec_block(env, body)? {
                        return Ok(Flow::Return(ret));
                    }
                }
                return Ok(Flow::Continue);
            }
            InstKind::Return => {
                let ret = match inputs.first() {
                    Some(&v) => Some(self.eval(env, v)?),
                    None => None,
                };
                return Ok(Flow::Return(ret));
            }
        };
        env.insert(output, result);
        Ok(Flow::Continue)
    }

    fn exec_var(&mut self, env: &FxHashMap<Value, Val>, inst: Inst) -> Result<Ptr> {
        let m = self.module;
        let ptr_ty = m[inst].outputs()[0];
        let store = self.pointee(ptr_ty)?;
        let padded = matches!(
            m[ptr_ty],
            TypeDef::Pointer {
                addr_space: StorageClass::Function | StorageClass::Private | StorageClass::Workgroup,
                ..
            }
        );
        let ptr = Ptr {
            alloc: self.allocs.len(),
            offset: 0,
            layout: Layout {
                padded,
                ..Layout::default()
            },
        };
        let size = if padded {
            self.padded_size(store)
        } else {
            m.size_of(store)
        };
        self.allocs.push(vec![0; size as usize]);
        if let Some(&init) = self.module[inst].inputs().first() {
            let init = self.eval(env, init)?;
            self.write(store, ptr, &init)?;
        }
        Ok(ptr)
    }

    fn pointee(&self, ty: Type) -> Result<Type> {
        self.module.pointee(ty).ok_or_else(|| {
            EvalError::Malformed(format!(
                "`{}` is not a pointer",
                self.module.display_type(ty)
            ))
        })
    }

    fn eval(&self, env: &FxHashMap<Value, Val>, v: Value) -> Result<Val> {
        match v {
            Value::Const(ct) => self.eval_const(ct),
            _ => env
                .get(&v)
                .cloned()
                .or_else(|| self.globals.get(&v).map(|&ptr| Val::Ptr(ptr)))
                .ok_or(EvalError::Undefined(v)),
        }
    }

    fn eval_ptr(&self, env: &FxHashMap<Value, Val>, v: Value) -> Result<Ptr> {
        match self.eval(env, v)? {
            Val::Ptr(ptr) => Ok(ptr),
            value => Err(EvalError::Malformed(format!(
                "expected pointer, found {value:?}"
            ))),
        }
    }

    fn eval_index(&self, env: &FxHashMap<Value, Val>, v: Value) -> Result<u32> {
        match self.eval(env, v)? {
            Val::Scalar(x) => x
                .as_index()
                .ok_or_else(|| EvalError::Malformed(format!("invalid index {x}"))),
            value => Err(EvalError::Malformed(format!(
                "expected index, found {value:?}"
            ))),
        }
    }

    fn eval_const(&self, ct: Const) -> Result<Val> {
        let m = self.module;
        match &m[ct].kind {
            &ConstKind::Scalar(x) => Ok(Val::Scalar(x)),
            ConstKind::Composite(elements) => elements
                .iter()
                .map(|&elem| self.eval_const(elem))
                .collect::<Result<_>>()
                .map(Val::Composite),
            ConstKind::Zero => self.zero(m[ct].ty),
        }
    }

    fn zero(&self, ty: Type) -> Result<Val> {
        let m = self.module;
        let repeat = |n: u32, elem: Type| -> Result<Val> {
            let elem = self.zero(elem)?;
            Ok(Val::Composite(vec![elem; n as usize]))
        };
        match m[ty] {
            TypeDef::Scalar(scalar) => Ok(Val::Scalar(match scalar {
                ScalarType::Bool => ScalarConst::Bool(false),
                ScalarType::I32 => ScalarConst::I32(0),
                ScalarType::U32 => ScalarConst::U32(0),
                ScalarType::F32 => ScalarConst::F32(0),
                ScalarType::F16 => ScalarConst::F16(0),
            })),
            TypeDef::Vector { element, width } => repeat(width, element),
            TypeDef::Matrix {
                element,
                columns,
                rows,
            } => {
                let column = Val::Composite(vec![self.zero(element)?; rows as usize]);
                Ok(Val::Composite(vec![column; columns as usize]))
            }
            TypeDef::Array {
                element,
                count: ArrayCount::Constant(count),
                ..
            } => repeat(count, element),
            TypeDef::Struct(s) => m[s]
                .members
                .iter()
                .map(|member| self.zero(member.ty))
                .collect::<Result<_>>()
                .map(Val::Composite),
            TypeDef::Void | TypeDef::Pointer { .. } | TypeDef::Array { .. } => Err(
                EvalError::Malformed(format!("no zero value for `{}`", m.display_type(ty))),
            ),
        }
    }

    /// Byte stride between the "major" vectors (columns, or rows if
    /// `row_major`) of a matrix.
    fn major_stride(&self, element: Type, columns: u32, rows: u32, layout: Layout) -> u32 {
        let major_len = if layout.row_major { columns } else { rows };
        layout.matrix_stride.unwrap_or_else(|| {
            let scale = if major_len == 2 { 2 } else { 4 };
            scale * self.module.size_of(element)
        })
    }

    /// Size of `ty` in non-host-shareable memory, see `Layout::padded`.
    fn padded_size(&self, ty: Type) -> u32 {
        match self.module[ty] {
            TypeDef::Array {
                element,
                count: ArrayCount::Constant(count),
                stride,
                ..
            } => count * stride.max(self.padded_size(element)),
            _ => self.module.size_of(ty),
        }
    }

    /// Offsets `ptr` (pointing to a `ty`) to its `index`-th component.
    fn step(&self, ty: Type, ptr: Ptr, index: u32) -> Result<(Type, Ptr)> {
        let m = self.module;
        let out_of_bounds = || EvalError::IndexOutOfBounds {
            index,
            ty: m.display_type(ty).to_string(),
        };
        let Ptr {
            alloc,
            offset,
            layout,
        } = ptr;
        let (elem_ty, offset, layout) = match m[ty] {
            TypeDef::Vector { element, width } => {
                if index >= width {
                    return Err(out_of_bounds());
                }
                let stride = layout.vector_stride.unwrap_or(m.size_of(element));
                (element, offset + index * stride, Layout {
                    padded: layout.padded,
                    ..Layout::default()
                })
            }
            TypeDef::Matrix {
                element,
                columns,
                rows,
            } => {
                if index >= columns {
                    return Err(out_of_bounds());
                }
                let column_ty = m
                    .lookup_type(&TypeDef::Vector {
                        element,
                        width: rows,
                    })
                    .ok_or_else(|| EvalError::Malformed("missing matrix column type".into()))?;
                let stride = self.major_stride(element, columns, rows, layout);
                let column_layout = Layout {
                    padded: layout.padded,
                    ..Layout::default()
                };
                if layout.row_major {
                    let column_layout = Layout {
                        vector_stride: Some(stride),
                        ..column_layout
                    };
                    (column_ty, offset + index * m.size_of(element), column_layout)
                } else {
                    (column_ty, offset + index * stride, column_layout)
                }
            }
            TypeDef::Array {
                element,
                count,
                stride,
                ..
            } => {
                if let ArrayCount::Constant(count) = count {
                    if index >= count {
                        return Err(out_of_bounds());
                    }
                }
                let stride = if layout.padded {
                    stride.max(self.padded_size(element))
                } else {
                    stride
                };
                (element, offset + index * stride, layout)
            }
            TypeDef::Struct(s) => {
                let member = m[s].members.get(index as usize).ok_or_else(out_of_bounds)?;
                let member_layout = Layout {
                    row_major: member.row_major,
                    matrix_stride: member.matrix_stride,
                    vector_stride: None,
                    padded: layout.padded,
                };
                (member.ty, offset + member.offset, member_layout)
            }
            TypeDef::Void | TypeDef::Scalar(_) | TypeDef::Pointer { .. } => {
                return Err(EvalError::Malformed(format!(
                    "cannot index into `{}`",
                    m.display_type(ty)
                )));
            }
        };
        Ok((
            elem_ty,
            Ptr {
                alloc,
                offset,
                layout,
            },
        ))
    }

    /// Number of components of a composite `ty` stored at `ptr`.
    fn component_count(&self, ty: Type, ptr: Ptr) -> Result<u32> {
        let m = self.module;
        Ok(match m[ty] {
            TypeDef::Vector { width, .. } => width,
            TypeDef::Matrix { columns, .. } => columns,
            TypeDef::Array {
                count: ArrayCount::Constant(count),
                ..
            } => count,
            TypeDef::Array {
                count: ArrayCount::Runtime,
                stride,
                ..
            } => {
                let len = self.allocs[ptr.alloc].len() as u32;
                len.saturating_sub(ptr.offset) / stride.max(1)
            }
            TypeDef::Struct(s) => m[s].members.len() as u32,
            TypeDef::Void | TypeDef::Scalar(_) | TypeDef::Pointer { .. } => {
                return Err(EvalError::Malformed(format!(
                    "`{}` cannot be stored in memory",
                    m.display_type(ty)
                )));
            }
        })
    }

    fn bytes(&self, ptr: Ptr, size: u32) -> Result<&[u8]> {
        let alloc = &self.allocs[ptr.alloc];
        let start = ptr.offset as usize;
        alloc
            .get(start..start + size as usize)
            .ok_or(EvalError::MemoryOutOfBounds {
                offset: ptr.offset,
                size,
                len: alloc.len(),
            })
    }

    fn bytes_mut(&mut self, ptr: Ptr, size: u32) -> Result<&mut [u8]> {
        let alloc = &mut self.allocs[ptr.alloc];
        let len = alloc.len();
        let start = ptr.offset as usize;
        alloc
            .get_mut(start..start + size as usize)
            .ok_or(EvalError::MemoryOutOfBounds {
                offset: ptr.offset,
                size,
                len,
            })
    }

    fn read(&self, ty: Type, ptr: Ptr) -> Result<Val> {
        if let TypeDef::Scalar(scalar) = self.module[ty] {
            let b = self.bytes(ptr, scalar.size())?;
            let word = || u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            return Ok(Val::Scalar(match scalar {
                ScalarType::Bool => ScalarConst::Bool(word() != 0),
                ScalarType::I32 => ScalarConst::I32(word() as i32),
                ScalarType::U32 => ScalarConst::U32(word()),
                ScalarType::F32 => ScalarConst::F32(word()),
                ScalarType::F16 => ScalarConst::F16(u16::from_le_bytes([b[0], b[1]])),
            }));
        }
        (0..self.component_count(ty, ptr)?)
            .map(|i| {
                let (elem_ty, elem_ptr) = self.step(ty, ptr, i)?;
                self.read(elem_ty, elem_ptr)
            })
            .collect::<Result<_>>()
            .map(Val::Composite)
    }

    fn write(&mut self, ty: Type, ptr: Ptr, value: &Val) -> Result<()> {
        let m = self.module;
        match (&m[ty], value) {
            (&TypeDef::Scalar(scalar), &Val::Scalar(x)) => {
                let word = match x {
                    ScalarConst::Bool(b) => u32::from(b),
                    ScalarConst::I32(x) => x as u32,
                    ScalarConst::U32(x) | ScalarConst::F32(x) => x,
                    ScalarConst::F16(x) => u32::from(x),
                };
                let size = scalar.size();
                self.bytes_mut(ptr, size)?
                    .copy_from_slice(&word.to_le_bytes()[..size as usize]);
                Ok(())
            }
            (_, Val::Composite(components)) => {
                let count = self.component_count(ty, ptr)?;
                if components.len() != count as usize {
                    return Err(EvalError::Malformed(format!(
                        "writing {} components to `{}`",
                        components.len(),
                        m.display_type(ty)
                    )));
                }
                for (i, component) in components.iter().enumerate() {
                    let (elem_ty, elem_ptr) = self.step(ty, ptr, i as u32)?;
                    self.write(elem_ty, elem_ptr, component)?;
                }
                Ok(())
            }
            _ => Err(EvalError::Malformed(format!(
                "cannot write {value:?} to `{}`",
                m.display_type(ty)
            ))),
        }
    }
}

fn component(value: Val, index: u32) -> Result<Val> {
    match value {
        Val::Composite(mut components) => {
            let len = components.len();
            if (index as usize) < len {
                Ok(components.swap_remove(index as usize))
            } else {
                Err(EvalError::IndexOutOfBounds {
                    index,
                    ty: format!("composite of {len}"),
                })
            }
        }
        value => Err(EvalError::Malformed(format!("cannot index into {value:?}"))),
    }
}

fn transpose(matrix: Val) -> Result<Val> {
    let columns = match matrix {
        Val::Composite(columns) => columns
            .into_iter()
            .map(|column| match column {
                Val::Composite(column) => Ok(column),
                value => Err(EvalError::Malformed(format!("{value:?} is not a vector"))),
            })
            .collect::<Result<Vec<_>>>()?,
        value => {
            return Err(EvalError::Malformed(format!("{value:?} is not a matrix")));
        }
    };
    let rows = columns.first().map_or(0, |column| column.len());
    Ok(Val::Composite(
        (0..rows)
            .map(|row| Val::Composite(columns.iter().map(|column| column[row].clone()).collect()))
            .collect(),
    ))
}

fn convert(x: ScalarConst, to: ScalarType) -> Result<ScalarConst> {
    let unsupported = || EvalError::Malformed(format!("unsupported conversion of {x} to {}", to.name()));
    let as_f32 = |bits: u32| f32::from_bits(bits);
    Ok(match (x, to) {
        (_, _) if x.ty() == to => x,
        (ScalarConst::I32(x), ScalarType::U32) => ScalarConst::U32(x as u32),
        (ScalarConst::U32(x), ScalarType::I32) => ScalarConst::I32(x as i32),
        (ScalarConst::Bool(b), ScalarType::I32) => ScalarConst::I32(i32::from(b)),
        (ScalarConst::Bool(b), ScalarType::U32) => ScalarConst::U32(u32::from(b)),
        (ScalarConst::I32(x), ScalarType::F32) => ScalarConst::f32(x as f32),
        (ScalarConst::U32(x), ScalarType::F32) => ScalarConst::f32(x as f32),
        (ScalarConst::F32(bits), ScalarType::I32) => ScalarConst::I32(as_f32(bits) as i32),
        (ScalarConst::F32(bits), ScalarType::U32) => ScalarConst::U32(as_f32(bits) as u32),
        _ => return Err(unsupported()),
    })
}
