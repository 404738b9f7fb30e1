use super::{Const, Type, def_handle};
use smallvec::SmallVec;

def_handle!(Inst);
def_handle!(Block);
def_handle!(Func);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Const(Const),
    InstOutput { inst: Inst, output_idx: u32 },
    FuncParam { func: Func, param_idx: u32 },
}

impl From<Const> for Value {
    fn from(ct: Const) -> Self {
        Value::Const(ct)
    }
}

impl Value {
    /// The (only) output of `inst`.
    pub fn output(inst: Inst) -> Self {
        Value::InstOutput {
            inst,
            output_idx: 0,
        }
    }

    pub fn defining_inst(self) -> Option<Inst> {
        match self {
            Value::InstOutput { inst, .. } => Some(inst),
            Value::Const(_) | Value::FuncParam { .. } => None,
        }
    }
}

/// One input operand of an instruction, referring to some [`Value`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Usage {
    pub inst: Inst,
    pub operand_idx: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Builtin {
    Transpose,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Callee {
    Func(Func),
    Builtin(Builtin),
}

/// Instruction kinds, with their operands (`inputs`) and results (`outputs`):
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InstKind {
    /// `[initializer?] -> [ptr]`
    Var,
    /// `[value] -> [value]`
    Let,
    /// `[ptr] -> [value]`
    Load,
    /// `[ptr, value] -> []`
    Store,
    /// `[base, indices...] -> [ptr or value]`, where `base` is either a
    /// pointer (producing a pointer) or a composite value.
    Access,
    /// `[components...] -> [value]`
    Construct,
    /// `[ptr-to-vector, index] -> [scalar]`
    LoadVectorElement,
    /// `[ptr-to-vector, index, scalar] -> []`
    StoreVectorElement,
    /// `[args...] -> [result?]`
    Call(Callee),
    /// Scalar conversion, `[value] -> [value]`.
    Convert,
    /// Runs `body` `count` times, `[] -> [index: u32]` (where the output is
    /// the loop counter, only available inside `body`).
    Loop { count: u32, body: Block },
    /// `[value?] -> []`
    Return,
}

impl InstKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Var => "var",
            Self::Let => "let",
            Self::Load => "load",
            Self::Store => "store",
            Self::Access => "access",
            Self::Construct => "construct",
            Self::LoadVectorElement => "load_vector_element",
            Self::StoreVectorElement => "store_vector_element",
            Self::Call(_) => "call",
            Self::Convert => "convert",
            Self::Loop { .. } => "loop",
            Self::Return => "ret",
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstDef {
    pub kind: InstKind,
    pub(super) inputs: SmallVec<[Value; 4]>,
    pub(super) outputs: SmallVec<[Type; 1]>,
    pub(super) parent: Option<Block>,
    pub(super) alive: bool,
}

impl InstDef {
    pub fn inputs(&self) -> &[Value] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Type] {
        &self.outputs
    }

    pub fn parent(&self) -> Option<Block> {
        self.parent
    }
}

#[derive(Clone, Debug, Default)]
pub struct BlockDef {
    pub(super) insts: Vec<Inst>,
}

impl BlockDef {
    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

#[derive(Clone, Debug)]
pub struct FuncDef {
    pub name: String,
    pub params: SmallVec<[Type; 4]>,
    pub ret: Type,
    pub body: Block,
    /// Set for entry points.
    pub stage: Option<ShaderStage>,
}
