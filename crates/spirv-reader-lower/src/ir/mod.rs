//! Arena-based shader IR, as produced by the SPIR-V reader front-end.
//!
//! Every entity (type, struct, constant, instruction, block, function) is owned
//! by a [`Module`] and referred to by a small `Copy` handle, which stays valid
//! for as long as the module exists (entities are never moved, instructions
//! are only ever *detached* when removed). Types and constants are interned,
//! so handle equality is structural equality, except for structs, which are
//! nominal: every [`Module::declare_struct`] call produces a distinct struct.
//!
//! The module also keeps a use-list for every [`Value`], kept up to date by
//! all of the mutation methods, so that passes can find the consumers of a
//! value without rescanning the whole module.

pub mod builder;
mod constant;
mod inst;
mod print;
mod types;

pub use self::builder::{Builder, InsertPoint};
pub use self::constant::{Const, ConstDef, ConstKind, ScalarConst};
pub use self::inst::{
    Block, BlockDef, Builtin, Callee, Func, FuncDef, Inst, InstDef, InstKind, ShaderStage, Usage,
    Value,
};
pub use self::types::{
    AccessMode, ArrayCount, ScalarType, Struct, StructDef, StructMember, Type, TypeDef,
};
pub use rspirv::spirv::StorageClass;

use indexmap::IndexSet;
use rustc_hash::{FxBuildHasher, FxHashMap};
use smallvec::SmallVec;
use std::collections::BTreeSet;

pub(crate) type FxIndexSet<T> = IndexSet<T, FxBuildHasher>;

/// Defines a `u32`-backed entity handle, indexing into one of the arenas of
/// a [`Module`].
macro_rules! def_handle {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            pub(crate) fn from_index(index: usize) -> Self {
                Self(u32::try_from(index).expect(concat!(stringify!($name), " arena overflow")))
            }

            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}
pub(crate) use def_handle;

#[derive(Clone)]
pub struct Module {
    types: FxIndexSet<TypeDef>,
    structs: Vec<StructDef>,
    consts: FxIndexSet<ConstDef>,
    insts: Vec<InstDef>,
    blocks: Vec<BlockDef>,
    funcs: Vec<FuncDef>,

    /// Block holding module-scope declarations (i.e. `Var`s).
    root: Block,

    uses: FxHashMap<Value, SmallVec<[Usage; 2]>>,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Module {
    pub fn new() -> Self {
        Self {
            types: FxIndexSet::default(),
            structs: vec![],
            consts: FxIndexSet::default(),
            insts: vec![],
            blocks: vec![BlockDef::default()],
            funcs: vec![],
            root: Block::from_index(0),
            uses: FxHashMap::default(),
        }
    }

    pub fn root(&self) -> Block {
        self.root
    }

    pub fn funcs(&self) -> impl ExactSizeIterator<Item = Func> + '_ {
        (0..self.funcs.len()).map(Func::from_index)
    }

    pub fn structs(&self) -> impl ExactSizeIterator<Item = Struct> + '_ {
        (0..self.structs.len()).map(Struct::from_index)
    }

    pub fn new_block(&mut self) -> Block {
        let block = Block::from_index(self.blocks.len());
        self.blocks.push(BlockDef::default());
        block
    }

    pub fn declare_func(
        &mut self,
        name: impl Into<String>,
        params: impl IntoIterator<Item = Type>,
        ret: Type,
        stage: Option<ShaderStage>,
    ) -> Func {
        let body = self.new_block();
        let func = Func::from_index(self.funcs.len());
        self.funcs.push(FuncDef {
            name: name.into(),
            params: params.into_iter().collect(),
            ret,
            body,
            stage,
        });
        func
    }

    pub fn param(&self, func: Func, param_idx: u32) -> Value {
        assert!((param_idx as usize) < self.funcs[func.index()].params.len());
        Value::FuncParam { func, param_idx }
    }

    pub fn set_param_type(&mut self, func: Func, param_idx: u32, ty: Type) {
        self.funcs[func.index()].params[param_idx as usize] = ty;
    }

    pub fn set_return_type(&mut self, func: Func, ty: Type) {
        self.funcs[func.index()].ret = ty;
    }

    pub fn type_of(&self, value: Value) -> Type {
        match value {
            Value::Const(ct) => self[ct].ty,
            Value::InstOutput { inst, output_idx } => self[inst].outputs()[output_idx as usize],
            Value::FuncParam { func, param_idx } => self[func].params[param_idx as usize],
        }
    }

    /// Creates a new (detached) instruction, registering the uses of its
    /// inputs. Use [`Module::append`] or [`Module::insert_before`] (or a
    /// [`Builder`]) to place it in a block.
    pub fn define_inst(
        &mut self,
        kind: InstKind,
        inputs: impl IntoIterator<Item = Value>,
        outputs: impl IntoIterator<Item = Type>,
    ) -> Inst {
        let inst = Inst::from_index(self.insts.len());
        let inputs: SmallVec<[Value; 4]> = inputs.into_iter().collect();
        for (operand_idx, &input) in inputs.iter().enumerate() {
            self.add_use(input, Usage {
                inst,
                operand_idx: operand_idx as u32,
            });
        }
        self.insts.push(InstDef {
            kind,
            inputs,
            outputs: outputs.into_iter().collect(),
            parent: None,
            alive: true,
        });
        inst
    }

    pub fn append(&mut self, block: Block, inst: Inst) {
        assert!(self[inst].parent.is_none(), "{inst:?} is already placed");
        self.blocks[block.index()].insts.push(inst);
        self.insts[inst.index()].parent = Some(block);
    }

    pub fn insert_before(&mut self, anchor: Inst, inst: Inst) {
        assert!(self[inst].parent.is_none(), "{inst:?} is already placed");
        let block = self[anchor]
            .parent
            .unwrap_or_else(|| panic!("insert_before: anchor {anchor:?} is detached"));
        let insts = &mut self.blocks[block.index()].insts;
        let pos = insts.iter().position(|&i| i == anchor).unwrap();
        insts.insert(pos, inst);
        self.insts[inst.index()].parent = Some(block);
    }

    /// Detaches `inst` from its block and drops the uses of its inputs
    /// (recursively, for the contents of `Loop` bodies).
    pub fn remove_inst(&mut self, inst: Inst) {
        if !self[inst].alive {
            return;
        }
        if let Some(block) = self.insts[inst.index()].parent.take() {
            self.blocks[block.index()].insts.retain(|&i| i != inst);
        }
        if let InstKind::Loop { body, .. } = self[inst].kind {
            for inner in self.blocks[body.index()].insts.clone() {
                self.remove_inst(inner);
            }
        }
        let inputs = std::mem::take(&mut self.insts[inst.index()].inputs);
        for (operand_idx, input) in inputs.into_iter().enumerate() {
            self.remove_use(input, Usage {
                inst,
                operand_idx: operand_idx as u32,
            });
        }
        self.insts[inst.index()].alive = false;
    }

    pub fn is_alive(&self, inst: Inst) -> bool {
        self[inst].alive
    }

    pub fn set_input(&mut self, inst: Inst, operand_idx: usize, value: Value) {
        let old = std::mem::replace(&mut self.insts[inst.index()].inputs[operand_idx], value);
        if old == value {
            return;
        }
        let usage = Usage {
            inst,
            operand_idx: operand_idx as u32,
        };
        self.remove_use(old, usage);
        self.add_use(value, usage);
    }

    /// Replaces all of the inputs of `inst` (e.g. to pop or swap indices).
    pub fn set_inputs(&mut self, inst: Inst, inputs: impl IntoIterator<Item = Value>) {
        let old = std::mem::take(&mut self.insts[inst.index()].inputs);
        for (operand_idx, input) in old.into_iter().enumerate() {
            self.remove_use(input, Usage {
                inst,
                operand_idx: operand_idx as u32,
            });
        }
        let new: SmallVec<[Value; 4]> = inputs.into_iter().collect();
        for (operand_idx, &input) in new.iter().enumerate() {
            self.add_use(input, Usage {
                inst,
                operand_idx: operand_idx as u32,
            });
        }
        self.insts[inst.index()].inputs = new;
    }

    pub fn set_output_type(&mut self, inst: Inst, output_idx: u32, ty: Type) {
        self.insts[inst.index()].outputs[output_idx as usize] = ty;
    }

    pub fn uses(&self, value: Value) -> &[Usage] {
        self.uses.get(&value).map_or(&[], |uses| &uses[..])
    }

    pub fn replace_all_uses_with(&mut self, old: Value, new: Value) {
        let uses: SmallVec<[Usage; 4]> = self.uses(old).iter().copied().collect();
        for Usage { inst, operand_idx } in uses {
            self.set_input(inst, operand_idx as usize, new);
        }
    }

    fn add_use(&mut self, value: Value, usage: Usage) {
        // Constants are shared by the whole module, their uses aren't tracked.
        if let Value::Const(_) = value {
            return;
        }
        self.uses.entry(value).or_default().push(usage);
    }

    fn remove_use(&mut self, value: Value, usage: Usage) {
        if let Some(uses) = self.uses.get_mut(&value) {
            if let Some(pos) = uses.iter().position(|&u| u == usage) {
                uses.remove(pos);
            }
        }
    }

    /// All live instructions reachable from `block`, in program order, with
    /// the contents of `Loop` bodies following their `Loop` instruction.
    pub fn insts_in(&self, block: Block) -> Vec<Inst> {
        fn collect(module: &Module, block: Block, out: &mut Vec<Inst>) {
            for &inst in &module[block].insts {
                out.push(inst);
                if let InstKind::Loop { body, .. } = module[inst].kind {
                    collect(module, body, out);
                }
            }
        }
        let mut out = vec![];
        collect(self, block, &mut out);
        out
    }
}

impl Module {
    pub fn lookup_type(&self, def: &TypeDef) -> Option<Type> {
        self.types.get_index_of(def).map(Type::from_index)
    }

    /// All types reachable from the live contents of the module (variables,
    /// instruction results, constant operands and function signatures),
    /// including the types nested inside them.
    pub fn referenced_types(&self) -> BTreeSet<Type> {
        let mut types = BTreeSet::new();
        let mut visit_stack: Vec<Type> = vec![];

        let all_insts = self
            .funcs()
            .flat_map(|func| self.insts_in(self[func].body))
            .chain(self.insts_in(self.root()));
        for inst in all_insts {
            visit_stack.extend(self[inst].outputs().iter().copied());
            for &input in self[inst].inputs() {
                if let Value::Const(ct) = input {
                    visit_stack.push(self[ct].ty);
                }
            }
        }
        for func in self.funcs() {
            visit_stack.extend(self[func].params.iter().copied());
            visit_stack.push(self[func].ret);
        }

        while let Some(ty) = visit_stack.pop() {
            if !types.insert(ty) {
                continue;
            }
            match self[ty] {
                TypeDef::Void | TypeDef::Scalar(_) => {}
                TypeDef::Vector { element, .. }
                | TypeDef::Matrix { element, .. }
                | TypeDef::Array { element, .. } => visit_stack.push(element),
                TypeDef::Pointer { store, .. } => visit_stack.push(store),
                TypeDef::Struct(s) => {
                    visit_stack.extend(self[s].members.iter().map(|member| member.ty));
                }
            }
        }
        types
    }

    pub fn referenced_structs(&self) -> BTreeSet<Struct> {
        self.referenced_types()
            .into_iter()
            .filter_map(|ty| match self[ty] {
                TypeDef::Struct(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

macro_rules! impl_index {
    ($($handle:ident => $field:ident: $def:ty),+ $(,)?) => {
        $(impl std::ops::Index<$handle> for Module {
            type Output = $def;
            fn index(&self, handle: $handle) -> &$def {
                &self.$field[handle.index()]
            }
        })+
    };
}
impl_index! {
    Type => types: TypeDef,
    Struct => structs: StructDef,
    Const => consts: ConstDef,
    Inst => insts: InstDef,
    Block => blocks: BlockDef,
    Func => funcs: FuncDef,
}
