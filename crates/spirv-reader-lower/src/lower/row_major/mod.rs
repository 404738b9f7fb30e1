//! Elimination of row-major matrices, i.e. struct members with the `RowMajor`
//! decoration, which the target IR can't express (it only ever stores matrices
//! column-major).
//!
//! A row-major `matCxR` is laid out in memory exactly like a column-major
//! `matRxC`, so every row-major member is retyped to the transposed matrix,
//! and every use of its storage is adjusted to keep seeing the logical value:
//! - whole matrices (or arrays of them) are transposed after loading, and
//!   before storing (through helper functions, for arrays)
//! - a logical column is strided in memory, and is accessed through helper
//!   functions which gather/scatter it one element at a time
//! - a single element is accessed directly, with its row and column swapped
//!
//! Type changes are propagated through a worklist: every value whose type was
//! rewritten (or which points into transposed storage) has its consumers
//! processed, until a fixpoint is reached.

mod access;
mod consts;
mod helpers;
mod types;

#[cfg(test)]
mod tests;

use crate::ir::{
    Builder, Callee, Const, Func, FxIndexSet, Inst, InstKind, Module, Struct, Type, TypeDef,
    Value,
};
use itertools::Itertools;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::collections::VecDeque;
use tracing::{debug, instrument, trace};

/// What a value was before the pass touched it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Origin {
    /// The original type of the value.
    ty: Type,
    /// The value is (or points to) data from a row-major struct member, i.e.
    /// any matrices in `ty` are physically stored transposed.
    row_major: bool,
}

pub(super) fn eliminate(module: &mut Module) {
    let mut eliminator = RowMajorEliminator::new(module);

    eliminator.seed();
    eliminator.process_worklist();
    eliminator.remove_superseded();

    debug!(
        structs = eliminator.struct_origins.len(),
        helpers = eliminator.column_load_helpers.len()
            + eliminator.column_store_helpers.len()
            + eliminator.array_transpose_helpers.len(),
        "eliminated row-major matrices"
    );
}

struct RowMajorEliminator<'a> {
    module: &'a mut Module,

    rewritten_types: FxHashMap<(Type, bool), Type>,
    rewritten_structs: FxHashMap<Struct, Type>,
    rewritten_consts: FxHashMap<(Const, bool), Const>,
    /// Maps every replacement struct to the struct it replaced.
    struct_origins: FxHashMap<Struct, Struct>,

    value_origins: FxHashMap<Value, Origin>,
    /// Pointers to a logical column of a row-major matrix, which have had the
    /// column index popped off (now pointing to the whole transposed matrix),
    /// mapped to that index.
    column_accesses: FxHashMap<Value, Value>,

    /// Instructions that existed before the pass, the only ones to process
    /// (anything the pass emits is already in its final form).
    original_insts: FxHashSet<Inst>,
    inst_queue: VecDeque<Inst>,
    value_stack: Vec<Value>,
    processed_values: FxHashSet<Value>,
    /// Instructions that had their rule applied already (and must not be
    /// rewritten again).
    rewritten_insts: FxHashSet<Inst>,
    /// Instructions replaced by new ones, to remove once they're unused.
    superseded_insts: FxIndexSet<Inst>,

    column_load_helpers: FxHashMap<Type, Func>,
    column_store_helpers: FxHashMap<Type, Func>,
    array_transpose_helpers: FxHashMap<Type, Func>,
}

impl<'a> RowMajorEliminator<'a> {
    fn new(module: &'a mut Module) -> Self {
        Self {
            module,

            rewritten_types: FxHashMap::default(),
            rewritten_structs: FxHashMap::default(),
            rewritten_consts: FxHashMap::default(),
            struct_origins: FxHashMap::default(),

            value_origins: FxHashMap::default(),
            column_accesses: FxHashMap::default(),

            original_insts: FxHashSet::default(),
            inst_queue: VecDeque::new(),
            value_stack: vec![],
            processed_values: FxHashSet::default(),
            rewritten_insts: FxHashSet::default(),
            superseded_insts: FxIndexSet::default(),

            column_load_helpers: FxHashMap::default(),
            column_store_helpers: FxHashMap::default(),
            array_transpose_helpers: FxHashMap::default(),
        }
    }
}

impl RowMajorEliminator<'_> {
    /// Rewrites constant operands and the types of every parameter, result,
    /// and return type, queueing up everything that changed.
    fn seed(&mut self) {
        let funcs: SmallVec<[Func; 8]> = self.module.funcs().collect();

        for &func in &funcs {
            for param_idx in 0..self.module[func].params.len() as u32 {
                let param = self.module.param(func, param_idx);
                let ty = self.module.type_of(param);
                let new_ty = self.rewrite_type(ty, false);
                if new_ty != ty {
                    self.module.set_param_type(func, param_idx, new_ty);
                    self.changed_value(param, Origin {
                        ty,
                        row_major: false,
                    });
                }
            }
            let ret = self.module[func].ret;
            let new_ret = self.rewrite_type(ret, false);
            if new_ret != ret {
                self.module.set_return_type(func, new_ret);
            }
        }

        let root = self.module.root();
        let mut insts = self.module.insts_in(root);
        for &func in &funcs {
            insts.extend(self.module.insts_in(self.module[func].body));
        }
        self.original_insts.extend(insts.iter().copied());

        for inst in insts {
            let mut changed = false;

            for operand_idx in 0..self.module[inst].inputs().len() {
                let Value::Const(ct) = self.module[inst].inputs()[operand_idx] else {
                    continue;
                };
                let new_ct = self.rewrite_const(ct, false);
                if new_ct != ct {
                    self.module.set_input(inst, operand_idx, new_ct.into());
                    self.value_origins.insert(new_ct.into(), Origin {
                        ty: self.module[ct].ty,
                        row_major: false,
                    });
                    changed = true;
                }
            }

            for output_idx in 0..self.module[inst].outputs().len() as u32 {
                let ty = self.module[inst].outputs()[output_idx as usize];
                let new_ty = self.rewrite_type(ty, false);
                if new_ty != ty {
                    self.module.set_output_type(inst, output_idx, new_ty);
                    self.changed_value(Value::InstOutput { inst, output_idx }, Origin {
                        ty,
                        row_major: false,
                    });
                    changed = true;
                }
            }

            if changed {
                self.inst_queue.push_back(inst);
            }
        }
    }

    fn process_worklist(&mut self) {
        loop {
            while let Some(inst) = self.inst_queue.pop_front() {
                self.process_inst(inst);
            }

            let Some(value) = self.value_stack.pop() else {
                break;
            };
            if !self.processed_values.insert(value) {
                continue;
            }
            if value.defining_inst().is_some_and(|inst| !self.is_live(inst)) {
                continue;
            }
            let users: SmallVec<[Inst; 4]> = self
                .module
                .uses(value)
                .iter()
                .map(|usage| usage.inst)
                .unique()
                .collect();
            self.inst_queue.extend(users);
        }
    }

    fn remove_superseded(&mut self) {
        for inst in std::mem::take(&mut self.superseded_insts) {
            let unused = (0..self.module[inst].outputs().len() as u32).all(|output_idx| {
                self.module
                    .uses(Value::InstOutput { inst, output_idx })
                    .is_empty()
            });
            if unused {
                trace!(?inst, "removing superseded instruction");
                self.module.remove_inst(inst);
            }
        }
    }

    fn is_live(&self, inst: Inst) -> bool {
        self.module.is_alive(inst) && !self.superseded_insts.contains(&inst)
    }

    /// Records the original form of `value` (which changed type, or points
    /// into transposed storage), and queues up its users.
    fn changed_value(&mut self, value: Value, origin: Origin) {
        self.value_origins.insert(value, origin);
        self.value_stack.push(value);
    }

    fn origin(&self, value: Value) -> Origin {
        self.value_origins
            .get(&value)
            .copied()
            .unwrap_or_else(|| Origin {
                ty: self.module.type_of(value),
                row_major: false,
            })
    }

    fn supersede(&mut self, inst: Inst) {
        self.rewritten_insts.insert(inst);
        self.superseded_insts.insert(inst);
    }

    #[instrument(level = "trace", skip(self))]
    fn process_inst(&mut self, inst: Inst) {
        if !self.original_insts.contains(&inst)
            || !self.is_live(inst)
            || self.rewritten_insts.contains(&inst)
        {
            return;
        }
        match self.module[inst].kind {
            InstKind::Access => self.classify_access(inst),
            InstKind::Load => self.rewrite_load(inst),
            InstKind::Store => self.rewrite_store(inst),
            InstKind::LoadVectorElement | InstKind::StoreVectorElement => {
                self.rewrite_vector_element(inst);
            }
            InstKind::Let => self.rewrite_let(inst),
            InstKind::Construct => self.rewrite_construct(inst),
            InstKind::Call(callee) => self.check_call(inst, callee),
            InstKind::Var | InstKind::Convert | InstKind::Loop { .. } | InstKind::Return => {}
        }
    }

    fn rewrite_load(&mut self, inst: Inst) {
        let ptr = self.module[inst].inputs()[0];
        let result = Value::output(inst);

        if let Some(&column) = self.column_accesses.get(&ptr) {
            let helper = self.column_load_helper(self.module.type_of(ptr));
            let column = self.index_as_u32(column, inst);
            let loaded = Builder::before(self.module, inst).call(helper, [ptr, column]);
            trace!(?inst, ?helper, "loading logical column");
            self.module.replace_all_uses_with(result, loaded);
            self.supersede(inst);
            return;
        }

        let Some(origin) = self.value_origins.get(&ptr).copied() else {
            return;
        };
        let logical = self.pointee(origin.ty);
        if self.needs_transpose(logical, origin.row_major) {
            let loaded = Builder::before(self.module, inst).load(ptr);
            let value = self.transpose_value(loaded, inst);
            trace!(?inst, "transposing after load");
            self.module.replace_all_uses_with(result, value);
            self.supersede(inst);
            return;
        }

        let physical = self.pointee(self.module.type_of(ptr));
        if physical != self.module[inst].outputs()[0] {
            self.module.set_output_type(inst, 0, physical);
            self.rewritten_insts.insert(inst);
            self.changed_value(result, Origin {
                ty: logical,
                row_major: origin.row_major,
            });
        }
    }

    fn rewrite_store(&mut self, inst: Inst) {
        let (ptr, value) = match self.module[inst].inputs() {
            &[ptr, value] => (ptr, value),
            inputs => unreachable!("store {inst:?} with {} operands", inputs.len()),
        };

        if let Some(&column) = self.column_accesses.get(&ptr) {
            let helper = self.column_store_helper(self.module.type_of(ptr));
            let column = self.index_as_u32(column, inst);
            Builder::before(self.module, inst).call_void(helper, [ptr, column, value]);
            trace!(?inst, ?helper, "storing logical column");
            self.supersede(inst);
            return;
        }

        let Some(origin) = self.value_origins.get(&ptr).copied() else {
            return;
        };
        let logical = self.pointee(origin.ty);
        if self.needs_transpose(logical, origin.row_major) {
            let stored = match value {
                Value::Const(ct) => self.rewrite_const(ct, origin.row_major).into(),
                _ => self.transpose_value(value, inst),
            };
            trace!(?inst, "transposing before store");
            self.module.set_input(inst, 1, stored);
            self.rewritten_insts.insert(inst);
        }
    }

    /// `LoadVectorElement`/`StoreVectorElement` on a logical column: element
    /// `row` of logical column `column` is element `column` of physical
    /// column `row`.
    fn rewrite_vector_element(&mut self, inst: Inst) {
        let inputs = self.module[inst].inputs();
        let (ptr, row) = (inputs[0], inputs[1]);
        let Some(&column) = self.column_accesses.get(&ptr) else {
            return;
        };

        let ptr_ty = self.module.type_of(ptr);
        let TypeDef::Pointer {
            store: matrix,
            addr_space,
            access,
        } = self.module[ptr_ty]
        else {
            unreachable!("{inst:?}: column access doesn't produce a pointer");
        };
        let physical_column = self.module.column_type(matrix);
        let physical_column_ptr = self.module.ty_ptr(physical_column, addr_space, access);
        let column_ptr =
            Builder::before(self.module, inst).access_typed(physical_column_ptr, ptr, [row]);
        trace!(?inst, "swapping row and column");
        self.module.set_input(inst, 0, column_ptr);
        self.module.set_input(inst, 1, column);
        self.rewritten_insts.insert(inst);
    }

    fn rewrite_let(&mut self, inst: Inst) {
        let value = self.module[inst].inputs()[0];
        let Some(origin) = self.value_origins.get(&value).copied() else {
            return;
        };
        if let Some(&column) = self.column_accesses.get(&value) {
            self.column_accesses.insert(Value::output(inst), column);
        }
        let ty = self.module.type_of(value);
        self.module.set_output_type(inst, 0, ty);
        self.rewritten_insts.insert(inst);
        self.changed_value(Value::output(inst), origin);
    }

    /// `Construct` of a rewritten struct: the components supplying row-major
    /// members have to be transposed.
    fn rewrite_construct(&mut self, inst: Inst) {
        let ty = self.module[inst].outputs()[0];
        let TypeDef::Struct(s) = self.module[ty] else {
            return;
        };
        let Some(&original) = self.struct_origins.get(&s) else {
            return;
        };
        if self.module[inst].inputs().is_empty() {
            return;
        }

        let row_major_members: SmallVec<[(usize, Type); 4]> = self.module[original]
            .members
            .iter()
            .filter(|member| member.row_major)
            .map(|member| (member.index as usize, member.ty))
            .collect();
        for (member_idx, member_ty) in row_major_members {
            if !self.needs_transpose(member_ty, true) {
                continue;
            }
            let component = self.module[inst].inputs()[member_idx];
            let transposed = match component {
                Value::Const(ct) => self.rewrite_const(ct, true).into(),
                _ => self.transpose_value(component, inst),
            };
            self.module.set_input(inst, member_idx, transposed);
        }
        trace!(?inst, "transposed row-major members");
        self.rewritten_insts.insert(inst);
    }

    /// Calls only ever see logical values, as parameter types are rewritten
    /// the same way as their arguments, but pointers into transposed storage
    /// can't be passed along.
    fn check_call(&self, inst: Inst, callee: Callee) {
        for &arg in self.module[inst].inputs() {
            let transposed = self.column_accesses.contains_key(&arg)
                || self.value_origins.get(&arg).is_some_and(|origin| {
                    let ty = self.module.pointee(origin.ty).unwrap_or(origin.ty);
                    self.needs_transpose(ty, origin.row_major)
                });
            assert!(
                !transposed,
                "{inst:?}: transposed row-major storage passed to {callee:?}"
            );
        }
    }

    fn pointee(&self, ptr_ty: Type) -> Type {
        self.module.pointee(ptr_ty).unwrap_or_else(|| {
            unreachable!("`{}` is not a pointer", self.module.display_type(ptr_ty))
        })
    }

    /// Converts a (logical column) index to the `u32` the helpers expect.
    fn index_as_u32(&mut self, index: Value, before: Inst) -> Value {
        let u32 = self.module.ty_u32();
        match index {
            Value::Const(ct) => {
                let index = self
                    .module
                    .const_as_index(ct)
                    .unwrap_or_else(|| unreachable!("{before:?}: non-integer index {ct:?}"));
                self.module.const_u32(index).into()
            }
            _ if self.module.type_of(index) == u32 => index,
            _ => Builder::before(self.module, before).convert(u32, index),
        }
    }

    /// Converts a whole matrix (or array of matrices) between its logical and
    /// transposed forms (in either direction).
    fn transpose_value(&mut self, value: Value, before: Inst) -> Value {
        let ty = self.module.type_of(value);
        match self.module[ty] {
            TypeDef::Matrix { .. } => Builder::before(self.module, before).transpose(value),
            TypeDef::Array { .. } => {
                let helper = self.array_transpose_helper(ty);
                Builder::before(self.module, before).call(helper, [value])
            }
            _ => unreachable!(
                "{before:?}: cannot transpose `{}`",
                self.module.display_type(ty)
            ),
        }
    }
}
