//! Positioned instruction emission.

use super::{
    AccessMode, Block, Builtin, Callee, Func, Inst, InstKind, Module, StorageClass, Type, TypeDef,
    Value,
};
use smallvec::SmallVec;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InsertPoint {
    End(Block),
    Before(Inst),
}

pub struct Builder<'a> {
    pub module: &'a mut Module,
    pub at: InsertPoint,
}

impl<'a> Builder<'a> {
    pub fn at_end(module: &'a mut Module, block: Block) -> Self {
        Self {
            module,
            at: InsertPoint::End(block),
        }
    }

    pub fn before(module: &'a mut Module, inst: Inst) -> Self {
        Self {
            module,
            at: InsertPoint::Before(inst),
        }
    }

    pub fn emit(
        &mut self,
        kind: InstKind,
        inputs: impl IntoIterator<Item = Value>,
        outputs: impl IntoIterator<Item = Type>,
    ) -> Inst {
        let inst = self.module.define_inst(kind, inputs, outputs);
        match self.at {
            InsertPoint::End(block) => self.module.append(block, inst),
            InsertPoint::Before(anchor) => self.module.insert_before(anchor, inst),
        }
        inst
    }

    pub fn var(
        &mut self,
        store: Type,
        addr_space: StorageClass,
        access: AccessMode,
        init: Option<Value>,
    ) -> Value {
        let ptr_ty = self.module.ty_ptr(store, addr_space, access);
        Value::output(self.emit(InstKind::Var, init, [ptr_ty]))
    }

    pub fn let_(&mut self, value: Value) -> Value {
        let ty = self.module.type_of(value);
        Value::output(self.emit(InstKind::Let, [value], [ty]))
    }

    pub fn load(&mut self, ptr: Value) -> Value {
        let ty = self.pointee_of(ptr);
        Value::output(self.emit(InstKind::Load, [ptr], [ty]))
    }

    pub fn store(&mut self, ptr: Value, value: Value) -> Inst {
        self.emit(InstKind::Store, [ptr, value], [])
    }

    /// `Access` with its result type derived from `base` and `indices`.
    pub fn access(&mut self, base: Value, indices: impl IntoIterator<Item = Value>) -> Value {
        let indices: SmallVec<[Value; 4]> = indices.into_iter().collect();
        let base_ty = self.module.type_of(base);
        let (mut ty, ptr) = match self.module[base_ty] {
            TypeDef::Pointer {
                store,
                addr_space,
                access,
            } => (store, Some((addr_space, access))),
            _ => (base_ty, None),
        };
        for &index in &indices {
            let const_index = match index {
                Value::Const(ct) => self.module.const_as_index(ct),
                _ => None,
            };
            ty = self.module.element_type(ty, const_index).unwrap_or_else(|| {
                panic!(
                    "access: cannot index into `{}` with {index:?}",
                    self.module.display_type(ty)
                )
            });
        }
        if let Some((addr_space, access)) = ptr {
            ty = self.module.ty_ptr(ty, addr_space, access);
        }
        self.access_typed(ty, base, indices)
    }

    pub fn access_typed(
        &mut self,
        result_ty: Type,
        base: Value,
        indices: impl IntoIterator<Item = Value>,
    ) -> Value {
        let inputs = [base].into_iter().chain(indices);
        Value::output(self.emit(InstKind::Access, inputs, [result_ty]))
    }

    pub fn construct(&mut self, ty: Type, components: impl IntoIterator<Item = Value>) -> Value {
        Value::output(self.emit(InstKind::Construct, components, [ty]))
    }

    pub fn load_vector_element(&mut self, ptr: Value, index: Value) -> Value {
        let vec_ty = self.pointee_of(ptr);
        let ty = match self.module[vec_ty] {
            TypeDef::Vector { element, .. } => element,
            _ => unreachable!(
                "load_vector_element: `{}` is not a vector",
                self.module.display_type(vec_ty)
            ),
        };
        Value::output(self.emit(InstKind::LoadVectorElement, [ptr, index], [ty]))
    }

    pub fn store_vector_element(&mut self, ptr: Value, index: Value, value: Value) -> Inst {
        self.emit(InstKind::StoreVectorElement, [ptr, index, value], [])
    }

    /// Call to a non-`void` function.
    pub fn call(&mut self, func: Func, args: impl IntoIterator<Item = Value>) -> Value {
        let ret = self.module[func].ret;
        Value::output(self.emit(InstKind::Call(Callee::Func(func)), args, [ret]))
    }

    pub fn call_void(&mut self, func: Func, args: impl IntoIterator<Item = Value>) -> Inst {
        self.emit(InstKind::Call(Callee::Func(func)), args, [])
    }

    pub fn transpose(&mut self, matrix: Value) -> Value {
        let ty = self.module.type_of(matrix);
        let transposed = match self.module[ty] {
            TypeDef::Matrix {
                element,
                columns,
                rows,
            } => self.module.ty_mat(element, rows, columns),
            _ => unreachable!("transpose: `{}` is not a matrix", self.module.display_type(ty)),
        };
        Value::output(self.emit(
            InstKind::Call(Callee::Builtin(Builtin::Transpose)),
            [matrix],
            [transposed],
        ))
    }

    pub fn convert(&mut self, ty: Type, value: Value) -> Value {
        Value::output(self.emit(InstKind::Convert, [value], [ty]))
    }

    /// Emits a `Loop` running `count` times, with `body` building its contents
    /// (receiving the `u32` loop counter).
    pub fn loop_(&mut self, count: u32, body: impl FnOnce(&mut Builder<'_>, Value)) -> Inst {
        let body_block = self.module.new_block();
        let u32 = self.module.ty_u32();
        let inst = self.emit(
            InstKind::Loop {
                count,
                body: body_block,
            },
            [],
            [u32],
        );
        body(
            &mut Builder::at_end(self.module, body_block),
            Value::output(inst),
        );
        inst
    }

    pub fn ret(&mut self, value: Option<Value>) -> Inst {
        self.emit(InstKind::Return, value, [])
    }

    fn pointee_of(&self, ptr: Value) -> Type {
        let ty = self.module.type_of(ptr);
        self.module
            .pointee(ty)
            .unwrap_or_else(|| panic!("`{}` is not a pointer", self.module.display_type(ty)))
    }
}
