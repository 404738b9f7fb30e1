//! Functions synthesized on demand, for accesses to transposed storage that
//! can't be expressed with a single instruction.

use super::RowMajorEliminator;
use crate::ir::{AccessMode, ArrayCount, Builder, Func, StorageClass, Type, TypeDef, Value};
use smallvec::SmallVec;
use tracing::debug;

impl RowMajorEliminator<'_> {
    /// `fn(ptr: ptr<matRxC>, column: u32) -> vecR`, gathering the logical
    /// column `column` (i.e. element `column` of every physical column) out of
    /// the transposed matrix `ptr` points to.
    pub(super) fn column_load_helper(&mut self, ptr_ty: Type) -> Func {
        if let Some(&func) = self.column_load_helpers.get(&ptr_ty) {
            return func;
        }

        let name = format!("load_column_{}", self.column_load_helpers.len());
        let (physical_column_ptr, logical_column, physical_columns) =
            self.column_helper_types(ptr_ty);
        let u32 = self.module.ty_u32();
        let func = self
            .module
            .declare_func(name, [ptr_ty, u32], logical_column, None);
        let (ptr, column) = (self.module.param(func, 0), self.module.param(func, 1));

        let body = self.module[func].body;
        let indices = self.u32_consts(physical_columns);
        let mut b = Builder::at_end(self.module, body);
        let elements: SmallVec<[Value; 4]> = indices
            .into_iter()
            .map(|i| {
                let physical_column = b.access_typed(physical_column_ptr, ptr, [i]);
                b.load_vector_element(physical_column, column)
            })
            .collect();
        let result = b.construct(logical_column, elements);
        b.ret(Some(result));

        debug!(
            helper = %self.module[func].name,
            ptr_ty = %self.module.display_type(ptr_ty),
            "synthesized column load helper"
        );
        self.column_load_helpers.insert(ptr_ty, func);
        func
    }

    /// `fn(ptr: ptr<matRxC>, column: u32, value: vecR)`, scattering `value`
    /// to the logical column `column` of the transposed matrix.
    pub(super) fn column_store_helper(&mut self, ptr_ty: Type) -> Func {
        if let Some(&func) = self.column_store_helpers.get(&ptr_ty) {
            return func;
        }

        let name = format!("store_column_{}", self.column_store_helpers.len());
        let (physical_column_ptr, logical_column, physical_columns) =
            self.column_helper_types(ptr_ty);
        let u32 = self.module.ty_u32();
        let void = self.module.ty_void();
        let TypeDef::Vector { element, .. } = self.module[logical_column] else {
            unreachable!()
        };
        let func = self
            .module
            .declare_func(name, [ptr_ty, u32, logical_column], void, None);
        let (ptr, column, value) = (
            self.module.param(func, 0),
            self.module.param(func, 1),
            self.module.param(func, 2),
        );

        let body = self.module[func].body;
        let indices = self.u32_consts(physical_columns);
        let mut b = Builder::at_end(self.module, body);
        for i in indices {
            let physical_column = b.access_typed(physical_column_ptr, ptr, [i]);
            let component = b.access_typed(element, value, [i]);
            b.store_vector_element(physical_column, column, component);
        }
        b.ret(None);

        debug!(
            helper = %self.module[func].name,
            ptr_ty = %self.module.display_type(ptr_ty),
            "synthesized column store helper"
        );
        self.column_store_helpers.insert(ptr_ty, func);
        func
    }

    /// `fn(array: A) -> A'`, where `A'` is `A` with every matrix (however
    /// deeply nested in arrays) transposed, but the same array strides.
    ///
    /// Transposition being its own inverse, the helper for `A'` is the
    /// inverse of the one for `A`, and both are needed when some storage is
    /// both loaded from and stored to. Arrays of square matrices have
    /// `A' == A`, so they share a single helper.
    pub(super) fn array_transpose_helper(&mut self, array_ty: Type) -> Func {
        if let Some(&func) = self.array_transpose_helpers.get(&array_ty) {
            return func;
        }

        let TypeDef::Array {
            element,
            count: ArrayCount::Constant(count),
            ..
        } = self.module[array_ty]
        else {
            unreachable!(
                "cannot transpose `{}` as a whole",
                self.module.display_type(array_ty)
            )
        };
        let nested_helper = match self.module[element] {
            TypeDef::Array { .. } => Some(self.array_transpose_helper(element)),
            TypeDef::Matrix { .. } => None,
            _ => unreachable!(
                "`{}` has no matrices to transpose",
                self.module.display_type(array_ty)
            ),
        };
        let transposed_ty = self.rewrite_type(array_ty, true);
        let transposed_element = self.rewrite_type(element, true);
        let transposed_element_ptr =
            self.module
                .ty_ptr(transposed_element, StorageClass::Function, AccessMode::ReadWrite);

        let name = format!("transpose_array_{}", self.array_transpose_helpers.len());
        let func = self
            .module
            .declare_func(name, [array_ty], transposed_ty, None);
        let array = self.module.param(func, 0);

        let body = self.module[func].body;
        let mut b = Builder::at_end(self.module, body);
        let result = b.var(
            transposed_ty,
            StorageClass::Function,
            AccessMode::ReadWrite,
            None,
        );
        b.loop_(count, |b, i| {
            let elem = b.access_typed(element, array, [i]);
            let transposed = match nested_helper {
                Some(helper) => b.call(helper, [elem]),
                None => b.transpose(elem),
            };
            let dest = b.access_typed(transposed_element_ptr, result, [i]);
            b.store(dest, transposed);
        });
        let transposed = b.load(result);
        b.ret(Some(transposed));

        debug!(
            helper = %self.module[func].name,
            array_ty = %self.module.display_type(array_ty),
            "synthesized array transpose helper"
        );
        self.array_transpose_helpers.insert(array_ty, func);
        func
    }

    /// For a pointer to a transposed matrix: the type of pointers to its
    /// physical columns, the type of its logical columns, and the number of
    /// physical columns (i.e. logical rows).
    fn column_helper_types(&mut self, ptr_ty: Type) -> (Type, Type, u32) {
        let TypeDef::Pointer {
            store: matrix,
            addr_space,
            access,
        } = self.module[ptr_ty]
        else {
            unreachable!("`{}` is not a pointer", self.module.display_type(ptr_ty))
        };
        let TypeDef::Matrix {
            element,
            columns,
            rows,
        } = self.module[matrix]
        else {
            unreachable!("`{}` is not a matrix", self.module.display_type(matrix))
        };
        let physical_column = self.module.ty_vec(element, rows);
        let physical_column_ptr = self.module.ty_ptr(physical_column, addr_space, access);
        let logical_column = self.module.ty_vec(element, columns);
        (physical_column_ptr, logical_column, columns)
    }

    fn u32_consts(&mut self, count: u32) -> SmallVec<[Value; 4]> {
        (0..count).map(|i| self.module.const_u32(i).into()).collect()
    }
}
