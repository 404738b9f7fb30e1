use super::RowMajorEliminator;
use crate::ir::{Const, ConstDef, ConstKind, TypeDef};
use smallvec::SmallVec;

impl RowMajorEliminator<'_> {
    /// The constant `ct` must be replaced with, for `rewrite_type(ty, row_major)`
    /// to be its type. Matrices are transposed by shuffling their (interned)
    /// components, so the result is bit-identical to a runtime `transpose`.
    pub(super) fn rewrite_const(&mut self, ct: Const, row_major: bool) -> Const {
        if let Some(&cached) = self.rewritten_consts.get(&(ct, row_major)) {
            return cached;
        }

        let ConstDef { ty, kind } = self.module[ct].clone();
        let new_ty = self.rewrite_type(ty, row_major);
        let rewritten = match kind {
            ConstKind::Scalar(_) => ct,
            ConstKind::Zero if new_ty == ty => ct,
            ConstKind::Zero => self.module.const_zero(new_ty),
            ConstKind::Composite(columns) if new_ty != ty || row_major => {
                match self.module[ty] {
                    TypeDef::Matrix {
                        element,
                        columns: column_count,
                        rows,
                    } if row_major => {
                        // New column `i` is made of the `i`-th element of every old column.
                        let new_column_ty = self.module.ty_vec(element, column_count);
                        let mut new_columns = SmallVec::<[Const; 4]>::new();
                        for i in 0..rows {
                            let elements: SmallVec<[Const; 4]> = columns
                                .iter()
                                .map(|&column| self.module.const_component(column, i))
                                .collect();
                            new_columns.push(self.module.const_composite(new_column_ty, elements));
                        }
                        self.module.const_composite(new_ty, new_columns)
                    }
                    TypeDef::Array { .. } => {
                        let elements: SmallVec<[Const; 4]> = columns
                            .iter()
                            .map(|&elem| self.rewrite_const(elem, row_major))
                            .collect();
                        self.module.const_composite(new_ty, elements)
                    }
                    TypeDef::Struct(s) => {
                        let member_row_major: SmallVec<[bool; 4]> = self.module[s]
                            .members
                            .iter()
                            .map(|member| member.row_major)
                            .collect();
                        let members: SmallVec<[Const; 4]> = columns
                            .iter()
                            .zip(member_row_major)
                            .map(|(&member, row_major)| self.rewrite_const(member, row_major))
                            .collect();
                        self.module.const_composite(new_ty, members)
                    }
                    _ => ct,
                }
            }
            ConstKind::Composite(_) => ct,
        };
        self.rewritten_consts.insert((ct, row_major), rewritten);
        rewritten
    }
}
