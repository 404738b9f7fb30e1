use super::RowMajorEliminator;
use crate::ir::{Struct, StructDef, StructMember, Type, TypeDef};
use tracing::debug;

impl RowMajorEliminator<'_> {
    /// The type `ty` must have in the target IR, if found in a member with
    /// `row_major` set (i.e. with any matrices in it transposed).
    pub(super) fn rewrite_type(&mut self, ty: Type, row_major: bool) -> Type {
        if let Some(&cached) = self.rewritten_types.get(&(ty, row_major)) {
            return cached;
        }
        let rewritten = match self.module[ty].clone() {
            TypeDef::Matrix {
                element,
                columns,
                rows,
            } if row_major => self.module.ty_mat(element, rows, columns),
            TypeDef::Pointer {
                store,
                addr_space,
                access,
            } => {
                let store = self.rewrite_type(store, row_major);
                self.module.ty_ptr(store, addr_space, access)
            }
            TypeDef::Array {
                element,
                count,
                stride,
                explicit_stride,
            } => {
                let element = self.rewrite_type(element, row_major);
                self.module.intern_type(TypeDef::Array {
                    element,
                    count,
                    stride,
                    explicit_stride,
                })
            }
            TypeDef::Struct(s) => self.rewrite_struct(s),
            TypeDef::Void
            | TypeDef::Scalar(_)
            | TypeDef::Vector { .. }
            | TypeDef::Matrix { .. } => ty,
        };
        self.rewritten_types.insert((ty, row_major), rewritten);
        rewritten
    }

    /// Replaces `s` with a new struct with no row-major members, unless it
    /// has neither row-major members nor members of rewritten types.
    fn rewrite_struct(&mut self, s: Struct) -> Type {
        if let Some(&cached) = self.rewritten_structs.get(&s) {
            return cached;
        }

        let def = self.module[s].clone();
        let mut changed = false;
        let members: Vec<StructMember> = def
            .members
            .iter()
            .map(|member| {
                let ty = self.rewrite_type(member.ty, member.row_major);
                changed |= ty != member.ty || member.row_major;
                StructMember {
                    ty,
                    row_major: false,
                    ..member.clone()
                }
            })
            .collect();

        let rewritten = if changed {
            let new_ty = self.module.declare_struct(StructDef { members, ..def });
            let TypeDef::Struct(new_s) = self.module[new_ty] else {
                unreachable!()
            };
            debug!(name = %self.module[new_s].name, ?s, ?new_s, "rewrote struct");
            self.struct_origins.insert(new_s, s);
            new_ty
        } else {
            self.module.intern_type(TypeDef::Struct(s))
        };
        self.rewritten_structs.insert(s, rewritten);
        rewritten
    }

    /// Whether a (logical) `ty` is stored transposed, when found in a member
    /// with `row_major` set.
    pub(super) fn needs_transpose(&self, ty: Type, row_major: bool) -> bool {
        match self.module[ty] {
            TypeDef::Matrix { .. } => row_major,
            TypeDef::Array { element, .. } => self.needs_transpose(element, row_major),
            _ => false,
        }
    }
}
