use super::{Origin, RowMajorEliminator};
use crate::ir::{AccessMode, Builder, Inst, StorageClass, Type, TypeDef, Value};
use smallvec::SmallVec;
use tracing::{instrument, trace};

impl RowMajorEliminator<'_> {
    /// Walks the indices of an `Access` through the original types of its
    /// base, and rewrites it depending on how deep it reaches into a row-major
    /// matrix (if at all):
    /// - not at all (or the whole matrix): only its result type changes
    /// - a logical column: the column index is popped off (pointers keep it
    ///   around for their users, in `column_accesses`)
    /// - a single element: the row and column indices are swapped
    #[instrument(level = "trace", skip(self))]
    pub(super) fn classify_access(&mut self, inst: Inst) {
        self.rewritten_insts.insert(inst);

        let inputs: SmallVec<[Value; 4]> = self.module[inst].inputs().iter().copied().collect();
        let (&base, indices) = inputs
            .split_first()
            .unwrap_or_else(|| unreachable!("{inst:?}: access without a base"));

        if let Some(&column) = self.column_accesses.get(&base) {
            // Element `row` of a logical column is in the physical column `row`.
            let &[row] = indices else {
                unreachable!("{inst:?}: too many indices into a logical column")
            };
            trace!(?inst, "element of logical column");
            self.module.set_inputs(inst, [base, row, column]);
            return;
        }

        let origin = self.origin(base);
        let (mut ty, ptr) = match self.module[origin.ty] {
            TypeDef::Pointer {
                store,
                addr_space,
                access,
            } => (store, Some((addr_space, access))),
            _ => (origin.ty, None),
        };
        let mut row_major = origin.row_major;
        // Position (in `indices`) and type of the first transposed matrix reached.
        let mut transposed_matrix = None;
        for (i, &index) in indices.iter().enumerate() {
            let const_index = match index {
                Value::Const(ct) => self.module.const_as_index(ct),
                _ => None,
            };
            match self.module[ty] {
                TypeDef::Struct(s) => {
                    let member_idx = const_index
                        .unwrap_or_else(|| unreachable!("{inst:?}: dynamic struct member index"));
                    let member = &self.module[s].members[member_idx as usize];
                    row_major = member.row_major;
                    ty = member.ty;
                    continue;
                }
                TypeDef::Matrix { .. } if row_major && transposed_matrix.is_none() => {
                    transposed_matrix = Some((i, ty));
                }
                _ => {}
            }
            ty = self.module.element_type(ty, const_index).unwrap_or_else(|| {
                unreachable!(
                    "{inst:?}: cannot index into `{}`",
                    self.module.display_type(ty)
                )
            });
        }

        match transposed_matrix {
            None => self.retype_access(inst, ty, row_major, ptr),
            Some((i, matrix)) if i + 1 == indices.len() => {
                self.access_logical_column(inst, &inputs, i, matrix, ptr);
            }
            Some((i, _)) if i + 2 == indices.len() => {
                trace!(?inst, "element of row-major matrix");
                let mut swapped = inputs.clone();
                let len = swapped.len();
                swapped.swap(len - 2, len - 1);
                self.module.set_inputs(inst, swapped);
            }
            Some((i, matrix)) => unreachable!(
                "{inst:?}: {} indices past row-major `{}`",
                indices.len() - i,
                self.module.display_type(matrix)
            ),
        }
    }

    /// An `Access` that doesn't reach into a transposed matrix, but which
    /// may have its result type changed (`logical` is the original type).
    fn retype_access(
        &mut self,
        inst: Inst,
        logical: Type,
        row_major: bool,
        ptr: Option<(StorageClass, AccessMode)>,
    ) {
        let result = Value::output(inst);
        let physical = self.rewrite_type(logical, row_major);
        let needs_transpose = self.needs_transpose(logical, row_major);

        match ptr {
            Some((addr_space, access)) => {
                let logical_ptr = self.module.ty_ptr(logical, addr_space, access);
                let physical_ptr = self.module.ty_ptr(physical, addr_space, access);
                self.module.set_output_type(inst, 0, physical_ptr);
                if physical_ptr != logical_ptr || needs_transpose {
                    trace!(?inst, needs_transpose, "retyped pointer access");
                    self.changed_value(result, Origin {
                        ty: logical_ptr,
                        row_major,
                    });
                }
            }
            // Extracting a whole transposed matrix (or array) out of a value,
            // which has to be transposed back for the users.
            None if needs_transpose => {
                let inputs: SmallVec<[Value; 4]> =
                    self.module[inst].inputs().iter().copied().collect();
                let extracted = Builder::before(self.module, inst).access_typed(
                    physical,
                    inputs[0],
                    inputs[1..].iter().copied(),
                );
                let value = self.transpose_value(extracted, inst);
                trace!(?inst, "transposing extracted value");
                self.module.replace_all_uses_with(result, value);
                self.supersede(inst);
            }
            None => {
                self.module.set_output_type(inst, 0, physical);
                if physical != logical {
                    self.changed_value(result, Origin {
                        ty: logical,
                        row_major,
                    });
                }
            }
        }
    }

    /// An `Access` reaching a logical column of the row-major `matrix`, with
    /// the column index at `indices[column_pos]` (the last index).
    fn access_logical_column(
        &mut self,
        inst: Inst,
        inputs: &[Value],
        column_pos: usize,
        matrix: Type,
        ptr: Option<(StorageClass, AccessMode)>,
    ) {
        let result = Value::output(inst);
        let (base, column) = (inputs[0], inputs[1 + column_pos]);
        let prefix = &inputs[1..1 + column_pos];
        let physical_matrix = self.rewrite_type(matrix, true);
        let logical_column = self.module.column_type(matrix);

        match ptr {
            Some((addr_space, access)) => {
                let physical_ptr = self.module.ty_ptr(physical_matrix, addr_space, access);
                let logical_ptr = self.module.ty_ptr(logical_column, addr_space, access);
                trace!(?inst, ?column, "popping logical column index");
                self.module
                    .set_inputs(inst, [base].into_iter().chain(prefix.iter().copied()));
                self.module.set_output_type(inst, 0, physical_ptr);
                self.column_accesses.insert(result, column);
                self.changed_value(result, Origin {
                    ty: logical_ptr,
                    row_major: true,
                });
            }
            None => {
                let mut b = Builder::before(self.module, inst);
                let physical = if prefix.is_empty() {
                    base
                } else {
                    b.access_typed(physical_matrix, base, prefix.iter().copied())
                };
                let logical = b.transpose(physical);
                let value = b.access_typed(logical_column, logical, [column]);
                trace!(?inst, "extracting logical column");
                self.module.replace_all_uses_with(result, value);
                self.supersede(inst);
            }
        }
    }
}
