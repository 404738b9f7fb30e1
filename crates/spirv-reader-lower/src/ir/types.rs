use super::{Module, StorageClass, def_handle};
use std::fmt;

def_handle!(
    /// Interned type, see [`TypeDef`].
    Type
);
def_handle!(
    /// Nominal struct declaration, see [`StructDef`].
    Struct
);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Bool,
    I32,
    U32,
    F32,
    F16,
}

impl ScalarType {
    pub fn size(self) -> u32 {
        match self {
            Self::Bool | Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F16 => 2,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Self::I32 | Self::U32)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::F32 => "f32",
            Self::F16 => "f16",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArrayCount {
    Constant(u32),
    Runtime,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeDef {
    Void,
    Scalar(ScalarType),
    Vector {
        element: Type,
        width: u32,
    },
    /// `columns` column vectors, each of `rows` elements.
    Matrix {
        element: Type,
        columns: u32,
        rows: u32,
    },
    Array {
        element: Type,
        count: ArrayCount,
        stride: u32,
        /// The stride came from an explicit `ArrayStride` decoration, and
        /// doesn't necessarily match the implicit (natural) stride.
        explicit_stride: bool,
    },
    Pointer {
        store: Type,
        addr_space: StorageClass,
        access: AccessMode,
    },
    Struct(Struct),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StructMember {
    pub name: String,
    pub ty: Type,
    pub index: u32,
    pub offset: u32,
    pub align: u32,
    pub size: u32,
    /// Explicit `MatrixStride` (the byte stride between the "major" vectors).
    pub matrix_stride: Option<u32>,
    /// `RowMajor` decoration, i.e. each logical *row* of the matrices in
    /// this member is stored contiguously.
    pub row_major: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StructDef {
    pub name: String,
    pub members: Vec<StructMember>,
    pub align: u32,
    pub size: u32,
}

impl Module {
    pub fn intern_type(&mut self, def: TypeDef) -> Type {
        let (index, _) = self.types.insert_full(def);
        Type::from_index(index)
    }

    pub fn ty_void(&mut self) -> Type {
        self.intern_type(TypeDef::Void)
    }

    pub fn ty_scalar(&mut self, scalar: ScalarType) -> Type {
        self.intern_type(TypeDef::Scalar(scalar))
    }

    pub fn ty_bool(&mut self) -> Type {
        self.ty_scalar(ScalarType::Bool)
    }

    pub fn ty_i32(&mut self) -> Type {
        self.ty_scalar(ScalarType::I32)
    }

    pub fn ty_u32(&mut self) -> Type {
        self.ty_scalar(ScalarType::U32)
    }

    pub fn ty_f32(&mut self) -> Type {
        self.ty_scalar(ScalarType::F32)
    }

    pub fn ty_f16(&mut self) -> Type {
        self.ty_scalar(ScalarType::F16)
    }

    pub fn ty_vec(&mut self, element: Type, width: u32) -> Type {
        self.intern_type(TypeDef::Vector { element, width })
    }

    pub fn ty_mat(&mut self, element: Type, columns: u32, rows: u32) -> Type {
        // Always present, for `lookup_type` (i.e. without `&mut Module`).
        self.ty_vec(element, rows);
        self.intern_type(TypeDef::Matrix {
            element,
            columns,
            rows,
        })
    }

    /// Array with the implicit (natural) stride of `element`.
    pub fn ty_array(&mut self, element: Type, count: u32) -> Type {
        let stride = self.natural_stride(element);
        self.intern_type(TypeDef::Array {
            element,
            count: ArrayCount::Constant(count),
            stride,
            explicit_stride: false,
        })
    }

    pub fn ty_array_with_stride(&mut self, element: Type, count: ArrayCount, stride: u32) -> Type {
        self.intern_type(TypeDef::Array {
            element,
            count,
            stride,
            explicit_stride: true,
        })
    }

    pub fn ty_runtime_array(&mut self, element: Type) -> Type {
        let stride = self.natural_stride(element);
        self.intern_type(TypeDef::Array {
            element,
            count: ArrayCount::Runtime,
            stride,
            explicit_stride: false,
        })
    }

    pub fn ty_ptr(&mut self, store: Type, addr_space: StorageClass, access: AccessMode) -> Type {
        self.intern_type(TypeDef::Pointer {
            store,
            addr_space,
            access,
        })
    }

    pub fn declare_struct(&mut self, def: StructDef) -> Type {
        for (i, member) in def.members.iter().enumerate() {
            assert_eq!(member.index as usize, i, "struct `{}` member order", def.name);
        }
        let s = Struct::from_index(self.structs.len());
        self.structs.push(def);
        self.intern_type(TypeDef::Struct(s))
    }

    /// Lays out `members` (name, type, row-major) with natural offsets, and
    /// declares the resulting struct.
    pub fn declare_struct_with_layout(
        &mut self,
        name: impl Into<String>,
        members: impl IntoIterator<Item = (&'static str, Type, bool)>,
    ) -> Type {
        let mut offset = 0u32;
        let mut struct_align = 1;
        let members = members
            .into_iter()
            .enumerate()
            .map(|(index, (name, ty, row_major))| {
                let (size, align) = if row_major {
                    self.row_major_size_align(ty)
                } else {
                    (self.size_of(ty), self.align_of(ty))
                };
                offset = offset.next_multiple_of(align);
                struct_align = struct_align.max(align);
                let member = StructMember {
                    name: name.to_string(),
                    ty,
                    index: index as u32,
                    offset,
                    align,
                    size,
                    matrix_stride: None,
                    row_major,
                };
                offset += size;
                member
            })
            .collect();
        self.declare_struct(StructDef {
            name: name.into(),
            members,
            align: struct_align,
            size: offset.next_multiple_of(struct_align),
        })
    }

    pub fn scalar_type(&self, ty: Type) -> Option<ScalarType> {
        match self[ty] {
            TypeDef::Scalar(scalar) => Some(scalar),
            _ => None,
        }
    }

    pub fn pointee(&self, ty: Type) -> Option<Type> {
        match self[ty] {
            TypeDef::Pointer { store, .. } => Some(store),
            _ => None,
        }
    }

    /// The type of the column vectors of a matrix type.
    pub fn column_type(&mut self, matrix: Type) -> Type {
        match self[matrix] {
            TypeDef::Matrix { element, rows, .. } => self.ty_vec(element, rows),
            _ => unreachable!("column_type: {} is not a matrix", self.display_type(matrix)),
        }
    }

    /// The type reached by indexing into `ty` (with `index` only needed for
    /// structs, where it must be known statically).
    pub fn element_type(&mut self, ty: Type, index: Option<u32>) -> Option<Type> {
        match self[ty] {
            TypeDef::Vector { element, .. } | TypeDef::Array { element, .. } => Some(element),
            TypeDef::Matrix { .. } => Some(self.column_type(ty)),
            TypeDef::Struct(s) => {
                let index = index?;
                self[s].members.get(index as usize).map(|m| m.ty)
            }
            TypeDef::Void | TypeDef::Scalar(_) | TypeDef::Pointer { .. } => None,
        }
    }

    pub fn size_of(&self, ty: Type) -> u32 {
        match self[ty] {
            TypeDef::Void | TypeDef::Pointer { .. } => 0,
            TypeDef::Scalar(scalar) => scalar.size(),
            TypeDef::Vector { element, width } => width * self.size_of(element),
            TypeDef::Matrix {
                element, columns, ..
            } => columns * self.default_matrix_stride(ty).unwrap_or(self.size_of(element)),
            TypeDef::Array { count, stride, .. } => match count {
                ArrayCount::Constant(count) => count * stride,
                ArrayCount::Runtime => stride,
            },
            TypeDef::Struct(s) => self[s].size,
        }
    }

    pub fn align_of(&self, ty: Type) -> u32 {
        match self[ty] {
            TypeDef::Void | TypeDef::Pointer { .. } => 1,
            TypeDef::Scalar(scalar) => scalar.size(),
            TypeDef::Vector { element, width } => {
                let size = self.size_of(element);
                if width == 2 { 2 * size } else { 4 * size }
            }
            TypeDef::Matrix { .. } => self.default_matrix_stride(ty).unwrap(),
            TypeDef::Array { element, .. } => self.align_of(element),
            TypeDef::Struct(s) => self[s].align,
        }
    }

    /// Size and alignment of `ty` when its matrices are laid out row-major.
    fn row_major_size_align(&self, ty: Type) -> (u32, u32) {
        match self[ty] {
            TypeDef::Matrix {
                element,
                columns,
                rows,
            } => {
                let row_align = if columns == 2 { 2 } else { 4 } * self.size_of(element);
                (rows * row_align, row_align)
            }
            TypeDef::Array { count, stride, element, .. } => {
                let (_, align) = self.row_major_size_align(element);
                let size = match count {
                    ArrayCount::Constant(count) => count * stride,
                    ArrayCount::Runtime => stride,
                };
                (size, align)
            }
            _ => (self.size_of(ty), self.align_of(ty)),
        }
    }

    /// Byte stride between the column vectors of a column-major matrix, when
    /// not overridden by an explicit `MatrixStride` (i.e. the column alignment).
    pub fn default_matrix_stride(&self, matrix: Type) -> Option<u32> {
        match self[matrix] {
            TypeDef::Matrix { element, rows, .. } => {
                let size = self.size_of(element);
                Some(if rows == 2 { 2 * size } else { 4 * size })
            }
            _ => None,
        }
    }

    fn natural_stride(&self, element: Type) -> u32 {
        self.size_of(element).next_multiple_of(self.align_of(element))
    }

    pub fn display_type(&self, ty: Type) -> impl fmt::Display + '_ {
        DisplayType { module: self, ty }
    }
}

struct DisplayType<'a> {
    module: &'a Module,
    ty: Type,
}

impl fmt::Display for DisplayType<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.module;
        match m[self.ty] {
            TypeDef::Void => f.write_str("void"),
            TypeDef::Scalar(scalar) => f.write_str(scalar.name()),
            TypeDef::Vector { element, width } => {
                write!(f, "vec{width}<{}>", m.display_type(element))
            }
            TypeDef::Matrix {
                element,
                columns,
                rows,
            } => write!(f, "mat{columns}x{rows}<{}>", m.display_type(element)),
            TypeDef::Array {
                element,
                count,
                stride,
                explicit_stride,
            } => {
                if explicit_stride {
                    write!(f, "@stride({stride}) ")?;
                }
                match count {
                    ArrayCount::Constant(count) => {
                        write!(f, "array<{}, {count}>", m.display_type(element))
                    }
                    ArrayCount::Runtime => write!(f, "array<{}>", m.display_type(element)),
                }
            }
            TypeDef::Pointer {
                store,
                addr_space,
                access,
            } => {
                let access = match access {
                    AccessMode::Read => "read",
                    AccessMode::Write => "write",
                    AccessMode::ReadWrite => "read_write",
                };
                write!(
                    f,
                    "ptr<{}, {}, {access}>",
                    addr_space_name(addr_space),
                    m.display_type(store)
                )
            }
            TypeDef::Struct(s) => f.write_str(&m[s].name),
        }
    }
}

pub(super) fn addr_space_name(addr_space: StorageClass) -> String {
    match addr_space {
        StorageClass::Function => "function".into(),
        StorageClass::Private => "private".into(),
        StorageClass::Workgroup => "workgroup".into(),
        StorageClass::Uniform => "uniform".into(),
        StorageClass::StorageBuffer => "storage".into(),
        StorageClass::PushConstant => "push_constant".into(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_structural() {
        let mut m = Module::new();
        let f32 = m.ty_f32();
        let a = m.ty_mat(f32, 2, 3);
        let b = m.ty_mat(f32, 2, 3);
        let c = m.ty_mat(f32, 3, 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn structs_are_nominal() {
        let mut m = Module::new();
        let f32 = m.ty_f32();
        let a = m.declare_struct_with_layout("S", [("x", f32, false)]);
        let b = m.declare_struct_with_layout("S", [("x", f32, false)]);
        assert_ne!(a, b);
    }

    #[test]
    fn row_major_layout_matches_transposed_column_major() {
        let mut m = Module::new();
        let f32 = m.ty_f32();
        let mat2x3 = m.ty_mat(f32, 2, 3);
        let mat3x2 = m.ty_mat(f32, 3, 2);

        // 2 columns of `vec3<f32>`, each padded to 16 bytes.
        assert_eq!((m.size_of(mat2x3), m.align_of(mat2x3)), (32, 16));
        // 3 rows of `vec2<f32>`, i.e. the same footprint as `mat3x2<f32>`.
        assert_eq!(m.row_major_size_align(mat2x3), (24, 8));
        assert_eq!((m.size_of(mat3x2), m.align_of(mat3x2)), (24, 8));
    }

    #[test]
    fn display() {
        let mut m = Module::new();
        let f32 = m.ty_f32();
        let mat = m.ty_mat(f32, 2, 3);
        let arr = m.ty_array_with_stride(mat, ArrayCount::Constant(4), 48);
        let ptr = m.ty_ptr(arr, StorageClass::Uniform, AccessMode::Read);
        assert_eq!(
            m.display_type(ptr).to_string(),
            "ptr<uniform, @stride(48) array<mat2x3<f32>, 4>, read>"
        );
    }
}
