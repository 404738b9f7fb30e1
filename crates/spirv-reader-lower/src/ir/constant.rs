use super::{Module, ScalarType, Type, def_handle};
use smallvec::SmallVec;
use std::fmt;

def_handle!(
    /// Interned constant, see [`ConstDef`].
    Const
);

/// Scalar constant value, with floats kept as their bit patterns (so that
/// constants can be interned, and are never re-rounded).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScalarConst {
    Bool(bool),
    I32(i32),
    U32(u32),
    F32(u32),
    F16(u16),
}

impl ScalarConst {
    pub fn f32(x: f32) -> Self {
        Self::F32(x.to_bits())
    }

    pub fn ty(self) -> ScalarType {
        match self {
            Self::Bool(_) => ScalarType::Bool,
            Self::I32(_) => ScalarType::I32,
            Self::U32(_) => ScalarType::U32,
            Self::F32(_) => ScalarType::F32,
            Self::F16(_) => ScalarType::F16,
        }
    }

    /// Integer value, for use as an index.
    pub fn as_index(self) -> Option<u32> {
        match self {
            Self::I32(x) => u32::try_from(x).ok(),
            Self::U32(x) => Some(x),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Bool(x) => write!(f, "{x}"),
            Self::I32(x) => write!(f, "{x}i"),
            Self::U32(x) => write!(f, "{x}u"),
            Self::F32(bits) => write!(f, "{}f", f32::from_bits(bits)),
            Self::F16(bits) => write!(f, "{bits:#06x}h"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConstKind {
    Scalar(ScalarConst),
    Composite(SmallVec<[Const; 4]>),
    /// All-zeros value of any (constructible) type.
    Zero,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConstDef {
    pub ty: Type,
    pub kind: ConstKind,
}

impl Module {
    pub fn intern_const(&mut self, def: ConstDef) -> Const {
        let (index, _) = self.consts.insert_full(def);
        Const::from_index(index)
    }

    pub fn const_scalar(&mut self, x: ScalarConst) -> Const {
        let ty = self.ty_scalar(x.ty());
        self.intern_const(ConstDef {
            ty,
            kind: ConstKind::Scalar(x),
        })
    }

    pub fn const_bool(&mut self, x: bool) -> Const {
        self.const_scalar(ScalarConst::Bool(x))
    }

    pub fn const_i32(&mut self, x: i32) -> Const {
        self.const_scalar(ScalarConst::I32(x))
    }

    pub fn const_u32(&mut self, x: u32) -> Const {
        self.const_scalar(ScalarConst::U32(x))
    }

    pub fn const_f32(&mut self, x: f32) -> Const {
        self.const_scalar(ScalarConst::f32(x))
    }

    pub fn const_f16_bits(&mut self, bits: u16) -> Const {
        self.const_scalar(ScalarConst::F16(bits))
    }

    pub fn const_composite(&mut self, ty: Type, elements: impl IntoIterator<Item = Const>) -> Const {
        self.intern_const(ConstDef {
            ty,
            kind: ConstKind::Composite(elements.into_iter().collect()),
        })
    }

    pub fn const_zero(&mut self, ty: Type) -> Const {
        self.intern_const(ConstDef {
            ty,
            kind: ConstKind::Zero,
        })
    }

    /// Matrix constant from a list of columns, each a list of `f32`s.
    pub fn const_mat_f32(&mut self, columns: &[&[f32]]) -> Const {
        let f32 = self.ty_f32();
        let rows = columns[0].len() as u32;
        let col_ty = self.ty_vec(f32, rows);
        let mat_ty = self.ty_mat(f32, columns.len() as u32, rows);
        let cols: SmallVec<[Const; 4]> = columns
            .iter()
            .map(|col| {
                assert_eq!(col.len() as u32, rows);
                let elems: SmallVec<[Const; 4]> = col.iter().map(|&x| self.const_f32(x)).collect();
                self.const_composite(col_ty, elems)
            })
            .collect();
        self.const_composite(mat_ty, cols)
    }

    /// Integer value of a scalar constant, for use as an index.
    pub fn const_as_index(&self, ct: Const) -> Option<u32> {
        match self[ct].kind {
            ConstKind::Scalar(x) => x.as_index(),
            ConstKind::Zero if self.scalar_type(self[ct].ty).is_some_and(|s| s.is_integer()) => {
                Some(0)
            }
            _ => None,
        }
    }

    /// The `i`-th component of a composite constant (also for `Zero`s).
    pub fn const_component(&mut self, ct: Const, i: u32) -> Const {
        let ty = self[ct].ty;
        if let ConstKind::Composite(elements) = &self[ct].kind {
            return elements[i as usize];
        }
        match self[ct].kind {
            ConstKind::Zero => {
                let elem_ty = self
                    .element_type(ty, Some(i))
                    .unwrap_or_else(|| panic!("const_component: {ct:?} is not a composite"));
                self.const_zero(elem_ty)
            }
            ConstKind::Scalar(_) | ConstKind::Composite(_) => {
                unreachable!("const_component: {ct:?} is a scalar")
            }
        }
    }

    pub fn display_const(&self, ct: Const) -> impl fmt::Display + '_ {
        DisplayConst { module: self, ct }
    }
}

struct DisplayConst<'a> {
    module: &'a Module,
    ct: Const,
}

impl fmt::Display for DisplayConst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.module;
        let ConstDef { ty, ref kind } = m[self.ct];
        match kind {
            ConstKind::Scalar(x) => write!(f, "{x}"),
            ConstKind::Zero => write!(f, "{}()", m.display_type(ty)),
            ConstKind::Composite(elements) => {
                write!(f, "{}(", m.display_type(ty))?;
                for (i, &elem) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", m.display_const(elem))?;
                }
                f.write_str(")")
            }
        }
    }
}
