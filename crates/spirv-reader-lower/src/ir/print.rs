//! Textual form of a [`Module`], used for debugging dumps and in tests.
//!
//! Values are numbered (`%1`, `%2`, ...) in the order they're defined, with
//! module-scope `Var`s first, and every function's parameters preceding its
//! body. Only the structs actually referenced by the module are printed.

use super::{Block, Builtin, Callee, Inst, InstKind, Module, Struct, TypeDef, Value};
use rustc_hash::FxHashMap;
use std::fmt;

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printer = Printer {
            module: self,
            value_names: FxHashMap::default(),
        };
        printer.number_values();

        for s in self.referenced_structs() {
            printer.print_struct(f, s)?;
            writeln!(f)?;
        }

        let root_insts = &self[self.root()].insts;
        for &inst in root_insts {
            printer.print_inst(f, inst, 0)?;
        }
        if !root_insts.is_empty() {
            writeln!(f)?;
        }

        for (i, func) in self.funcs().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            let def = &self[func];
            if let Some(stage) = def.stage {
                write!(f, "@{} ", format!("{stage:?}").to_lowercase())?;
            }
            write!(f, "fn {}(", def.name)?;
            for param_idx in 0..def.params.len() {
                if param_idx > 0 {
                    f.write_str(", ")?;
                }
                let param = Value::FuncParam {
                    func,
                    param_idx: param_idx as u32,
                };
                write!(
                    f,
                    "{}:{}",
                    printer.value(param),
                    self.display_type(def.params[param_idx])
                )?;
            }
            f.write_str(")")?;
            if self[def.ret] != TypeDef::Void {
                write!(f, " -> {}", self.display_type(def.ret))?;
            }
            writeln!(f, " {{")?;
            printer.print_block(f, def.body, 1)?;
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

struct Printer<'a> {
    module: &'a Module,
    value_names: FxHashMap<Value, usize>,
}

impl Printer<'_> {
    fn number_values(&mut self) {
        let m = self.module;
        let mut next = 1;
        let mut name = |names: &mut FxHashMap<Value, usize>, v| {
            names.insert(v, next);
            next += 1;
        };
        for inst in m.insts_in(m.root()) {
            for output_idx in 0..m[inst].outputs().len() {
                name(&mut self.value_names, Value::InstOutput {
                    inst,
                    output_idx: output_idx as u32,
                });
            }
        }
        for func in m.funcs() {
            for param_idx in 0..m[func].params.len() {
                name(&mut self.value_names, Value::FuncParam {
                    func,
                    param_idx: param_idx as u32,
                });
            }
            for inst in m.insts_in(m[func].body) {
                for output_idx in 0..m[inst].outputs().len() {
                    name(&mut self.value_names, Value::InstOutput {
                        inst,
                        output_idx: output_idx as u32,
                    });
                }
            }
        }
    }

    fn print_struct(&self, f: &mut fmt::Formatter<'_>, s: Struct) -> fmt::Result {
        let m = self.module;
        let def = &m[s];
        writeln!(
            f,
            "{} = struct @align({}) @size({}) {{",
            def.name, def.align, def.size
        )?;
        for member in &def.members {
            write!(
                f,
                "  {}: {} @offset({})",
                member.name,
                m.display_type(member.ty),
                member.offset
            )?;
            if let Some(stride) = member.matrix_stride {
                write!(f, " @matrix_stride({stride})")?;
            }
            if member.row_major {
                f.write_str(" @row_major")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "}}")
    }

    fn print_block(&self, f: &mut fmt::Formatter<'_>, block: Block, depth: usize) -> fmt::Result {
        for &inst in &self.module[block].insts {
            self.print_inst(f, inst, depth)?;
        }
        Ok(())
    }

    fn print_inst(
        &self,
        f: &mut fmt::Formatter<'_>,
        inst: Inst,
        depth: usize,
    ) -> fmt::Result {
        let m = self.module;
        let def = &m[inst];
        let indent = "  ".repeat(depth);
        f.write_str(&indent)?;

        if let InstKind::Loop { count, body } = def.kind {
            writeln!(
                f,
                "loop {count} [{}:u32] {{",
                self.value(Value::output(inst))
            )?;
            self.print_block(f, body, depth + 1)?;
            return writeln!(f, "{indent}}}");
        }

        for (output_idx, &ty) in def.outputs().iter().enumerate() {
            if output_idx > 0 {
                f.write_str(", ")?;
            }
            let output = Value::InstOutput {
                inst,
                output_idx: output_idx as u32,
            };
            write!(f, "{}:{}", self.value(output), m.display_type(ty))?;
        }
        if !def.outputs().is_empty() {
            f.write_str(" = ")?;
        }

        match def.kind {
            InstKind::Call(Callee::Func(func)) => write!(f, "call %{}", m[func].name)?,
            InstKind::Call(Callee::Builtin(Builtin::Transpose)) => f.write_str("transpose")?,
            kind => f.write_str(kind.name())?,
        }
        let mut separator = match def.kind {
            InstKind::Call(Callee::Func(_)) => ", ",
            _ => " ",
        };
        for &input in def.inputs() {
            write!(f, "{separator}{}", self.value(input))?;
            separator = ", ";
        }
        writeln!(f)
    }

    fn value(&self, v: Value) -> String {
        match v {
            Value::Const(ct) => self.module.display_const(ct).to_string(),
            _ => match self.value_names.get(&v) {
                Some(n) => format!("%{n}"),
                None => "%<undef>".to_string(),
            },
        }
    }
}
