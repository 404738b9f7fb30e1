use super::RowMajorEliminator;
use crate::interp::{Interpreter, Val};
use crate::ir::{
    AccessMode, ArrayCount, Builder, Func, Module, ScalarConst, ShaderStage, StorageClass,
    StructDef, StructMember, Type, TypeDef, Value,
};
use crate::lower::{Options, run, transpose_row_major};
use crate::validate::Capabilities;
use itertools::Itertools;
use pretty_assertions::assert_eq;

fn f32_bytes(xs: &[f32]) -> Vec<u8> {
    xs.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn module_var(m: &mut Module, ty: Type, addr_space: StorageClass) -> Value {
    let access = if addr_space == StorageClass::Uniform {
        AccessMode::Read
    } else {
        AccessMode::ReadWrite
    };
    let root = m.root();
    Builder::at_end(m, root).var(ty, addr_space, access, None)
}

/// A variable of `S { m: @row_major <ty> }`.
fn row_major_var(m: &mut Module, ty: Type, addr_space: StorageClass) -> Value {
    let s = m.declare_struct_with_layout("S", [("m", ty, true)]);
    module_var(m, s, addr_space)
}

fn entry(m: &mut Module, name: &str, params: &[Type], ret: Type) -> Func {
    m.declare_func(name, params.iter().copied(), ret, Some(ShaderStage::Compute))
}

fn lower(m: &mut Module) {
    run(m, &Options {
        validate_output: true,
        ..Options::default()
    })
    .unwrap();
}

fn assert_module(m: &Module, expected: &str) {
    assert_eq!(m.to_string().trim(), expected.trim());
}

fn helper_names(m: &Module) -> Vec<String> {
    m.funcs()
        .filter(|&func| m[func].stage.is_none())
        .map(|func| m[func].name.clone())
        .sorted()
        .collect()
}

/// The struct a module-scope variable holds.
fn var_struct(m: &Module, var: Value) -> &StructDef {
    let TypeDef::Pointer { store, .. } = m[m.type_of(var)] else {
        panic!("not a pointer");
    };
    let TypeDef::Struct(s) = m[store] else {
        panic!("not a struct");
    };
    &m[s]
}

#[derive(Debug, PartialEq)]
struct Outcome {
    ret: Option<Val>,
    memory: Vec<Vec<u8>>,
}

fn execute(m: &Module, func: Func, args: &[Val], inputs: &[(Value, Vec<u8>)]) -> Outcome {
    let mut interp = Interpreter::new(m).unwrap();
    for (var, bytes) in inputs {
        interp.bind(*var, bytes.clone()).unwrap();
    }
    let ret = interp.call(func, args.iter().cloned()).unwrap();
    let memory = inputs
        .iter()
        .map(|(var, _)| interp.memory(*var).unwrap().to_vec())
        .collect();
    Outcome { ret, memory }
}

/// Lowers `m`, checking that every call in `calls` has the same outcome
/// before and after.
fn lower_and_compare(
    m: &mut Module,
    calls: &[(Func, Vec<Val>)],
    inputs: &[(Value, Vec<u8>)],
) -> Vec<Outcome> {
    let before: Vec<Outcome> = calls
        .iter()
        .map(|(func, args)| execute(m, *func, args, inputs))
        .collect();
    lower(m);
    let after: Vec<Outcome> = calls
        .iter()
        .map(|(func, args)| execute(m, *func, args, inputs))
        .collect();
    assert_eq!(before, after);
    after
}

#[test]
fn whole_matrix_load_is_transposed() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::Uniform);
    let main = entry(&mut m, "main", &[], mat2x3);
    let body = m[main].body;
    let zero = m.const_u32(0);
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let outcomes = lower_and_compare(&mut m, &[(main, vec![])], &[(
        var,
        f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
    )]);
    assert_eq!(
        outcomes[0].ret,
        Some(Val::mat_f32(&[&[1.0, 3.0, 5.0], &[2.0, 4.0, 6.0]]))
    );
    assert_module(
        &m,
        r#"
S = struct @align(8) @size(24) {
  m: mat3x2<f32> @offset(0)
}

%1:ptr<uniform, S, read> = var

@compute fn main() -> mat2x3<f32> {
  %2:ptr<uniform, mat3x2<f32>, read> = access %1, 0u
  %3:mat3x2<f32> = load %2
  %4:mat2x3<f32> = transpose %3
  ret %4
}
"#,
    );
}

#[test]
fn column_load_goes_through_helper() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let vec3 = m.ty_vec(f32, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::Uniform);
    let main = entry(&mut m, "main", &[], vec3);
    let body = m[main].body;
    let (zero, one) = (m.const_u32(0), m.const_u32(1));
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into(), one.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let outcomes = lower_and_compare(&mut m, &[(main, vec![])], &[(
        var,
        f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
    )]);
    assert_eq!(outcomes[0].ret, Some(Val::vec_f32(&[2.0, 4.0, 6.0])));
    assert_module(
        &m,
        r#"
S = struct @align(8) @size(24) {
  m: mat3x2<f32> @offset(0)
}

%1:ptr<uniform, S, read> = var

@compute fn main() -> vec3<f32> {
  %2:ptr<uniform, mat3x2<f32>, read> = access %1, 0u
  %3:vec3<f32> = call %load_column_0, %2, 1u
  ret %3
}

fn load_column_0(%4:ptr<uniform, mat3x2<f32>, read>, %5:u32) -> vec3<f32> {
  %6:ptr<uniform, vec2<f32>, read> = access %4, 0u
  %7:f32 = load_vector_element %6, %5
  %8:ptr<uniform, vec2<f32>, read> = access %4, 1u
  %9:f32 = load_vector_element %8, %5
  %10:ptr<uniform, vec2<f32>, read> = access %4, 2u
  %11:f32 = load_vector_element %10, %5
  %12:vec3<f32> = construct %7, %9, %11
  ret %12
}
"#,
    );
}

#[test]
fn column_store_of_square_matrix_leaves_other_columns() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat3x3 = m.ty_mat(f32, 3, 3);
    let vec3 = m.ty_vec(f32, 3);
    let var = row_major_var(&mut m, mat3x3, StorageClass::StorageBuffer);
    let main = entry(&mut m, "main", &[], vec3);
    let body = m[main].body;
    let (zero, one) = (m.const_u32(0), m.const_u32(1));
    let elems = [10.0, 20.0, 30.0].map(|x| m.const_f32(x));
    let column = m.const_composite(vec3, elems);
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into(), one.into()]);
    b.store(ptr, column.into());
    let ptr = b.access(var, [zero.into(), one.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    // Three rows, padded to 16 bytes.
    let rows = [1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0, 7.0, 8.0, 9.0, 0.0];
    let outcomes = lower_and_compare(&mut m, &[(main, vec![])], &[(var, f32_bytes(&rows))]);
    assert_eq!(outcomes[0].ret, Some(Val::vec_f32(&[10.0, 20.0, 30.0])));
    assert_eq!(
        outcomes[0].memory[0],
        f32_bytes(&[1.0, 10.0, 3.0, 0.0, 4.0, 20.0, 6.0, 0.0, 7.0, 30.0, 9.0, 0.0])
    );
    assert_eq!(helper_names(&m), ["load_column_0", "store_column_0"]);
}

#[test]
fn element_access_swaps_row_and_column() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::Uniform);
    let main = entry(&mut m, "main", &[], f32);
    let body = m[main].body;
    let (zero, one, two) = (m.const_u32(0), m.const_u32(1), m.const_u32(2));
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into(), one.into(), two.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    lower(&mut m);
    assert_module(
        &m,
        r#"
S = struct @align(8) @size(24) {
  m: mat3x2<f32> @offset(0)
}

%1:ptr<uniform, S, read> = var

@compute fn main() -> f32 {
  %2:ptr<uniform, f32, read> = access %1, 0u, 2u, 1u
  %3:f32 = load %2
  ret %3
}
"#,
    );
}

#[test]
fn dynamic_elements_keep_their_values() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let u32 = m.ty_u32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::Uniform);

    let by_access = entry(&mut m, "by_access", &[u32, u32], f32);
    let (column, row) = (m.param(by_access, 0), m.param(by_access, 1));
    let body = m[by_access].body;
    let zero = m.const_u32(0);
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into(), column, row]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let by_vector_element = entry(&mut m, "by_vector_element", &[u32, u32], f32);
    let (column, row) = (m.param(by_vector_element, 0), m.param(by_vector_element, 1));
    let body = m[by_vector_element].body;
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into(), column]);
    let value = b.load_vector_element(ptr, row);
    b.ret(Some(value));

    let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let calls: Vec<(Func, Vec<Val>)> = [by_access, by_vector_element]
        .into_iter()
        .cartesian_product(0..2)
        .cartesian_product(0..3)
        .map(|((func, c), r)| (func, vec![Val::u32(c), Val::u32(r)]))
        .collect();
    let outcomes = lower_and_compare(&mut m, &calls, &[(var, f32_bytes(&data))]);
    for ((_, args), outcome) in calls.iter().zip(&outcomes) {
        let &[Val::Scalar(ScalarConst::U32(c)), Val::Scalar(ScalarConst::U32(r))] = &args[..] else {
            unreachable!()
        };
        assert_eq!(outcome.ret, Some(Val::f32(data[(r * 2 + c) as usize])));
    }
}

#[test]
fn store_vector_element_through_column() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let u32 = m.ty_u32();
    let void = m.ty_void();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::StorageBuffer);
    let main = entry(&mut m, "main", &[u32, u32], void);
    let (column, row) = (m.param(main, 0), m.param(main, 1));
    let body = m[main].body;
    let zero = m.const_u32(0);
    let value = m.const_f32(42.0);
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into(), column]);
    b.store_vector_element(ptr, row, value.into());
    b.ret(None);

    let outcomes = lower_and_compare(&mut m, &[(main, vec![Val::u32(1), Val::u32(2)])], &[(
        var,
        f32_bytes(&[0.0; 6]),
    )]);
    assert_eq!(
        outcomes[0].memory[0],
        f32_bytes(&[0.0, 0.0, 0.0, 0.0, 0.0, 42.0])
    );
}

#[test]
fn signed_column_index_is_converted() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let i32 = m.ty_i32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let vec3 = m.ty_vec(f32, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::Uniform);
    let main = entry(&mut m, "main", &[i32], vec3);
    let column = m.param(main, 0);
    let body = m[main].body;
    let zero = m.const_u32(0);
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into(), column]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let outcomes = lower_and_compare(
        &mut m,
        &[(main, vec![Val::Scalar(ScalarConst::I32(0))])],
        &[(var, f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))],
    );
    assert_eq!(outcomes[0].ret, Some(Val::vec_f32(&[1.0, 3.0, 5.0])));
    assert!(m.to_string().contains("= convert %2"));
}

#[test]
fn column_pointer_forwarded_through_let() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let vec3 = m.ty_vec(f32, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::Uniform);
    let main = entry(&mut m, "main", &[], vec3);
    let body = m[main].body;
    let (zero, one) = (m.const_u32(0), m.const_u32(1));
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into(), one.into()]);
    let forwarded = b.let_(ptr);
    let value = b.load(forwarded);
    b.ret(Some(value));

    let outcomes = lower_and_compare(&mut m, &[(main, vec![])], &[(
        var,
        f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
    )]);
    assert_eq!(outcomes[0].ret, Some(Val::vec_f32(&[2.0, 4.0, 6.0])));
    assert_eq!(helper_names(&m), ["load_column_0"]);
}

#[test]
fn accesses_into_loaded_struct() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let u32 = m.ty_u32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let vec3 = m.ty_vec(f32, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::Uniform);
    let (zero, one) = (m.const_u32(0), m.const_u32(1));

    let whole = entry(&mut m, "whole", &[], mat2x3);
    let body = m[whole].body;
    let mut b = Builder::at_end(&mut m, body);
    let s = b.load(var);
    let value = b.access(s, [zero.into()]);
    b.ret(Some(value));

    let column = entry(&mut m, "column", &[], vec3);
    let body = m[column].body;
    let mut b = Builder::at_end(&mut m, body);
    let s = b.load(var);
    let value = b.access(s, [zero.into(), one.into()]);
    b.ret(Some(value));

    let element = entry(&mut m, "element", &[u32, u32], f32);
    let (c, r) = (m.param(element, 0), m.param(element, 1));
    let body = m[element].body;
    let mut b = Builder::at_end(&mut m, body);
    let s = b.load(var);
    let value = b.access(s, [zero.into(), c, r]);
    b.ret(Some(value));

    let outcomes = lower_and_compare(
        &mut m,
        &[
            (whole, vec![]),
            (column, vec![]),
            (element, vec![Val::u32(1), Val::u32(2)]),
        ],
        &[(var, f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))],
    );
    assert_eq!(
        outcomes[0].ret,
        Some(Val::mat_f32(&[&[1.0, 3.0, 5.0], &[2.0, 4.0, 6.0]]))
    );
    assert_eq!(outcomes[1].ret, Some(Val::vec_f32(&[2.0, 4.0, 6.0])));
    assert_eq!(outcomes[2].ret, Some(Val::f32(6.0)));
    assert!(helper_names(&m).is_empty());
}

#[test]
fn constant_store_is_folded() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let void = m.ty_void();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::StorageBuffer);
    let main = entry(&mut m, "main", &[], void);
    let body = m[main].body;
    let zero = m.const_u32(0);
    let value = m.const_mat_f32(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into()]);
    b.store(ptr, value.into());
    b.ret(None);

    let outcomes = lower_and_compare(&mut m, &[(main, vec![])], &[(var, vec![0; 24])]);
    assert_eq!(
        outcomes[0].memory[0],
        f32_bytes(&[1.0, 4.0, 2.0, 5.0, 3.0, 6.0])
    );
    let text = m.to_string();
    assert!(text.contains(
        "store %2, mat3x2<f32>(vec2<f32>(1f, 4f), vec2<f32>(2f, 5f), vec2<f32>(3f, 6f))"
    ));
    assert!(!text.contains("transpose"));
}

#[test]
fn struct_constant_follows_member_layout() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let void = m.ty_void();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let s = m.declare_struct_with_layout("S", [("m", mat2x3, true), ("n", mat2x3, false)]);
    let var = module_var(&mut m, s, StorageClass::StorageBuffer);
    let main = entry(&mut m, "main", &[], void);
    let body = m[main].body;
    let matrix = m.const_mat_f32(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
    let value = m.const_composite(s, [matrix, matrix]);
    let mut b = Builder::at_end(&mut m, body);
    b.store(var, value.into());
    b.ret(None);

    let outcomes = lower_and_compare(&mut m, &[(main, vec![])], &[(var, vec![0; 64])]);
    assert_eq!(
        outcomes[0].memory[0],
        f32_bytes(&[
            1.0, 4.0, 2.0, 5.0, 3.0, 6.0, 0.0, 0.0, // m, rows
            1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0, // n, columns
        ])
    );
    assert_module(
        &m,
        r#"
S = struct @align(16) @size(64) {
  m: mat3x2<f32> @offset(0)
  n: mat2x3<f32> @offset(32)
}

%1:ptr<storage, S, read_write> = var

@compute fn main() {
  store %1, S(mat3x2<f32>(vec2<f32>(1f, 4f), vec2<f32>(2f, 5f), vec2<f32>(3f, 6f)), mat2x3<f32>(vec3<f32>(1f, 2f, 3f), vec3<f32>(4f, 5f, 6f)))
  ret
}
"#,
    );
}

#[test]
fn transposing_constants_twice_is_identity() {
    let mut m = Module::new();
    let value = m.const_mat_f32(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
    let transposed = m.const_mat_f32(&[&[1.0, 4.0], &[2.0, 5.0], &[3.0, 6.0]]);
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let array = m.ty_array_with_stride(mat2x3, ArrayCount::Constant(2), 24);
    let values = m.const_composite(array, [value, value]);
    let zero = m.const_zero(array);

    let mut eliminator = RowMajorEliminator::new(&mut m);
    assert_eq!(eliminator.rewrite_const(value, true), transposed);
    assert_eq!(eliminator.rewrite_const(transposed, true), value);
    assert_eq!(eliminator.rewrite_const(value, false), value);

    let transposed_values = eliminator.rewrite_const(values, true);
    assert_eq!(eliminator.rewrite_const(transposed_values, true), values);
    let transposed_zero = eliminator.rewrite_const(zero, true);
    assert_eq!(eliminator.rewrite_const(transposed_zero, true), zero);
}

#[test]
fn struct_construct_transposes_members() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let void = m.ty_void();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let array = m.ty_array_with_stride(mat2x3, ArrayCount::Constant(2), 24);
    let s = m.declare_struct_with_layout("S", [
        ("m", mat2x3, true),
        ("a", array, true),
        ("n", mat2x3, false),
    ]);
    let var = module_var(&mut m, s, StorageClass::StorageBuffer);
    let main = entry(&mut m, "main", &[mat2x3, array], void);
    let (mat, arr) = (m.param(main, 0), m.param(main, 1));
    let body = m[main].body;
    let mut b = Builder::at_end(&mut m, body);
    let value = b.construct(s, [mat, arr, mat]);
    b.store(var, value);
    b.ret(None);

    let mat_val = Val::mat_f32(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
    let arr_val = Val::Composite(vec![
        Val::mat_f32(&[&[7.0, 8.0, 9.0], &[10.0, 11.0, 12.0]]),
        Val::mat_f32(&[&[13.0, 14.0, 15.0], &[16.0, 17.0, 18.0]]),
    ]);
    // 24 + 48 bytes of row-major data, then a column-major `mat2x3` at 80.
    let outcomes = lower_and_compare(&mut m, &[(main, vec![mat_val, arr_val])], &[(
        var,
        vec![0; 112],
    )]);
    assert_eq!(
        outcomes[0].memory[0][..72].to_vec(),
        f32_bytes(&[
            1.0, 4.0, 2.0, 5.0, 3.0, 6.0, //
            7.0, 10.0, 8.0, 11.0, 9.0, 12.0, //
            13.0, 16.0, 14.0, 17.0, 15.0, 18.0,
        ])
    );
    assert_eq!(helper_names(&m), ["transpose_array_0"]);
}

#[test]
fn array_load_goes_through_helper() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let array = m.ty_array_with_stride(mat2x3, ArrayCount::Constant(2), 24);
    let s = m.declare_struct_with_layout("S", [("a", array, true)]);
    let var = module_var(&mut m, s, StorageClass::Uniform);
    let main = entry(&mut m, "main", &[], array);
    let body = m[main].body;
    let zero = m.const_u32(0);
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let data: Vec<f32> = (1..=12).map(|x| x as f32).collect();
    let outcomes = lower_and_compare(&mut m, &[(main, vec![])], &[(var, f32_bytes(&data))]);
    assert_eq!(
        outcomes[0].ret,
        Some(Val::Composite(vec![
            Val::mat_f32(&[&[1.0, 3.0, 5.0], &[2.0, 4.0, 6.0]]),
            Val::mat_f32(&[&[7.0, 9.0, 11.0], &[8.0, 10.0, 12.0]]),
        ]))
    );
    assert_module(
        &m,
        r#"
S = struct @align(8) @size(48) {
  a: @stride(24) array<mat3x2<f32>, 2> @offset(0)
}

%1:ptr<uniform, S, read> = var

@compute fn main() -> @stride(24) array<mat2x3<f32>, 2> {
  %2:ptr<uniform, @stride(24) array<mat3x2<f32>, 2>, read> = access %1, 0u
  %3:@stride(24) array<mat3x2<f32>, 2> = load %2
  %4:@stride(24) array<mat2x3<f32>, 2> = call %transpose_array_0, %3
  ret %4
}

fn transpose_array_0(%5:@stride(24) array<mat3x2<f32>, 2>) -> @stride(24) array<mat2x3<f32>, 2> {
  %6:ptr<function, @stride(24) array<mat2x3<f32>, 2>, read_write> = var
  loop 2 [%7:u32] {
    %8:mat3x2<f32> = access %5, %7
    %9:mat2x3<f32> = transpose %8
    %10:ptr<function, mat2x3<f32>, read_write> = access %6, %7
    store %10, %9
  }
  %11:@stride(24) array<mat2x3<f32>, 2> = load %6
  ret %11
}
"#,
    );
}

#[test]
fn array_helpers_are_shared_per_type() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let array = m.ty_array_with_stride(mat2x3, ArrayCount::Constant(2), 24);
    let s = m.declare_struct_with_layout("S", [("a", array, true)]);
    let var = module_var(&mut m, s, StorageClass::StorageBuffer);
    let zero = m.const_u32(0);

    let mut loads = vec![];
    for name in ["load_a", "load_b"] {
        let func = entry(&mut m, name, &[], array);
        let body = m[func].body;
        let mut b = Builder::at_end(&mut m, body);
        let ptr = b.access(var, [zero.into()]);
        let value = b.load(ptr);
        b.ret(Some(value));
        loads.push(func);
    }

    let void = m.ty_void();
    let store = entry(&mut m, "store", &[array], void);
    let value = m.param(store, 0);
    let body = m[store].body;
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into()]);
    b.store(ptr, value);
    b.ret(None);

    let data: Vec<f32> = (1..=12).map(|x| x as f32).collect();
    let stored = Val::Composite(vec![
        Val::mat_f32(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]),
        Val::mat_f32(&[&[7.0, 8.0, 9.0], &[10.0, 11.0, 12.0]]),
    ]);
    let outcomes = lower_and_compare(
        &mut m,
        &[
            (loads[0], vec![]),
            (loads[1], vec![]),
            (store, vec![stored]),
        ],
        &[(var, f32_bytes(&data))],
    );
    assert_eq!(outcomes[0], outcomes[1]);
    // One helper for each direction.
    assert_eq!(helper_names(&m), ["transpose_array_0", "transpose_array_1"]);
}

#[test]
fn nested_arrays_get_nested_helpers() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let inner = m.ty_array_with_stride(mat2x3, ArrayCount::Constant(2), 24);
    let outer = m.ty_array_with_stride(inner, ArrayCount::Constant(2), 48);
    let s = m.declare_struct_with_layout("S", [("a", outer, true)]);
    let var = module_var(&mut m, s, StorageClass::Uniform);
    let (zero, one, two) = (m.const_u32(0), m.const_u32(1), m.const_u32(2));

    let whole = entry(&mut m, "whole", &[], outer);
    let body = m[whole].body;
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let single = entry(&mut m, "single", &[], mat2x3);
    let body = m[single].body;
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into(), one.into(), zero.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let element = entry(&mut m, "element", &[], f32);
    let body = m[element].body;
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [
        zero.into(),
        one.into(),
        one.into(),
        one.into(),
        two.into(),
    ]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let data: Vec<f32> = (1..=24).map(|x| x as f32).collect();
    let outcomes = lower_and_compare(
        &mut m,
        &[(whole, vec![]), (single, vec![]), (element, vec![])],
        &[(var, f32_bytes(&data))],
    );
    assert_eq!(
        outcomes[1].ret,
        Some(Val::mat_f32(&[&[13.0, 15.0, 17.0], &[14.0, 16.0, 18.0]]))
    );
    // `a[1][1]`, row 2 of column 1.
    assert_eq!(outcomes[2].ret, Some(Val::f32(24.0)));
    assert_eq!(helper_names(&m), ["transpose_array_0", "transpose_array_1"]);
}

#[test]
fn explicit_matrix_stride_is_kept() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let vec3 = m.ty_vec(f32, 3);
    // Rows 32 bytes apart, twice the natural stride.
    let s = m.declare_struct(StructDef {
        name: "S".into(),
        members: vec![StructMember {
            name: "m".into(),
            ty: mat2x3,
            index: 0,
            offset: 0,
            align: 16,
            size: 96,
            matrix_stride: Some(32),
            row_major: true,
        }],
        align: 16,
        size: 96,
    });
    let var = module_var(&mut m, s, StorageClass::StorageBuffer);
    let (zero, one) = (m.const_u32(0), m.const_u32(1));

    let whole = entry(&mut m, "whole", &[], mat2x3);
    let body = m[whole].body;
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let column = entry(&mut m, "column", &[vec3], vec3);
    let new_column = m.param(column, 0);
    let body = m[column].body;
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into(), one.into()]);
    let value = b.load(ptr);
    b.store(ptr, new_column);
    b.ret(Some(value));

    let mut data = vec![0.0; 24];
    for (row, values) in [[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]].into_iter().enumerate() {
        data[row * 8..][..2].copy_from_slice(&values);
    }
    let outcomes = lower_and_compare(
        &mut m,
        &[
            (whole, vec![]),
            (column, vec![Val::vec_f32(&[7.0, 8.0, 9.0])]),
        ],
        &[(var, f32_bytes(&data))],
    );
    assert_eq!(
        outcomes[0].ret,
        Some(Val::mat_f32(&[&[1.0, 3.0, 5.0], &[2.0, 4.0, 6.0]]))
    );
    assert_eq!(outcomes[1].ret, Some(Val::vec_f32(&[2.0, 4.0, 6.0])));

    let rewritten = var_struct(&m, var);
    assert_eq!((rewritten.align, rewritten.size), (16, 96));
    let member = &rewritten.members[0];
    assert_eq!(m.display_type(member.ty).to_string(), "mat3x2<f32>");
    assert_eq!(
        (member.offset, member.size, member.matrix_stride, member.row_major),
        (0, 96, Some(32), false)
    );
}

#[test]
fn pointer_parameters_are_retyped() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::Uniform);
    let ptr_ty = m.type_of(var);
    let get = m.declare_func("get", [ptr_ty], mat2x3, None);
    let param = m.param(get, 0);
    let body = m[get].body;
    let zero = m.const_u32(0);
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(param, [zero.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let main = entry(&mut m, "main", &[], mat2x3);
    let body = m[main].body;
    let mut b = Builder::at_end(&mut m, body);
    let value = b.call(get, [var]);
    b.ret(Some(value));

    let outcomes = lower_and_compare(&mut m, &[(main, vec![])], &[(
        var,
        f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
    )]);
    assert_eq!(
        outcomes[0].ret,
        Some(Val::mat_f32(&[&[1.0, 3.0, 5.0], &[2.0, 4.0, 6.0]]))
    );
    assert_eq!(m[get].params[0], m.type_of(var));
}

#[test]
fn nested_struct_is_rewritten() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let inner = m.declare_struct_with_layout("Inner", [("m", mat2x3, true)]);
    let outer = m.declare_struct_with_layout("Outer", [("x", f32, false), ("inner", inner, false)]);
    let var = module_var(&mut m, outer, StorageClass::Uniform);
    let main = entry(&mut m, "main", &[], mat2x3);
    let body = m[main].body;
    let (zero, one) = (m.const_u32(0), m.const_u32(1));
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [one.into(), zero.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    // `x`, padding up to the 8-byte alignment of `inner`, then its rows.
    let outcomes = lower_and_compare(&mut m, &[(main, vec![])], &[(
        var,
        f32_bytes(&[0.5, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
    )]);
    assert_eq!(
        outcomes[0].ret,
        Some(Val::mat_f32(&[&[1.0, 3.0, 5.0], &[2.0, 4.0, 6.0]]))
    );
    let text = m.to_string();
    assert!(text.contains("  inner: Inner @offset(8)\n"));
    assert!(text.contains("  m: mat3x2<f32> @offset(0)\n"));
}

#[test]
fn column_major_module_is_untouched() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let s = m.declare_struct_with_layout("S", [("m", mat2x3, false)]);
    let var = module_var(&mut m, s, StorageClass::Uniform);
    let main = entry(&mut m, "main", &[], mat2x3);
    let body = m[main].body;
    let zero = m.const_u32(0);
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let before = m.to_string();
    transpose_row_major(&mut m).unwrap();
    assert_eq!(m.to_string(), before);
    assert_eq!(m.funcs().len(), 1);
}

#[test]
fn second_run_changes_nothing() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let vec3 = m.ty_vec(f32, 3);
    let array = m.ty_array_with_stride(mat2x3, ArrayCount::Constant(2), 24);
    let s = m.declare_struct_with_layout("S", [("m", mat2x3, true), ("a", array, true)]);
    let var = module_var(&mut m, s, StorageClass::StorageBuffer);
    let main = entry(&mut m, "main", &[vec3], array);
    let column = m.param(main, 0);
    let body = m[main].body;
    let (zero, one) = (m.const_u32(0), m.const_u32(1));
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into(), one.into()]);
    b.store(ptr, column);
    let ptr = b.access(var, [one.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    lower(&mut m);
    let once = m.to_string();
    lower(&mut m);
    assert_eq!(m.to_string(), once);
}

#[test]
fn invalid_input_is_left_alone() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::Uniform);
    let main = entry(&mut m, "main", &[], mat2x3);
    let body = m[main].body;
    let zero = m.const_u32(0);
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into()]);
    let value = b.load(ptr);
    b.ret(Some(value));

    let before = m.to_string();
    let err = run(&mut m, &Options {
        capabilities: Capabilities::default(),
        validate_output: false,
    })
    .unwrap_err();
    assert_eq!(err.pass, "transpose_row_major");
    assert_eq!(m.to_string(), before);
}

#[test]
#[should_panic(expected = "transposed row-major storage")]
fn passing_transposed_pointer_to_call_panics() {
    let mut m = Module::new();
    let f32 = m.ty_f32();
    let mat2x3 = m.ty_mat(f32, 2, 3);
    let var = row_major_var(&mut m, mat2x3, StorageClass::Uniform);
    let mat_ptr = m.ty_ptr(mat2x3, StorageClass::Uniform, AccessMode::Read);
    let callee = m.declare_func("callee", [mat_ptr], mat2x3, None);
    let param = m.param(callee, 0);
    let body = m[callee].body;
    let mut b = Builder::at_end(&mut m, body);
    let value = b.load(param);
    b.ret(Some(value));

    let main = entry(&mut m, "main", &[], mat2x3);
    let body = m[main].body;
    let zero = m.const_u32(0);
    let mut b = Builder::at_end(&mut m, body);
    let ptr = b.access(var, [zero.into()]);
    let value = b.call(callee, [ptr]);
    b.ret(Some(value));

    let _ = transpose_row_major(&mut m);
}
