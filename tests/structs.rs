use test_utils::{deref_int, interp_from, local_int, run_main};

#[test]
fn array_initialiser_stores_in_order() {
    let mut interp = interp_from(
        "int main() {\n    int a[3] = {10, 20, 30};\n    return a[1];\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(20), deref_int(&mut interp, result));
}

#[test]
fn array_initialiser_with_designated_index() {
    let mut interp = interp_from(
        "int main() {\n    int a[8] = {1, [4] = 2, 3};\n    return a[5];\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    // The element after [4] = 2 continues at index 5.
    assert_eq!(Some(3), deref_int(&mut interp, result));
}

#[test]
fn struct_initialiser_fills_fields() {
    let mut interp = interp_from(
        "int main() {\n    struct point p = { .x = 1, .y = 2 };\n    return p.y;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(2), deref_int(&mut interp, result));
}

#[test]
fn member_stores_and_loads() {
    let mut interp = interp_from(
        "int main() {\n    c.count = 3;\n    c.count = c.count + 1;\n    return c.count;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(4), deref_int(&mut interp, result));
}

#[test]
fn enum_declaration_binds_enumerators() {
    let mut interp = interp_from(
        "enum color { RED, GREEN = 5, BLUE };\nint g = GREEN;\nint b = BLUE;\n",
    );
    interp.globals_pass().unwrap();
    assert_eq!(Some(5), local_int(&mut interp, "g"));
    assert_eq!(Some(6), local_int(&mut interp, "b"));
    assert_eq!(Some(0), local_int(&mut interp, "RED"));
}

#[test]
fn struct_declaration_returns_its_fields() {
    let mut interp = interp_from("struct s { int x; int y; };\n");
    interp.globals_pass().unwrap();

    // The declaration evaluates to a field list without allocating memory.
    let source = "struct s { int x; int y; }";
    let stream = ssi::lexer::lex_c(source).unwrap();
    let tree = ssi::grammar::parse_expr(stream.order(), &stream).unwrap();
    assert_eq!("StructDecl", tree.label());
}

#[test]
fn statement_expression_returns_its_value() {
    let mut interp = interp_from(
        "int main() {\n    int v = ({ int t = 5; return t; });\n    return v;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(5), deref_int(&mut interp, result));
}

#[test]
fn deref_member_chain() {
    let mut interp = interp_from(
        "int main() {\n    d->inner.bits = 9;\n    return d->inner.bits;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(9), deref_int(&mut interp, result));
}

#[test]
fn union_declaration_is_a_no_op() {
    let source = "union u { int a; int b; }";
    let stream = ssi::lexer::lex_c(source).unwrap();
    let tree = ssi::grammar::parse_expr(stream.order(), &stream).unwrap();
    assert_eq!("UnionDecl", tree.label());
}
