use std::cell::Cell;
use std::rc::Rc;

use ssi::interpreter::Interpreter;
use ssi::trace::Payload;
use test_utils::{deref_int, interp_from, run_main};

#[test]
fn registered_handler_supplies_allocations() {
    let mut interp = interp_from(
        "int main() {\n    int *p = kz(8);\n    *p = 5;\n    return *p;\n}\n",
    );
    interp.register_fn(
        "kz",
        Rc::new(|interp: &mut Interpreter, _args| interp.emit("(str (str (opaque)))", &[])),
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(5), deref_int(&mut interp, result));
}

#[test]
fn handler_sees_evaluated_arguments() {
    let seen = Rc::new(Cell::new(0i64));
    let mut interp = interp_from("int main() { note(6 * 7); return 0; }\n");

    let sink = seen.clone();
    interp.register_fn(
        "note",
        Rc::new(move |interp: &mut Interpreter, args| {
            let inner = interp
                .emit("(* {0})", &[ssi::interpreter::EmitArg::Val(args[0])])?
                .expect("argument value");
            if let Payload::Int(n) = interp.trace.cval(inner) {
                sink.set(*n);
            }
            Ok(None)
        }),
    );

    let _ = run_main(&mut interp);
    assert_eq!(42, seen.get());
}

#[test]
fn missing_function_body_yields_opaque() {
    let mut interp = interp_from("int main() {\n    int r = mystery(4);\n    return r;\n}\n");
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(None, deref_int(&mut interp, result));

    let inner = interp
        .emit("(* {0})", &[ssi::interpreter::EmitArg::Val(result)])
        .unwrap()
        .expect("stored value");
    assert!(matches!(interp.trace.cval(inner), Payload::Opaque(_)));
    assert!(interp.opaque_reason(inner).is_some());
}

#[test]
fn breakpoints_fire_before_the_line() {
    let fired = Rc::new(Cell::new(false));
    let mut interp = interp_from("int a = 1;\nint b = 2;\n");

    let flag = fired.clone();
    interp.break_lines.insert(
        2,
        Rc::new(move |_interp: &mut Interpreter| {
            flag.set(true);
            Ok(())
        }),
    );

    interp.globals_pass().unwrap();
    assert!(fired.get());
}

#[test]
fn set_to_line_moves_the_head() {
    let mut interp = interp_from("int a = 1;\nint b = 2;\nint c = 3;\n");
    interp.set_to_line(3);
    test_utils::run_to_end(&mut interp);

    // Only line 3 executed.
    assert_eq!(Some(3), test_utils::local_int(&mut interp, "c"));
    let b = interp.trace.local("b");
    assert!(!interp.trace.is_concrete(b));
}

#[test]
fn module_metadata_handlers_run_during_globals_pass() {
    let collected = Rc::new(Cell::new(false));
    let mut interp = interp_from("MODULE_LICENSE(\"GPL\");\nint x;\n");

    let flag = collected.clone();
    interp.register_fn(
        "MODULE_LICENSE",
        Rc::new(move |interp: &mut Interpreter, args| {
            let inner = interp
                .emit("(* {0})", &[ssi::interpreter::EmitArg::Val(args[0])])?
                .expect("license string cell");
            if matches!(interp.trace.cval(inner), Payload::Str(s) if s == "GPL") {
                flag.set(true);
            }
            Ok(None)
        }),
    );

    interp.globals_pass().unwrap();
    assert!(collected.get());
}
