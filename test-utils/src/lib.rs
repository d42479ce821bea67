use ssi::interpreter::{InterpError, Interpreter, Step};
use ssi::trace::{Payload, ValueId};

/// Build an interpreter over inline C source.
pub fn interp_from(source: &str) -> Interpreter {
    Interpreter::from_source(source).expect("test source must lex")
}

/// Run the globals pass, then call `main()` and return its value.
pub fn run_main(interp: &mut Interpreter) -> Option<ValueId> {
    interp.globals_pass().expect("globals pass must succeed");
    interp.exec_c("main()", &[]).expect("main must run")
}

/// Step until the end of the stream or a top-level return, with a cap so a
/// diverging test fails instead of hanging.
pub fn run_to_end(interp: &mut Interpreter) -> Option<ValueId> {
    for _ in 0..10_000 {
        match interp.step() {
            Ok(Step::Return(v)) => return v,
            Ok(Step::Eof) => return None,
            Ok(Step::Ran) => {}
            Err(InterpError::EndOfStream) => return None,
            Err(e) => panic!("step failed: {e}"),
        }
    }
    panic!("step cap exceeded");
}

/// Resolve a value to a concrete integer. Expression results are sometimes
/// locations (a cell holding the result) and sometimes scalars (the result
/// of a load), so look through one level of memory if needed. Opaque values
/// are left alone and report `None`.
pub fn deref_int(interp: &mut Interpreter, value: ValueId) -> Option<i64> {
    match interp.trace.cval(value).clone() {
        Payload::Int(n) => Some(n),
        Payload::Mem(cell) => {
            let inner = interp.trace.get_value(cell);
            match interp.trace.cval(inner) {
                Payload::Int(n) => Some(*n),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Resolve a value to a concrete string, looking through one level of
/// memory if needed.
pub fn deref_str(interp: &mut Interpreter, value: ValueId) -> Option<String> {
    match interp.trace.cval(value).clone() {
        Payload::Str(s) => Some(s),
        Payload::Mem(cell) => {
            let inner = interp.trace.get_value(cell);
            match interp.trace.cval(inner) {
                Payload::Str(s) => Some(s.clone()),
                _ => None,
            }
        }
        _ => None,
    }
}

/// The concrete integer bound to a named local, if any.
pub fn local_int(interp: &mut Interpreter, name: &str) -> Option<i64> {
    let local = interp.trace.local(name);
    deref_int(interp, local)
}
