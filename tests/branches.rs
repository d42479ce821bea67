use ssi::trace::{Op, Payload};
use test_utils::{deref_int, interp_from, run_main};

#[test]
fn opaque_condition_takes_the_true_branch() {
    let mut interp = interp_from(
        "int main() {\n    int x;\n    if (x == 0) return 1;\n    return 2;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(1), deref_int(&mut interp, result));

    // The taken branch is recorded as an assertion over the condition.
    let assertions = interp.trace.assertions().to_vec();
    assert_eq!(1, assertions.len());
    assert!(matches!(
        interp.trace.payload(assertions[0]),
        Payload::Deferred(Op::Ne, _)
    ));
}

#[test]
fn concrete_false_condition_takes_the_else_branch() {
    let mut interp = interp_from(
        "int main() {\n    int x = 0;\n    if (x) { return 1; } else { return 2; }\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(2), deref_int(&mut interp, result));
}

#[test]
fn if_without_else_falls_through() {
    let mut interp = interp_from(
        "int main() {\n    int a = 1;\n    if (0) a = 5;\n    return a;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(1), deref_int(&mut interp, result));
}

#[test]
fn goto_jumps_forward() {
    let mut interp = interp_from(
        "int main() {\n    int a = 1;\n    goto out;\n    a = 9;\n    out: return a;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(1), deref_int(&mut interp, result));
}

#[test]
fn goto_ite_is_usable_directly() {
    let mut interp = interp_from(
        "int main() {\n    goto_ite (0) yes no;\n    yes: return 1;\n    no: return 2;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(2), deref_int(&mut interp, result));
}

#[test]
fn logical_not_lowers_to_comparison() {
    let mut interp = interp_from("int main() {\n    int x = 0;\n    return !x;\n}\n");
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(1), deref_int(&mut interp, result));
}
