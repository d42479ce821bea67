use test_utils::{deref_int, interp_from, local_int, run_main};

#[test]
fn for_loop_sums() {
    let mut interp = interp_from(
        "int main() {\n    int a = 0;\n    for (int i = 0; i < 3; i = i + 1) a = a + i;\n    return a;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(3), deref_int(&mut interp, result));
}

#[test]
fn for_loop_runs_exactly_three_times() {
    // At top level the loop variables stay in the global scope, so the exit
    // value of the counter is observable.
    let mut interp = interp_from(
        "int a = 0;\nfor (i = 0; i < 3; i = i + 1) a = a + 1;\n",
    );
    interp.globals_pass().unwrap();
    assert_eq!(Some(3), local_int(&mut interp, "a"));
    assert_eq!(Some(3), local_int(&mut interp, "i"));
}

#[test]
fn while_loop() {
    let mut interp = interp_from(
        "int main() {\n    int n = 10;\n    int steps = 0;\n    while (n > 0) { n = n - 3; steps = steps + 1; }\n    return steps;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(4), deref_int(&mut interp, result));
}

#[test]
fn do_while_runs_at_least_once() {
    let mut interp = interp_from(
        "int main() {\n    int a = 0;\n    do { a = a + 1; } while (0);\n    return a;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(1), deref_int(&mut interp, result));
}

#[test]
fn break_targets_the_innermost_loop() {
    // The break inside the for must leave the loop, not the switch.
    let mut interp = interp_from(
        "int a = 0;\n\
         int i = 9;\n\
         switch (1) {\n\
             case 1:\n\
                 for (i = 0; i < 10; i = i + 1) { break; }\n\
                 a = 5;\n\
                 break;\n\
             case 2:\n\
                 a = 9;\n\
                 break;\n\
         }\n",
    );
    interp.globals_pass().unwrap();
    assert_eq!(Some(5), local_int(&mut interp, "a"));
    assert_eq!(Some(0), local_int(&mut interp, "i"));
}

#[test]
fn continue_skips_to_the_update() {
    let mut interp = interp_from(
        "int main() {\n    int evens = 0;\n    for (int i = 0; i < 6; i = i + 1) {\n        if (i % 2) continue;\n        evens = evens + 1;\n    }\n    return evens;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(3), deref_int(&mut interp, result));
}

#[test]
fn break_leaves_a_while() {
    let mut interp = interp_from(
        "int main() {\n    int n = 0;\n    while (1) { n = n + 1; if (n == 4) break; }\n    return n;\n}\n",
    );
    let result = run_main(&mut interp).expect("main returns a value");
    assert_eq!(Some(4), deref_int(&mut interp, result));
}
