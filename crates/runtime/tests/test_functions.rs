//! Function declarations, calls, returns, recursion, natives, and the
//! runtime errors around calling: arity, callability, call depth.

use lox_runtime::{InterpretResult, run_capture};

fn run(source: &str) -> String {
    run_capture(source).0
}

#[test]
fn test_call_and_return() {
    assert_eq!(
        run("fun add(a, b) { return a + b; } print add(1, 2);"),
        "3.000000\n"
    );
    assert_eq!(
        run("fun f(a, b, c) { print a + b + c; } f(1, 2, 3);"),
        "6.000000\n"
    );
}

#[test]
fn test_falling_off_the_end_returns_nil() {
    assert_eq!(run("fun f() {} print f();"), "nil\n");
    assert_eq!(run("fun f() { return; } print f();"), "nil\n");
}

#[test]
fn test_function_print_representation() {
    assert_eq!(run("fun f() {} print f;"), "<function: f>\n");
    assert_eq!(run("print clock;"), "<native func>\n");
}

#[test]
fn test_recursion() {
    assert_eq!(
        run("fun fib(n) { if (n < 2) return n; return fib(n - 2) + fib(n - 1); } print fib(10);"),
        "55.000000\n"
    );
}

#[test]
fn test_mutual_recursion_through_globals() {
    let source = "\
fun isEven(n) { if (n == 0) return true; return isOdd(n - 1); }
fun isOdd(n) { if (n == 0) return false; return isEven(n - 1); }
print isEven(4);
print isOdd(7);
";
    assert_eq!(run(source), "true\ntrue\n");
}

#[test]
fn test_late_bound_globals() {
    assert_eq!(
        run("fun f() { return g(); } fun g() { return 42; } print f();"),
        "42.000000\n"
    );
}

#[test]
fn test_return_after_control_flow() {
    assert_eq!(
        run("fun f(x) { if (x) return \"yes\"; else return \"no\"; } print f(true);"),
        "yes\n"
    );
    assert_eq!(
        run("fun f() { while (true) return \"inside\"; } print f();"),
        "inside\n"
    );
}

#[test]
fn test_arity_mismatch() {
    let (output, result) = run_capture("fun f(a, b) {}\nf(1);");
    assert_eq!(
        output,
        "Expected 2 arguments but got 1.\n[line 2] in <script>\n"
    );
    assert_eq!(result, InterpretResult::RuntimeError);

    let (output, _) = run_capture("fun f() {}\nf(1, 2);");
    assert_eq!(
        output,
        "Expected 0 arguments but got 2.\n[line 2] in <script>\n"
    );
}

#[test]
fn test_calling_non_callables() {
    for source in ["nil();", "true();", "1();", "\"str\"();", "var x = 1; x();"] {
        let (output, result) = run_capture(source);
        assert_eq!(
            output,
            "Can only call functions and classes.\n[line 1] in <script>\n",
            "source: {source}"
        );
        assert_eq!(result, InterpretResult::RuntimeError);
    }
}

#[test]
fn test_runtime_error_trace_spans_frames() {
    let source = "\
fun a() { b(); }
fun b() { nil - 1; }
a();
";
    let (output, result) = run_capture(source);
    assert_eq!(
        output,
        "Operands must be numbers.\n\
         [line 2] in <function: b>\n\
         [line 1] in <function: a>\n\
         [line 3] in <script>\n"
    );
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn test_stack_overflow_on_runaway_recursion() {
    let (output, result) = run_capture("fun f() { f(); } f();");
    assert!(output.starts_with("Stack overflow.\n"), "{output}");
    assert!(output.contains("[line 1] in <function: f>"), "{output}");
    assert!(output.trim_end().ends_with("[line 1] in <script>"), "{output}");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn test_clock_native() {
    assert_eq!(run("print clock() >= 0;"), "true\n");
    // Monotonic: a later reading never goes backwards.
    assert_eq!(
        run("var start = clock(); var end = clock(); print end >= start;"),
        "true\n"
    );
}

#[test]
fn test_function_values_are_first_class() {
    assert_eq!(
        run("fun greet() { return \"hi\"; } var f = greet; print f();"),
        "hi\n"
    );
    assert_eq!(
        run("fun twice(f) { f(); f(); } fun hello() { print \"hello\"; } twice(hello);"),
        "hello\nhello\n"
    );
}
