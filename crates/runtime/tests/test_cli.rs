//! End-to-end CLI behavior: output routing, exit codes, and flags.

use std::io::Write as _;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

fn lox(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_lox"))
        .args(args)
        .output()
        .expect("failed to run lox binary")
}

fn script(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(source.as_bytes()).expect("write script");
    file
}

#[test]
fn test_runs_a_file_to_stdout() {
    let file = script("print 1 + 2;\nprint \"done\";\n");
    let output = lox(&[file.path().to_str().unwrap()]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "3.000000\ndone\n");
    assert!(output.stderr.is_empty());
}

#[test]
fn test_compile_error_exits_65_with_stderr_diagnostics() {
    let file = script("print ;\n");
    let output = lox(&[file.path().to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(65));
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("[line 1] Error at ';': Expect expression."),
        "{stderr}"
    );
}

#[test]
fn test_runtime_error_exits_70_with_stderr_trace() {
    let file = script("print \"before\";\nunknown = 1;\n");
    let output = lox(&[file.path().to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(70));
    // Program output stays on stdout, the trace goes to stderr.
    assert_eq!(String::from_utf8_lossy(&output.stdout), "before\n");
    assert_eq!(
        String::from_utf8_lossy(&output.stderr),
        "Undefined variable: 'unknown'.\n[line 2] in <script>\n"
    );
}

#[test]
fn test_disassemble_flag_prints_listing_then_runs() {
    let file = script("print 7;\n");
    let output = lox(&["--disassemble", file.path().to_str().unwrap()]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("== <script> =="), "{stdout}");
    assert!(stdout.contains("OP_PRINT"), "{stdout}");
    assert!(stdout.ends_with("7.000000\n"), "{stdout}");
}

#[test]
fn test_trace_flag_dumps_stack_to_stderr() {
    let file = script("print 1;\n");
    let output = lox(&["--trace", file.path().to_str().unwrap()]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "1.000000\n");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("<script>"), "{stderr}");
}

#[test]
fn test_gc_threshold_flag() {
    let file = script("var s = \"\"; var i = 0; while (i < 100) { s = s + \"y\"; i = i + 1; } print i;");
    let output = lox(&["--gc-threshold", "1024", file.path().to_str().unwrap()]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "100.000000\n");
}

#[test]
fn test_no_script_is_a_usage_error() {
    let output = lox(&[]);
    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage"));
}

#[test]
fn test_missing_file_exits_66() {
    let output = lox(&["/no/such/file.lox"]);
    assert_eq!(output.status.code(), Some(66));
}

#[test]
fn test_completions_flag() {
    let output = lox(&["--completions", "bash"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("lox"));
}
