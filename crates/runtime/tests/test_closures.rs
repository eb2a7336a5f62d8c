//! Closure semantics: shared captures, open vs closed upvalues, and
//! upvalue threading through intermediate functions.

use lox_runtime::run_capture;

fn run(source: &str) -> String {
    run_capture(source).0
}

#[test]
fn test_two_closures_share_one_captured_variable() {
    let source = "\
var f; var g;
{
  var local = \"local\";
  fun f_() { print local; local = \"after f\"; print local; }
  f = f_;
  fun g_() { print local; local = \"after g\"; print local; }
  g = g_;
}
f(); g();
";
    assert_eq!(run(source), "local\nafter f\nafter f\nafter g\n");
}

#[test]
fn test_counter_keeps_state_across_calls() {
    let source = "\
fun makeCounter() {
  var count = 0;
  fun increment() {
    count = count + 1;
    return count;
  }
  return increment;
}
var counter = makeCounter();
print counter();
print counter();
print counter();
";
    assert_eq!(run(source), "1.000000\n2.000000\n3.000000\n");
}

#[test]
fn test_independent_instances_do_not_share() {
    let source = "\
fun makeCounter() {
  var count = 0;
  fun increment() { count = count + 1; return count; }
  return increment;
}
var a = makeCounter();
var b = makeCounter();
print a();
print a();
print b();
";
    assert_eq!(run(source), "1.000000\n2.000000\n1.000000\n");
}

#[test]
fn test_close_over_function_parameter() {
    let source = "\
fun make(param) {
  fun inner() { print param; }
  return inner;
}
var f = make(\"arg\");
f();
";
    assert_eq!(run(source), "arg\n");
}

#[test]
fn test_writes_through_open_upvalue_are_visible_both_ways() {
    let source = "\
var getter;
{
  var x = 1;
  fun get() { return x; }
  getter = get;
  x = 2;
  print getter();
}
print getter();
";
    assert_eq!(run(source), "2.000000\n2.000000\n");
}

#[test]
fn test_upvalue_threads_through_intermediate_function() {
    let source = "\
fun outer() {
  var x = \"value\";
  fun middle() {
    fun inner() { return x; }
    return inner;
  }
  return middle;
}
var mid = outer();
var inner = mid();
print inner();
";
    assert_eq!(run(source), "value\n");
}

#[test]
fn test_shadow_closure_with_local() {
    let source = "\
{
  var foo = \"closure\";
  fun f() {
    {
      print foo;
      var foo = \"shadow\";
      print foo;
    }
    print foo;
  }
  f();
}
";
    assert_eq!(run(source), "closure\nshadow\nclosure\n");
}

#[test]
fn test_close_over_later_variable() {
    let source = "\
fun f() {
  var a = \"a\";
  var b = \"b\";
  fun g() {
    print b;
    print a;
  }
  g();
}
f();
";
    assert_eq!(run(source), "b\na\n");
}

#[test]
fn test_closure_survives_many_frames() {
    let source = "\
fun makeAdder(n) {
  fun add(x) { return x + n; }
  return add;
}
fun apply(f, v) { return f(v); }
var add5 = makeAdder(5);
print apply(add5, 10);
print add5(1);
";
    assert_eq!(run(source), "15.000000\n6.000000\n");
}

#[test]
fn test_assign_through_closure_updates_closed_cell() {
    let source = "\
var set; var get;
{
  var shared = \"initial\";
  fun setter(v) { shared = v; }
  fun getter() { return shared; }
  set = setter;
  get = getter;
}
set(\"updated\");
print get();
";
    assert_eq!(run(source), "updated\n");
}
