//! End-to-end language tests: compile a script and call `main`.

use civet::{ErrorKind, Program, Value};

fn run(src: &str) -> Result<Value, civet::Error> {
    let mut prog = Program::new();
    prog.compile_str("test.cv", src)?;
    prog.call("main", &[])
}

fn run_num(src: &str) -> f64 {
    let v = run(src).unwrap();
    v.as_number().unwrap_or_else(|| panic!("expected a number, got {v:?}"))
}

#[test]
fn fibonacci_recursion() {
    let src = "
        function fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); }
        function main() { return fib(10); }
    ";
    assert_eq!(run_num(src), 55.0);
}

#[test]
fn closures_capture_by_reference() {
    let src = "
        function make_counter() {
          var n = 0;
          return function() { n = n + 1; return n; };
        }
        function main() { var c = make_counter(); c(); c(); return c(); }
    ";
    assert_eq!(run_num(src), 3.0);
}

#[test]
fn array_element_mutation() {
    let src = "function main() { var a = [10,20,30]; a[1] = 99; return a[0] + a[1] + a[2]; }";
    assert_eq!(run_num(src), 139.0);
}

#[test]
fn map_lookup_failure() {
    let src = "function main() { var m = { \"x\" : 1 }; return m[\"y\"]; }";
    let err = run(src).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert!(err.message.contains("key not in map"), "{}", err.message);
}

#[test]
fn break_with_upvalue_close() {
    let src = "
        function main() {
          var i = 0; var f = null;
          while (1) {
            var x = i; f = function(){ return x; };
            i = i + 1; if (i == 3) break;
          }
          return f();
        }
    ";
    assert_eq!(run_num(src), 2.0);
}

#[test]
fn gc_stress_array_of_strings() {
    let elems: Vec<String> = (0..100).map(|i| format!("\"s{i}\"")).collect();
    let lit = elems.join(", ");
    let src = format!(
        "function main() {{
           var a = [{lit}];
           var b = [{lit}];
           var i = 0;
           while (i < len(a)) {{
             if (a[i] != b[i]) return -1;
             i = i + 1;
           }}
           return len(a);
         }}"
    );
    let mut prog = Program::new();
    prog.set_gc_stress(true);
    prog.compile_str("stress.cv", &src).unwrap();
    let ret = prog.call("main", &[]).unwrap();
    assert_eq!(ret.as_number(), Some(100.0));
}

#[test]
fn nested_closures_reach_through_two_scopes() {
    let src = "
        function make_adder(x) {
          return function(y) { return function(z) { return x + y + z; }; };
        }
        function main() { return make_adder(1)(2)(3); }
    ";
    assert_eq!(run_num(src), 6.0);
}

#[test]
fn closures_share_one_cell_per_variable() {
    let src = "
        function main() {
          var get = null; var set = null;
          {
            var x = 10;
            get = function(){ return x; };
            set = function(v){ x = v; };
          }
          set(42);
          return get();
        }
    ";
    assert_eq!(run_num(src), 42.0);
}

#[test]
fn while_with_continue() {
    let src = "
        function main() {
          var total = 0; var i = 0;
          while (i < 10) {
            i = i + 1;
            if (i % 2 == 0) continue;
            total = total + i;
          }
          return total;
        }
    ";
    assert_eq!(run_num(src), 25.0);
}

#[test]
fn logical_operators_return_the_deciding_operand() {
    assert_eq!(run_num("function main() { return 0 || 5; }"), 5.0);
    assert_eq!(run_num("function main() { return 2 || 9; }"), 2.0);
    assert_eq!(run_num("function main() { return 1 && 7; }"), 7.0);
    assert!(run("function main() { return null && 9; }").unwrap().is_null());
    // short circuit: the right side must not run
    let src = "
        function boom() { return 1 / 0 > 0; }
        function main() { if (false && boom()) return 1; return 2; }
    ";
    assert_eq!(run_num(src), 2.0);
}

#[test]
fn comparisons_in_value_position() {
    let src = "function main() { var b = 2 < 3; if (b == true) return 1; return 0; }";
    assert_eq!(run_num(src), 1.0);
    assert_eq!(run("function main() { return 3 >= 4; }").unwrap().as_bool(), Some(false));
    assert_eq!(run("function main() { return \"a\" != \"b\"; }").unwrap().as_bool(), Some(true));
    assert_eq!(run("function main() { return \"ab\" == \"ab\"; }").unwrap().as_bool(), Some(true));
}

#[test]
fn arithmetic_follows_ieee_754() {
    assert_eq!(run_num("function main() { return 7 % 3; }"), 1.0);
    assert_eq!(run_num("function main() { return -7 % 3; }"), -1.0);
    assert_eq!(run_num("function main() { return 1 / 4; }"), 0.25);
    let v = run_num("function main() { return 1 / 0; }");
    assert!(v.is_infinite() && v > 0.0);
    let v = run_num("function main() { return 0 / 0; }");
    assert!(v.is_nan());
}

#[test]
fn truthiness() {
    assert_eq!(run_num("function main() { if (\"\") return 1; return 2; }"), 2.0);
    assert_eq!(run_num("function main() { if (\"x\") return 1; return 2; }"), 1.0);
    assert_eq!(run_num("function main() { if (0) return 1; return 2; }"), 2.0);
    assert_eq!(run_num("function main() { if ([]) return 1; return 2; }"), 1.0);
    assert_eq!(run_num("function main() { if (null) return 1; return 2; }"), 2.0);
    assert_eq!(run_num("function main() { if (!null) return 1; return 2; }"), 1.0);
}

#[test]
fn map_access_and_dot_sugar() {
    let src = "
        function main() {
          var m = { \"x\": 1, 2: 20, true: 3 };
          m.y = m.x + m[2];
          return m.y + m[true];
        }
    ";
    assert_eq!(run_num(src), 24.0);
}

#[test]
fn missing_arguments_are_null_and_extras_dropped() {
    let src = "
        function probe(a, b) { if (b == null) return 1; return 2; }
        function main() { return probe(9) + probe(9, 9) + probe(9, 9, 9); }
    ";
    assert_eq!(run_num(src), 5.0);
}

#[test]
fn deep_recursion_grows_the_value_stack() {
    let src = "
        function deep(n) { if (n < 1) return 0; return deep(n - 1) + 1; }
        function main() { return deep(2000); }
    ";
    assert_eq!(run_num(src), 2000.0);
}

#[test]
fn anonymous_function_called_in_place() {
    let src = "function main() { return (function(x) { return x * x; })(9); }";
    assert_eq!(run_num(src), 81.0);
}

#[test]
fn mutual_recursion_between_top_level_functions() {
    let src = "
        function is_even(n) { if (n == 0) return true; return is_odd(n - 1); }
        function is_odd(n) { if (n == 0) return false; return is_even(n - 1); }
        function main() { if (is_even(10)) return 1; return 0; }
    ";
    assert_eq!(run_num(src), 1.0);
}

#[test]
fn include_resolves_relative_to_including_file() {
    let dir = std::env::temp_dir().join(format!("civet-include-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("lib.cv"), "function helper() { return 30; }\n").unwrap();
    let main_path = dir.join("main.cv");
    std::fs::write(
        &main_path,
        "include \"lib.cv\"\nfunction main() { return helper() + 12; }\n",
    )
    .unwrap();

    let mut prog = Program::new();
    prog.compile_file(&main_path).unwrap();
    let ret = prog.call("main", &[]).unwrap();
    assert_eq!(ret.as_number(), Some(42.0));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn block_scoped_variables_release_their_registers() {
    let src = "
        function main() {
          var total = 0;
          { var a = 1; total = total + a; }
          { var b = 2; total = total + b; }
          return total;
        }
    ";
    assert_eq!(run_num(src), 3.0);
}

#[test]
fn loop_iterations_capture_distinct_cells() {
    let src = "
        function main() {
          var fs = [null, null, null];
          var i = 0;
          while (i < 3) {
            var x = i * 10;
            fs[i] = function(){ return x; };
            i = i + 1;
          }
          return fs[0]() + fs[1]() + fs[2]();
        }
    ";
    assert_eq!(run_num(src), 30.0);
}
