//! Host API tests: native functions, value construction and inspection,
//! output capture, re-entrant calls.

use civet::{CollectStringPrint, Error, Program, Value};
use pretty_assertions::assert_eq;

#[test]
fn registered_native_is_callable_from_scripts() {
    fn double(_prog: &mut Program, args: &[Value]) -> Result<Value, Error> {
        match args.first().and_then(|v| v.as_number()) {
            Some(n) => Ok(Value::Number(n * 2.0)),
            None => Err(Error::runtime("double(): argument must be a number")),
        }
    }

    let mut prog = Program::new();
    prog.register_native("double", double);
    prog.compile_str("t.cv", "function main(x) { return double(x) + 1; }").unwrap();
    let ret = prog.call("main", &[Value::Number(20.5)]).unwrap();
    assert_eq!(ret.as_number(), Some(42.0));
}

#[test]
fn native_errors_become_runtime_errors_with_location() {
    fn fail(_prog: &mut Program, _args: &[Value]) -> Result<Value, Error> {
        Err(Error::runtime("fail(): boom"))
    }

    let mut prog = Program::new();
    prog.register_native("fail", fail);
    prog.compile_str("t.cv", "function main() {\n  return fail();\n}").unwrap();
    let err = prog.call("main", &[]).unwrap_err();
    assert!(err.message.contains("fail(): boom"), "{}", err.message);
    assert!(err.message.starts_with("t.cv:2:"), "{}", err.message);
    assert_eq!(prog.last_error(), Some(err.message.as_str()));
}

#[test]
fn native_can_reenter_the_vm() {
    fn call_twice(prog: &mut Program, args: &[Value]) -> Result<Value, Error> {
        let first = prog.call("helper", args)?;
        let second = prog.call("helper", &[first])?;
        Ok(second)
    }

    let mut prog = Program::new();
    prog.register_native("call_twice", call_twice);
    prog.compile_str(
        "t.cv",
        "function helper(n) { return n * 3; }
         function main() { return call_twice(2) + 1; }",
    )
    .unwrap();
    let ret = prog.call("main", &[]).unwrap();
    assert_eq!(ret.as_number(), Some(19.0));
}

#[test]
fn natives_receive_live_container_values() {
    fn sum(prog: &mut Program, args: &[Value]) -> Result<Value, Error> {
        let arr = args[0];
        let len = prog.array_len(arr).ok_or_else(|| Error::runtime("sum(): argument must be an array"))?;
        let mut total = 0.0;
        for i in 0..len {
            total += prog.array_get(arr, i).and_then(Value::as_number).unwrap_or(0.0);
        }
        Ok(Value::Number(total))
    }

    let mut prog = Program::new();
    prog.register_native("sum", sum);
    prog.compile_str("t.cv", "function main() { return sum([1, 2, 3, 4]); }").unwrap();
    assert_eq!(prog.call("main", &[]).unwrap().as_number(), Some(10.0));
}

#[test]
fn array_construction_and_mutation_from_the_host() {
    let mut prog = Program::new();
    prog.compile_str("t.cv", "function second(a) { return a[1]; }").unwrap();

    let arr = prog.new_array();
    let s = prog.new_string("hello");
    prog.array_push(arr, Value::Number(1.0)).unwrap();
    prog.array_push(arr, s).unwrap();
    assert_eq!(prog.array_len(arr), Some(2));

    let ret = prog.call("second", &[arr]).unwrap();
    assert_eq!(prog.get_string(ret), Some("hello"));

    prog.array_set(arr, 1, Value::Bool(true)).unwrap();
    assert_eq!(prog.array_get(arr, 1).and_then(Value::as_bool), Some(true));
    assert!(prog.array_set(arr, 9, Value::Null).is_err());
    assert!(prog.array_push(Value::Number(0.0), Value::Null).is_err());

    let first = prog.array_grow(arr, 3).unwrap();
    assert_eq!(first, 2);
    assert_eq!(prog.array_len(arr), Some(5));
    assert!(prog.array_get(arr, 4).unwrap().is_null());
}

#[test]
fn map_api_including_iteration_and_delete() {
    let mut prog = Program::new();
    let map = prog.new_map();
    let key = prog.new_string("x");
    prog.map_insert(map, key, Value::Number(1.0)).unwrap();
    prog.map_insert(map, Value::Number(2.0), Value::Bool(true)).unwrap();
    prog.map_insert(map, Value::Bool(false), Value::Null).unwrap();

    // null keys are rejected
    let err = prog.map_insert(map, Value::Null, Value::Null).unwrap_err();
    assert!(err.message.contains("null"), "{}", err.message);

    // lookup through a different-but-equal string key
    let key2 = prog.new_string("x");
    assert_eq!(prog.map_get(map, key2).and_then(Value::as_number), Some(1.0));

    // iterate every key exactly once
    let mut count = 0;
    let mut k = prog.map_next_key(map, None);
    while let Some(cur) = k {
        count += 1;
        k = prog.map_next_key(map, Some(cur));
    }
    assert_eq!(count, 3);

    prog.map_delete(map, key2).unwrap();
    assert!(prog.map_get(map, key).is_none());
    let err = prog.map_delete(map, key).unwrap_err();
    assert!(err.message.contains("key not in map"), "{}", err.message);
}

#[test]
fn print_output_is_captured_by_collect_writer() {
    let collector = CollectStringPrint::new();
    let mut prog = Program::with_print(Box::new(collector.clone()));
    prog.compile_str(
        "t.cv",
        "function main() {
           print(\"a=\", 1, \" \", true, \" \", null, \"\\n\");
           printf(\"%d %x %g %s %%\\n\", 255, 255, 0.5, \"str\");
         }",
    )
    .unwrap();
    prog.call("main", &[]).unwrap();
    assert_eq!(collector.output(), "a=1 true null\n255 ff 0.5 str %\n");
}

#[test]
fn printf_reports_bad_usage() {
    let mut prog = Program::new();
    prog.compile_str(
        "t.cv",
        "function missing() { printf(\"%d\"); }
         function badtype() { printf(\"%d\", \"nope\"); }
         function badspec() { printf(\"%q\", 1); }",
    )
    .unwrap();
    let err = prog.call("missing", &[]).unwrap_err();
    assert!(err.message.contains("no argument supplied for '%d'"), "{}", err.message);
    let err = prog.call("badtype", &[]).unwrap_err();
    assert!(err.message.contains("invalid argument type for '%d'"), "{}", err.message);
    let err = prog.call("badspec", &[]).unwrap_err();
    assert!(err.message.contains("invalid format specifier: '%q'"), "{}", err.message);
}

#[test]
fn len_native_validates_its_argument() {
    let mut prog = Program::new();
    prog.compile_str(
        "t.cv",
        "function ok() { return len([1,2,3]); }
         function bad() { return len(5); }
         function arity() { return len(); }",
    )
    .unwrap();
    assert_eq!(prog.call("ok", &[]).unwrap().as_number(), Some(3.0));
    let err = prog.call("bad", &[]).unwrap_err();
    assert!(err.message.contains("argument must be an array"), "{}", err.message);
    let err = prog.call("arity", &[]).unwrap_err();
    assert!(err.message.contains("invalid number of arguments: 0"), "{}", err.message);
}

#[test]
fn unknown_function_call_fails_and_sets_last_error() {
    let mut prog = Program::new();
    assert!(prog.last_error().is_none());
    let err = prog.call("nope", &[]).unwrap_err();
    assert!(err.message.contains("function 'nope' not found"), "{}", err.message);
    assert_eq!(prog.last_error(), Some(err.message.as_str()));
}

#[test]
fn display_forms() {
    let mut prog = Program::new();
    let s = prog.new_string("txt");
    let arr = prog.new_array();
    prog.array_push(arr, Value::Number(1.0)).unwrap();
    assert_eq!(prog.display(Value::Null), "null");
    assert_eq!(prog.display(Value::Bool(false)), "false");
    assert_eq!(prog.display(Value::Number(2.5)), "2.5");
    assert_eq!(prog.display(Value::Number(17.0)), "17");
    assert_eq!(prog.display(s), "txt");
    assert_eq!(prog.display(arr), "<array with 1 elements>");
}

#[test]
fn type_predicates() {
    let mut prog = Program::new();
    prog.compile_str("t.cv", "function id(x) { return x; }").unwrap();
    let s = prog.new_string("s");
    let a = prog.new_array();
    let m = prog.new_map();
    assert!(prog.is_string(s) && !prog.is_string(a));
    assert!(prog.is_array(a) && !prog.is_array(m));
    assert!(prog.is_map(m) && !prog.is_map(s));
    assert!(!prog.is_callable(s));
    assert_eq!(prog.get_string(s), Some("s"));
    assert_eq!(prog.get_string(Value::Number(1.0)), None);
}

#[test]
fn failed_compilation_attaches_nothing() {
    let mut prog = Program::new();
    prog.compile_str("good.cv", "function keep() { return 1; }").unwrap();
    let err = prog.compile_str("bad.cv", "function broken() { return 1 +; }").unwrap_err();
    assert_eq!(prog.last_error(), Some(err.message.as_str()));
    // the earlier function still runs; nothing from the failed unit exists
    assert_eq!(prog.call("keep", &[]).unwrap().as_number(), Some(1.0));
    assert!(prog.call("broken", &[]).is_err());
}
