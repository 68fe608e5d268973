//! Garbage collection behavior through the public API.

use civet::Program;

#[test]
fn unreachable_host_values_are_collected() {
    let mut prog = Program::new();
    prog.collect_garbage();
    let baseline = prog.live_objects();

    for i in 0..10 {
        prog.new_string(&format!("temp-{i}"));
    }
    assert_eq!(prog.live_objects(), baseline + 10);

    // still rooted through the host roots stack
    prog.collect_garbage();
    assert_eq!(prog.live_objects(), baseline + 10);

    prog.release_host_values();
    prog.collect_garbage();
    assert_eq!(prog.live_objects(), baseline);
}

#[test]
fn pinned_objects_survive_collection() {
    let mut prog = Program::new();
    prog.collect_garbage();
    let baseline = prog.live_objects();

    let s = prog.new_string("pinned");
    prog.pin(s);
    prog.release_host_values();
    prog.collect_garbage();
    assert_eq!(prog.live_objects(), baseline + 1);
    assert_eq!(prog.get_string(s), Some("pinned"));

    prog.unpin(s);
    prog.collect_garbage();
    assert_eq!(prog.live_objects(), baseline);
}

#[test]
fn container_contents_stay_reachable() {
    let mut prog = Program::new();
    let arr = prog.new_array();
    let s = prog.new_string("kept");
    prog.array_push(arr, s).unwrap();
    let map = prog.new_map();
    prog.map_insert(map, s, arr).unwrap();

    // keep only the map rooted, through a pin
    prog.pin(map);
    prog.release_host_values();
    prog.collect_garbage();

    let arr_again = prog.map_get(map, s).unwrap();
    let item = prog.array_get(arr_again, 0).unwrap();
    assert_eq!(prog.get_string(item), Some("kept"));
    assert_eq!(prog.map_next_key(map, None).map(|k| prog.display(k)), Some("kept".to_owned()));
    prog.unpin(map);
}

#[test]
fn compiled_functions_survive_collection() {
    let mut prog = Program::new();
    prog.compile_str(
        "t.cv",
        "function greet() { return \"hello\"; }
         function main() { return greet(); }",
    )
    .unwrap();
    prog.collect_garbage();
    let ret = prog.call("main", &[]).unwrap();
    assert_eq!(prog.get_string(ret), Some("hello"));
}

#[test]
fn stress_mode_matches_normal_execution() {
    let src = "
        function build(n) {
          var out = [null];
          var i = 0;
          while (i < n) {
            out[0] = { \"i\": i, \"s\": \"value\" };
            i = i + 1;
          }
          return out;
        }
        function main() {
          var rows = build(50);
          var total = 0;
          var i = 0;
          while (i < 50) { total = total + 1; i = i + 1; }
          return total + rows[0].i;
        }
    ";

    let mut normal = Program::new();
    normal.compile_str("t.cv", src).unwrap();
    let expected = normal.call("main", &[]).unwrap().as_number().unwrap();

    let mut stressed = Program::new();
    stressed.set_gc_stress(true);
    stressed.compile_str("t.cv", src).unwrap();
    let got = stressed.call("main", &[]).unwrap().as_number().unwrap();

    assert_eq!(expected, got);
    assert_eq!(expected, 99.0);
}

#[test]
fn closures_and_cells_survive_stress_collection() {
    let src = "
        function make_accum() {
          var total = 0;
          return function(n) { total = total + n; return total; };
        }
        function main() {
          var acc = make_accum();
          acc(1); acc(2); acc(3);
          return acc(4);
        }
    ";
    let mut prog = Program::new();
    prog.set_gc_stress(true);
    prog.compile_str("t.cv", src).unwrap();
    assert_eq!(prog.call("main", &[]).unwrap().as_number(), Some(10.0));
}

#[test]
fn threshold_collection_runs_during_execution() {
    let src = "
        function main() {
          var i = 0;
          var keep = [null];
          while (i < 500) {
            var tmp = [i, i + 1, i + 2];
            keep[0] = tmp;
            i = i + 1;
          }
          return len(keep);
        }
    ";
    let mut prog = Program::new();
    prog.set_gc_threshold(64);
    prog.compile_str("t.cv", src).unwrap();
    assert_eq!(prog.call("main", &[]).unwrap().as_number(), Some(1.0));
    // the hundreds of temporary arrays must not accumulate
    prog.release_host_values();
    prog.collect_garbage();
    assert!(prog.live_objects() < 100, "live objects: {}", prog.live_objects());
}
