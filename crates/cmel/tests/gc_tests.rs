//! Collector behavior under stress: every allocation point collects, so any
//! missing root shows up as a freed-slot access or wrong output.

use cmel::{CollectStringPrint, Runner};
use pretty_assertions::assert_eq;

fn run_stressed(source: &str) -> (Runner, String) {
    let mut out = CollectStringPrint::new();
    let mut runner = Runner::with_gc_stress();
    match runner.run(source, &mut out) {
        Ok(()) => (runner, out.into_output()),
        Err(error) => panic!("script failed under gc stress: {error}"),
    }
}

#[test]
fn closures_and_upvalues_survive_stress_collection() {
    let (runner, output) = run_stressed(
        "fun makeCounter() {
           var n = 0;
           fun inc() { n = n + 1; return n; }
           return inc;
         }
         var c = makeCounter();
         print c();
         print c();
         print \"x\" + c();",
    );
    assert_eq!(output, "1\n2\nx3\n");
    assert_eq!(runner.open_upvalue_count(), 0);
}

#[test]
fn string_interning_survives_collection() {
    let (runner, output) = run_stressed(
        "var parts = \"a-b-a\".split(\"-\");
         print parts[0] == parts[2];
         print \"he\" + \"llo\" == \"hello\";",
    );
    assert_eq!(output, "true\ntrue\n");
    // Same content, one object: the intern table never holds duplicates.
    let stats = runner.heap_stats();
    assert_eq!(stats.objects_by_type.get("Str").copied(), Some(stats.interned_strings));
}

#[test]
fn garbage_lists_are_reclaimed() {
    let (mut runner, _) = run_stressed(
        "var i = 0;
         while (i < 50) {
           var l = [1, 2, 3, 4];
           var m = {\"k\": l};
           i = i + 1;
         }",
    );
    runner.collect_garbage();
    let stats = runner.heap_stats();
    assert!(stats.collections > 0, "stress mode must have collected");
    // All loop-local lists and maps are unreachable once the script ends.
    assert_eq!(stats.objects_by_type.get("List"), None);
    assert_eq!(stats.objects_by_type.get("Map"), None);
    assert!(stats.free_slots > 0, "dead objects must have freed slots");
}

#[test]
fn reachable_data_is_never_reclaimed() {
    let (mut runner, output) = run_stressed(
        "var keep = [];
         var i = 0;
         while (i < 20) {
           keep.add(\"item\" + i);
           i = i + 1;
         }
         print keep.length();
         print keep[19];",
    );
    assert_eq!(output, "20\nitem19\n");
    runner.collect_garbage();
    runner.collect_garbage();
    let stats = runner.heap_stats();
    assert_eq!(stats.objects_by_type.get("List").copied(), Some(1));
}

#[test]
fn classes_and_instances_survive_stress() {
    let (_, output) = run_stressed(
        "class Node {
           init(value, next) {
             this.value = value;
             this.next = next;
           }
         }
         var head = nil;
         var i = 0;
         while (i < 10) {
           head = Node(i, head);
           i = i + 1;
         }
         var sum = 0;
         while (head != nil) {
           sum = sum + head.value;
           head = head.next;
         }
         print sum;",
    );
    assert_eq!(output, "45\n");
}

#[test]
fn reverse_twice_is_identity_under_stress() {
    let (_, output) = run_stressed(
        "var l = [1, \"two\", nil, true];
         var rr = l.reverse().reverse();
         var i = 0;
         while (i < l.length()) {
           assertEqual(l[i], rr[i]);
           i = i + 1;
         }
         print \"ok\";",
    );
    assert_eq!(output, "ok\n");
}

#[test]
fn list_callbacks_allocate_safely_under_stress() {
    let (_, output) = run_stressed(
        "var words = [\"a\", \"b\", \"c\"];
         print words.map(fun(w) { return w + \"!\"; });
         print [1, 2, 3, 4, 5].filter(fun(n) { return n % 2 == 1; });",
    );
    assert_eq!(output, "[a!, b!, c!]\n[1, 3, 5]\n");
}

#[test]
fn collection_runs_and_threshold_rearms_without_stress() {
    // Build enough short-lived strings to cross the 1 MiB first threshold.
    let mut out = CollectStringPrint::new();
    let mut runner = Runner::new();
    runner
        .run(
            "var s = \"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\";
             var i = 0;
             while (i < 8) {
               s = s + s;
               i = i + 1;
             }
             var j = 0;
             while (j < 200) {
               var copy = s + j;
               j = j + 1;
             }
             print s.length();",
            &mut out,
        )
        .unwrap();
    assert_eq!(out.output(), "8192\n");
    let stats = runner.heap_stats();
    assert!(stats.collections > 0, "threshold crossing must trigger collection");
}
