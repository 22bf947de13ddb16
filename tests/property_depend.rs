use std::collections::BTreeMap;

use proptest::prelude::*;

use flowsched::depend::{clean, compile, parse, validate_acyclic};

const OPS: [&str; 3] = [",", "|", "&"];

// Expressions over a small alphabet of names, some of which are outside the
// unit so `clean` has something to drop.
fn expression_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec((0..8usize, 0..3usize), 0..8).prop_map(|parts| {
        let mut out = String::new();
        for (i, (name, op)) in parts.iter().enumerate() {
            if i > 0 {
                out.push_str(OPS[*op]);
            }
            out.push_str(&format!("t{name}"));
        }
        out
    })
}

// Task `i` may only depend on tasks `0..i`, so the set is acyclic.
fn acyclic_strategy(max_tasks: usize) -> impl Strategy<Value = BTreeMap<String, String>> {
    (1..=max_tasks).prop_flat_map(|n| {
        proptest::collection::vec(
            proptest::collection::vec((any::<usize>(), 0..3usize), 0..4),
            n,
        )
        .prop_map(move |raw| {
            let mut exprs = BTreeMap::new();
            for (i, deps) in raw.into_iter().enumerate() {
                let mut expr = String::new();
                if i > 0 {
                    for (j, (dep, op)) in deps.iter().enumerate() {
                        if j > 0 {
                            expr.push_str(OPS[*op]);
                        }
                        expr.push_str(&format!("t{}", dep % i));
                    }
                }
                exprs.insert(format!("t{i}"), expr);
            }
            exprs
        })
    })
}

fn unit_names() -> Vec<String> {
    (0..5).map(|i| format!("t{i}")).collect()
}

proptest! {
    #[test]
    fn clean_is_idempotent(expr in expression_strategy(), owner in 0..8usize) {
        let names = unit_names();
        let owner = format!("t{owner}");
        let once = clean(&names, &owner, &expr).unwrap();
        let twice = clean(&names, &owner, &once).unwrap();
        prop_assert_eq!(&once, &twice);

        for name in parse(&once).unwrap().task_names() {
            prop_assert!(names.contains(&name));
            prop_assert_ne!(&name, &owner);
        }
    }

    #[test]
    fn forward_only_dependencies_compile_acyclic(exprs in acyclic_strategy(8)) {
        let graph = compile("blk", "v1", &exprs).unwrap();
        prop_assert!(validate_acyclic(&graph));
    }

    #[test]
    fn mutual_dependency_is_always_a_cycle(exprs in acyclic_strategy(6)) {
        prop_assume!(exprs.len() >= 2);
        let mut exprs = exprs;
        let last = format!("t{}", exprs.len() - 1);
        exprs.insert("t0".to_string(), last.clone());
        let forward = exprs.get(&last).cloned().unwrap_or_default();
        let forward = if forward.is_empty() { "t0".to_string() } else { format!("{forward},t0") };
        exprs.insert(last, forward);

        let graph = compile("blk", "v1", &exprs).unwrap();
        prop_assert!(!validate_acyclic(&graph));
    }
}
