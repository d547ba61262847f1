use proptest::prelude::*;
use storm::spooled::SpooledSet;
use storm::Prim;

#[derive(Debug, Clone)]
enum Op {
    Add(Prim),
    Discard(Prim),
}

fn prim() -> impl Strategy<Value = Prim> {
    prop_oneof![
        Just(Prim::Null),
        (0i64..16).prop_map(Prim::Int),
        prop_oneof![
            Just(f64::NAN),
            Just(f64::INFINITY),
            Just(f64::NEG_INFINITY),
            Just(-0.0),
            (0i32..4).prop_map(f64::from),
        ]
        .prop_map(Prim::Float),
        "[a-c]{1,2}".prop_map(Prim::Str),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => prim().prop_map(Op::Add),
        1 => prim().prop_map(Op::Discard),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn spilling_matches_an_in_memory_model(ops in proptest::collection::vec(op(), 1..40), threshold in 1usize..6) {
        let scratch = tempfile::tempdir().expect("scratch dir");
        let mut set = SpooledSet::new(threshold, scratch.path());
        let mut model: Vec<Prim> = Vec::new();

        for op in ops {
            match op {
                Op::Add(item) => {
                    let fresh = !model.contains(&item);
                    prop_assert_eq!(set.add(item.clone()).expect("add"), fresh);
                    if fresh {
                        model.push(item);
                    }
                }
                Op::Discard(item) => {
                    let held = model.contains(&item);
                    prop_assert_eq!(set.discard(&item).expect("discard"), held);
                    model.retain(|have| *have != item);
                }
            }
            prop_assert_eq!(set.len(), model.len());
        }

        for item in &model {
            prop_assert!(set.contains(item).expect("contains"));
        }
        let mut have = set.to_vec().expect("to_vec");
        let mut want = model.clone();
        have.sort_by_key(|item| format!("{item:?}"));
        want.sort_by_key(|item| format!("{item:?}"));
        prop_assert_eq!(have, want);
        set.close().expect("close");
    }
}
