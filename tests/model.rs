use std::sync::Arc;

use proptest::prelude::*;
use weaktable_rs::WeakTable;

const SLOTS: usize = 12;

#[derive(Debug, Clone)]
enum Op {
    Add(usize, u32),
    Remove(usize),
    // Drops the key and replaces it with a fresh allocation
    Release(usize),
    Get(usize),
    Purge,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..SLOTS, any::<u32>()).prop_map(|(i, v)| Op::Add(i, v)),
        1 => (0..SLOTS).prop_map(Op::Remove),
        1 => (0..SLOTS).prop_map(Op::Release),
        2 => (0..SLOTS).prop_map(Op::Get),
        1 => Just(Op::Purge),
    ]
}

proptest! {
    #[test]
    fn table_matches_model(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let table: WeakTable<usize, u32> = WeakTable::new();
        let mut keys: Vec<Arc<usize>> = (0..SLOTS).map(Arc::new).collect();
        let mut model: Vec<Option<u32>> = vec![None; SLOTS];

        for op in ops {
            match op {
                Op::Add(i, v) => {
                    let added = table.try_add(&keys[i], v).unwrap();
                    prop_assert_eq!(added, model[i].is_none());
                    if added {
                        model[i] = Some(v);
                    }
                }
                Op::Remove(i) => {
                    let removed = table.remove(&keys[i]).unwrap();
                    prop_assert_eq!(removed, model[i].take().is_some());
                }
                Op::Release(i) => {
                    keys[i] = Arc::new(i);
                    model[i] = None;
                }
                Op::Get(i) => {
                    prop_assert_eq!(table.get(&keys[i]), model[i]);
                }
                Op::Purge => {
                    table.purge_expired().unwrap();
                }
            }
        }

        let expected: Vec<(usize, u32)> = model
            .iter()
            .copied()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i, v)))
            .collect();
        prop_assert!(table.len() >= expected.len());

        let mut live: Vec<(usize, u32)> = table.iter().map(|(k, v)| (*k, v)).collect();
        live.sort();
        prop_assert_eq!(live, expected);
    }
}
