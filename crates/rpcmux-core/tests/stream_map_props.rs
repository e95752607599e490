//! Property tests for `StreamMap` against a `BTreeMap` model.

use std::collections::BTreeMap;

use proptest::prelude::*;
use rpcmux_core::StreamMap;

#[derive(Debug, Clone)]
enum MapOp {
    /// Add the next id, `gap` above the previous one.
    Add(u32),
    /// Delete the live entry at this position (modulo len).
    DeleteNth(usize),
    /// Delete an id that was never inserted.
    DeleteMissing,
    Pick,
}

fn map_op() -> impl Strategy<Value = MapOp> {
    prop_oneof![
        4 => (1u32..4).prop_map(MapOp::Add),
        3 => any::<usize>().prop_map(MapOp::DeleteNth),
        1 => Just(MapOp::DeleteMissing),
        1 => Just(MapOp::Pick),
    ]
}

proptest! {
    #[test]
    fn behaves_like_ordered_map(
        initial in 2usize..16,
        ops in proptest::collection::vec(map_op(), 1..200),
    ) {
        let mut map = StreamMap::with_capacity(initial);
        let mut model = BTreeMap::new();
        let mut next_id = 0u32;
        let mut adds = 0usize;
        let mut deletes = 0usize;

        for op in ops {
            match op {
                MapOp::Add(gap) => {
                    next_id += gap;
                    map.add(next_id, next_id * 10);
                    model.insert(next_id, next_id * 10);
                    adds += 1;
                }
                MapOp::DeleteNth(n) => {
                    if model.is_empty() {
                        continue;
                    }
                    let key = *model.keys().nth(n % model.len()).unwrap();
                    prop_assert_eq!(map.delete(key), model.remove(&key));
                    prop_assert_eq!(map.delete(key), None, "second delete must be a no-op");
                    deletes += 1;
                }
                MapOp::DeleteMissing => {
                    prop_assert_eq!(map.delete(next_id + 1), None);
                }
                MapOp::Pick => {
                    match map.random_pick() {
                        Some((k, v)) => prop_assert_eq!(model.get(&k), Some(v)),
                        None => prop_assert!(model.is_empty()),
                    }
                }
            }

            prop_assert_eq!(map.len(), adds - deletes);
            prop_assert!(map.len() <= map.capacity());
        }

        let live: Vec<_> = map.iter().map(|(k, v)| (k, *v)).collect();
        let expected: Vec<_> = model.iter().map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(live, expected);
        for (k, v) in &model {
            prop_assert_eq!(map.find(*k), Some(v));
        }
    }

    #[test]
    fn growth_only_doubles_as_needed(initial in 2usize..32, count in 1usize..300) {
        let mut map = StreamMap::with_capacity(initial);
        for id in 1..=count as u32 {
            map.add(id, ());
        }
        let cap = map.capacity();
        prop_assert!(cap >= count);
        // One doubling less would not have held every entry.
        prop_assert!(cap == initial || cap / 2 < count);
    }
}
