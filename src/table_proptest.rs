#![cfg(test)]

// Property tests for WeakSlotTable kept inside the crate so they can use
// the test id type with caller-chosen hashes.

use crate::table::tests::TestId;
use crate::table::{InsertError, WeakSlotTable};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};

#[derive(Clone, Debug)]
enum Op {
    Insert(u32),
    Remove(u32),
    Contains(u32),
    Clear,
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    let n = 0u32..48;
    let op = prop_oneof![
        4 => n.clone().prop_map(Op::Insert),
        3 => n.clone().prop_map(Op::Remove),
        2 => n.prop_map(Op::Contains),
        1 => Just(Op::Clear),
    ];
    proptest::collection::vec(op, 1..200)
}

fn make_id(n: u32, buckets: u64) -> TestId {
    // Few buckets force long collision chains through tombstones.
    TestId {
        n,
        hash: crate::identity::mix64(n as u64) % buckets,
    }
}

// Property: state-machine equivalence against std::collections::HashMap.
// Invariants exercised across random operation sequences:
// - duplicates are rejected and keep the first notifier;
// - `remove` returns the stored notifier exactly once;
// - `contains` matches the model, including past tombstones;
// - `ids` yields each live id exactly once;
// - structural invariants (power-of-two capacity, load factor,
//   len/filled accounting, probe reachability) hold after every step;
// - capacity never decreases.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine(ops in arb_ops(), buckets in prop_oneof![Just(1u64), Just(4), Just(u64::MAX)]) {
        let mut sut: WeakSlotTable<TestId, u32> = WeakSlotTable::new();
        let mut model: HashMap<u32, u32> = HashMap::new();
        let mut next_notifier = 0u32;
        let mut last_capacity = 0;

        for op in ops {
            match op {
                Op::Insert(n) => {
                    next_notifier += 1;
                    match sut.insert(make_id(n, buckets), next_notifier) {
                        Ok(_) => prop_assert!(model.insert(n, next_notifier).is_none()),
                        Err(InsertError::DuplicateId) => prop_assert!(model.contains_key(&n)),
                    }
                }
                Op::Remove(n) => {
                    prop_assert_eq!(sut.remove(make_id(n, buckets)), model.remove(&n));
                }
                Op::Contains(n) => {
                    prop_assert_eq!(sut.contains(make_id(n, buckets)), model.contains_key(&n));
                    prop_assert_eq!(sut.notifier(make_id(n, buckets)), model.get(&n).copied());
                }
                Op::Clear => {
                    let mut drained = sut.clear();
                    drained.sort_unstable();
                    let mut expected: Vec<u32> = model.drain().map(|(_, v)| v).collect();
                    expected.sort_unstable();
                    prop_assert_eq!(drained, expected);
                }
            }

            sut.assert_invariants();
            prop_assert_eq!(sut.len(), model.len());
            prop_assert!(sut.capacity() >= last_capacity);
            last_capacity = sut.capacity();

            let seen: Vec<u32> = sut.ids().map(|id| id.n).collect();
            let unique: BTreeSet<u32> = seen.iter().copied().collect();
            prop_assert_eq!(seen.len(), unique.len());
            let expected: BTreeSet<u32> = model.keys().copied().collect();
            prop_assert_eq!(unique, expected);
        }
    }
}
