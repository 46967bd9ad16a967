#![no_main]
use libfuzzer_sys::arbitrary::{self, Arbitrary};
use libfuzzer_sys::fuzz_target;
use rust_deferred::{all, all_settled, race_with_index, Deferred, Outcome, Promise, Reason};

#[derive(Arbitrary, Debug, Clone, Copy)]
enum Child {
    Inline(u16),
    Resolve(u16),
    Reject,
    Cancel,
}

#[derive(Arbitrary, Debug)]
struct Input {
    children: Vec<Child>,
    // Settlement order, as indices into the pending children
    order: Vec<u8>,
}

fn build(children: &[Child]) -> (Vec<Option<Deferred<u16>>>, Vec<Promise<u16>>) {
    children
        .iter()
        .map(|child| match child {
            Child::Inline(value) => (None, Promise::resolved(*value)),
            _ => {
                let (deferred, promise) = Deferred::new();
                (Some(deferred), promise)
            }
        })
        .unzip()
}

fn settle_in_order(children: &[Child], deferreds: &[Option<Deferred<u16>>], order: &[u8]) {
    let mut pending: Vec<usize> = (0..children.len())
        .filter(|&i| deferreds[i].is_some())
        .collect();
    let mut cursor = order.iter();
    while !pending.is_empty() {
        let pick = cursor.next().map(|&b| b as usize).unwrap_or(0) % pending.len();
        let index = pending.swap_remove(pick);
        let Some(deferred) = &deferreds[index] else { continue };
        let result = match children[index] {
            Child::Resolve(value) => deferred.resolve(value),
            Child::Reject => deferred.reject(Reason::msg("rejected")),
            _ => deferred.cancel(),
        };
        assert!(result.is_ok());
    }
}

fuzz_target!(|input: Input| {
    let children = &input.children[..input.children.len().min(64)];

    // Every child's outcome lands in its own slot
    let (deferreds, promises) = build(children);
    let settled = all_settled(promises).unwrap();
    settle_in_order(children, &deferreds, &input.order);
    let outcomes = settled.wait().resolved().unwrap();
    assert_eq!(outcomes.len(), children.len());
    for (outcome, child) in outcomes.iter().zip(children) {
        match child {
            Child::Inline(value) | Child::Resolve(value) => {
                assert_eq!(outcome, &Outcome::Resolved(*value))
            }
            Child::Reject => assert!(outcome.is_rejected()),
            Child::Cancel => assert!(outcome.is_canceled()),
        }
    }

    // Fail-fast settles exactly once, with a value vector only if nothing failed
    let (deferreds, promises) = build(children);
    let values = all(promises).unwrap();
    settle_in_order(children, &deferreds, &input.order);
    let failed = children
        .iter()
        .any(|child| matches!(child, Child::Reject | Child::Cancel));
    match values.wait() {
        Outcome::Resolved(values) => {
            assert!(!failed);
            assert_eq!(values.len(), children.len());
        }
        _ => assert!(failed),
    }

    // The race winner is a real child
    if !children.is_empty() {
        let (deferreds, promises) = build(children);
        let winner = race_with_index(promises).unwrap();
        settle_in_order(children, &deferreds, &input.order);
        if let Outcome::Resolved((index, value)) = winner.wait() {
            match children[index] {
                Child::Inline(expected) | Child::Resolve(expected) => assert_eq!(value, expected),
                _ => panic!("race resolved from a failed child"),
            }
        }
    }
});
