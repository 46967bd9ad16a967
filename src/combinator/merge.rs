//! Pairwise merge of heterogeneous promises
//!
//! `mergeN` waits for all of its children and always resolves with a tuple
//! holding each child's own outcome. A child's failure is data in its slot,
//! never the parent's rejection.

use once_cell::sync::OnceCell;

use super::engine::{count_child, Collect, Engine, Step};
use crate::cancellation::CancellationToken;
use crate::error::{PromiseError, Result};
use crate::promise::{Deferred, Promise};
use crate::state::Outcome;
use crate::Value;

fn invalid_child(index: usize) -> PromiseError {
    PromiseError::InvalidArgument(format!("child {} is not a valid promise", index))
}

macro_rules! merge_impl {
    (
        $(#[$meta:meta])*
        $name:ident, $with_token:ident, $collector:ident;
        $($T:ident $arg:ident $write:ident $idx:tt),+
    ) => {
        pub(crate) struct $collector<$($T),+> {
            slots: ($(OnceCell<Outcome<$T>>,)+),
        }

        impl<$($T: Value),+> $collector<$($T),+> {
            $(
                fn $write(&self, _index: usize, outcome: Outcome<$T>) -> Step<<Self as Collect>::Output> {
                    let _ = self.slots.$idx.set(outcome);
                    Step::Continue
                }
            )+
        }

        impl<$($T: Value),+> Collect for $collector<$($T),+> {
            type Output = ($(Outcome<$T>,)+);

            fn complete(&self) -> Outcome<Self::Output> {
                Outcome::Resolved(($(
                    match self.slots.$idx.get() {
                        Some(outcome) => outcome.clone(),
                        None => Outcome::Rejected(
                            PromiseError::InvalidOperation("merge slot never written").into(),
                        ),
                    },
                )+))
            }
        }

        $(#[$meta])*
        pub fn $name<$($T: Value),+>($($arg: Promise<$T>),+) -> Result<Promise<($(Outcome<$T>,)+)>> {
            $with_token(None, $($arg),+)
        }

        pub(crate) fn $with_token<$($T: Value),+>(
            token: Option<&CancellationToken>,
            $($arg: Promise<$T>),+
        ) -> Result<Promise<($(Outcome<$T>,)+)>> {
            $(
                if !$arg.is_valid() {
                    return Err(invalid_child($idx));
                }
            )+

            let collector = $collector {
                slots: ($(OnceCell::<Outcome<$T>>::new(),)+),
            };

            // Inline children fill their slot now; the rest are linked after
            // the engine exists.
            let mut pending: u32 = 0;
            $(
                let $arg = match $arg.try_into_inline() {
                    Ok(value) => {
                        let _ = collector.slots.$idx.set(Outcome::Resolved(value));
                        None
                    }
                    Err(child) => {
                        pending = count_child(pending)?;
                        Some(child)
                    }
                };
            )+

            let (parent, promise) = Deferred::new();
            let engine = Engine::new(collector, pending, parent);
            if let Some(token) = token {
                engine.cancel_on(token);
            }
            if pending == 0 {
                engine.complete();
            }
            $(
                if let Some(child) = $arg {
                    engine.link(child, $idx, $collector::$write);
                }
            )+

            Ok(promise)
        }
    };
}

merge_impl! {
    /// Wait for two promises of different types
    ///
    /// ```rust
    /// use rust_deferred::{combinator, Deferred, Outcome, Promise};
    ///
    /// let (deferred, name) = Deferred::<String>::new();
    /// let merged = combinator::merge2(Promise::resolved(7u32), name).unwrap();
    ///
    /// deferred.reject(rust_deferred::Reason::msg("offline")).unwrap();
    /// assert_eq!(
    ///     merged.wait(),
    ///     Outcome::Resolved((Outcome::Resolved(7), Outcome::rejected_with("offline")))
    /// );
    /// ```
    merge2, merge2_with_token, Merge2;
    A a write_a 0, B b write_b 1
}

merge_impl! {
    /// Wait for three promises of different types
    merge3, merge3_with_token, Merge3;
    A a write_a 0, B b write_b 1, C c write_c 2
}

merge_impl! {
    /// Wait for four promises of different types
    merge4, merge4_with_token, Merge4;
    A a write_a 0, B b write_b 1, C c write_c 2, D d write_d 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Reason, SettlementState};

    #[test]
    fn test_merge2_all_inline() {
        let merged = merge2(Promise::resolved(1u8), Promise::resolved("one")).unwrap();
        assert_eq!(merged.state(), Ok(SettlementState::Resolved));
        assert_eq!(
            merged.wait(),
            Outcome::Resolved((Outcome::Resolved(1), Outcome::Resolved("one")))
        );
    }

    #[test]
    fn test_merge3_waits_for_every_child() {
        let (d1, p1) = Deferred::<u32>::new();
        let (d2, p2) = Deferred::<String>::new();
        let merged = merge3(p1, p2, Promise::resolved(true)).unwrap();

        d2.cancel().unwrap();
        assert_eq!(merged.state(), Ok(SettlementState::Pending));
        d1.reject(Reason::msg("X")).unwrap();

        assert_eq!(
            merged.wait(),
            Outcome::Resolved((
                Outcome::rejected_with("X"),
                Outcome::Canceled,
                Outcome::Resolved(true)
            ))
        );
    }

    #[test]
    fn test_merge4_mixed_types() {
        let (d, p) = Deferred::<Vec<u8>>::new();
        let merged = merge4(
            Promise::resolved(1i64),
            Promise::resolved('x'),
            p,
            Promise::resolved(()),
        )
        .unwrap();

        d.resolve(vec![1, 2]).unwrap();
        let (first, second, third, fourth) = merged.wait().resolved().unwrap();
        assert_eq!(first, Outcome::Resolved(1));
        assert_eq!(second, Outcome::Resolved('x'));
        assert_eq!(third, Outcome::Resolved(vec![1, 2]));
        assert_eq!(fourth, Outcome::Resolved(()));
    }

    #[test]
    fn test_merge_token_cancels_parent_only() {
        let token = CancellationToken::new();
        let (d1, p1) = Deferred::<u32>::new();
        let (d2, p2) = Deferred::<&'static str>::new();
        let merged = merge2_with_token(Some(&token), p1, p2).unwrap();

        d1.resolve(1).unwrap();
        token.cancel();
        assert_eq!(merged.state(), Ok(SettlementState::Canceled));

        // The remaining child still settles and its outcome is dropped
        assert!(d2.resolve("late").is_ok());
        assert_eq!(merged.wait(), Outcome::Canceled);
        assert_eq!(token.registered(), 0);
    }
}
