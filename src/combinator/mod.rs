//! N-ary combinators
//!
//! Each combinator turns a set of child promises into one parent promise:
//!
//! | combinator         | settles when                      | parent outcome                  |
//! |--------------------|-----------------------------------|---------------------------------|
//! | [`all`]            | every child resolved, or a failure | values in order, or the failure |
//! | [`all_settled`]    | every child settled               | every child's outcome           |
//! | [`race`]           | the first child settles           | that child's outcome            |
//! | [`race_with_index`]| the first child settles           | its index and outcome           |
//! | [`first`]          | a child resolves, or all failed   | that value, or the first failure|
//! | [`merge2`]..       | every child settled               | tuple of each child's outcome   |
//!
//! Children that lose a race or finish after a fail-fast parent has settled
//! keep running; their outcomes are consumed and dropped.
//!
//! Use [`Combinator`] to attach a cancellation token or to supply the output
//! vector.

mod collect;
mod engine;
mod merge;

pub use merge::{merge2, merge3, merge4};

use crate::cancellation::CancellationToken;
use crate::error::{PromiseError, Result};
use crate::promise::Promise;
use crate::state::Outcome;
use crate::Value;

use collect::{AllOutcomes, AllValues, FirstResolved, FirstSettled, FirstSettledIndexed};
use engine::Writer;

/// Builder for combinators with optional settings
#[derive(Debug, Clone, Default)]
pub struct Combinator {
    token: Option<CancellationToken>,
}

impl Combinator {
    /// Create a new combinator builder
    pub fn new() -> Self {
        Self { token: None }
    }

    /// Cancel the combined promise when `token` is canceled
    ///
    /// Children are not canceled; they run to completion and their outcomes
    /// are discarded.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Resolve with every child's value, or settle with the first failure
    pub fn all<T, I>(self, children: I) -> Result<Promise<Vec<T>>>
    where
        T: Value,
        I: IntoIterator<Item = Promise<T>>,
    {
        self.all_into(children, Vec::new())
    }

    /// Like [`all`](Self::all), reusing `results` as the output vector
    ///
    /// Any existing contents of `results` are discarded.
    pub fn all_into<T, I>(self, children: I, results: Vec<T>) -> Result<Promise<Vec<T>>>
    where
        T: Value,
        I: IntoIterator<Item = Promise<T>>,
    {
        let write: Writer<T, AllValues<T>> = AllValues::write;
        let enumerated = engine::enumerate(children, write)?;
        let collector = AllValues::new(enumerated.len(), results);
        Ok(engine::run(enumerated, collector, self.token.as_ref()))
    }

    /// Resolve with every child's outcome once all of them have settled
    pub fn all_settled<T, I>(self, children: I) -> Result<Promise<Vec<Outcome<T>>>>
    where
        T: Value,
        I: IntoIterator<Item = Promise<T>>,
    {
        self.all_settled_into(children, Vec::new())
    }

    pub fn all_settled_into<T, I>(
        self,
        children: I,
        results: Vec<Outcome<T>>,
    ) -> Result<Promise<Vec<Outcome<T>>>>
    where
        T: Value,
        I: IntoIterator<Item = Promise<T>>,
    {
        let write: Writer<T, AllOutcomes<T>> = AllOutcomes::write;
        let enumerated = engine::enumerate(children, write)?;
        let collector = AllOutcomes::new(enumerated.len(), results);
        Ok(engine::run(enumerated, collector, self.token.as_ref()))
    }

    /// Settle with the first child to settle, whatever its outcome
    ///
    /// Fails with [`PromiseError::InvalidArgument`] for zero children.
    pub fn race<T, I>(self, children: I) -> Result<Promise<T>>
    where
        T: Value,
        I: IntoIterator<Item = Promise<T>>,
    {
        let write: Writer<T, FirstSettled<T>> = FirstSettled::write;
        let enumerated = engine::enumerate(children, write)?;
        if enumerated.is_empty() {
            return Err(no_children("race"));
        }
        Ok(engine::run(enumerated, FirstSettled::new(), self.token.as_ref()))
    }

    /// Like [`race`](Self::race), also reporting the winner's index
    pub fn race_with_index<T, I>(self, children: I) -> Result<Promise<(usize, T)>>
    where
        T: Value,
        I: IntoIterator<Item = Promise<T>>,
    {
        let write: Writer<T, FirstSettledIndexed<T>> = FirstSettledIndexed::write;
        let enumerated = engine::enumerate(children, write)?;
        if enumerated.is_empty() {
            return Err(no_children("race_with_index"));
        }
        Ok(engine::run(
            enumerated,
            FirstSettledIndexed::new(),
            self.token.as_ref(),
        ))
    }

    /// Resolve with the first child to resolve
    ///
    /// If every child fails, the parent takes the first failure.
    pub fn first<T, I>(self, children: I) -> Result<Promise<T>>
    where
        T: Value,
        I: IntoIterator<Item = Promise<T>>,
    {
        let write: Writer<T, FirstResolved<T>> = FirstResolved::write;
        let enumerated = engine::enumerate(children, write)?;
        if enumerated.is_empty() {
            return Err(no_children("first"));
        }
        Ok(engine::run(enumerated, FirstResolved::new(), self.token.as_ref()))
    }

    /// [`merge2`] with this builder's cancellation token
    pub fn merge2<A, B>(self, a: Promise<A>, b: Promise<B>) -> Result<Promise<(Outcome<A>, Outcome<B>)>>
    where
        A: Value,
        B: Value,
    {
        merge::merge2_with_token(self.token.as_ref(), a, b)
    }

    pub fn merge3<A, B, C>(
        self,
        a: Promise<A>,
        b: Promise<B>,
        c: Promise<C>,
    ) -> Result<Promise<(Outcome<A>, Outcome<B>, Outcome<C>)>>
    where
        A: Value,
        B: Value,
        C: Value,
    {
        merge::merge3_with_token(self.token.as_ref(), a, b, c)
    }

    pub fn merge4<A, B, C, D>(
        self,
        a: Promise<A>,
        b: Promise<B>,
        c: Promise<C>,
        d: Promise<D>,
    ) -> Result<Promise<(Outcome<A>, Outcome<B>, Outcome<C>, Outcome<D>)>>
    where
        A: Value,
        B: Value,
        C: Value,
        D: Value,
    {
        merge::merge4_with_token(self.token.as_ref(), a, b, c, d)
    }
}

fn no_children(combinator: &str) -> PromiseError {
    PromiseError::InvalidArgument(format!("{} requires at least one child", combinator))
}

/// Resolve with every child's value, or settle with the first failure
pub fn all<T, I>(children: I) -> Result<Promise<Vec<T>>>
where
    T: Value,
    I: IntoIterator<Item = Promise<T>>,
{
    Combinator::new().all(children)
}

/// Resolve with every child's outcome once all of them have settled
pub fn all_settled<T, I>(children: I) -> Result<Promise<Vec<Outcome<T>>>>
where
    T: Value,
    I: IntoIterator<Item = Promise<T>>,
{
    Combinator::new().all_settled(children)
}

/// Settle with the first child to settle
pub fn race<T, I>(children: I) -> Result<Promise<T>>
where
    T: Value,
    I: IntoIterator<Item = Promise<T>>,
{
    Combinator::new().race(children)
}

pub fn race_with_index<T, I>(children: I) -> Result<Promise<(usize, T)>>
where
    T: Value,
    I: IntoIterator<Item = Promise<T>>,
{
    Combinator::new().race_with_index(children)
}

/// Resolve with the first child to resolve
pub fn first<T, I>(children: I) -> Result<Promise<T>>
where
    T: Value,
    I: IntoIterator<Item = Promise<T>>,
{
    Combinator::new().first(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Reason, SettlementState};
    use crate::Deferred;

    #[test]
    fn test_all_empty_resolves_immediately() {
        let parent = all(Vec::<Promise<u32>>::new()).unwrap();
        assert_eq!(parent.state(), Ok(SettlementState::Resolved));
        assert_eq!(parent.wait(), Outcome::Resolved(Vec::new()));
    }

    #[test]
    fn test_all_settled_scenario() {
        let (b, pb) = Deferred::<u32>::new();
        let (c, pc) = Deferred::<u32>::new();
        let parent = all_settled(vec![Promise::resolved(1), pb, pc]).unwrap();

        c.reject(Reason::msg("X")).unwrap();
        b.resolve(2).unwrap();

        assert_eq!(
            parent.wait(),
            Outcome::Resolved(vec![
                Outcome::Resolved(1),
                Outcome::Resolved(2),
                Outcome::rejected_with("X"),
            ])
        );
    }

    #[test]
    fn test_all_fails_fast() {
        let (b, pb) = Deferred::<u32>::new();
        let (c, pc) = Deferred::<u32>::new();
        let parent = all(vec![Promise::resolved(1), pb, pc]).unwrap();

        c.reject(Reason::msg("X")).unwrap();
        assert_eq!(parent.state(), Ok(SettlementState::Rejected));
        // The loser still settles cleanly
        b.resolve(2).unwrap();
        assert_eq!(parent.wait(), Outcome::rejected_with("X"));
    }

    #[test]
    fn test_all_into_reuses_buffer() {
        let (d, p) = Deferred::<u32>::new();
        let buffer = vec![9, 9, 9, 9];
        let parent = Combinator::new()
            .all_into(vec![p, Promise::resolved(5)], buffer)
            .unwrap();

        d.resolve(4).unwrap();
        assert_eq!(parent.wait(), Outcome::Resolved(vec![4, 5]));
    }

    #[test]
    fn test_race_requires_children() {
        assert!(matches!(
            race(Vec::<Promise<u32>>::new()),
            Err(PromiseError::InvalidArgument(_))
        ));
        assert!(matches!(
            first(Vec::<Promise<u32>>::new()),
            Err(PromiseError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_race_takes_first_settlement() {
        let (a, pa) = Deferred::<u32>::new();
        let (b, pb) = Deferred::<u32>::new();
        let parent = race_with_index(vec![pa, pb]).unwrap();

        b.cancel().unwrap();
        a.resolve(1).unwrap();
        assert_eq!(parent.wait(), Outcome::Canceled);
    }

    #[test]
    fn test_race_inline_child_wins() {
        let (_a, pa) = Deferred::<u32>::new();
        let parent = race_with_index(vec![pa, Promise::resolved(8)]).unwrap();
        assert_eq!(parent.wait(), Outcome::Resolved((1, 8)));
    }

    #[test]
    fn test_first_skips_failures() {
        let (a, pa) = Deferred::<u32>::new();
        let (b, pb) = Deferred::<u32>::new();
        let parent = first(vec![pa, pb]).unwrap();

        a.reject(Reason::msg("a failed")).unwrap();
        assert_eq!(parent.state(), Ok(SettlementState::Pending));
        b.resolve(2).unwrap();
        assert_eq!(parent.wait(), Outcome::Resolved(2));
    }

    #[test]
    fn test_first_all_failed_takes_first_failure() {
        let (a, pa) = Deferred::<u32>::new();
        let (b, pb) = Deferred::<u32>::new();
        let parent = first(vec![pa, pb]).unwrap();

        b.cancel().unwrap();
        a.reject(Reason::msg("a failed")).unwrap();
        assert_eq!(parent.wait(), Outcome::Canceled);
    }

    #[test]
    fn test_builder_token_cancels_parent_only() {
        let token = CancellationToken::new();
        let (a, pa) = Deferred::<u32>::new();
        let parent = Combinator::new()
            .cancel_on(token.clone())
            .all_settled(vec![pa])
            .unwrap();

        token.cancel();
        assert_eq!(parent.wait(), Outcome::Canceled);
        assert!(a.is_pending());
        a.resolve(1).unwrap();
    }
}
