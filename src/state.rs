//! Settlement vocabulary shared by every component
//!
//! A promise is always in one of four [`SettlementState`]s. Once it leaves
//! `Pending` it never changes again. The payload that travels with a terminal
//! state is an [`Outcome`].

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::error::{Message, Panicked};

/// The tri-state outcome of a promise plus its pending state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SettlementState {
    Pending = 0,
    Resolved = 2,
    Rejected = 3,
    Canceled = 4,
}

impl SettlementState {
    /// Returns `true` once the promise can no longer change
    pub fn is_terminal(self) -> bool {
        !matches!(self, SettlementState::Pending)
    }

    pub(crate) fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Pending),
            2 => Some(Self::Resolved),
            3 => Some(Self::Rejected),
            4 => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for SettlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Resolved => f.write_str("resolved"),
            Self::Rejected => f.write_str("rejected"),
            Self::Canceled => f.write_str("canceled"),
        }
    }
}

/// Why a promise was rejected
///
/// Cloning is cheap: the underlying error is shared. Two reasons compare equal
/// when they are the same error or render the same message.
#[derive(Clone)]
pub struct Reason {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl Reason {
    /// Wrap an arbitrary error
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// A reason carrying only a message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Convert a payload caught by `catch_unwind` into a rejection reason
    pub fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(Panicked(message))
    }

    /// Attempt to view the reason as a concrete error type
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    /// Returns `true` if this reason came from a panicking continuation
    pub fn is_panic(&self) -> bool {
        self.downcast_ref::<Panicked>().is_some()
    }

    pub fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }
}

impl<E> From<E> for Reason
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl fmt::Debug for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reason").field(&self.inner.to_string()).finish()
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl PartialEq for Reason {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.to_string() == other.to_string()
    }
}

/// The payload of a terminal promise
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Resolved(T),
    Rejected(Reason),
    /// Cancellation carries no value
    Canceled,
}

impl<T> Outcome<T> {
    /// A rejected outcome with a message reason
    pub fn rejected_with(message: impl Into<String>) -> Self {
        Outcome::Rejected(Reason::msg(message))
    }

    pub fn state(&self) -> SettlementState {
        match self {
            Outcome::Resolved(_) => SettlementState::Resolved,
            Outcome::Rejected(_) => SettlementState::Rejected,
            Outcome::Canceled => SettlementState::Canceled,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Outcome::Resolved(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }

    pub fn as_ref(&self) -> Outcome<&T> {
        match self {
            Outcome::Resolved(value) => Outcome::Resolved(value),
            Outcome::Rejected(reason) => Outcome::Rejected(reason.clone()),
            Outcome::Canceled => Outcome::Canceled,
        }
    }

    /// Map the resolved value, passing rejections and cancellation through
    pub fn map<U, F>(self, f: F) -> Outcome<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Outcome::Resolved(value) => Outcome::Resolved(f(value)),
            Outcome::Rejected(reason) => Outcome::Rejected(reason),
            Outcome::Canceled => Outcome::Canceled,
        }
    }

    /// Re-type a failed outcome. Returns `Err(value)` for a resolved one.
    pub fn into_failure<U>(self) -> Result<Outcome<U>, T> {
        match self {
            Outcome::Resolved(value) => Err(value),
            Outcome::Rejected(reason) => Ok(Outcome::Rejected(reason)),
            Outcome::Canceled => Ok(Outcome::Canceled),
        }
    }

    pub fn resolved(self) -> Option<T> {
        match self {
            Outcome::Resolved(value) => Some(value),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&Reason> {
        match self {
            Outcome::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

impl<T, E> From<Result<T, E>> for Outcome<T>
where
    E: Into<Reason>,
{
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Outcome::Resolved(value),
            Err(error) => Outcome::Rejected(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn test_state_bits_round_trip() {
        for state in [
            SettlementState::Pending,
            SettlementState::Resolved,
            SettlementState::Rejected,
            SettlementState::Canceled,
        ] {
            assert_eq!(SettlementState::from_bits(state as u8), Some(state));
        }
        assert_eq!(SettlementState::from_bits(1), None);
        assert!(!SettlementState::Pending.is_terminal());
        assert!(SettlementState::Canceled.is_terminal());
    }

    #[test]
    fn test_reason_downcast() {
        let reason = Reason::from(DiskError);
        assert!(reason.downcast_ref::<DiskError>().is_some());
        assert_eq!(reason.to_string(), "disk on fire");
        assert!(!reason.is_panic());
    }

    #[test]
    fn test_reason_equality_by_message() {
        assert_eq!(Reason::msg("X"), Reason::msg("X"));
        assert_ne!(Reason::msg("X"), Reason::msg("Y"));
    }

    #[test]
    fn test_panic_payload_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        let reason = Reason::panicked(payload);
        assert!(reason.is_panic());
        assert!(reason.to_string().contains("boom"));
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: Outcome<u8> = Ok::<u8, DiskError>(7).into();
        assert_eq!(ok, Outcome::Resolved(7));

        let err: Outcome<u8> = Err::<u8, DiskError>(DiskError).into();
        assert_eq!(err.state(), SettlementState::Rejected);
        assert_eq!(err.reason().map(|r| r.to_string()), Some("disk on fire".into()));
    }

    #[test]
    fn test_outcome_map_passes_failures_through() {
        let canceled: Outcome<u8> = Outcome::Canceled;
        assert_eq!(canceled.map(|v| v * 2), Outcome::Canceled);
        assert_eq!(Outcome::Resolved(3).map(|v| v * 2), Outcome::Resolved(6));
        assert_eq!(
            Outcome::<u8>::rejected_with("X").into_failure::<String>(),
            Ok(Outcome::Rejected(Reason::msg("X")))
        );
    }
}
