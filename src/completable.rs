use crate::Fault;
use thiserror::Error;

/// The error type returned by a drain when no value is (yet) available.
///
/// The value can be unavailable because the sequence has to wait for an asynchronous operation,
/// because it has ended, because user code faulted, or because the drain was called out of turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum Incomplete {
    /// The sequence reached an `await` which is not finished yet. Use
    /// [`crate::AsyncEnumerator::wait_for_next`] to be notified once it can continue.
    #[error("Operation suspended")]
    Suspended,
    /// The sequence has ended and cannot produce more values.
    ///
    /// This is also returned when an enumerator is polled after it was disposed.
    #[error("Sequence exhausted")]
    Exhausted,
    /// The method body faulted. The fault is reported once, after which the sequence
    /// is [`Incomplete::Exhausted`].
    #[error("{0}")]
    Faulted(Fault),
    /// A second consecutive drain was requested while the sequence is still blocked on
    /// an unfinished `await` and no wait was registered in between.
    #[error("Drain called out of turn")]
    OutOfTurn,
}

/// A [`Completable`] result is a value eventually produced by a sequence where
/// the production can be [`Incomplete`] when the value is polled.
pub type Completable<T> = Result<T, Incomplete>;

impl From<Fault> for Incomplete {
    fn from(value: Fault) -> Self {
        Incomplete::Faulted(value)
    }
}
