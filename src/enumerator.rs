use crate::{Completable, DynEnumerator, ValueAwaitable};

/// The consumer side of an asynchronous sequence.
///
/// A consumer alternates between [`AsyncEnumerator::wait_for_next`] and
/// [`AsyncEnumerator::try_get_next`], keeping at most one call outstanding at a time:
///
/// ```text
/// while wait_for_next().await? {
///     while let Ok(item) = try_get_next() { ... }
/// }
/// ```
pub trait AsyncEnumerator<T>: Send + Sync {
    /// Wait until a value can be drained or the sequence ends.
    ///
    /// The awaitable resolves to `true` when [`AsyncEnumerator::try_get_next`] will return
    /// a value, to `false` once the sequence has ended, or to the fault which ended it.
    /// Calling it again before draining returns an awaitable for the same occurrence.
    fn wait_for_next(&self) -> ValueAwaitable<bool>;

    /// Try to take the next value without waiting.
    ///
    /// Returns:
    /// - `Ok(item)` when a value is available
    /// - `Err(Incomplete::Suspended)` when the sequence waits for an asynchronous operation
    /// - `Err(Incomplete::Exhausted)` when the sequence has ended
    /// - `Err(Incomplete::Faulted(_))` when the method body faulted (reported once)
    /// - `Err(Incomplete::OutOfTurn)` when called again while still suspended
    ///   (depending on [`crate::DrainPolicy`])
    fn try_get_next(&self) -> Completable<T>;

    /// End the sequence early. Idempotent.
    ///
    /// Pending operations are not cancelled, but the sequence never resumes from them.
    /// An outstanding wait completes as cancelled.
    fn dispose(&self) -> ValueAwaitable<()>;

    /// Utility method to convert this [`AsyncEnumerator`] to a dynamic type.
    fn dyn_enumerator(self) -> DynEnumerator<T>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
}
