use crate::{CompletionSource, Continuation, ContinuationContext, Fault, SourceStatus, Token};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// The producer-side capability of anything a method body can `await`.
///
/// The driver checks [`Awaiter::is_ready`] first and continues synchronously when it is;
/// otherwise it hoists the awaiter and installs itself through
/// [`Awaiter::register_continuation`], reading [`Awaiter::outcome`] once resumed.
pub trait Awaiter: Send + Sync {
    type Output;

    fn is_ready(&self) -> bool;

    /// The outcome of a ready awaiter. Only called after [`Awaiter::is_ready`] returned `true`.
    fn outcome(&self) -> Result<Self::Output, Fault>;

    /// Install a continuation which runs once the awaiter becomes ready (immediately
    /// if it already is). Called at most once per awaiter.
    fn register_continuation(&self, continuation: Continuation);
}

/// An awaitable bound to one occurrence of a [`CompletionSource`], or an already known result.
///
/// This is the value a consumer receives from [`crate::AsyncEnumerator::wait_for_next`]:
/// no synchronization object is allocated per element, every awaitable shares the
/// source and only remembers its [`Token`]. Polling parks the task on the source, so any
/// number of awaitables of one occurrence can be polled, dropped and polled again.
pub struct ValueAwaitable<T> {
    repr: Repr<T>,
}

enum Repr<T> {
    Ready(Option<Result<T, Fault>>),
    Source {
        source: Arc<CompletionSource<T>>,
        token: Token,
        context: ContinuationContext,
    },
}

// No field is ever pinned structurally.
impl<T> Unpin for ValueAwaitable<T> {}

impl<T> ValueAwaitable<T> {
    /// An awaitable which is already complete.
    pub fn ready(result: Result<T, Fault>) -> ValueAwaitable<T> {
        ValueAwaitable {
            repr: Repr::Ready(Some(result)),
        }
    }

    /// An awaitable observing the occurrence `token` of `source`.
    pub fn from_source(source: Arc<CompletionSource<T>>, token: Token) -> ValueAwaitable<T> {
        ValueAwaitable::with_context(source, token, ContinuationContext::Inline)
    }

    /// Same as [`ValueAwaitable::from_source`], but wakeups are delivered through `context`.
    pub fn with_context(
        source: Arc<CompletionSource<T>>,
        token: Token,
        context: ContinuationContext,
    ) -> ValueAwaitable<T> {
        ValueAwaitable {
            repr: Repr::Source {
                source,
                token,
                context,
            },
        }
    }

    /// The token of the observed occurrence (`None` for ready awaitables).
    pub fn token(&self) -> Option<Token> {
        match &self.repr {
            Repr::Ready(_) => None,
            Repr::Source { token, .. } => Some(*token),
        }
    }

    /// True if this awaitable observes `source`.
    pub fn is_bound_to(&self, source: &Arc<CompletionSource<T>>) -> bool {
        match &self.repr {
            Repr::Ready(_) => false,
            Repr::Source { source: own, .. } => Arc::ptr_eq(own, source),
        }
    }

    /// # Panics
    ///
    /// Panics if the source was reset since this awaitable was created.
    #[track_caller]
    pub fn status(&self) -> SourceStatus {
        match &self.repr {
            Repr::Ready(None) | Repr::Ready(Some(Ok(_))) => SourceStatus::Succeeded,
            Repr::Ready(Some(Err(fault))) if fault.is_cancelled() => SourceStatus::Canceled,
            Repr::Ready(Some(Err(_))) => SourceStatus::Faulted,
            Repr::Source { source, token, .. } => source.status(*token),
        }
    }

    #[track_caller]
    pub fn is_completed(&self) -> bool {
        self.status() != SourceStatus::Pending
    }
}

impl<T: Clone> ValueAwaitable<T> {
    /// The result of a completed awaitable.
    ///
    /// # Panics
    ///
    /// Panics if the awaitable is still pending, if the source was reset in the meantime,
    /// or if a ready result was already taken by polling.
    #[track_caller]
    pub fn result(&self) -> Result<T, Fault> {
        match &self.repr {
            Repr::Ready(Some(result)) => result.clone(),
            Repr::Ready(None) => panic!("`ValueAwaitable` polled after completion"),
            Repr::Source { source, token, .. } => source.result(*token),
        }
    }
}

impl<T: Clone> Future for ValueAwaitable<T> {
    type Output = Result<T, Fault>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.repr {
            Repr::Ready(result) => match result.take() {
                Some(result) => Poll::Ready(result),
                None => panic!("`ValueAwaitable` polled after completion"),
            },
            Repr::Source {
                source,
                token,
                context,
            } => {
                if source.poll_ready(*token, cx.waker(), context) {
                    Poll::Ready(source.result(*token))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl<T: Clone + Send + Sync> Awaiter for ValueAwaitable<T> {
    type Output = T;

    fn is_ready(&self) -> bool {
        self.is_completed()
    }

    fn outcome(&self) -> Result<T, Fault> {
        self.result()
    }

    fn register_continuation(&self, continuation: Continuation) {
        match &self.repr {
            Repr::Ready(_) => continuation(),
            Repr::Source {
                source,
                token,
                context,
                ..
            } => source.on_completed(continuation, *token, context.clone()),
        }
    }
}
