use crate::{Fault, UsageError};
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::task::Waker;

/// A one-shot callback installed on a [`CompletionSource`] or an [`crate::Awaiter`].
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one occurrence of a [`CompletionSource`] (the version it had when observed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    pub const fn new(version: u64) -> Token {
        Token(version)
    }

    pub fn version(&self) -> u64 {
        self.0
    }
}

/// Observable status of a [`CompletionSource`] occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceStatus {
    Pending,
    Succeeded,
    Faulted,
    Canceled,
}

/// Runs continuations somewhere other than the completing thread.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, continuation: Continuation);
}

/// Where a continuation runs once the outcome it waits for is available.
///
/// The context is captured explicitly when the continuation is registered.
#[derive(Clone, Default)]
pub enum ContinuationContext {
    /// Run on the thread which completes the source (or registers the continuation,
    /// if the outcome is already available).
    #[default]
    Inline,
    /// Post the continuation to the given scheduler.
    Scheduler(Arc<dyn Scheduler>),
}

impl Debug for ContinuationContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ContinuationContext::Inline => write!(f, "Inline"),
            ContinuationContext::Scheduler(_) => write!(f, "Scheduler(..)"),
        }
    }
}

/// The default pool hop: every continuation runs on a fresh named thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, continuation: Continuation) {
        let spawned = std::thread::Builder::new()
            .name("async-sequence-continuation".to_string())
            .spawn(continuation);
        if let Err(error) = spawned {
            // The closure is lost together with the failed spawn; nothing can run it anymore.
            tracing::error!(%error, "failed to spawn continuation thread");
        }
    }
}

enum Slot {
    /// No outcome, no continuation.
    Empty,
    /// A continuation waits for the outcome.
    Registered(Continuation, ContinuationContext),
    /// The outcome is present and nobody registered yet.
    Completed,
    /// The single continuation has been dispatched.
    Fired,
}

struct Core<T> {
    version: u64,
    outcome: Option<Result<T, Fault>>,
    slot: Slot,
    /// Consumer tasks parked on the current occurrence.
    wakers: Vec<(Waker, ContinuationContext)>,
}

/// Everything that must run once an outcome was recorded, outside the lock.
struct Wakeups {
    continuation: Option<(Continuation, ContinuationContext)>,
    wakers: Vec<(Waker, ContinuationContext)>,
}

/// A reusable, versioned, single-continuation synchronization object.
///
/// It holds a single pending outcome and at most one continuation. It is
/// [`reset`](CompletionSource::reset) before each reuse, which bumps its version; every
/// observer carries the [`Token`] it was created with, and using a token from a previous
/// occurrence is a [`UsageError`].
///
/// One instance is created per state machine and reused for every element: the consumer
/// side observes it through [`crate::ValueAwaitable`]s bound to a [`Token`].
pub struct CompletionSource<T> {
    core: Mutex<Core<T>>,
    run_continuations_asynchronously: bool,
}

impl<T> Debug for CompletionSource<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let core = self.core.lock();
        f.debug_struct("CompletionSource")
            .field("version", &core.version)
            .field("completed", &core.outcome.is_some())
            .finish()
    }
}

impl<T> Default for CompletionSource<T> {
    fn default() -> Self {
        CompletionSource::new()
    }
}

impl<T> CompletionSource<T> {
    /// Create a new pending source at version zero.
    pub fn new() -> CompletionSource<T> {
        CompletionSource {
            core: Mutex::new(Core {
                version: 0,
                outcome: None,
                slot: Slot::Empty,
                wakers: Vec::new(),
            }),
            run_continuations_asynchronously: false,
        }
    }

    /// Create a source which never runs an [`ContinuationContext::Inline`] continuation on
    /// the completing thread, hopping to a [`ThreadScheduler`] instead.
    pub fn with_asynchronous_continuations() -> CompletionSource<T> {
        CompletionSource {
            run_continuations_asynchronously: true,
            ..CompletionSource::new()
        }
    }

    /// The token of the current occurrence.
    pub fn version(&self) -> Token {
        Token(self.core.lock().version)
    }

    /// Forget the outcome and any continuation and start a new occurrence.
    pub fn reset(&self) -> Token {
        let mut core = self.core.lock();
        core.version = core.version.wrapping_add(1);
        core.outcome = None;
        core.slot = Slot::Empty;
        core.wakers.clear();
        tracing::trace!(version = core.version, "completion source reset");
        Token(core.version)
    }

    /// True once an outcome was recorded for the current occurrence.
    pub fn is_completed(&self) -> bool {
        self.core.lock().outcome.is_some()
    }

    /// Record a successful outcome and fire the registered continuation, if any.
    ///
    /// # Panics
    ///
    /// Panics with [`UsageError::AlreadyCompleted`] if the current occurrence already has
    /// an outcome.
    #[track_caller]
    pub fn set_result(&self, value: T) {
        self.complete(Ok(value));
    }

    /// Record a faulted outcome and fire the registered continuation, if any.
    ///
    /// # Panics
    ///
    /// Same as [`CompletionSource::set_result`].
    #[track_caller]
    pub fn set_exception(&self, fault: Fault) {
        self.complete(Err(fault));
    }

    /// Complete the occurrence `token` with a value, unless the source was reset or
    /// completed in the meantime. Returns `true` if this call recorded the outcome.
    pub fn try_set_result(&self, token: Token, value: T) -> bool {
        self.try_complete(token, Ok(value))
    }

    /// Fault the occurrence `token`; see [`CompletionSource::try_set_result`].
    pub fn try_set_exception(&self, token: Token, fault: Fault) -> bool {
        self.try_complete(token, Err(fault))
    }

    #[track_caller]
    fn complete(&self, outcome: Result<T, Fault>) {
        let mut core = self.core.lock();
        if core.outcome.is_some() {
            drop(core);
            UsageError::AlreadyCompleted.fail();
        }
        let wakeups = Self::record(&mut core, outcome);
        drop(core);
        // Continuations may re-enter this source, so they never run under the lock.
        self.wake(wakeups);
    }

    fn try_complete(&self, token: Token, outcome: Result<T, Fault>) -> bool {
        let mut core = self.core.lock();
        if core.version != token.0 || core.outcome.is_some() {
            tracing::trace!(
                version = core.version,
                token = token.0,
                "late completion ignored"
            );
            return false;
        }
        let wakeups = Self::record(&mut core, outcome);
        drop(core);
        self.wake(wakeups);
        true
    }

    fn record(core: &mut Core<T>, outcome: Result<T, Fault>) -> Wakeups {
        tracing::trace!(
            version = core.version,
            faulted = outcome.is_err(),
            parked = core.wakers.len(),
            "completion source completed"
        );
        core.outcome = Some(outcome);
        let continuation = match std::mem::replace(&mut core.slot, Slot::Fired) {
            Slot::Registered(continuation, context) => Some((continuation, context)),
            _ => {
                core.slot = Slot::Completed;
                None
            }
        };
        Wakeups {
            continuation,
            wakers: std::mem::take(&mut core.wakers),
        }
    }

    fn wake(&self, wakeups: Wakeups) {
        if let Some((continuation, context)) = wakeups.continuation {
            self.dispatch(continuation, context);
        }
        for (waker, context) in wakeups.wakers {
            self.dispatch(Box::new(move || waker.wake()), context);
        }
    }

    /// Park a consumer task on the occurrence `token` unless it already has an outcome.
    ///
    /// Returns `true` if the outcome is available. Any number of tasks can park on one
    /// occurrence, and a task which parks again only replaces its previous waker. Wakers
    /// of abandoned observers are woken spuriously and otherwise ignored.
    ///
    /// # Panics
    ///
    /// Panics with [`UsageError::StaleToken`] if `token` does not match the current version.
    #[track_caller]
    pub fn poll_ready(&self, token: Token, waker: &Waker, context: &ContinuationContext) -> bool {
        let mut core = self.core.lock();
        Self::validate(&core, token);
        if core.outcome.is_some() {
            return true;
        }
        match core.wakers.iter_mut().find(|(parked, _)| parked.will_wake(waker)) {
            Some(entry) => entry.1 = context.clone(),
            None => core.wakers.push((waker.clone(), context.clone())),
        }
        false
    }

    /// Status of the occurrence identified by `token`.
    ///
    /// # Panics
    ///
    /// Panics with [`UsageError::StaleToken`] if `token` does not match the current version.
    #[track_caller]
    pub fn status(&self, token: Token) -> SourceStatus {
        let core = self.core.lock();
        Self::validate(&core, token);
        match &core.outcome {
            None => SourceStatus::Pending,
            Some(Ok(_)) => SourceStatus::Succeeded,
            Some(Err(fault)) if fault.is_cancelled() => SourceStatus::Canceled,
            Some(Err(_)) => SourceStatus::Faulted,
        }
    }

    /// Install `continuation` for the occurrence identified by `token`.
    ///
    /// If the outcome is already available, the continuation is dispatched immediately
    /// (inline or through `context`).
    ///
    /// # Panics
    ///
    /// Panics on a stale token or when a continuation was already installed for this
    /// occurrence.
    #[track_caller]
    pub fn on_completed(
        &self,
        continuation: Continuation,
        token: Token,
        context: ContinuationContext,
    ) {
        let mut core = self.core.lock();
        Self::validate(&core, token);
        match std::mem::replace(&mut core.slot, Slot::Fired) {
            Slot::Empty => {
                core.slot = Slot::Registered(continuation, context);
            }
            Slot::Completed => {
                drop(core);
                self.dispatch(continuation, context);
            }
            previous @ (Slot::Registered(..) | Slot::Fired) => {
                core.slot = previous;
                drop(core);
                UsageError::ContinuationAlreadyRegistered.fail();
            }
        }
    }

    fn dispatch(&self, continuation: Continuation, context: ContinuationContext) {
        match context {
            ContinuationContext::Scheduler(scheduler) => {
                tracing::trace!("continuation posted to scheduler");
                scheduler.schedule(continuation);
            }
            ContinuationContext::Inline if self.run_continuations_asynchronously => {
                tracing::trace!("continuation hops to thread scheduler");
                ThreadScheduler.schedule(continuation);
            }
            ContinuationContext::Inline => continuation(),
        }
    }

    #[track_caller]
    fn validate(core: &Core<T>, token: Token) {
        if core.version != token.0 {
            UsageError::StaleToken {
                expected: Token(core.version),
                found: token,
            }
            .fail();
        }
    }
}

impl<T: Clone> CompletionSource<T> {
    /// The outcome of the occurrence identified by `token`.
    ///
    /// # Panics
    ///
    /// Panics on a stale token or while the occurrence is still pending.
    #[track_caller]
    pub fn result(&self, token: Token) -> Result<T, Fault> {
        let core = self.core.lock();
        Self::validate(&core, token);
        match &core.outcome {
            Some(outcome) => outcome.clone(),
            None => {
                drop(core);
                UsageError::NotCompleted.fail()
            }
        }
    }
}
