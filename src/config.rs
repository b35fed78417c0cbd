use crate::ContinuationContext;

/// What [`crate::AsyncEnumerator::try_get_next`] does when it is called again while the
/// sequence is still blocked on an unfinished `await` and no wait was registered in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DrainPolicy {
    /// Return [`crate::Incomplete::OutOfTurn`] without touching the state machine.
    #[default]
    Reject,
    /// Park the calling thread until the pending `await` finishes, then continue the drain.
    Block,
}

/// Options of a running [`crate::AsyncSequence`].
#[derive(Debug, Clone, Default)]
pub struct SequenceConfig {
    pub drain_policy: DrainPolicy,
    /// Where the state machine resumes after an `await` and where consumer wakeups run.
    pub continuation_context: ContinuationContext,
    /// Never run consumer continuations on the thread which produced the value.
    pub run_continuations_asynchronously: bool,
}

impl SequenceConfig {
    pub fn with_drain_policy(mut self, drain_policy: DrainPolicy) -> SequenceConfig {
        self.drain_policy = drain_policy;
        self
    }

    pub fn with_continuation_context(mut self, context: ContinuationContext) -> SequenceConfig {
        self.continuation_context = context;
        self
    }

    pub fn with_asynchronous_continuations(mut self, enabled: bool) -> SequenceConfig {
        self.run_continuations_asynchronously = enabled;
        self
    }
}
