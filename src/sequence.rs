use crate::host::{DynAwaiter, Host};
use crate::{
    AsyncEnumerator, Completable, CompletionSource, Continuation, ContinuationContext,
    DrainPolicy, Driver, Fault, Incomplete, LoweredMethod, MachineState, SequenceConfig, Token,
    Value, ValueAwaitable,
};
use cancel_this::Cancelled;
use parking_lot::{Condvar, Mutex};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

/// A running instance of a lowered async iterator method, exposing the two-headed
/// consumer protocol on top of a [`Driver`].
///
/// All consumer calls are serialized on one lock. Consumer waits are answered through a
/// single [`CompletionSource`] which is reset for every element, so no synchronization
/// object is allocated per element.
pub struct AsyncSequence {
    machine: Arc<Machine>,
}

struct Machine {
    shared: Mutex<Shared>,
    /// Signalled whenever a suspended driver may have become resumable.
    advanced: Condvar,
    completion: Arc<CompletionSource<bool>>,
    host: Arc<dyn Host>,
    config: SequenceConfig,
}

struct Shared {
    driver: Driver,
    /// The last produced value, until it is drained.
    current: Option<Value>,
    /// A consumer wait is registered on the occurrence `promise_token`.
    promise_active: bool,
    promise_token: Token,
}

/// The result of one run of the driver, as seen by the adapter.
enum Step {
    Produced,
    Finished,
    Faulted(Fault),
    /// Suspended on an `await`. Carries the awaiter if the suspension is new and needs
    /// a continuation.
    Suspended(Option<(DynAwaiter, u64)>),
}

impl AsyncSequence {
    pub fn new(
        method: Arc<LoweredMethod>,
        host: Arc<dyn Host>,
        config: SequenceConfig,
    ) -> AsyncSequence {
        let completion = if config.run_continuations_asynchronously {
            CompletionSource::with_asynchronous_continuations()
        } else {
            CompletionSource::new()
        };
        tracing::debug!(method = method.name(), "async sequence created");
        AsyncSequence {
            machine: Arc::new(Machine {
                shared: Mutex::new(Shared {
                    driver: Driver::new(method),
                    current: None,
                    promise_active: false,
                    promise_token: completion.version(),
                }),
                advanced: Condvar::new(),
                completion: Arc::new(completion),
                host,
                config,
            }),
        }
    }

    pub fn machine_state(&self) -> MachineState {
        self.machine.shared.lock().driver.machine_state()
    }

    /// True while a consumer wait is registered.
    pub fn is_promise_active(&self) -> bool {
        self.machine.shared.lock().promise_active
    }

    pub fn config(&self) -> &SequenceConfig {
        &self.machine.config
    }
}

impl Debug for AsyncSequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let shared = self.machine.shared.lock();
        f.debug_struct("AsyncSequence")
            .field("state", &shared.driver.machine_state())
            .field("current", &shared.current)
            .field("promise_active", &shared.promise_active)
            .finish()
    }
}

impl Machine {
    /// Run the driver once. Must be called with the lock held.
    fn drive(&self, shared: &mut Shared) -> Step {
        let epoch = shared.driver.epoch();
        match shared.driver.step(self.host.as_ref()) {
            Ok(Some(value)) => {
                shared.current = Some(value);
                Step::Produced
            }
            Ok(None) | Err(Incomplete::Exhausted) | Err(Incomplete::OutOfTurn) => Step::Finished,
            Err(Incomplete::Faulted(fault)) => Step::Faulted(fault),
            Err(Incomplete::Suspended) => {
                let fresh = shared.driver.epoch() != epoch;
                let awaiter = shared.driver.awaiter().filter(|_| fresh).cloned();
                Step::Suspended(awaiter.map(|awaiter| (awaiter, shared.driver.epoch())))
            }
        }
    }

    /// Deliver the outcome of a drive to the wait registered on `token`. Called without
    /// the lock, since completing the wait may run consumer code.
    fn settle(self: &Arc<Self>, token: Token, step: Step) {
        match step {
            Step::Produced => {
                self.completion.try_set_result(token, true);
            }
            Step::Finished => {
                self.completion.try_set_result(token, false);
            }
            Step::Faulted(fault) => {
                self.completion.try_set_exception(token, fault);
            }
            Step::Suspended(Some((awaiter, epoch))) => self.watch(awaiter, epoch),
            Step::Suspended(None) => {}
        }
    }

    /// Install the driver as the continuation of `awaiter`.
    fn watch(self: &Arc<Self>, awaiter: DynAwaiter, epoch: u64) {
        let machine: Weak<Machine> = Arc::downgrade(self);
        let resume: Continuation = Box::new(move || {
            if let Some(machine) = machine.upgrade() {
                machine.resume_from(epoch);
            }
        });
        let continuation = match &self.config.continuation_context {
            ContinuationContext::Inline => resume,
            ContinuationContext::Scheduler(scheduler) => {
                let scheduler = scheduler.clone();
                Box::new(move || scheduler.schedule(resume)) as Continuation
            }
        };
        awaiter.register_continuation(continuation);
    }

    /// The continuation of the `await` which suspended the driver at `epoch`.
    fn resume_from(self: &Arc<Self>, epoch: u64) {
        let mut shared = self.shared.lock();
        let awaiting = matches!(shared.driver.machine_state(), MachineState::Awaiting(_));
        if shared.driver.epoch() != epoch || !awaiting {
            tracing::trace!(
                epoch,
                current = shared.driver.epoch(),
                "stale continuation ignored"
            );
            return;
        }
        if !shared.promise_active {
            // Nobody waits; the next drain continues synchronously.
            drop(shared);
            self.advanced.notify_all();
            return;
        }
        let token = shared.promise_token;
        let step = self.drive(&mut shared);
        drop(shared);
        self.advanced.notify_all();
        self.settle(token, step);
    }

    fn awaitable(&self, token: Token) -> ValueAwaitable<bool> {
        ValueAwaitable::with_context(
            self.completion.clone(),
            token,
            self.config.continuation_context.clone(),
        )
    }
}

impl AsyncEnumerator<Value> for AsyncSequence {
    fn wait_for_next(&self) -> ValueAwaitable<bool> {
        let machine = &self.machine;
        let mut shared = machine.shared.lock();
        if shared.driver.is_finished() {
            // The end (or fault) may still be on its way to the registered wait.
            if shared.promise_active && !machine.completion.is_completed() {
                return machine.awaitable(shared.promise_token);
            }
            shared.promise_active = false;
            return ValueAwaitable::ready(Ok(false));
        }
        if shared.promise_active {
            tracing::trace!("wait already registered");
            return machine.awaitable(shared.promise_token);
        }

        let token = machine.completion.reset();
        shared.promise_active = true;
        shared.promise_token = token;
        // A pending await resumes the driver through its own continuation.
        let step = shared
            .driver
            .is_resumable()
            .then(|| machine.drive(&mut shared));
        tracing::trace!(
            token = token.version(),
            state = shared.driver.machine_state().raw(),
            "wait registered"
        );
        drop(shared);

        if let Some(step) = step {
            machine.settle(token, step);
        }
        machine.awaitable(token)
    }

    fn try_get_next(&self) -> Completable<Value> {
        let machine = &self.machine;
        let mut shared = machine.shared.lock();
        loop {
            if shared.promise_active {
                if let Some(value) = shared.current.take() {
                    shared.promise_active = false;
                    return Ok(value);
                }
                if shared.driver.is_finished() {
                    shared.promise_active = false;
                    return Err(Incomplete::Exhausted);
                }
                return Err(Incomplete::Suspended);
            }

            match shared.driver.machine_state() {
                MachineState::Finished => return Err(Incomplete::Exhausted),
                MachineState::Awaiting(state) if !shared.driver.is_resumable() => {
                    match machine.config.drain_policy {
                        DrainPolicy::Reject => {
                            tracing::warn!(state, "drain called out of turn");
                            return Err(Incomplete::OutOfTurn);
                        }
                        DrainPolicy::Block => {
                            tracing::trace!(state, "drain blocks on pending await");
                            machine.advanced.wait(&mut shared);
                            continue;
                        }
                    }
                }
                _ => {}
            }

            let step = machine.drive(&mut shared);
            let result = match &step {
                Step::Produced => match shared.current.take() {
                    Some(value) => Ok(value),
                    None => Err(Incomplete::Exhausted),
                },
                Step::Finished => Err(Incomplete::Exhausted),
                Step::Faulted(fault) => Err(Incomplete::Faulted(fault.clone())),
                Step::Suspended(_) => Err(Incomplete::Suspended),
            };
            drop(shared);
            if let Step::Suspended(Some((awaiter, epoch))) = step {
                machine.watch(awaiter, epoch);
            }
            return result;
        }
    }

    fn dispose(&self) -> ValueAwaitable<()> {
        let machine = &self.machine;
        let cancel = {
            let mut shared = machine.shared.lock();
            shared.driver.dispose();
            shared.current = None;
            let cancel = shared.promise_active.then_some(shared.promise_token);
            shared.promise_active = false;
            cancel
        };
        machine.advanced.notify_all();
        if let Some(token) = cancel {
            tracing::debug!(token = token.version(), "outstanding wait cancelled");
            machine
                .completion
                .try_set_exception(token, Fault::Cancelled(Cancelled::default()));
        }
        ValueAwaitable::ready(Ok(()))
    }
}

impl LoweredMethod {
    /// Start a new iteration of this method with the default [`SequenceConfig`].
    pub fn invoke(self: Arc<Self>, host: Arc<dyn Host>) -> AsyncSequence {
        self.invoke_with(host, SequenceConfig::default())
    }

    pub fn invoke_with(
        self: Arc<Self>,
        host: Arc<dyn Host>,
        config: SequenceConfig,
    ) -> AsyncSequence {
        AsyncSequence::new(self, host, config)
    }
}
