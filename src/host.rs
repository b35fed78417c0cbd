use crate::{Awaiter, CompletionSource, Fault, Value, ValueAwaitable};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A type alias for the awaiter of an operation started by a [`Host`].
pub type DynAwaiter = Arc<dyn Awaiter<Output = Value>>;

/// An evaluated [`crate::Operation`], ready to be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Completed(Value),
    Delay(Duration),
    Fail(String),
    External(String),
}

/// The producer-side environment of a running method: everything a method body can
/// observe outside of its own locals.
pub trait Host: Send + Sync {
    /// Receive the output of a `Write` statement.
    fn write(&self, text: &str);

    /// Start an awaited operation.
    ///
    /// The returned awaiter may already be ready, in which case the driver continues
    /// synchronously without suspending.
    fn begin(&self, request: Request) -> DynAwaiter;
}

/// A [`Host`] which collects the written output in memory and runs operations as follows:
///
///  - `Completed` and `Fail` are ready immediately.
///  - `Delay` of zero is ready immediately, otherwise it finishes on a timer thread.
///  - `External(name)` waits for the gate returned by [`StandardHost::gate`]; unknown
///    names fault.
#[derive(Default)]
pub struct StandardHost {
    output: Mutex<String>,
    gates: Mutex<HashMap<String, Arc<CompletionSource<Value>>>>,
}

impl StandardHost {
    pub fn new() -> StandardHost {
        StandardHost::default()
    }

    /// Everything written so far.
    pub fn output(&self) -> String {
        self.output.lock().clone()
    }

    /// Return the written output and clear the buffer.
    pub fn take_output(&self) -> String {
        std::mem::take(&mut *self.output.lock())
    }

    /// The completion source behind `External(name)`, created on first use.
    ///
    /// A gate serves one awaiting method per occurrence; [`CompletionSource::reset`] it
    /// before reuse.
    pub fn gate(&self, name: &str) -> Arc<CompletionSource<Value>> {
        self.gates
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CompletionSource::new()))
            .clone()
    }

    fn delay(&self, duration: Duration) -> DynAwaiter {
        if duration.is_zero() {
            return Arc::new(ValueAwaitable::ready(Ok(Value::Unit)));
        }
        let source = Arc::new(CompletionSource::new());
        let awaitable = ValueAwaitable::from_source(source.clone(), source.version());
        let timer = source.clone();
        let spawned = std::thread::Builder::new()
            .name("async-sequence-delay".to_string())
            .spawn(move || {
                std::thread::sleep(duration);
                timer.set_result(Value::Unit);
            });
        if let Err(error) = spawned {
            tracing::warn!(%error, "failed to start delay timer");
            source.set_exception(Fault::thrown(format!("cannot start delay: {}", error)));
        }
        Arc::new(awaitable)
    }
}

impl Host for StandardHost {
    fn write(&self, text: &str) {
        tracing::trace!(text, "write");
        self.output.lock().push_str(text);
    }

    fn begin(&self, request: Request) -> DynAwaiter {
        tracing::trace!(?request, "operation started");
        match request {
            Request::Completed(value) => Arc::new(ValueAwaitable::ready(Ok(value))),
            Request::Fail(message) => Arc::new(ValueAwaitable::ready(Err(Fault::thrown(message)))),
            Request::Delay(duration) => self.delay(duration),
            Request::External(name) => {
                let gate = self.gates.lock().get(&name).cloned();
                match gate {
                    Some(source) => {
                        let token = source.version();
                        Arc::new(ValueAwaitable::from_source(source, token))
                    }
                    None => Arc::new(ValueAwaitable::ready(Err(Fault::thrown(format!(
                        "unknown operation `{}`",
                        name
                    ))))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_output_buffer() {
        let host = StandardHost::new();
        host.write("1 ");
        host.write("2 ");
        assert_eq!(host.output(), "1 2 ");
        assert_eq!(host.take_output(), "1 2 ");
        assert_eq!(host.output(), "");
    }

    #[test]
    fn test_ready_operations() {
        let host = StandardHost::new();
        let completed = host.begin(Request::Completed(Value::Int(3)));
        assert!(completed.is_ready());
        assert_eq!(completed.outcome(), Ok(Value::Int(3)));

        let failed = host.begin(Request::Fail("io".to_string()));
        assert!(failed.is_ready());
        assert_eq!(failed.outcome(), Err(Fault::thrown("io")));

        let instant = host.begin(Request::Delay(Duration::ZERO));
        assert!(instant.is_ready());
    }

    #[test]
    fn test_unknown_external_faults() {
        let host = StandardHost::new();
        let awaiter = host.begin(Request::External("nowhere".to_string()));
        assert!(awaiter.is_ready());
        assert_eq!(
            awaiter.outcome(),
            Err(Fault::thrown("unknown operation `nowhere`"))
        );
    }

    #[test]
    fn test_gate_resumes_awaiter() {
        let host = StandardHost::new();
        let gate = host.gate("io");
        let awaiter = host.begin(Request::External("io".to_string()));
        assert!(!awaiter.is_ready());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        awaiter.register_continuation(Box::new(move || flag.store(true, Ordering::SeqCst)));
        gate.set_result(Value::from("payload"));
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(awaiter.outcome(), Ok(Value::from("payload")));
    }

    #[test]
    fn test_delay_finishes_on_timer() {
        let host = StandardHost::new();
        let awaiter = host.begin(Request::Delay(Duration::from_millis(5)));
        let (sender, receiver) = std::sync::mpsc::channel();
        awaiter.register_continuation(Box::new(move || {
            let _ = sender.send(());
        }));
        receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(awaiter.is_ready());
        assert_eq!(awaiter.outcome(), Ok(Value::Unit));
    }
}
