use crate::{Continuation, Scheduler};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with the `TRACE` level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Drive a future to completion on the current thread.
pub fn block_on<F: Future>(future: F) -> F::Output {
    futures_lite::future::block_on(future)
}

/// A [`Scheduler`] which queues continuations until the test runs them.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<Vec<Continuation>>,
}

impl ManualScheduler {
    /// Run every queued continuation (including ones queued meanwhile) and return
    /// how many ran.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let batch = std::mem::take(&mut *self.queue.lock());
            if batch.is_empty() {
                return count;
            }
            for continuation in batch {
                continuation();
                count += 1;
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, continuation: Continuation) {
        self.queue.lock().push(continuation);
    }
}
