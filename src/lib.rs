// All traits/structs have dedicated modules for encapsulation, and we then re-export
// these types here for easier public usage.

mod awaitable;
mod collector;
mod completable;
mod completion_source;
mod config;
mod driver;
mod enumerator;
mod fault;
mod host;
mod ir;
mod liveness;
mod lowering;
mod sequence;

#[cfg(test)]
mod test_scenarios;
#[cfg(all(test, feature = "serde"))]
mod test_serialization;
#[cfg(test)]
mod test_utils;

pub use awaitable::{Awaiter, ValueAwaitable};
pub use collector::{Collector, for_each};
pub use completable::{Completable, Incomplete};
pub use completion_source::{
    CompletionSource, Continuation, ContinuationContext, Scheduler, SourceStatus,
    ThreadScheduler, Token,
};
pub use config::{DrainPolicy, SequenceConfig};
pub use driver::{Driver, Frame, MachineState};
pub use enumerator::AsyncEnumerator;
pub use fault::{Fault, UsageError};
pub use host::{DynAwaiter, Host, Request, StandardHost};
pub use ir::{BinaryOp, Expr, MethodBody, Operation, Stmt, Value};
pub use lowering::{
    Handler, Instr, LocalId, LocalInfo, LoweredMethod, LoweringError, StateTable, Storage, lower,
};
pub use sequence::AsyncSequence;

/// A type alias for `Box<dyn AsyncEnumerator<T>>`.
pub type DynEnumerator<T> = Box<dyn AsyncEnumerator<T>>;

// Boxed enumerators are not enumerators automatically.

impl<T> AsyncEnumerator<T> for DynEnumerator<T> {
    fn wait_for_next(&self) -> ValueAwaitable<bool> {
        (**self).wait_for_next()
    }

    fn try_get_next(&self) -> Completable<T> {
        (**self).try_get_next()
    }

    fn dispose(&self) -> ValueAwaitable<()> {
        (**self).dispose()
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::test_utils::{block_on, init_test_logging};
    use std::sync::Arc;

    fn numbers() -> MethodBody {
        MethodBody::new("Numbers")
            .push(Stmt::write("0 "))
            .push(Stmt::yield_return(1))
            .push(Stmt::await_op(Operation::delay(2)))
            .push(Stmt::yield_return(2))
    }

    #[test]
    fn test_dyn_enumerator_integration() {
        init_test_logging();
        let host = Arc::new(StandardHost::new());
        let method = Arc::new(lower(&numbers()).unwrap());
        let dyn_enumerator: DynEnumerator<Value> = method.invoke(host.clone()).dyn_enumerator();
        assert_eq!(dyn_enumerator.try_get_next(), Ok(Value::Int(1)));
        assert_eq!(block_on(dyn_enumerator.wait_for_next()), Ok(true));
        assert_eq!(dyn_enumerator.try_get_next(), Ok(Value::Int(2)));
        assert_eq!(block_on(dyn_enumerator.wait_for_next()), Ok(false));
        assert_eq!(block_on(dyn_enumerator.dispose()), Ok(()));
        assert_eq!(host.output(), "0 ");
    }

    #[test]
    fn test_end_to_end_collection() {
        init_test_logging();
        let host = Arc::new(StandardHost::new());
        let method = Arc::new(lower(&numbers()).unwrap());
        let collector: Collector<Value, Vec<Value>> = method.invoke(host).dyn_enumerator().into();
        let result = block_on(collector.collect()).unwrap();
        assert_eq!(result, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_boxed_dyn_enumerator_is_enumerator() {
        let host = Arc::new(StandardHost::new());
        let method = Arc::new(lower(&numbers()).unwrap());
        let boxed: DynEnumerator<Value> = method.invoke(host).dyn_enumerator();
        // A boxed enumerator can be boxed again.
        let twice: DynEnumerator<Value> = boxed.dyn_enumerator();
        let collector: Collector<Value, Vec<Value>> = twice.into();
        assert_eq!(block_on(collector.collect()).unwrap().len(), 2);
    }

    #[test]
    fn test_same_method_many_instances() {
        let method = Arc::new(lower(&numbers()).unwrap());
        let first = method.clone().invoke(Arc::new(StandardHost::new()));
        let second = method.clone().invoke(Arc::new(StandardHost::new()));
        assert_eq!(first.try_get_next(), Ok(Value::Int(1)));
        // Instances do not share state.
        assert_eq!(second.machine_state(), MachineState::NotStarted);
        assert_eq!(second.try_get_next(), Ok(Value::Int(1)));
        assert_eq!(Arc::strong_count(&method), 3);
    }

    #[test]
    fn test_rejected_method_never_runs() {
        let method = MethodBody::new("Broken").push(Stmt::try_catch(
            vec![Stmt::yield_return(1)],
            "e",
            vec![],
        ));
        let error = lower(&method).unwrap_err();
        assert!(matches!(error, LoweringError::YieldInTryWithCatch { .. }));
        assert!(error.to_string().contains("try block"));
    }
}
