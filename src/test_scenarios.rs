use crate::test_utils::{block_on, init_test_logging};
use crate::{
    AsyncEnumerator, AsyncSequence, BinaryOp, Expr, Fault, Host, Incomplete, MachineState,
    MethodBody, Operation, SourceStatus, StandardHost, Stmt, Value, for_each, lower,
};
use proptest::prelude::*;
use std::sync::Arc;

fn start(host: &Arc<StandardHost>, method: MethodBody) -> AsyncSequence {
    init_test_logging();
    Arc::new(lower(&method).unwrap()).invoke(host.clone())
}

#[test]
fn test_scenario_foreach_output() {
    let host = Arc::new(StandardHost::new());
    let method = MethodBody::new("Numbers")
        .push(Stmt::write("1 "))
        .push(Stmt::await_op(Operation::completed(Value::Unit)))
        .push(Stmt::write("2 "))
        .push(Stmt::yield_return(3))
        .push(Stmt::write("4 "));

    host.write("0 ");
    let sequence = start(&host, method);
    block_on(for_each(&sequence, |value| {
        host.write(&format!("{} ", value))
    }))
    .unwrap();
    host.write("5");
    assert_eq!(host.output(), "0 1 2 3 4 5");
}

#[test]
fn test_scenario_extra_waits_are_no_ops() {
    let host = Arc::new(StandardHost::new());
    let method = MethodBody::new("Delayed")
        .push(Stmt::yield_return(42))
        .push(Stmt::await_op(Operation::delay(100)))
        .push(Stmt::yield_return(43));
    let sequence = start(&host, method);

    let waits = [
        sequence.wait_for_next(),
        sequence.wait_for_next(),
        sequence.wait_for_next(),
    ];
    assert!(waits.iter().all(|wait| wait.token() == waits[0].token()));
    for wait in waits {
        assert_eq!(block_on(wait), Ok(true));
    }
    assert_eq!(sequence.try_get_next(), Ok(Value::Int(42)));
    assert_eq!(sequence.try_get_next(), Err(Incomplete::Suspended));

    let waits = [
        sequence.wait_for_next(),
        sequence.wait_for_next(),
        sequence.wait_for_next(),
    ];
    assert!(waits.iter().all(|wait| wait.token() == waits[0].token()));
    for wait in waits {
        assert_eq!(block_on(wait), Ok(true));
    }
    assert_eq!(sequence.try_get_next(), Ok(Value::Int(43)));
    assert_eq!(block_on(sequence.wait_for_next()), Ok(false));
}

#[test]
fn test_terminal_absorption() {
    let host = Arc::new(StandardHost::new());
    let method = MethodBody::new("Short")
        .push(Stmt::write("body "))
        .push(Stmt::yield_return(1));
    let sequence = start(&host, method);
    assert_eq!(sequence.try_get_next(), Ok(Value::Int(1)));
    assert_eq!(block_on(sequence.wait_for_next()), Ok(false));
    assert_eq!(sequence.machine_state().raw(), -2);
    for _ in 0..3 {
        assert_eq!(sequence.try_get_next(), Err(Incomplete::Exhausted));
        assert_eq!(block_on(sequence.wait_for_next()), Ok(false));
    }
    assert_eq!(host.output(), "body ");
}

#[test]
#[should_panic(expected = "stale token")]
fn test_awaitable_of_previous_element_is_stale() {
    let host = Arc::new(StandardHost::new());
    let method = MethodBody::new("Two")
        .push(Stmt::yield_return(1))
        .push(Stmt::yield_return(2));
    let sequence = start(&host, method);
    let first = sequence.wait_for_next();
    assert_eq!(first.status(), SourceStatus::Succeeded);
    assert_eq!(sequence.try_get_next(), Ok(Value::Int(1)));
    let second = sequence.wait_for_next();
    assert_eq!(second.status(), SourceStatus::Succeeded);
    // The source was reset for the second element.
    let _ = first.status();
}

#[test]
fn test_hoisted_values_survive_suspension() {
    let host = Arc::new(StandardHost::new());
    let method = MethodBody::new("Hoisting")
        .push(Stmt::assign("kept", 10))
        .push(Stmt::assign("scratch", 1))
        .push(Stmt::write(Expr::local("scratch")))
        .push(Stmt::await_into("slow", Operation::delay(2)))
        .push(Stmt::yield_return(Expr::local("kept")))
        .push(Stmt::assign("kept", Expr::add(Expr::local("kept"), 5.into())))
        .push(Stmt::yield_return(Expr::local("kept")));
    let lowered = lower(&method).unwrap();
    assert_eq!(lowered.hoisted_locals(), vec!["kept"]);

    let sequence = start(&host, method);
    let mut values = Vec::new();
    block_on(for_each(&sequence, |value| values.push(value))).unwrap();
    assert_eq!(values, vec![Value::Int(10), Value::Int(15)]);
    assert_eq!(host.output(), "1");
}

#[test]
fn test_catch_handler_across_suspension() {
    let host = Arc::new(StandardHost::new());
    let gate = host.gate("io");
    let method = MethodBody::new("Catching")
        .push(Stmt::assign("attempts", 0))
        .push(Stmt::try_catch(
            vec![
                Stmt::assign("attempts", Expr::add(Expr::local("attempts"), 1.into())),
                Stmt::await_op(Operation::external("io")),
            ],
            "error",
            vec![Stmt::write(Expr::add(
                Expr::local("error"),
                Expr::add(" after ".into(), Expr::local("attempts")),
            ))],
        ))
        .push(Stmt::yield_return(Expr::local("attempts")));
    let sequence = start(&host, method);

    let waiting = sequence.wait_for_next();
    assert!(!waiting.is_completed());
    gate.set_exception(Fault::thrown("timeout"));
    assert_eq!(block_on(waiting), Ok(true));
    assert_eq!(sequence.try_get_next(), Ok(Value::Int(1)));
    assert_eq!(host.output(), "timeout after 1");
}

#[test]
fn test_handler_reads_await_target_after_fault() {
    let host = Arc::new(StandardHost::new());
    let gate = host.gate("io");
    let method = MethodBody::new("Fallback")
        .push(Stmt::assign("x", 1))
        .push(Stmt::try_catch(
            vec![Stmt::await_into("x", Operation::external("io"))],
            "error",
            vec![Stmt::write(Expr::local("x"))],
        ))
        .push(Stmt::yield_return(Expr::local("x")));
    let lowered = lower(&method).unwrap();
    assert_eq!(lowered.hoisted_locals(), vec!["x"]);

    let sequence = start(&host, method);
    let waiting = sequence.wait_for_next();
    assert!(!waiting.is_completed());
    gate.set_exception(Fault::thrown("offline"));
    assert_eq!(block_on(waiting), Ok(true));
    // The fault left the previous value in place.
    assert_eq!(sequence.try_get_next(), Ok(Value::Int(1)));
    assert_eq!(host.output(), "1");
}

#[test]
fn test_loop_with_awaits_and_yields() {
    let host = Arc::new(StandardHost::new());
    let method = MethodBody::new("Countdown")
        .push(Stmt::assign("n", 3))
        .push(Stmt::while_loop(
            Expr::binary(BinaryOp::Gt, Expr::local("n"), 0.into()),
            vec![
                Stmt::await_op(Operation::delay(1)),
                Stmt::yield_return(Expr::local("n")),
                Stmt::assign("n", Expr::binary(BinaryOp::Sub, Expr::local("n"), 1.into())),
            ],
        ))
        .push(Stmt::write("done"));
    let sequence = start(&host, method);
    let mut values = Vec::new();
    block_on(for_each(&sequence, |value| values.push(value))).unwrap();
    assert_eq!(values, vec![Value::Int(3), Value::Int(2), Value::Int(1)]);
    assert_eq!(host.output(), "done");
}

#[test]
fn test_fault_after_values() {
    let host = Arc::new(StandardHost::new());
    let method = MethodBody::new("Faulting")
        .push(Stmt::yield_return(1))
        .push(Stmt::await_op(Operation::delay(1)))
        .push(Stmt::throw("gave up"))
        .push(Stmt::yield_return(2));
    let sequence = start(&host, method);
    let mut values = Vec::new();
    let result = block_on(for_each(&sequence, |value| values.push(value)));
    assert_eq!(result, Err(Fault::thrown("gave up")));
    assert_eq!(values, vec![Value::Int(1)]);
    assert_eq!(sequence.machine_state(), MachineState::Finished);
    // The fault surfaced once; afterwards the sequence has simply ended.
    assert_eq!(block_on(sequence.wait_for_next()), Ok(false));
    assert_eq!(sequence.try_get_next(), Err(Incomplete::Exhausted));
    assert_eq!(block_on(sequence.wait_for_next()), Ok(false));
}

/// One statement of a generated method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Write(i64),
    Yield(i64),
    AwaitSlow,
    AwaitFast,
    YieldBreak,
}

fn body(ops: &[Op]) -> MethodBody {
    let body = ops
        .iter()
        .map(|op| match op {
            Op::Write(i) => Stmt::write(format!("w{} ", i).as_str()),
            Op::Yield(i) => Stmt::yield_return(*i),
            Op::AwaitSlow => Stmt::await_op(Operation::delay(1)),
            Op::AwaitFast => Stmt::await_op(Operation::completed(Value::Unit)),
            Op::YieldBreak => Stmt::YieldBreak,
        })
        .collect();
    MethodBody::new("Generated").with_body(body)
}

/// The trace of writes and consumed values in source order, up to the first `yield break`.
fn expected_trace(ops: &[Op]) -> String {
    let mut trace = String::new();
    for op in ops {
        match op {
            Op::Write(i) => trace.push_str(&format!("w{} ", i)),
            Op::Yield(i) => trace.push_str(&format!("y{} ", i)),
            Op::AwaitSlow | Op::AwaitFast => {}
            Op::YieldBreak => break,
        }
    }
    trace
}

/// Consume through the foreach loop: wait first, then drain.
fn waiting_trace(ops: &[Op]) -> String {
    let host = Arc::new(StandardHost::new());
    let sequence = start(&host, body(ops));
    block_on(for_each(&sequence, |value| {
        host.write(&format!("y{} ", value))
    }))
    .unwrap();
    host.output()
}

/// Consume by draining first and only waiting when the sequence is suspended.
fn draining_trace(ops: &[Op]) -> String {
    let host = Arc::new(StandardHost::new());
    let sequence = start(&host, body(ops));
    loop {
        match sequence.try_get_next() {
            Ok(value) => host.write(&format!("y{} ", value)),
            Err(Incomplete::Suspended) => {
                if !block_on(sequence.wait_for_next()).unwrap() {
                    break;
                }
            }
            Err(Incomplete::Exhausted) => break,
            Err(other) => panic!("unexpected drain result: {:?}", other),
        }
    }
    host.output()
}

fn permutations(items: &[Op]) -> Vec<Vec<Op>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut result = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(index);
        for mut tail in permutations(&rest) {
            tail.insert(0, *item);
            result.push(tail);
        }
    }
    result
}

#[test]
fn test_ordering_over_statement_permutations() {
    let ops = [
        Op::Write(1),
        Op::Yield(2),
        Op::AwaitSlow,
        Op::AwaitFast,
        Op::YieldBreak,
    ];
    let all = permutations(&ops);
    assert_eq!(all.len(), 120);
    for ops in all {
        let expected = expected_trace(&ops);
        assert_eq!(waiting_trace(&ops), expected, "waiting consumer, body {:?}", ops);
        assert_eq!(draining_trace(&ops), expected, "draining consumer, body {:?}", ops);
    }
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0_i64..100).prop_map(Op::Write),
        (0_i64..100).prop_map(Op::Yield),
        Just(Op::AwaitSlow),
        Just(Op::AwaitFast),
        Just(Op::YieldBreak),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_values_and_writes_keep_source_order(
        mut ops in proptest::collection::vec(arb_op(), 0..10)
    ) {
        // Every body must be an iterator.
        ops.push(Op::YieldBreak);
        let expected = expected_trace(&ops);
        prop_assert_eq!(waiting_trace(&ops), expected.clone());
        prop_assert_eq!(draining_trace(&ops), expected);
    }
}
