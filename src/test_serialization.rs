use crate::{
    BinaryOp, DrainPolicy, Expr, Fault, MachineState, MethodBody, Operation, Stmt, Value, lower,
};
use cancel_this::Cancelled;

fn sample_method() -> MethodBody {
    MethodBody::new("Sample")
        .push(Stmt::assign("i", 0))
        .push(Stmt::while_loop(
            Expr::binary(BinaryOp::Lt, Expr::local("i"), 2.into()),
            vec![
                Stmt::await_into("x", Operation::external("io")),
                Stmt::yield_return(Expr::add(Expr::local("x"), Expr::local("i"))),
                Stmt::assign("i", Expr::add(Expr::local("i"), 1.into())),
            ],
        ))
        .push(Stmt::try_catch(
            vec![Stmt::await_op(Operation::delay(5))],
            "e",
            vec![Stmt::write(Expr::local("e"))],
        ))
}

#[test]
fn test_method_body_serialization() {
    let method = sample_method();

    let serialized = serde_json::to_string(&method).unwrap();
    let deserialized: MethodBody = serde_json::from_str(&serialized).unwrap();

    assert_eq!(method, deserialized);
}

#[test]
fn test_lowered_method_serialization() {
    let lowered = lower(&sample_method()).unwrap();

    let serialized = serde_json::to_string(&lowered).unwrap();
    let deserialized: crate::LoweredMethod = serde_json::from_str(&serialized).unwrap();

    assert_eq!(lowered, deserialized);
    assert_eq!(deserialized.hoisted_locals(), lowered.hoisted_locals());
    assert_eq!(deserialized.states().await_count(), 2);
}

#[test]
fn test_value_serialization() {
    for value in [
        Value::Unit,
        Value::Bool(true),
        Value::Int(-7),
        Value::from("text"),
    ] {
        let serialized = serde_json::to_string(&value).unwrap();
        let deserialized: Value = serde_json::from_str(&serialized).unwrap();
        assert_eq!(value, deserialized);
    }
}

#[test]
fn test_fault_serialization() {
    let fault = Fault::thrown("boom");
    let serialized = serde_json::to_string(&fault).unwrap();
    let deserialized: Fault = serde_json::from_str(&serialized).unwrap();
    assert_eq!(fault, deserialized);

    // Cancellation is a runtime condition and never leaves the process.
    let cancelled = Fault::Cancelled(Cancelled::default());
    assert!(serde_json::to_string(&cancelled).is_err());
}

#[test]
fn test_config_enums_serialization() {
    let policy = DrainPolicy::Block;
    let serialized = serde_json::to_string(&policy).unwrap();
    assert_eq!(serialized, "\"Block\"");
    let deserialized: DrainPolicy = serde_json::from_str(&serialized).unwrap();
    assert_eq!(policy, deserialized);

    let state = MachineState::Produced(1);
    let serialized = serde_json::to_string(&state).unwrap();
    let deserialized: MachineState = serde_json::from_str(&serialized).unwrap();
    assert_eq!(state, deserialized);
    assert_eq!(deserialized.raw(), -4);
}
