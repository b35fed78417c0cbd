use crate::host::{DynAwaiter, Host, Request};
use crate::ir::{BinaryOp, Expr, Operation, Value};
use crate::lowering::{Instr, LoweredMethod, Storage};
use crate::{Completable, Fault, Incomplete};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Where a state machine instance currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MachineState {
    #[default]
    NotStarted,
    /// Suspended at the await with the given state number.
    Awaiting(u32),
    /// Produced a value at the given yield point; resumes after it.
    Produced(u32),
    /// Ended normally or by a fault. Absorbing.
    Finished,
}

impl MachineState {
    /// The integer encoding of the state: `-1` not started, `n >= 0` suspended at await `n`,
    /// `-2` finished and `-3 - k` after yield point `k`.
    pub fn raw(&self) -> i64 {
        match self {
            MachineState::NotStarted => -1,
            MachineState::Awaiting(state) => i64::from(*state),
            MachineState::Produced(point) => -3 - i64::from(*point),
            MachineState::Finished => -2,
        }
    }

    pub fn is_finished(&self) -> bool {
        *self == MachineState::Finished
    }
}

/// The mutable part of a state machine instance: everything that survives a suspension.
#[derive(Clone)]
pub struct Frame {
    state: MachineState,
    hoisted: Vec<Value>,
    awaiter: Option<DynAwaiter>,
    epoch: u64,
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("state", &self.state)
            .field("hoisted", &self.hoisted)
            .field("awaiting", &self.awaiter.is_some())
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl Frame {
    /// A fresh frame for `method`, with every hoisted slot set to [`Value::Unit`].
    pub fn new(method: &LoweredMethod) -> Frame {
        Frame {
            state: MachineState::NotStarted,
            hoisted: vec![Value::Unit; method.hoisted_count()],
            awaiter: None,
            epoch: 0,
        }
    }

    pub fn machine_state(&self) -> MachineState {
        self.state
    }

    /// The hoisted locals, in slot order.
    pub fn hoisted(&self) -> &[Value] {
        &self.hoisted
    }

    /// Counts suspensions; a continuation captured at one suspension is only honored
    /// while the epoch is unchanged.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The awaiter of the pending `await`.
    pub fn awaiter(&self) -> Option<&DynAwaiter> {
        self.awaiter.as_ref()
    }

    fn finish(&mut self) {
        self.state = MachineState::Finished;
        self.awaiter = None;
        self.hoisted.clear();
    }
}

/// Executes the code of a [`LoweredMethod`] between suspension points.
///
/// Each [`Driver::step`] runs until the method produces a value (`Ok(Some(_))`), ends
/// (`Ok(None)`), faults (`Err(Incomplete::Faulted)`) or reaches an `await` which is not
/// finished yet (`Err(Incomplete::Suspended)`). A finished driver never runs user code
/// again and reports `Err(Incomplete::Exhausted)`.
#[derive(Debug, Clone)]
pub struct Driver {
    method: Arc<LoweredMethod>,
    frame: Frame,
}

enum Flow {
    Next,
    Goto(usize),
    Suspend,
    Produce(Value),
    Finish,
}

impl Driver {
    pub fn new(method: Arc<LoweredMethod>) -> Driver {
        let frame = Frame::new(&method);
        Driver { method, frame }
    }

    pub fn machine_state(&self) -> MachineState {
        self.frame.state
    }

    pub fn is_finished(&self) -> bool {
        self.frame.state.is_finished()
    }

    pub fn epoch(&self) -> u64 {
        self.frame.epoch
    }

    pub fn awaiter(&self) -> Option<&DynAwaiter> {
        self.frame.awaiter()
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// True if [`Driver::step`] would make progress: the method has not started, sits
    /// after a yield, or waits for an await which has finished in the meantime.
    pub fn is_resumable(&self) -> bool {
        match self.frame.state {
            MachineState::NotStarted | MachineState::Produced(_) => true,
            MachineState::Awaiting(_) => self
                .frame
                .awaiter
                .as_ref()
                .is_some_and(|awaiter| awaiter.is_ready()),
            MachineState::Finished => false,
        }
    }

    /// Force the terminal state, abandoning a pending await.
    pub fn dispose(&mut self) {
        if !self.frame.state.is_finished() {
            tracing::debug!(
                method = self.method.name(),
                state = self.frame.state.raw(),
                "driver disposed"
            );
        }
        self.frame.finish();
        self.frame.epoch += 1;
    }

    /// Run until the next suspension point.
    pub fn step(&mut self, host: &dyn Host) -> Completable<Option<Value>> {
        let method = self.method.clone();
        let (mut pc, mut resumed) = match self.frame.state {
            MachineState::Finished => return Err(Incomplete::Exhausted),
            MachineState::NotStarted => (0, None),
            MachineState::Produced(point) => match method.states().resume_pc(point) {
                Some(pc) => (pc, None),
                None => unreachable!("yield point {} out of range", point),
            },
            MachineState::Awaiting(state) => {
                let Some(awaiter) = self.frame.awaiter.as_ref() else {
                    unreachable!("await state {} without an awaiter", state)
                };
                if !awaiter.is_ready() {
                    return Err(Incomplete::Suspended);
                }
                let outcome = awaiter.outcome();
                self.frame.awaiter = None;
                match method.states().await_pc(state) {
                    Some(pc) => (pc, Some(outcome)),
                    None => unreachable!("await state {} out of range", state),
                }
            }
        };
        tracing::trace!(
            method = method.name(),
            state = self.frame.state.raw(),
            pc,
            "driver resumed"
        );

        let mut transient = vec![Value::Unit; method.transient_count()];
        let mut caught: Option<Fault> = None;
        loop {
            let instr = &method.code()[pc];
            match self.execute(instr, host, &mut transient, &mut resumed, &mut caught) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Goto(target)) => pc = target,
                Ok(Flow::Suspend) => {
                    tracing::trace!(
                        method = method.name(),
                        state = self.frame.state.raw(),
                        "driver suspended on await"
                    );
                    return Err(Incomplete::Suspended);
                }
                Ok(Flow::Produce(value)) => {
                    tracing::trace!(method = method.name(), %value, "driver produced value");
                    return Ok(Some(value));
                }
                Ok(Flow::Finish) => {
                    tracing::debug!(method = method.name(), "driver finished");
                    self.frame.finish();
                    return Ok(None);
                }
                Err(fault) => match method.handler_for(pc) {
                    Some(handler) => {
                        tracing::trace!(%fault, pc, target = handler.target, "fault caught");
                        pc = handler.target;
                        caught = Some(fault);
                    }
                    None => {
                        tracing::debug!(method = method.name(), %fault, "driver faulted");
                        self.frame.finish();
                        return Err(Incomplete::Faulted(fault));
                    }
                },
            }
        }
    }

    fn execute(
        &mut self,
        instr: &Instr,
        host: &dyn Host,
        transient: &mut [Value],
        resumed: &mut Option<Result<Value, Fault>>,
        caught: &mut Option<Fault>,
    ) -> Result<Flow, Fault> {
        match instr {
            Instr::Assign { target, value } => {
                let value = self.eval(value, transient)?;
                self.store(*target, value, transient);
                Ok(Flow::Next)
            }
            Instr::Write(value) => {
                let value = self.eval(value, transient)?;
                host.write(&value.to_string());
                Ok(Flow::Next)
            }
            Instr::Await {
                state,
                bind,
                operation,
            } => {
                let outcome = match resumed.take() {
                    Some(outcome) => outcome,
                    None => {
                        let awaiter = host.begin(self.request(operation, transient)?);
                        if !awaiter.is_ready() {
                            self.frame.state = MachineState::Awaiting(*state);
                            self.frame.awaiter = Some(awaiter);
                            self.frame.epoch += 1;
                            return Ok(Flow::Suspend);
                        }
                        awaiter.outcome()
                    }
                };
                let value = outcome?;
                if let Some(bind) = bind {
                    self.store(*bind, value, transient);
                }
                Ok(Flow::Next)
            }
            Instr::Yield { point, value } => {
                let value = self.eval(value, transient)?;
                self.frame.state = MachineState::Produced(*point);
                Ok(Flow::Produce(value))
            }
            Instr::Jump(target) => Ok(Flow::Goto(*target)),
            Instr::Branch {
                condition,
                otherwise,
            } => {
                if as_bool(self.eval(condition, transient)?)? {
                    Ok(Flow::Next)
                } else {
                    Ok(Flow::Goto(*otherwise))
                }
            }
            Instr::Throw(value) => {
                let message = self.eval(value, transient)?;
                Err(Fault::thrown(message.to_string()))
            }
            Instr::Catch { bind } => {
                let message = caught
                    .take()
                    .map(|fault| fault.message())
                    .unwrap_or_default();
                if let Some(bind) = bind {
                    self.store(*bind, Value::Str(message), transient);
                }
                Ok(Flow::Next)
            }
            Instr::Return => Ok(Flow::Finish),
        }
    }

    fn request(
        &self,
        operation: &Operation<Storage>,
        transient: &[Value],
    ) -> Result<Request, Fault> {
        Ok(match operation {
            Operation::Completed(value) => Request::Completed(self.eval(value, transient)?),
            Operation::Delay(millis) => match self.eval(millis, transient)? {
                Value::Int(millis) if millis >= 0 => {
                    Request::Delay(Duration::from_millis(millis.unsigned_abs()))
                }
                other => return Err(Fault::thrown(format!("invalid delay `{}`", other))),
            },
            Operation::Fail(message) => Request::Fail(self.eval(message, transient)?.to_string()),
            Operation::External(name) => Request::External(name.clone()),
        })
    }

    fn load(&self, storage: Storage, transient: &[Value]) -> Value {
        match storage {
            Storage::Hoisted(slot) => self.frame.hoisted[slot].clone(),
            Storage::Transient(slot) => transient[slot].clone(),
        }
    }

    fn store(&mut self, storage: Storage, value: Value, transient: &mut [Value]) {
        match storage {
            Storage::Hoisted(slot) => self.frame.hoisted[slot] = value,
            Storage::Transient(slot) => transient[slot] = value,
        }
    }

    fn eval(&self, expr: &Expr<Storage>, transient: &[Value]) -> Result<Value, Fault> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Local(storage) => Ok(self.load(*storage, transient)),
            Expr::Not(inner) => Ok(Value::Bool(!as_bool(self.eval(inner, transient)?)?)),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs, transient)?;
                let rhs = self.eval(rhs, transient)?;
                binary(*op, lhs, rhs)
            }
        }
    }
}

fn as_bool(value: Value) -> Result<bool, Fault> {
    match value {
        Value::Bool(value) => Ok(value),
        other => Err(Fault::thrown(format!("expected a boolean, found `{}`", other))),
    }
}

fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, Fault> {
    let overflow = || Fault::thrown("arithmetic overflow");
    match (op, lhs, rhs) {
        (BinaryOp::Eq, lhs, rhs) => Ok(Value::Bool(lhs == rhs)),
        (BinaryOp::Ne, lhs, rhs) => Ok(Value::Bool(lhs != rhs)),
        (BinaryOp::Add, Value::Int(a), Value::Int(b)) => {
            a.checked_add(b).map(Value::Int).ok_or_else(overflow)
        }
        (BinaryOp::Add, lhs @ Value::Str(_), rhs) | (BinaryOp::Add, lhs, rhs @ Value::Str(_)) => {
            Ok(Value::Str(format!("{}{}", lhs, rhs)))
        }
        (BinaryOp::Sub, Value::Int(a), Value::Int(b)) => {
            a.checked_sub(b).map(Value::Int).ok_or_else(overflow)
        }
        (BinaryOp::Mul, Value::Int(a), Value::Int(b)) => {
            a.checked_mul(b).map(Value::Int).ok_or_else(overflow)
        }
        (BinaryOp::Div, Value::Int(_), Value::Int(0)) => Err(Fault::thrown("division by zero")),
        (BinaryOp::Div, Value::Int(a), Value::Int(b)) => {
            a.checked_div(b).map(Value::Int).ok_or_else(overflow)
        }
        (BinaryOp::Lt, Value::Int(a), Value::Int(b)) => Ok(Value::Bool(a < b)),
        (BinaryOp::Gt, Value::Int(a), Value::Int(b)) => Ok(Value::Bool(a > b)),
        (BinaryOp::Lt, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a < b)),
        (BinaryOp::Gt, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a > b)),
        (BinaryOp::And, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a && b)),
        (BinaryOp::Or, Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a || b)),
        (op, lhs, rhs) => Err(Fault::thrown(format!(
            "cannot apply {:?} to `{}` and `{}`",
            op, lhs, rhs
        ))),
    }
}
