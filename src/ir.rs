use std::fmt::{Display, Formatter};

/// A runtime value of the method body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Value {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(value) => write!(f, "{}", value),
            Value::Int(value) => write!(f, "{}", value),
            Value::Str(value) => write!(f, "{}", value),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BinaryOp {
    /// Integer addition, or concatenation when either side is a string.
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Gt,
    And,
    Or,
}

/// An expression of the method body.
///
/// Expressions are generic over the way a local is referenced, so the same type describes
/// both the source tree (`String` names) and lowered code ([`crate::Storage`] slots).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Expr<L = String> {
    Literal(Value),
    Local(L),
    Not(Box<Expr<L>>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr<L>>,
        rhs: Box<Expr<L>>,
    },
}

impl<L> Expr<L> {
    pub fn literal<V: Into<Value>>(value: V) -> Expr<L> {
        Expr::Literal(value.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr<L>, rhs: Expr<L>) -> Expr<L> {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(lhs: Expr<L>, rhs: Expr<L>) -> Expr<L> {
        Expr::binary(BinaryOp::Add, lhs, rhs)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Expr<L>) -> Expr<L> {
        Expr::Not(Box::new(inner))
    }

    /// Rewrite every local reference.
    pub fn try_map_locals<M, E, F>(&self, f: &mut F) -> Result<Expr<M>, E>
    where
        F: FnMut(&L) -> Result<M, E>,
    {
        Ok(match self {
            Expr::Literal(value) => Expr::Literal(value.clone()),
            Expr::Local(local) => Expr::Local(f(local)?),
            Expr::Not(inner) => Expr::Not(Box::new(inner.try_map_locals(f)?)),
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op: *op,
                lhs: Box::new(lhs.try_map_locals(f)?),
                rhs: Box::new(rhs.try_map_locals(f)?),
            },
        })
    }

    pub fn map_locals<M, F: FnMut(&L) -> M>(&self, f: &mut F) -> Expr<M> {
        match self {
            Expr::Literal(value) => Expr::Literal(value.clone()),
            Expr::Local(local) => Expr::Local(f(local)),
            Expr::Not(inner) => Expr::Not(Box::new(inner.map_locals(f))),
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op: *op,
                lhs: Box::new(lhs.map_locals(f)),
                rhs: Box::new(rhs.map_locals(f)),
            },
        }
    }

    /// Visit every local read by this expression.
    pub fn for_each_local<F: FnMut(&L)>(&self, f: &mut F) {
        match self {
            Expr::Literal(_) => {}
            Expr::Local(local) => f(local),
            Expr::Not(inner) => inner.for_each_local(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.for_each_local(f);
                rhs.for_each_local(f);
            }
        }
    }
}

impl Expr<String> {
    pub fn local<S: Into<String>>(name: S) -> Expr {
        Expr::Local(name.into())
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::Literal(value.into())
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Literal(value.into())
    }
}

impl From<bool> for Expr {
    fn from(value: bool) -> Self {
        Expr::Literal(value.into())
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::Literal(value.into())
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Literal(value)
    }
}

/// An asynchronous operation started by an `await`.
///
/// The [`crate::Host`] decides how an operation is actually carried out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operation<L = String> {
    /// An operation which is already finished with the given value.
    Completed(Expr<L>),
    /// Finishes with `()` after the given number of milliseconds.
    Delay(Expr<L>),
    /// An operation which is already finished with a fault carrying the given message.
    Fail(Expr<L>),
    /// A named operation supplied by the host.
    External(String),
}

impl<L> Operation<L> {
    pub fn completed<E: Into<Expr<L>>>(value: E) -> Operation<L> {
        Operation::Completed(value.into())
    }

    pub fn delay(millis: i64) -> Operation<L> {
        Operation::Delay(Expr::literal(millis))
    }

    pub fn fail<S: Into<String>>(message: S) -> Operation<L> {
        Operation::Fail(Expr::literal(message.into()))
    }

    pub fn external<S: Into<String>>(name: S) -> Operation<L> {
        Operation::External(name.into())
    }

    pub fn try_map_locals<M, E, F>(&self, f: &mut F) -> Result<Operation<M>, E>
    where
        F: FnMut(&L) -> Result<M, E>,
    {
        Ok(match self {
            Operation::Completed(value) => Operation::Completed(value.try_map_locals(f)?),
            Operation::Delay(millis) => Operation::Delay(millis.try_map_locals(f)?),
            Operation::Fail(message) => Operation::Fail(message.try_map_locals(f)?),
            Operation::External(name) => Operation::External(name.clone()),
        })
    }

    pub fn map_locals<M, F: FnMut(&L) -> M>(&self, f: &mut F) -> Operation<M> {
        match self {
            Operation::Completed(value) => Operation::Completed(value.map_locals(f)),
            Operation::Delay(millis) => Operation::Delay(millis.map_locals(f)),
            Operation::Fail(message) => Operation::Fail(message.map_locals(f)),
            Operation::External(name) => Operation::External(name.clone()),
        }
    }

    pub fn for_each_local<F: FnMut(&L)>(&self, f: &mut F) {
        match self {
            Operation::Completed(expr) | Operation::Delay(expr) | Operation::Fail(expr) => {
                expr.for_each_local(f)
            }
            Operation::External(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Stmt {
    Assign {
        local: String,
        value: Expr,
    },
    /// Append the value to the host output.
    Write(Expr),
    Await {
        bind: Option<String>,
        operation: Operation,
    },
    YieldReturn(Expr),
    YieldBreak,
    /// Raise a [`crate::Fault`] whose message is the value of the expression.
    Throw(Expr),
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    /// Run `body`; a fault raised inside it binds its message to `binding` and runs `handler`.
    TryCatch {
        body: Vec<Stmt>,
        binding: Option<String>,
        handler: Vec<Stmt>,
    },
}

impl Stmt {
    pub fn assign<S: Into<String>, E: Into<Expr>>(local: S, value: E) -> Stmt {
        Stmt::Assign {
            local: local.into(),
            value: value.into(),
        }
    }

    pub fn write<E: Into<Expr>>(value: E) -> Stmt {
        Stmt::Write(value.into())
    }

    pub fn await_op(operation: Operation) -> Stmt {
        Stmt::Await {
            bind: None,
            operation,
        }
    }

    pub fn await_into<S: Into<String>>(local: S, operation: Operation) -> Stmt {
        Stmt::Await {
            bind: Some(local.into()),
            operation,
        }
    }

    pub fn yield_return<E: Into<Expr>>(value: E) -> Stmt {
        Stmt::YieldReturn(value.into())
    }

    pub fn throw<E: Into<Expr>>(value: E) -> Stmt {
        Stmt::Throw(value.into())
    }

    pub fn if_else(condition: Expr, then_branch: Vec<Stmt>, else_branch: Vec<Stmt>) -> Stmt {
        Stmt::If {
            condition,
            then_branch,
            else_branch,
        }
    }

    pub fn while_loop(condition: Expr, body: Vec<Stmt>) -> Stmt {
        Stmt::While { condition, body }
    }

    pub fn try_catch<S: Into<String>>(body: Vec<Stmt>, binding: S, handler: Vec<Stmt>) -> Stmt {
        Stmt::TryCatch {
            body,
            binding: Some(binding.into()),
            handler,
        }
    }
}

/// The body of an async iterator method, as handed over by the front end.
///
/// Binding and type checking have already happened: locals are referred to by name, and the
/// only suspension points are [`Stmt::Await`], [`Stmt::YieldReturn`] and [`Stmt::YieldBreak`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MethodBody {
    pub name: String,
    pub body: Vec<Stmt>,
}

impl MethodBody {
    pub fn new<S: Into<String>>(name: S) -> MethodBody {
        MethodBody {
            name: name.into(),
            body: Vec::new(),
        }
    }

    /// Append a statement (builder style).
    pub fn push(mut self, stmt: Stmt) -> MethodBody {
        self.body.push(stmt);
        self
    }

    pub fn with_body(mut self, body: Vec<Stmt>) -> MethodBody {
        self.body = body;
        self
    }
}
