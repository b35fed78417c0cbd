use crate::ir::{Expr, MethodBody, Operation, Stmt};
use crate::liveness;
use std::collections::HashMap;
use thiserror::Error;

/// Reasons to reject a method at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum LoweringError {
    #[error("`{method}`: cannot yield a value in the body of a try block with a catch clause")]
    YieldInTryWithCatch { method: String },
    #[error("`{method}`: cannot yield a value in the body of a catch clause")]
    YieldInCatch { method: String },
    #[error("`{method}`: use of undeclared local `{local}`")]
    UnknownLocal { method: String, local: String },
    #[error("`{method}`: an async iterator must contain `yield return` or `yield break`")]
    NotAnIterator { method: String },
}

/// Index of a local in [`LoweredMethod::locals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocalId(pub u32);

/// Where the driver keeps a local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Storage {
    /// A slot of the state machine; survives suspension.
    Hoisted(usize),
    /// A slot of the per-run frame; discarded whenever the driver returns.
    Transient(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Instr<L = Storage> {
    Assign {
        target: L,
        value: Expr<L>,
    },
    Write(Expr<L>),
    /// Suspension on I/O. Resumes at this instruction, which then binds the outcome.
    Await {
        state: u32,
        bind: Option<L>,
        operation: Operation<L>,
    },
    /// Suspension on production. Resumes at the next instruction.
    Yield {
        point: u32,
        value: Expr<L>,
    },
    Jump(usize),
    /// Continue with the next instruction if the condition holds, jump otherwise.
    Branch {
        condition: Expr<L>,
        otherwise: usize,
    },
    Throw(Expr<L>),
    /// Entry of a catch handler; binds the message of the caught fault.
    Catch {
        bind: Option<L>,
    },
    /// `yield break`, or the end of the body.
    Return,
}

impl<L> Instr<L> {
    /// Visit every local read by this instruction.
    pub fn for_each_use<F: FnMut(&L)>(&self, f: &mut F) {
        match self {
            Instr::Assign { value, .. } => value.for_each_local(f),
            Instr::Write(value) | Instr::Yield { value, .. } | Instr::Throw(value) => {
                value.for_each_local(f)
            }
            Instr::Await { operation, .. } => operation.for_each_local(f),
            Instr::Branch { condition, .. } => condition.for_each_local(f),
            Instr::Jump(_) | Instr::Catch { .. } | Instr::Return => {}
        }
    }

    /// The local written by this instruction, if any.
    pub fn def(&self) -> Option<&L> {
        match self {
            Instr::Assign { target, .. } => Some(target),
            Instr::Await { bind, .. } | Instr::Catch { bind } => bind.as_ref(),
            _ => None,
        }
    }

    /// True if executing this instruction can raise a fault.
    pub fn can_fault(&self) -> bool {
        !matches!(self, Instr::Jump(_) | Instr::Catch { .. } | Instr::Return)
    }

    fn map_locals<M, F: FnMut(&L) -> M>(&self, f: &mut F) -> Instr<M> {
        match self {
            Instr::Assign { target, value } => Instr::Assign {
                target: f(target),
                value: value.map_locals(f),
            },
            Instr::Write(value) => Instr::Write(value.map_locals(f)),
            Instr::Await {
                state,
                bind,
                operation,
            } => Instr::Await {
                state: *state,
                bind: bind.as_ref().map(&mut *f),
                operation: operation.map_locals(f),
            },
            Instr::Yield { point, value } => Instr::Yield {
                point: *point,
                value: value.map_locals(f),
            },
            Instr::Jump(target) => Instr::Jump(*target),
            Instr::Branch {
                condition,
                otherwise,
            } => Instr::Branch {
                condition: condition.map_locals(f),
                otherwise: *otherwise,
            },
            Instr::Throw(value) => Instr::Throw(value.map_locals(f)),
            Instr::Catch { bind } => Instr::Catch {
                bind: bind.as_ref().map(&mut *f),
            },
            Instr::Return => Instr::Return,
        }
    }
}

/// A protected range `start..end` whose faults transfer control to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Handler {
    pub start: usize,
    pub end: usize,
    pub target: usize,
}

impl Handler {
    pub fn protects(&self, pc: usize) -> bool {
        self.start <= pc && pc < self.end
    }
}

/// The numbered suspension points of a lowered method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StateTable {
    awaits: Vec<usize>,
    yields: Vec<usize>,
}

impl StateTable {
    /// Number of await states (`0..await_count()`).
    pub fn await_count(&self) -> usize {
        self.awaits.len()
    }

    /// Number of post-yield resumption points.
    pub fn yield_count(&self) -> usize {
        self.yields.len()
    }

    /// The instruction of await state `state`.
    pub fn await_pc(&self, state: u32) -> Option<usize> {
        self.awaits.get(state as usize).copied()
    }

    /// The instruction following yield point `point`.
    pub fn resume_pc(&self, point: u32) -> Option<usize> {
        self.yields.get(point as usize).map(|pc| pc + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocalInfo {
    pub name: String,
    pub storage: Storage,
}

/// The output of [`lower`]: everything the driver needs to run one async iterator method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LoweredMethod {
    name: String,
    code: Vec<Instr>,
    handlers: Vec<Handler>,
    states: StateTable,
    locals: Vec<LocalInfo>,
    hoisted_count: usize,
    transient_count: usize,
}

impl LoweredMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &[Instr] {
        &self.code
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn states(&self) -> &StateTable {
        &self.states
    }

    pub fn locals(&self) -> &[LocalInfo] {
        &self.locals
    }

    pub fn hoisted_count(&self) -> usize {
        self.hoisted_count
    }

    pub fn transient_count(&self) -> usize {
        self.transient_count
    }

    /// Names of the hoisted locals, in slot order.
    pub fn hoisted_locals(&self) -> Vec<&str> {
        let mut hoisted = self
            .locals
            .iter()
            .filter_map(|local| match local.storage {
                Storage::Hoisted(slot) => Some((slot, local.name.as_str())),
                Storage::Transient(_) => None,
            })
            .collect::<Vec<_>>();
        hoisted.sort_unstable();
        hoisted.into_iter().map(|(_, name)| name).collect()
    }

    pub fn local(&self, name: &str) -> Option<&LocalInfo> {
        self.locals.iter().find(|local| local.name == name)
    }

    /// The innermost handler protecting the instruction at `pc`.
    pub fn handler_for(&self, pc: usize) -> Option<&Handler> {
        self.handlers.iter().find(|handler| handler.protects(pc))
    }
}

/// Lower `method` into flat, resumable code, or reject it.
///
/// The structured statement tree is flattened into a list of [`Instr`]s with explicit jumps
/// and a table of exception [`Handler`]s. Every `await` receives a state number and every
/// `yield return` a resumption point ([`StateTable`]). Locals whose value has to survive a
/// suspension point are hoisted into the state machine ([`Storage::Hoisted`]); all other
/// locals only live for a single run of the driver ([`Storage::Transient`]).
pub fn lower(method: &MethodBody) -> Result<LoweredMethod, LoweringError> {
    let mut lowerer = Lowerer::new(&method.name);
    for stmt in &method.body {
        lowerer.declare(stmt);
    }
    if !method.body.iter().any(contains_yield) {
        return Err(LoweringError::NotAnIterator {
            method: method.name.clone(),
        });
    }
    lowerer.lower_block(&method.body)?;
    lowerer.code.push(Instr::Return);

    let hoisted = liveness::crossing_locals(&lowerer.code, &lowerer.handlers);

    let mut hoisted_count = 0;
    let mut transient_count = 0;
    let storage = lowerer
        .locals
        .iter()
        .enumerate()
        .map(|(index, _)| {
            if hoisted.contains(&LocalId(index as u32)) {
                hoisted_count += 1;
                Storage::Hoisted(hoisted_count - 1)
            } else {
                transient_count += 1;
                Storage::Transient(transient_count - 1)
            }
        })
        .collect::<Vec<_>>();

    let code = lowerer
        .code
        .iter()
        .map(|instr| instr.map_locals(&mut |local: &LocalId| storage[local.0 as usize]))
        .collect::<Vec<_>>();

    let locals = lowerer
        .locals
        .into_iter()
        .zip(storage)
        .map(|(name, storage)| LocalInfo { name, storage })
        .collect::<Vec<_>>();

    let states = StateTable {
        awaits: lowerer.awaits,
        yields: lowerer.yields,
    };

    tracing::debug!(
        method = %method.name,
        instructions = code.len(),
        awaits = states.await_count(),
        yields = states.yield_count(),
        hoisted = hoisted_count,
        transient = transient_count,
        "lowered async iterator"
    );

    Ok(LoweredMethod {
        name: method.name.clone(),
        code,
        handlers: lowerer.handlers,
        states,
        locals,
        hoisted_count,
        transient_count,
    })
}

fn contains_yield(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::YieldReturn(_) | Stmt::YieldBreak => true,
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => then_branch.iter().chain(else_branch).any(contains_yield),
        Stmt::While { body, .. } => body.iter().any(contains_yield),
        Stmt::TryCatch { body, handler, .. } => body.iter().chain(handler).any(contains_yield),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    TryWithCatch,
    Catch,
}

struct Lowerer<'a> {
    method: &'a str,
    locals: Vec<String>,
    index: HashMap<String, LocalId>,
    code: Vec<Instr<LocalId>>,
    handlers: Vec<Handler>,
    awaits: Vec<usize>,
    yields: Vec<usize>,
    regions: Vec<Region>,
}

impl<'a> Lowerer<'a> {
    fn new(method: &'a str) -> Self {
        Lowerer {
            method,
            locals: Vec::new(),
            index: HashMap::new(),
            code: Vec::new(),
            handlers: Vec::new(),
            awaits: Vec::new(),
            yields: Vec::new(),
            regions: Vec::new(),
        }
    }

    /// Register every name assigned anywhere in the body.
    fn declare(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { local, .. } => self.declare_local(local),
            Stmt::Await {
                bind: Some(local), ..
            } => self.declare_local(local),
            Stmt::If {
                then_branch,
                else_branch,
                ..
            } => {
                for stmt in then_branch.iter().chain(else_branch) {
                    self.declare(stmt);
                }
            }
            Stmt::While { body, .. } => {
                for stmt in body {
                    self.declare(stmt);
                }
            }
            Stmt::TryCatch {
                body,
                binding,
                handler,
            } => {
                if let Some(binding) = binding {
                    self.declare_local(binding);
                }
                for stmt in body.iter().chain(handler) {
                    self.declare(stmt);
                }
            }
            _ => {}
        }
    }

    fn declare_local(&mut self, name: &str) {
        if !self.index.contains_key(name) {
            let id = LocalId(self.locals.len() as u32);
            self.locals.push(name.to_string());
            self.index.insert(name.to_string(), id);
        }
    }

    fn resolve(&self, name: &String) -> Result<LocalId, LoweringError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| LoweringError::UnknownLocal {
                method: self.method.to_string(),
                local: name.clone(),
            })
    }

    fn expr(&self, expr: &Expr) -> Result<Expr<LocalId>, LoweringError> {
        expr.try_map_locals(&mut |name| self.resolve(name))
    }

    fn pc(&self) -> usize {
        self.code.len()
    }

    fn lower_block(&mut self, block: &[Stmt]) -> Result<(), LoweringError> {
        for stmt in block {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), LoweringError> {
        match stmt {
            Stmt::Assign { local, value } => {
                let instr = Instr::Assign {
                    target: self.resolve(local)?,
                    value: self.expr(value)?,
                };
                self.code.push(instr);
            }
            Stmt::Write(value) => {
                let instr = Instr::Write(self.expr(value)?);
                self.code.push(instr);
            }
            Stmt::Await { bind, operation } => {
                let bind = bind.as_ref().map(|name| self.resolve(name)).transpose()?;
                let operation = operation.try_map_locals(&mut |name| self.resolve(name))?;
                let state = self.awaits.len() as u32;
                self.awaits.push(self.pc());
                self.code.push(Instr::Await {
                    state,
                    bind,
                    operation,
                });
            }
            Stmt::YieldReturn(value) => {
                if self.regions.contains(&Region::Catch) {
                    return Err(LoweringError::YieldInCatch {
                        method: self.method.to_string(),
                    });
                }
                if self.regions.contains(&Region::TryWithCatch) {
                    return Err(LoweringError::YieldInTryWithCatch {
                        method: self.method.to_string(),
                    });
                }
                let value = self.expr(value)?;
                let point = self.yields.len() as u32;
                self.yields.push(self.pc());
                self.code.push(Instr::Yield { point, value });
            }
            Stmt::YieldBreak => self.code.push(Instr::Return),
            Stmt::Throw(value) => {
                let instr = Instr::Throw(self.expr(value)?);
                self.code.push(instr);
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let condition = self.expr(condition)?;
                let branch = self.pc();
                self.code.push(Instr::Branch {
                    condition,
                    otherwise: usize::MAX,
                });
                self.lower_block(then_branch)?;
                if else_branch.is_empty() {
                    self.patch(branch, self.pc());
                } else {
                    let jump = self.pc();
                    self.code.push(Instr::Jump(usize::MAX));
                    self.patch(branch, self.pc());
                    self.lower_block(else_branch)?;
                    self.patch(jump, self.pc());
                }
            }
            Stmt::While { condition, body } => {
                let condition = self.expr(condition)?;
                let head = self.pc();
                self.code.push(Instr::Branch {
                    condition,
                    otherwise: usize::MAX,
                });
                self.lower_block(body)?;
                self.code.push(Instr::Jump(head));
                self.patch(head, self.pc());
            }
            Stmt::TryCatch {
                body,
                binding,
                handler,
            } => {
                let start = self.pc();
                self.regions.push(Region::TryWithCatch);
                let lowered = self.lower_block(body);
                self.regions.pop();
                lowered?;
                let end = self.pc();
                let jump = self.pc();
                self.code.push(Instr::Jump(usize::MAX));
                let target = self.pc();
                let bind = binding
                    .as_ref()
                    .map(|name| self.resolve(name))
                    .transpose()?;
                self.code.push(Instr::Catch { bind });
                self.regions.push(Region::Catch);
                let lowered = self.lower_block(handler);
                self.regions.pop();
                lowered?;
                self.patch(jump, self.pc());
                // Nested handlers were pushed first, so lookup finds the innermost one.
                self.handlers.push(Handler { start, end, target });
            }
        }
        Ok(())
    }

    fn patch(&mut self, at: usize, destination: usize) {
        match &mut self.code[at] {
            Instr::Jump(target) => *target = destination,
            Instr::Branch { otherwise, .. } => *otherwise = destination,
            _ => unreachable!("only jumps and branches are patched"),
        }
    }
}
