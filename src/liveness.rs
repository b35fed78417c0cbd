use crate::lowering::{Handler, Instr, LocalId};
use std::collections::BTreeSet;

type LiveSet = BTreeSet<LocalId>;

/// Backward liveness over the instruction graph of a lowered method.
///
/// A faulting instruction never writes its target, so its definition only kills liveness
/// along the normal edges. Along the exception edge into a `catch` handler, everything the
/// handler reads stays live.
pub(crate) struct Liveness {
    live_in: Vec<LiveSet>,
    /// Live after the instruction completes normally.
    live_after: Vec<LiveSet>,
}

impl Liveness {
    pub(crate) fn compute(code: &[Instr<LocalId>], handlers: &[Handler]) -> Liveness {
        let normal = (0..code.len())
            .map(|pc| normal_successors(code, pc))
            .collect::<Vec<_>>();
        let exceptional = (0..code.len())
            .map(|pc| exception_edge(code, handlers, pc))
            .collect::<Vec<_>>();
        let mut live_in = vec![LiveSet::new(); code.len()];
        let mut live_after = vec![LiveSet::new(); code.len()];

        let mut changed = true;
        while changed {
            changed = false;
            for pc in (0..code.len()).rev() {
                let mut after = LiveSet::new();
                for successor in &normal[pc] {
                    after.extend(live_in[*successor].iter().copied());
                }

                let mut input = after.clone();
                if let Some(def) = code[pc].def() {
                    input.remove(def);
                }
                if let Some(target) = exceptional[pc] {
                    input.extend(live_in[target].iter().copied());
                }
                code[pc].for_each_use(&mut |local| {
                    input.insert(*local);
                });

                if input != live_in[pc] || after != live_after[pc] {
                    live_in[pc] = input;
                    live_after[pc] = after;
                    changed = true;
                }
            }
        }

        Liveness {
            live_in,
            live_after,
        }
    }

    pub(crate) fn live_in(&self, pc: usize) -> &LiveSet {
        &self.live_in[pc]
    }

    pub(crate) fn live_after(&self, pc: usize) -> &LiveSet {
        &self.live_after[pc]
    }
}

/// Successors of the instruction at `pc` when it does not fault.
pub(crate) fn normal_successors(code: &[Instr<LocalId>], pc: usize) -> Vec<usize> {
    let mut result = match &code[pc] {
        Instr::Jump(target) => vec![*target],
        Instr::Branch { otherwise, .. } => vec![pc + 1, *otherwise],
        Instr::Return | Instr::Throw(_) => Vec::new(),
        _ => vec![pc + 1],
    };
    result.retain(|successor| *successor < code.len());
    result.dedup();
    result
}

/// The handler entered when the instruction at `pc` faults.
pub(crate) fn exception_edge(code: &[Instr<LocalId>], handlers: &[Handler], pc: usize) -> Option<usize> {
    if !code[pc].can_fault() {
        return None;
    }
    handlers
        .iter()
        .find(|handler| handler.protects(pc))
        .map(|handler| handler.target)
        .filter(|target| *target < code.len())
}

/// Locals whose lifetime crosses at least one suspension point and which therefore
/// have to be hoisted into the state machine.
///
/// After an `await` resumes normally, the local it binds is written fresh, so only the
/// rest of the normal live set crosses. When it resumes with a fault, nothing is bound and
/// everything the handler reads crosses. After a `yield return` everything live crosses.
pub(crate) fn crossing_locals(code: &[Instr<LocalId>], handlers: &[Handler]) -> LiveSet {
    let liveness = Liveness::compute(code, handlers);
    let mut crossing = LiveSet::new();
    for (pc, instr) in code.iter().enumerate() {
        match instr {
            Instr::Await { bind, .. } => {
                crossing.extend(
                    liveness
                        .live_after(pc)
                        .iter()
                        .filter(|local| Some(*local) != bind.as_ref()),
                );
                if let Some(target) = exception_edge(code, handlers, pc) {
                    crossing.extend(liveness.live_in(target).iter().copied());
                }
            }
            Instr::Yield { .. } => crossing.extend(liveness.live_after(pc).iter().copied()),
            _ => {}
        }
    }
    tracing::trace!(?crossing, "locals live across suspension points");
    crossing
}
