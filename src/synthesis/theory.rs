//! The inner problem: is one concrete assignment a working chain?

use std::fmt::{self, Display};

use chain_search::traits::{Theory, Verdict};
use itertools::Itertools;
use tracing::{event, Level};
use z3::{ast::Bool, Context, SatResult, Solver};

use crate::{
    constraint::{StateConstraintSet, TransitionConstraintSet},
    error::SynthError,
    evaluation::ModeledBlock,
    gadget::Gadget,
    reference::MemoryValuation,
    synthesis::{assignment_model::ChainSolution, slot_assignments::SlotAssignments, Decision},
};

/// Which part of the encoding a tracked constraint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TheoryStage {
    /// A gadget realizes its slot.
    Semantics,
    /// Pointer ranges and custom transition predicates.
    Transition,
    /// One gadget's exit state is the next one's entry state.
    Consistency,
    /// One gadget jumps to the next.
    Branch,
    Precondition,
    Postcondition,
}

/// Decisions that cannot all hold together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConflictClause {
    decisions: Vec<Decision>,
}

impl ConflictClause {
    pub fn new(mut decisions: Vec<Decision>) -> Self {
        decisions.sort();
        decisions.dedup();
        Self { decisions }
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    /// The empty clause: nothing can be chosen.
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

impl Display for ConflictClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.decisions.iter().map(|d| format!("{}:{}", d.index, d.choice)).join(", "))
    }
}

struct Tracked<'ctx> {
    stage: TheoryStage,
    decisions: Vec<Decision>,
    constraint: Bool<'ctx>,
}

/// Checks assignments against the reference slots in one solver.
///
/// The slot models and their links are asserted once; everything that
/// depends on the assignment lives in a scope that is popped afterwards.
pub struct PcodeTheory<'ctx, 'p> {
    ctx: &'ctx Context,
    solver: Solver<'ctx>,
    slots: Vec<ModeledBlock<'ctx>>,
    candidates: Vec<Vec<ModeledBlock<'ctx>>>,
    gadgets: Vec<Vec<&'p Gadget>>,
    preconditions: &'p StateConstraintSet,
    postconditions: &'p StateConstraintSet,
    transitions: &'p TransitionConstraintSet,
}

impl<'ctx, 'p> PcodeTheory<'ctx, 'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &'ctx Context,
        slots: Vec<ModeledBlock<'ctx>>,
        candidates: Vec<Vec<ModeledBlock<'ctx>>>,
        gadgets: Vec<Vec<&'p Gadget>>,
        initial_memory: &MemoryValuation,
        preconditions: &'p StateConstraintSet,
        postconditions: &'p StateConstraintSet,
        transitions: &'p TransitionConstraintSet,
    ) -> Result<Self, SynthError> {
        let solver = Solver::new(ctx);
        let first = slots.first().ok_or(SynthError::EmptySpecification)?;
        solver.assert(&initial_memory.apply(first.original_state())?);
        for pair in slots.windows(2) {
            solver.assert(&pair[0].assert_concat(&pair[1]));
        }
        Ok(Self { ctx, solver, slots, candidates, gadgets, preconditions, postconditions, transitions })
    }

    fn encode(&self, assignment: &SlotAssignments) -> Result<Vec<Tracked<'ctx>>, SynthError> {
        let chosen: Vec<(Decision, &ModeledBlock<'ctx>)> =
            assignment.decisions().map(|d| (d, &self.candidates[d.index][d.choice])).collect();
        let mut tracked = Vec::new();
        for ((decision, gadget), slot) in chosen.iter().zip(&self.slots) {
            tracked.push(Tracked {
                stage: TheoryStage::Semantics,
                decisions: vec![*decision],
                constraint: gadget.realizes(slot)?,
            });
            tracked.push(Tracked {
                stage: TheoryStage::Transition,
                decisions: vec![*decision],
                constraint: self.transitions.apply(gadget)?,
            });
        }
        for pair in chosen.windows(2) {
            let ((d0, g0), (d1, g1)) = (pair[0], pair[1]);
            tracked.push(Tracked {
                stage: TheoryStage::Consistency,
                decisions: vec![d0, d1],
                constraint: g0.assert_concat(g1),
            });
            tracked.push(Tracked {
                stage: TheoryStage::Branch,
                decisions: vec![d0, d1],
                constraint: g0
                    .can_branch_to_address(g1.address())
                    .unwrap_or_else(|| Bool::from_bool(self.ctx, false)),
            });
        }
        if let (Some((first_decision, first)), Some((last_decision, last))) = (chosen.first(), chosen.last()) {
            tracked.push(Tracked {
                stage: TheoryStage::Precondition,
                decisions: vec![*first_decision],
                constraint: self.preconditions.apply(first.original_state(), first.address())?,
            });
            tracked.push(Tracked {
                stage: TheoryStage::Postcondition,
                decisions: vec![*last_decision],
                constraint: self.postconditions.apply(last.final_state(), last.address())?,
            });
        }
        Ok(tracked)
    }

    fn check_in_scope(
        &self,
        assignment: &SlotAssignments,
    ) -> Result<Verdict<ChainSolution, ConflictClause>, SynthError> {
        let tracked = self.encode(assignment)?;
        let tracks: Vec<Bool<'ctx>> = tracked.iter().map(|_| Bool::fresh_const(self.ctx, "track")).collect();
        for (t, track) in tracked.iter().zip(&tracks) {
            self.solver.assert_and_track(&t.constraint, track);
        }
        match self.solver.check() {
            SatResult::Sat => {
                let model = self.solver.get_model().ok_or(SynthError::ModelGeneration)?;
                let chain: Vec<(&Gadget, &ModeledBlock<'ctx>)> = assignment
                    .decisions()
                    .map(|d| (self.gadgets[d.index][d.choice], &self.candidates[d.index][d.choice]))
                    .collect();
                Ok(Verdict::Consistent(ChainSolution::from_model(&model, &chain, self.preconditions)?))
            }
            SatResult::Unsat => {
                let core = self.solver.get_unsat_core();
                let blamed: Vec<&Tracked<'ctx>> =
                    tracked.iter().zip(&tracks).filter(|(_, track)| core.contains(*track)).map(|(t, _)| t).collect();
                event!(
                    Level::TRACE,
                    "conflict stages: {:?}",
                    blamed.iter().map(|t| t.stage).unique().collect::<Vec<_>>()
                );
                let decisions = blamed.iter().flat_map(|t| t.decisions.iter().copied()).collect();
                Ok(Verdict::Conflict(ConflictClause::new(decisions)))
            }
            SatResult::Unknown => Ok(Verdict::Unknown),
        }
    }
}

impl<'ctx, 'p> Theory<SlotAssignments> for PcodeTheory<'ctx, 'p> {
    type Solution = ChainSolution;
    type Conflict = ConflictClause;
    type Error = SynthError;

    fn check(&mut self, assignment: &SlotAssignments) -> Result<Verdict<ChainSolution, ConflictClause>, SynthError> {
        self.solver.push();
        let verdict = self.check_in_scope(assignment);
        self.solver.pop(1);
        verdict
    }
}
