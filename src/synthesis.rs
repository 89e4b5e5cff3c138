//! Choosing one gadget per slot, and proving the choice works.

use std::fmt::{self, Display};

use chain_search::search::{search, Outcome};
use serde::Serialize;
use tracing::{event, instrument, Level};
use z3::Context;

use crate::{bytecode::Instruction, error::SynthError, evaluation::ModeledBlock, gadget::Gadget, state::StateArena};

pub mod assignment_model;
pub mod builder;
pub mod decision;
pub mod prefilter;
pub mod selection;
pub mod slot_assignments;
pub mod theory;

use self::{
    builder::SynthesisParams,
    decision::{DecisionResult, SelectionFailure},
    selection::OuterProblem,
    theory::PcodeTheory,
};

/// Slot `index` uses its candidate number `choice`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Decision {
    pub index: usize,
    pub choice: usize,
}

impl Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {} <- candidate {}", self.index, self.choice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisPhase {
    Initializing,
    Encoding,
    Solving,
    Sat,
    Unsat,
    Timeout,
}

/// One search over a fixed slot layout.
pub struct AssignmentSynthesis<'p> {
    params: &'p SynthesisParams,
    slots: Vec<Instruction>,
    phase: SynthesisPhase,
}

impl<'p> AssignmentSynthesis<'p> {
    pub fn new(params: &'p SynthesisParams, slots: Vec<Instruction>) -> Self {
        Self { params, slots, phase: SynthesisPhase::Initializing }
    }

    pub fn phase(&self) -> SynthesisPhase {
        self.phase
    }

    pub fn slots(&self) -> &[Instruction] {
        &self.slots
    }

    /// Library candidates per slot, before any solving.
    pub fn candidates(&self) -> Vec<Vec<&'p Gadget>> {
        let params = self.params;
        self.slots
            .iter()
            .map(|slot| {
                params
                    .library()
                    .candidates_for(std::slice::from_ref(slot), params.max_candidates(), params.rng_seed())
            })
            .collect()
    }

    fn finish(&mut self, result: DecisionResult) -> DecisionResult {
        self.phase = match result {
            DecisionResult::AssignmentFound(_) => SynthesisPhase::Sat,
            DecisionResult::Unsat(_) => SynthesisPhase::Unsat,
            DecisionResult::Timeout => SynthesisPhase::Timeout,
        };
        result
    }

    #[instrument(skip_all, fields(slots = self.slots.len()))]
    pub fn decide(&mut self) -> Result<DecisionResult, SynthError> {
        let params = self.params;
        let arch = params.arch();
        self.phase = SynthesisPhase::Encoding;
        let candidates = prefilter::narrow(params, &self.slots, self.candidates())?;
        if let Some(index) = candidates.iter().position(Vec::is_empty) {
            event!(Level::WARN, "no candidate can realize slot {}: {}", index, self.slots[index]);
            return Ok(self.finish(DecisionResult::Unsat(SelectionFailure { indices: vec![index] })));
        }

        let ctx = Context::new(&params.solver_config());
        let mut arena = StateArena::new();
        let mut slot_models = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            slot_models.push(ModeledBlock::read(&ctx, arch, vec![slot.clone()], arena.fresh())?);
        }
        let mut candidate_models = Vec::with_capacity(candidates.len());
        for slot in &candidates {
            let mut models = Vec::with_capacity(slot.len());
            for gadget in slot {
                models.push(gadget.model(&ctx, arch, arena.fresh())?);
            }
            candidate_models.push(models);
        }
        let lengths: Vec<Vec<usize>> = candidates.iter().map(|slot| slot.iter().map(|g| g.len()).collect()).collect();

        let mut theory = PcodeTheory::new(
            &ctx,
            slot_models,
            candidate_models,
            candidates,
            params.reference().initial_memory(),
            params.preconditions(),
            params.postconditions(),
            params.transitions(),
        )?;
        let mut problem = OuterProblem::new(&ctx, params.selection_strategy(), &lengths);

        self.phase = SynthesisPhase::Solving;
        let mut conflicts = 0usize;
        let outcome = search(&mut problem, &mut theory, |assignment, conflict| {
            conflicts += 1;
            event!(Level::DEBUG, "{} refuted by {}", assignment, conflict);
        })?;
        event!(Level::INFO, "search finished after {} conflicts", conflicts);
        let result = match outcome {
            Outcome::Found(solution) => DecisionResult::AssignmentFound(solution),
            Outcome::Exhausted(failure) => DecisionResult::Unsat(failure),
            Outcome::Inconclusive => DecisionResult::Timeout,
        };
        Ok(self.finish(result))
    }
}
