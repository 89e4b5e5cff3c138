//! The resolved engine: everything a run needs, plus the extension points.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{event, instrument, Level};
use z3::{ast::Bool, Config, Context, SatResult, Solver};

use crate::{
    config::constraint::CompiledConstraints,
    constraint::{StateConstraintGenerator, StateConstraintSet, TransitionConstraintGenerator, TransitionConstraintSet},
    error::SynthError,
    evaluation::ModeledBlock,
    gadget::GadgetLibrary,
    reference::ReferenceProgram,
    state::StateArena,
    synthesis::{
        assignment_model::{Binding, ChainSolution},
        decision::{DecisionResult, SelectionFailure},
        AssignmentSynthesis,
    },
    ty::ArchInfo,
};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisSelectionStrategy {
    #[serde(alias = "SatStrategy")]
    Sat,
    #[default]
    #[serde(alias = "OptimizeStrategy")]
    Optimize,
}

#[derive(Clone, Debug)]
pub struct SynthesisParams {
    library: Arc<GadgetLibrary>,
    reference: ReferenceProgram,
    preconditions: StateConstraintSet,
    postconditions: StateConstraintSet,
    transitions: TransitionConstraintSet,
    strategy: SynthesisSelectionStrategy,
    candidates_per_slot: usize,
    parallel: usize,
    combine_instructions: bool,
    seed: u64,
    timeout_ms: Option<u64>,
}

impl SynthesisParams {
    pub fn new(library: GadgetLibrary, reference: ReferenceProgram) -> Self {
        Self {
            library: Arc::new(library),
            reference,
            preconditions: StateConstraintSet::new(),
            postconditions: StateConstraintSet::new(),
            transitions: TransitionConstraintSet::default(),
            strategy: SynthesisSelectionStrategy::default(),
            candidates_per_slot: 50,
            parallel: 4,
            combine_instructions: true,
            seed: 0,
            timeout_ms: None,
        }
    }

    pub fn with_constraints(mut self, constraints: CompiledConstraints) -> Self {
        self.preconditions = constraints.precondition;
        self.postconditions = constraints.postcondition;
        self.transitions = constraints.transition;
        self
    }

    pub fn strategy(mut self, strategy: SynthesisSelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn candidates_per_slot(mut self, candidates_per_slot: usize) -> Self {
        self.candidates_per_slot = candidates_per_slot;
        self
    }

    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn combine_instructions(mut self, combine_instructions: bool) -> Self {
        self.combine_instructions = combine_instructions;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Must hold on the chain's initial state.
    pub fn add_precondition(&mut self, generator: Arc<StateConstraintGenerator>) {
        self.preconditions.add_custom(generator);
    }

    /// Must hold on the chain's final state.
    pub fn add_postcondition(&mut self, generator: Arc<StateConstraintGenerator>) {
        self.postconditions.add_custom(generator);
    }

    /// Must hold for every gadget of the chain.
    pub fn add_transition_constraint(&mut self, generator: Arc<TransitionConstraintGenerator>) {
        self.transitions.add_custom(generator);
    }

    pub fn library(&self) -> &GadgetLibrary {
        &self.library
    }

    pub fn reference(&self) -> &ReferenceProgram {
        &self.reference
    }

    pub fn arch(&self) -> &Arc<ArchInfo> {
        self.library.arch()
    }

    pub fn preconditions(&self) -> &StateConstraintSet {
        &self.preconditions
    }

    pub fn postconditions(&self) -> &StateConstraintSet {
        &self.postconditions
    }

    pub fn transitions(&self) -> &TransitionConstraintSet {
        &self.transitions
    }

    pub fn selection_strategy(&self) -> SynthesisSelectionStrategy {
        self.strategy
    }

    pub fn max_candidates(&self) -> usize {
        self.candidates_per_slot
    }

    pub fn parallel_workers(&self) -> usize {
        self.parallel
    }

    pub fn rng_seed(&self) -> u64 {
        self.seed
    }

    pub(crate) fn solver_config(&self) -> Config {
        let mut config = Config::new();
        config.set_model_generation(true);
        if let Some(timeout) = self.timeout_ms {
            config.set_timeout_msec(timeout);
        }
        config
    }

    /// Try every slot layout, fewest slots first, until one yields a chain.
    #[instrument(skip_all, fields(instructions = self.reference.len()))]
    pub fn run(&self) -> Result<DecisionResult, SynthError> {
        let mut timed_out = false;
        let mut failure = None;
        for (n, slots) in self.reference.slot_layouts(self.combine_instructions).into_iter().enumerate() {
            event!(Level::INFO, "layout {}: {} slots", n, slots.len());
            let mut synthesis = AssignmentSynthesis::new(self, slots);
            match synthesis.decide()? {
                DecisionResult::AssignmentFound(solution) => {
                    event!(Level::INFO, "found a chain of {} gadgets", solution.len());
                    return Ok(DecisionResult::AssignmentFound(solution));
                }
                DecisionResult::Unsat(f) => failure = Some(f),
                DecisionResult::Timeout => timed_out = true,
            }
        }
        if timed_out {
            Ok(DecisionResult::Timeout)
        } else {
            Ok(DecisionResult::Unsat(failure.unwrap_or_default()))
        }
    }

    /// Replay `solution` from the library bytes and check it still meets
    /// every postcondition and transition constraint.
    #[instrument(skip_all, fields(steps = solution.len()))]
    pub fn verify(&self, solution: &ChainSolution) -> Result<bool, SynthError> {
        let ctx = Context::new(&self.solver_config());
        let arch = self.arch();
        let mut arena = StateArena::new();
        let mut blocks = Vec::with_capacity(solution.len());
        for step in &solution.steps {
            let instructions = self.library.relift(step.library, step.address, step.length)?;
            blocks.push(ModeledBlock::read(&ctx, arch, instructions, arena.fresh())?);
        }
        let (first, last) = match (blocks.first(), blocks.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(SynthError::EmptySpecification),
        };
        let solver = Solver::new(&ctx);
        for (name, value) in &solution.initial_registers {
            let register = Binding::Register { name: name.clone(), value: *value };
            solver.assert(&register.pin(first.original_state())?);
        }
        for binding in &solution.initial_memory {
            solver.assert(&binding.pin(first.original_state())?);
        }
        for (step, block) in solution.steps.iter().zip(&blocks) {
            for binding in &step.bindings {
                solver.assert(&binding.pin(block.original_state())?);
            }
            solver.assert(&self.transitions.apply(block)?);
        }
        for pair in blocks.windows(2) {
            solver.assert(&pair[0].assert_concat(&pair[1]));
            let branch = pair[0].can_branch_to_address(pair[1].address()).unwrap_or_else(|| Bool::from_bool(&ctx, false));
            solver.assert(&branch);
        }
        solver.assert(&self.preconditions.apply(first.original_state(), first.address())?);
        solver.assert(&self.postconditions.apply(last.final_state(), last.address())?);
        match solver.check() {
            SatResult::Sat => Ok(true),
            SatResult::Unsat => Ok(false),
            SatResult::Unknown => {
                event!(Level::WARN, "replay was inconclusive");
                Ok(false)
            }
        }
    }
}
