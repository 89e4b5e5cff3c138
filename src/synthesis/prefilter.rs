//! Cheap per-pair refutation before the real search.

use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::{event, instrument, Level};
use z3::{Context, SatResult, Solver};

use crate::{
    bytecode::Instruction, error::SynthError, evaluation::ModeledBlock, gadget::Gadget, state::StateArena,
    synthesis::builder::SynthesisParams,
};

// Can `gadget` stand in for `slot` at all, ignoring the rest of the chain?
// Anything short of a proof of the contrary keeps the pair.
fn admissible(ctx: &Context, params: &SynthesisParams, slot: &Instruction, gadget: &Gadget) -> Result<bool, SynthError> {
    let arch = params.arch();
    let mut arena = StateArena::new();
    let slot = ModeledBlock::read(ctx, arch, vec![slot.clone()], arena.fresh())?;
    let gadget = gadget.model(ctx, arch, arena.fresh())?;
    let solver = Solver::new(ctx);
    solver.assert(&gadget.realizes(&slot)?);
    solver.assert(&params.transitions().apply(&gadget)?);
    Ok(solver.check() != SatResult::Unsat)
}

/// Drop the candidates that provably cannot realize their slot.
///
/// Pairs are checked on `parallel` worker threads, each with its own solver
/// context. Candidate order within a slot is preserved.
#[instrument(skip_all, fields(slots = slots.len()))]
pub fn narrow<'p>(
    params: &'p SynthesisParams,
    slots: &[Instruction],
    candidates: Vec<Vec<&'p Gadget>>,
) -> Result<Vec<Vec<&'p Gadget>>, SynthError> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(params.parallel_workers())
        .build()
        .map_err(|e| SynthError::WorkerPool(e.to_string()))?;
    let pairs: Vec<(usize, &'p Gadget)> = candidates
        .iter()
        .enumerate()
        .flat_map(|(i, slot)| slot.iter().map(move |g| (i, *g)))
        .collect();
    let verdicts: Vec<bool> = pool.install(|| {
        pairs
            .par_iter()
            .map_init(
                || Context::new(&params.solver_config()),
                |ctx, (i, gadget)| admissible(ctx, params, &slots[*i], gadget),
            )
            .collect::<Result<Vec<_>, _>>()
    })?;
    let mut narrowed = vec![Vec::new(); slots.len()];
    for ((i, gadget), keep) in pairs.into_iter().zip(verdicts) {
        if keep {
            narrowed[i].push(gadget);
        }
    }
    for (i, (before, after)) in candidates.iter().zip(&narrowed).enumerate() {
        event!(Level::DEBUG, "slot {}: {} of {} candidates admissible", i, after.len(), before.len());
    }
    Ok(narrowed)
}
