use std::sync::Arc;

use z3::{
    ast::{Ast, Bool},
    Context, SatResult, Solver,
};

use crate::{error::SynthError, evaluation::ModeledBlock, state::State};

pub mod state;
pub mod transition;

pub use state::{ConstraintWarning, MemoryEqualityConstraint, StateConstraint, StateConstraintSet};
pub use transition::{PointerRange, TransitionConstraintSet};

/// Boolean sort
pub type Constraint<'ctx> = Bool<'ctx>;

/// A predicate over a state, given the address of the block it belongs to.
pub type StateConstraintGenerator =
    dyn for<'a> Fn(&State<'a>, u64) -> Result<Bool<'a>, SynthError> + Send + Sync + 'static;

/// A predicate over a single gadget. `None` means nothing to assert.
pub type TransitionConstraintGenerator =
    dyn for<'a> Fn(&ModeledBlock<'a>) -> Result<Option<Bool<'a>>, SynthError> + Send + Sync + 'static;

/// Box a closure as a state predicate.
pub fn state_predicate<F>(f: F) -> Arc<StateConstraintGenerator>
where
    F: for<'a> Fn(&State<'a>, u64) -> Result<Bool<'a>, SynthError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Box a closure as a transition predicate.
pub fn transition_predicate<F>(f: F) -> Arc<TransitionConstraintGenerator>
where
    F: for<'a> Fn(&ModeledBlock<'a>) -> Result<Option<Bool<'a>>, SynthError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Return false if the constraint is unsatisfiable.
pub fn sat<'ctx>(constraint: &Constraint<'ctx>) -> bool {
    let solver = Solver::new(constraint.get_ctx());
    solver.assert(constraint);
    !matches!(solver.check(), SatResult::Unsat)
}

/// Conjunction of all `constraints`; true when empty.
pub fn conjoin<'ctx>(ctx: &'ctx Context, constraints: &[Constraint<'ctx>]) -> Constraint<'ctx> {
    Bool::and(ctx, &constraints.iter().collect::<Vec<_>>())
}

/// Disjunction of all `constraints`; false when empty.
pub fn disjoin<'ctx>(ctx: &'ctx Context, constraints: &[Constraint<'ctx>]) -> Constraint<'ctx> {
    Bool::or(ctx, &constraints.iter().collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::Config;

    #[test]
    fn empty_conjunction_and_disjunction() {
        let ctx = Context::new(&Config::new());
        let p = Bool::new_const(&ctx, "p");
        assert!(sat(&conjoin(&ctx, &[])));
        assert!(!sat(&disjoin(&ctx, &[])));
        assert!(!sat(&conjoin(&ctx, &[p.clone(), p.not()])));
        assert!(sat(&disjoin(&ctx, &[p.clone(), p.not()])));
    }
}
