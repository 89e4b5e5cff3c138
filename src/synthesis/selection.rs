//! The outer problem: pick one candidate per slot, learning from refuted
//! picks.

use chain_search::traits::{Selection, SelectionProblem};
use tracing::{event, Level};
use z3::{
    ast::{Bool, Int},
    Context, Optimize, SatResult, Solver,
};

use crate::{
    error::SynthError,
    synthesis::{
        builder::SynthesisSelectionStrategy, decision::SelectionFailure, slot_assignments::SlotAssignments,
        theory::ConflictClause,
    },
};

/// Selector variables `i{slot}_g{candidate}` and the clauses tying them.
struct Selectors<'ctx> {
    ctx: &'ctx Context,
    vars: Vec<Vec<Bool<'ctx>>>,
    tracks: Vec<Bool<'ctx>>,
}

impl<'ctx> Selectors<'ctx> {
    fn new(ctx: &'ctx Context, sizes: &[usize]) -> Self {
        let vars = sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| (0..n).map(|j| Bool::new_const(ctx, format!("i{}_g{}", i, j))).collect())
            .collect();
        let tracks = (0..sizes.len()).map(|i| Bool::new_const(ctx, format!("slot_{}", i))).collect();
        Self { ctx, vars, tracks }
    }

    /// Every slot picks something; pairs `(clause, track)`.
    fn at_least_one(&self) -> Vec<(Bool<'ctx>, &Bool<'ctx>)> {
        self.vars
            .iter()
            .zip(&self.tracks)
            .map(|(slot, track)| (Bool::or(self.ctx, &slot.iter().collect::<Vec<_>>()), track))
            .collect()
    }

    fn at_most_one(&self) -> Vec<Bool<'ctx>> {
        let mut clauses = Vec::new();
        for slot in &self.vars {
            for (j, a) in slot.iter().enumerate() {
                for b in &slot[j + 1..] {
                    clauses.push(Bool::or(self.ctx, &[&a.not(), &b.not()]));
                }
            }
        }
        clauses
    }

    fn block(&self, assignment: &SlotAssignments) -> Bool<'ctx> {
        let chosen: Vec<&Bool<'ctx>> = assignment.decisions().map(|d| &self.vars[d.index][d.choice]).collect();
        Bool::and(self.ctx, &chosen).not()
    }

    fn block_conflict(&self, conflict: &ConflictClause) -> Bool<'ctx> {
        if conflict.is_empty() {
            return Bool::from_bool(self.ctx, false);
        }
        let chosen: Vec<&Bool<'ctx>> = conflict.decisions().iter().map(|d| &self.vars[d.index][d.choice]).collect();
        Bool::and(self.ctx, &chosen).not()
    }

    fn failure(&self, core: &[Bool<'ctx>]) -> SelectionFailure {
        let indices = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| core.contains(*t))
            .map(|(i, _)| i)
            .collect();
        SelectionFailure { indices }
    }
}

/// Any assignment will do.
pub struct SatProblem<'ctx> {
    selectors: Selectors<'ctx>,
    solver: Solver<'ctx>,
}

impl<'ctx> SatProblem<'ctx> {
    pub fn new(ctx: &'ctx Context, sizes: &[usize]) -> Self {
        let selectors = Selectors::new(ctx, sizes);
        let solver = Solver::new(ctx);
        for (clause, track) in selectors.at_least_one() {
            solver.assert_and_track(&clause, track);
        }
        for clause in selectors.at_most_one() {
            solver.assert(&clause);
        }
        Self { selectors, solver }
    }
}

impl<'ctx> SelectionProblem for SatProblem<'ctx> {
    type Assignment = SlotAssignments;
    type Conflict = ConflictClause;
    type Failure = SelectionFailure;
    type Error = SynthError;

    fn next_assignment(&mut self) -> Result<Selection<SlotAssignments, SelectionFailure>, SynthError> {
        match self.solver.check() {
            SatResult::Sat => {
                let model = self.solver.get_model().ok_or(SynthError::ModelGeneration)?;
                let assignment = SlotAssignments::create_from_model(&model, &self.selectors.vars)?;
                self.solver.assert(&self.selectors.block(&assignment));
                Ok(Selection::Assignment(assignment))
            }
            SatResult::Unsat => Ok(Selection::Exhausted(self.selectors.failure(&self.solver.get_unsat_core()))),
            SatResult::Unknown => Ok(Selection::Unknown),
        }
    }

    fn add_conflict(&mut self, conflict: &ConflictClause) -> Result<(), SynthError> {
        self.solver.assert(&self.selectors.block_conflict(conflict));
        Ok(())
    }
}

/// Prefers chains with fewer instructions overall.
///
/// The optimizer cannot explain unsatisfiability, so every hard clause is
/// mirrored into a plain solver that can.
pub struct OptimizeProblem<'ctx> {
    selectors: Selectors<'ctx>,
    optimize: Optimize<'ctx>,
    mirror: Solver<'ctx>,
}

impl<'ctx> OptimizeProblem<'ctx> {
    /// `lengths[i][j]` is the instruction count of candidate `j` of slot `i`.
    pub fn new(ctx: &'ctx Context, lengths: &[Vec<usize>]) -> Self {
        let sizes: Vec<usize> = lengths.iter().map(Vec::len).collect();
        let selectors = Selectors::new(ctx, &sizes);
        let optimize = Optimize::new(ctx);
        let mirror = Solver::new(ctx);
        for (clause, track) in selectors.at_least_one() {
            optimize.assert(&clause);
            mirror.assert_and_track(&clause, track);
        }
        for clause in selectors.at_most_one() {
            optimize.assert(&clause);
            mirror.assert(&clause);
        }
        let zero = Int::from_u64(ctx, 0);
        let costs: Vec<Int<'ctx>> = selectors
            .vars
            .iter()
            .zip(lengths)
            .flat_map(|(slot, lens)| slot.iter().zip(lens))
            .map(|(selector, len)| selector.ite(&Int::from_u64(ctx, *len as u64), &zero))
            .collect();
        let total = Int::add(ctx, &costs.iter().collect::<Vec<_>>());
        optimize.minimize(&total);
        Self { selectors, optimize, mirror }
    }

    fn assert(&self, clause: &Bool<'ctx>) {
        self.optimize.assert(clause);
        self.mirror.assert(clause);
    }
}

impl<'ctx> SelectionProblem for OptimizeProblem<'ctx> {
    type Assignment = SlotAssignments;
    type Conflict = ConflictClause;
    type Failure = SelectionFailure;
    type Error = SynthError;

    fn next_assignment(&mut self) -> Result<Selection<SlotAssignments, SelectionFailure>, SynthError> {
        match self.optimize.check(&[]) {
            SatResult::Sat => {
                let model = self.optimize.get_model().ok_or(SynthError::ModelGeneration)?;
                let assignment = SlotAssignments::create_from_model(&model, &self.selectors.vars)?;
                self.assert(&self.selectors.block(&assignment));
                Ok(Selection::Assignment(assignment))
            }
            SatResult::Unsat => {
                if self.mirror.check() != SatResult::Unsat {
                    event!(Level::WARN, "optimizer and mirror solver disagree; no diagnostic available");
                    return Ok(Selection::Exhausted(SelectionFailure::default()));
                }
                Ok(Selection::Exhausted(self.selectors.failure(&self.mirror.get_unsat_core())))
            }
            SatResult::Unknown => Ok(Selection::Unknown),
        }
    }

    fn add_conflict(&mut self, conflict: &ConflictClause) -> Result<(), SynthError> {
        self.assert(&self.selectors.block_conflict(conflict));
        Ok(())
    }
}

/// The configured strategy, behind one type.
pub enum OuterProblem<'ctx> {
    Sat(SatProblem<'ctx>),
    Optimize(OptimizeProblem<'ctx>),
}

impl<'ctx> OuterProblem<'ctx> {
    pub fn new(ctx: &'ctx Context, strategy: SynthesisSelectionStrategy, lengths: &[Vec<usize>]) -> Self {
        match strategy {
            SynthesisSelectionStrategy::Sat => {
                let sizes: Vec<usize> = lengths.iter().map(Vec::len).collect();
                OuterProblem::Sat(SatProblem::new(ctx, &sizes))
            }
            SynthesisSelectionStrategy::Optimize => OuterProblem::Optimize(OptimizeProblem::new(ctx, lengths)),
        }
    }
}

impl<'ctx> SelectionProblem for OuterProblem<'ctx> {
    type Assignment = SlotAssignments;
    type Conflict = ConflictClause;
    type Failure = SelectionFailure;
    type Error = SynthError;

    fn next_assignment(&mut self) -> Result<Selection<SlotAssignments, SelectionFailure>, SynthError> {
        match self {
            OuterProblem::Sat(p) => p.next_assignment(),
            OuterProblem::Optimize(p) => p.next_assignment(),
        }
    }

    fn add_conflict(&mut self, conflict: &ConflictClause) -> Result<(), SynthError> {
        match self {
            OuterProblem::Sat(p) => p.add_conflict(conflict),
            OuterProblem::Optimize(p) => p.add_conflict(conflict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::Decision;
    use std::collections::HashSet;
    use z3::Config;

    fn drain<P>(problem: &mut P) -> (Vec<SlotAssignments>, Option<SelectionFailure>)
    where
        P: SelectionProblem<Assignment = SlotAssignments, Failure = SelectionFailure, Error = SynthError>,
    {
        let mut seen = Vec::new();
        loop {
            match problem.next_assignment().unwrap() {
                Selection::Assignment(a) => seen.push(a),
                Selection::Exhausted(f) => return (seen, Some(f)),
                Selection::Unknown => return (seen, None),
            }
        }
    }

    #[test]
    fn enumerates_every_combination_once() {
        let ctx = Context::new(&Config::new());
        let mut problem = SatProblem::new(&ctx, &[2, 3]);
        let (seen, failure) = drain(&mut problem);
        assert_eq!(seen.len(), 6);
        assert_eq!(seen.iter().cloned().collect::<HashSet<_>>().len(), 6);
        assert!(failure.is_some());
    }

    #[test]
    fn conflicts_prune_all_extensions() {
        let ctx = Context::new(&Config::new());
        let mut problem = SatProblem::new(&ctx, &[2, 2, 2]);
        problem.add_conflict(&ConflictClause::new(vec![Decision { index: 1, choice: 0 }])).unwrap();
        let (seen, _) = drain(&mut problem);
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|a| a.choice(1) == Some(1)));
    }

    #[test]
    fn empty_slot_is_reported() {
        let ctx = Context::new(&Config::new());
        let mut problem = SatProblem::new(&ctx, &[1, 0, 2]);
        let (seen, failure) = drain(&mut problem);
        assert!(seen.is_empty());
        assert!(failure.unwrap().indices.contains(&1));
    }

    #[test]
    fn optimizer_prefers_short_candidates() {
        let ctx = Context::new(&Config::new());
        let mut problem = OptimizeProblem::new(&ctx, &[vec![3, 1, 2], vec![2, 4]]);
        match problem.next_assignment().unwrap() {
            Selection::Assignment(a) => assert_eq!(a.choices(), &[1, 0]),
            other => panic!("expected an assignment, got {:?}", other),
        }
        let (rest, failure) = drain(&mut problem);
        assert_eq!(rest.len(), 5);
        assert!(failure.is_some());
    }

    #[test]
    fn empty_conflict_ends_the_search() {
        let ctx = Context::new(&Config::new());
        let mut problem = OuterProblem::new(&ctx, SynthesisSelectionStrategy::Optimize, &[vec![1, 1]]);
        problem.add_conflict(&ConflictClause::new(vec![])).unwrap();
        assert!(matches!(problem.next_assignment().unwrap(), Selection::Exhausted(_)));
    }
}
