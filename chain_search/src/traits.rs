//! Traits for the generic assignment search.

/// The answer of a selection problem to a request for a new assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<A, F> {
  /// A fresh assignment that has not been proposed before.
  Assignment(A),
  /// No assignment remains. The payload explains why.
  Exhausted(F),
  /// The underlying solver gave up.
  Unknown,
}

/// The answer of a theory to a proposed assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<S, C> {
  Consistent(S),
  Conflict(C),
  Unknown,
}

/// Problems that enumerate assignments, excluding every combination
/// covered by a learned conflict.
pub trait SelectionProblem {
  type Assignment;
  type Conflict;
  type Failure;
  type Error;

  fn next_assignment(&mut self) -> Result<Selection<Self::Assignment, Self::Failure>, Self::Error>;
  /// Exclude every assignment that agrees with `conflict`.
  fn add_conflict(&mut self, conflict: &Self::Conflict) -> Result<(), Self::Error>;
}

/// Decision procedures for a single assignment.
pub trait Theory<A> {
  type Solution;
  type Conflict;
  type Error;

  fn check(&mut self, assignment: &A) -> Result<Verdict<Self::Solution, Self::Conflict>, Self::Error>;
}
