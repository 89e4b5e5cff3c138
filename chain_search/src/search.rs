//! A generic lazy search: propose, check, learn.

use crate::traits::{Selection, SelectionProblem, Theory, Verdict};

/// Terminal outcomes of a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<S, F> {
  Found(S),
  Exhausted(F),
  Inconclusive,
}

pub fn search<P, T, G>(problem: &mut P, theory: &mut T, mut on_conflict: G) -> Result<Outcome<T::Solution, P::Failure>, P::Error>
  where
    P: SelectionProblem,
    T: Theory<P::Assignment, Conflict = P::Conflict, Error = P::Error>,
    G: FnMut(&P::Assignment, &P::Conflict),
{
  loop {
    let assignment = match problem.next_assignment()? {
      Selection::Assignment(a) => a,
      Selection::Exhausted(failure) => return Ok(Outcome::Exhausted(failure)),
      Selection::Unknown => return Ok(Outcome::Inconclusive),
    };
    match theory.check(&assignment)? {
      Verdict::Consistent(solution) => return Ok(Outcome::Found(solution)),
      Verdict::Conflict(conflict) => {
        on_conflict(&assignment, &conflict);
        problem.add_conflict(&conflict)?;
      }
      Verdict::Unknown => return Ok(Outcome::Inconclusive),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Enumerates pairs (a, b) with a, b < 3, skipping refuted values of `a`.
  struct Pairs {
    next: usize,
    banned: Vec<usize>,
  }

  impl SelectionProblem for Pairs {
    type Assignment = (usize, usize);
    type Conflict = usize;
    type Failure = &'static str;
    type Error = ();

    fn next_assignment(&mut self) -> Result<Selection<(usize, usize), &'static str>, ()> {
      while self.next < 9 {
        let candidate = (self.next / 3, self.next % 3);
        self.next += 1;
        if !self.banned.contains(&candidate.0) {
          return Ok(Selection::Assignment(candidate));
        }
      }
      Ok(Selection::Exhausted("no pairs left"))
    }

    fn add_conflict(&mut self, conflict: &usize) -> Result<(), ()> {
      self.banned.push(*conflict);
      Ok(())
    }
  }

  struct SumIs(usize);

  impl Theory<(usize, usize)> for SumIs {
    type Solution = (usize, usize);
    type Conflict = usize;
    type Error = ();

    fn check(&mut self, a: &(usize, usize)) -> Result<Verdict<(usize, usize), usize>, ()> {
      if a.0 + a.1 == self.0 {
        Ok(Verdict::Consistent(*a))
      } else if a.0 + 2 < self.0 {
        Ok(Verdict::Conflict(a.0))
      } else {
        Ok(Verdict::Conflict(usize::MAX))
      }
    }
  }

  #[test]
  fn finds_first_consistent_assignment() {
    let mut conflicts = 0;
    let mut problem = Pairs { next: 0, banned: vec![] };
    let outcome = search(&mut problem, &mut SumIs(3), |_, _| conflicts += 1);
    assert_eq!(outcome, Ok(Outcome::Found((1, 2))));
    assert_eq!(conflicts, 3);
  }

  #[test]
  fn exhausts_when_nothing_fits() {
    let mut problem = Pairs { next: 0, banned: vec![] };
    let outcome = search(&mut problem, &mut SumIs(7), |_, _| {});
    assert_eq!(outcome, Ok(Outcome::Exhausted("no pairs left")));
  }
}
