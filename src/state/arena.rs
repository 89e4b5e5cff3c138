/// Identity of one symbolic state instance.
///
/// Fresh inputs of a state are named after its generation, so two states built
/// from the same generation share every unconstrained input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(usize);

impl Generation {
  pub fn index(&self) -> usize {
    self.0
  }
}

/// Index-based allocator of state generations.
#[derive(Debug, Default, Clone)]
pub struct StateArena {
  next: usize,
}

impl StateArena {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fresh(&mut self) -> Generation {
    let generation = Generation(self.next);
    self.next += 1;
    generation
  }

  /// Allocate a contiguous run of generations.
  pub fn fresh_n(&mut self, n: usize) -> Vec<Generation> {
    (0..n).map(|_| self.fresh()).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generations_are_unique_and_ordered() {
    let mut arena = StateArena::new();
    let a = arena.fresh();
    let rest = arena.fresh_n(3);
    assert_eq!(a.index(), 0);
    assert_eq!(rest.iter().map(Generation::index).collect::<Vec<_>>(), vec![1, 2, 3]);
  }
}
