use std::fmt::{self, Display};

use itertools::Itertools;
use serde::Serialize;

use crate::synthesis::assignment_model::ChainSolution;

/// Slots blamed for exhausting the search. Best effort, not minimal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionFailure {
    pub indices: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DecisionResult {
    AssignmentFound(ChainSolution),
    Unsat(SelectionFailure),
    Timeout,
}

impl DecisionResult {
    pub fn is_sat(&self) -> bool {
        matches!(self, DecisionResult::AssignmentFound(_))
    }

    pub fn solution(&self) -> Option<&ChainSolution> {
        match self {
            DecisionResult::AssignmentFound(s) => Some(s),
            _ => None,
        }
    }
}

impl Display for DecisionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionResult::AssignmentFound(solution) => write!(f, "sat:\n{}", solution),
            DecisionResult::Unsat(failure) => write!(f, "unsat (slots {})", failure.indices.iter().join(", ")),
            DecisionResult::Timeout => write!(f, "timeout"),
        }
    }
}
