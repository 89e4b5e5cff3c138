use std::fmt::{self, Display};

use itertools::Itertools;
use z3::{ast::Bool, Model};

use crate::{error::SynthError, synthesis::Decision};

/// One candidate index per slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotAssignments {
    choices: Vec<usize>,
}

impl SlotAssignments {
    pub fn new(choices: Vec<usize>) -> Self {
        Self { choices }
    }

    pub fn choice(&self, index: usize) -> Option<usize> {
        self.choices.get(index).copied()
    }

    pub fn choices(&self) -> &[usize] {
        &self.choices
    }

    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }

    pub fn decisions(&self) -> impl Iterator<Item = Decision> + '_ {
        self.choices.iter().enumerate().map(|(index, &choice)| Decision { index, choice })
    }

    /// Read the selector that is true for every slot.
    pub fn create_from_model<'ctx>(model: &Model<'ctx>, selectors: &[Vec<Bool<'ctx>>]) -> Result<Self, SynthError> {
        let mut choices = Vec::with_capacity(selectors.len());
        for (index, slot) in selectors.iter().enumerate() {
            let mut chosen = None;
            for (choice, selector) in slot.iter().enumerate() {
                if model.eval(selector, true).and_then(|b| b.as_bool()) == Some(true) {
                    chosen = Some(choice);
                    break;
                }
            }
            let choice = chosen.ok_or_else(|| SynthError::ModelParsing(format!("selector of slot {}", index)))?;
            choices.push(choice);
        }
        Ok(Self { choices })
    }
}

impl Display for SlotAssignments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.choices.iter().join(", "))
    }
}
