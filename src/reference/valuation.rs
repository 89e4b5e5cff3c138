use std::collections::BTreeMap;

use serde::Serialize;
use z3::ast::{Ast, Bool, BV};

use crate::{bytecode::VarNode, constraint::conjoin, error::SynthError, state::State};

/// Initial ram contents the reference program depends on, keyed by address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryValuation(BTreeMap<u64, Vec<u8>>);

impl MemoryValuation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the bytes were already present.
    pub fn insert(&mut self, address: u64, bytes: Vec<u8>) -> bool {
        if self.covers(address, bytes.len()) {
            return false;
        }
        self.0.insert(address, bytes);
        true
    }

    // Ranges may overlap, so an earlier, longer range can hold the byte.
    fn byte(&self, address: u64) -> Option<u8> {
        self.0
            .range(..=address)
            .rev()
            .find_map(|(start, bytes)| bytes.get((address - start) as usize).copied())
    }

    pub fn covers(&self, address: u64, size: usize) -> bool {
        (0..size as u64).all(|i| self.byte(address + i).is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Vec<u8>)> {
        self.0.iter()
    }

    /// Pin every byte on `state`.
    pub fn apply<'a>(&self, state: &State<'a>) -> Result<Bool<'a>, SynthError> {
        let ctx = state.get_ctx();
        let ram = state.arch().ram_space();
        let mut parts = Vec::new();
        for (address, bytes) in &self.0 {
            for (i, byte) in bytes.iter().enumerate() {
                let stored = state.read(&VarNode::new(ram, address + i as u64, 1))?;
                parts.push(stored._eq(&BV::from_u64(ctx, *byte as u64, 8)));
            }
        }
        Ok(conjoin(ctx, &parts))
    }
}
