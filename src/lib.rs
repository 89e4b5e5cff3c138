pub mod bytecode;
pub mod config;
pub mod constraint;
pub mod dynamic;
pub mod error;
pub mod evaluation;
pub mod gadget;
pub mod loader;
pub mod reference;
pub mod semantics;
pub mod state;
pub mod synthesis;
pub mod traits;
pub mod ty;
pub mod value;

pub use config::SynthConfig;
pub use error::SynthError;
pub use synthesis::{
  builder::{SynthesisParams, SynthesisSelectionStrategy},
  decision::DecisionResult,
};
