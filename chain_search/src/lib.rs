//! # Chain Search
//!
//! The crate defines a generic lazy assignment search parametrized by
//!
//! - a selection problem, which proposes one candidate per slot and learns
//! from refuted combinations;
//!
//! - a theory, which decides whether a proposed assignment is realizable
//! and, when it is not, explains which decisions were responsible;
//!
//! - an `on_conflict` hook, which observes every refutation.

pub mod traits;
pub mod search;
