//! Understaffed jobs close to their start.

pub mod model;
pub mod resolver;

pub use model::{DecisionOutcome, DecisionStatus, EdgeCaseChoice, EdgeCaseDecision};
pub use resolver::EdgeCaseResolver;
