//! Crew engine — allocation, execution tracking and settlement for jobs
//! that need more than one cleaner.

pub mod api;
pub mod approvals;
pub mod clock;
pub mod completion;
pub mod config;
pub mod edge_case;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod notify;
pub mod offers;
pub mod rooms;
pub mod settlement;
pub mod store;
pub mod sweeper;

#[cfg(test)]
mod test_support;

pub use engine::{Engine, EngineDeps, JobSnapshot};
pub use error::{Error, Result};
