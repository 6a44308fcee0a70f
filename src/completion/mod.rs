//! Per-worker progress, departures and extra work.

pub mod model;
pub mod tracker;

pub use model::{
    CompletionRecord, CompletionStatus, Departure, DepartureOutcome, ExtraWorkBatch,
    ExtraWorkOffer, ExtraWorkOutcome, ExtraWorkStatus,
};
pub use tracker::CompletionTracker;
