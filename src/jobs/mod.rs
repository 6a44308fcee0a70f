//! Jobs — the staffing aggregate and the slot ledger.

pub mod ledger;
pub mod model;

pub use ledger::{SlotClaimed, SlotLedger, SlotUnavailable};
pub use model::{Job, JobStatus, NewJob, Relationship};
