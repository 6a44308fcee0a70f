//! Join requests on restricted jobs.

pub mod manager;
pub mod model;

pub use manager::JoinApprovalManager;
pub use model::{ApprovalOutcome, JoinRequest, JoinRequestStatus};
