//! Rooms — units of work and the partitioner that prices and assigns them.

pub mod model;
pub mod partitioner;

pub use model::{RoomAssignment, RoomEvidence, RoomSpec, RoomStatus};
pub use partitioner::{WorkPartitioner, compute_shares};
