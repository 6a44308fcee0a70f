//! Offers extended to cleaners for open slots.

pub mod manager;
pub mod model;

pub use manager::OfferManager;
pub use model::{AcceptOutcome, DeclineOutcome, Offer, OfferStatus, OfferType};
