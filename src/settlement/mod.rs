//! Settlement — pure calculation plus the persisting service around it.

pub mod calculator;
pub mod model;
pub mod service;

pub use calculator::settle;
pub use model::{LineKind, PaymentIntent, SettlementLine, SettlementReport, SettlementState};
pub use service::SettlementService;
