//! Error types for the crew engine.
//!
//! Race-lost situations (slot gone, offer already resolved) are not errors;
//! they are returned as outcome enums by the managers. Everything here is
//! either a rejected request, an infrastructure failure, or a broken invariant.

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Data integrity violation: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Collaborator error: {0}")]
    Gateway(#[from] GatewayError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

/// One unmet requirement reported when a worker or room cannot be completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "requirement", rename_all = "snake_case")]
pub enum MissingRequirement {
    /// The room has not been marked completed yet.
    RoomNotCompleted { room_id: Uuid, label: String },
    /// Checklist items are still open for the room.
    ChecklistIncomplete {
        room_id: Uuid,
        label: String,
        done: u32,
        required: u32,
    },
    /// Required photos have not been uploaded for the room.
    PhotosMissing {
        room_id: Uuid,
        label: String,
        uploaded: u32,
        required: u32,
    },
}

impl std::fmt::Display for MissingRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoomNotCompleted { label, .. } => write!(f, "room '{label}' not completed"),
            Self::ChecklistIncomplete {
                label,
                done,
                required,
                ..
            } => write!(f, "room '{label}' checklist {done}/{required}"),
            Self::PhotosMissing {
                label,
                uploaded,
                required,
                ..
            } => write!(f, "room '{label}' photos {uploaded}/{required}"),
        }
    }
}

/// A request violated a state-machine precondition.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{entity} {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Requirements not met: {}", format_missing(.0))]
    MissingRequirements(Vec<MissingRequirement>),

    #[error("Not permitted: {0}")]
    NotPermitted(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidInput { field: String, reason: String },
}

fn format_missing(missing: &[MissingRequirement]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Invariant violations. These indicate a bug, never a business condition.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error("Job {job_id} has {confirmed} confirmed cleaners but only {total} slots")]
    SlotOverflow {
        job_id: Uuid,
        confirmed: u32,
        total: u32,
    },

    #[error("Job {job_id} is {status} with {confirmed} of {total} slots confirmed")]
    Understaffed {
        job_id: Uuid,
        status: String,
        confirmed: u32,
        total: u32,
    },

    #[error("Job {job_id} room shares sum to {actual}, expected {expected}")]
    ShareMismatch {
        job_id: Uuid,
        expected: Decimal,
        actual: Decimal,
    },

    #[error("Settlement for job {job_id} changed concurrently: {reason}")]
    SettlementConflict { job_id: Uuid, reason: String },
}

/// Failures reported by external collaborators.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{collaborator} unavailable: {reason}")]
    Unavailable {
        collaborator: &'static str,
        reason: String,
    },

    #[error("{collaborator} rejected request: {reason}")]
    Rejected {
        collaborator: &'static str,
        reason: String,
    },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
