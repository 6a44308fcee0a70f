//! Per-worker completion records and extra-work batches.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::offers::model::OfferStatus;

/// Per-worker state on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Assigned,
    Started,
    Completed,
    /// Worker-initiated exit.
    DroppedOut,
    /// System-declared after the start deadline with zero progress.
    NoShow,
}

impl CompletionStatus {
    pub fn can_transition_to(&self, target: CompletionStatus) -> bool {
        use CompletionStatus::*;

        matches!(
            (self, target),
            (Assigned, Started) | (Assigned, DroppedOut) | (Assigned, NoShow) |
            (Started, Completed) | (Started, DroppedOut) | (Started, NoShow)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DroppedOut | Self::NoShow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::DroppedOut => "dropped_out",
            Self::NoShow => "no_show",
        }
    }
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CompletionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(Self::Assigned),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "dropped_out" => Ok(Self::DroppedOut),
            "no_show" => Ok(Self::NoShow),
            _ => Err(format!("Unknown completion status: {s}")),
        }
    }
}

/// One per (job, cleaner).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub job_id: Uuid,
    pub cleaner_id: String,
    pub status: CompletionStatus,
    /// Rooms taken back from this worker on departure. Used to explain
    /// partial payouts.
    pub released_rooms: u32,
    /// Set once the worker took rooms from a departed co-worker.
    #[serde(default)]
    pub extra_work_accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_work_decline_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CompletionRecord {
    pub fn assigned(job_id: Uuid, cleaner_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            cleaner_id: cleaner_id.into(),
            status: CompletionStatus::Assigned,
            released_rooms: 0,
            extra_work_accepted: false,
            extra_work_decline_reason: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How a worker left a job early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Departure {
    DroppedOut,
    NoShow,
}

impl Departure {
    pub fn status(&self) -> CompletionStatus {
        match self {
            Self::DroppedOut => CompletionStatus::DroppedOut,
            Self::NoShow => CompletionStatus::NoShow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraWorkStatus {
    /// Waiting on confirmed co-workers.
    Open,
    /// A co-worker took the rooms.
    Accepted,
    /// Nobody took the rooms in time; urgent-fill offers went out.
    Escalated,
    /// The job was cancelled.
    Withdrawn,
}

impl ExtraWorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Accepted => "accepted",
            Self::Escalated => "escalated",
            Self::Withdrawn => "withdrawn",
        }
    }
}

impl std::fmt::Display for ExtraWorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExtraWorkStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "accepted" => Ok(Self::Accepted),
            "escalated" => Ok(Self::Escalated),
            "withdrawn" => Ok(Self::Withdrawn),
            _ => Err(format!("Unknown extra work status: {s}")),
        }
    }
}

/// Rooms released by one departure, offered to the remaining co-workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraWorkBatch {
    pub id: Uuid,
    pub job_id: Uuid,
    pub departed_cleaner_id: String,
    pub room_ids: Vec<Uuid>,
    pub status: ExtraWorkStatus,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One co-worker's invitation to take a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraWorkOffer {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub job_id: Uuid,
    pub cleaner_id: String,
    pub status: OfferStatus,
    /// Sum of the released rooms' shares.
    pub earnings_offered: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What happened after a worker departed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DepartureOutcome {
    pub released_rooms: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_work_batch: Option<Uuid>,
    pub extra_work_offers: usize,
    pub slot_offers: usize,
}

/// Result of a co-worker responding to an extra-work offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExtraWorkOutcome {
    Accepted { batch_id: Uuid, rooms: Vec<Uuid> },
    Declined { batch_id: Uuid, escalated: bool },
    /// Someone else took the batch first, or it already escalated.
    NoLongerAvailable { batch_id: Uuid },
}
