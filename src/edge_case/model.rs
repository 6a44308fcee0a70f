//! Go/no-go decisions for jobs that are understaffed close to start.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::model::CancelSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Proceed,
    Cancel,
    /// Timed out with at least one confirmed cleaner.
    AutoProceeded,
    /// Timed out with nobody confirmed; there is nobody to proceed with.
    AutoCancelled,
    /// The job was cancelled through another path.
    Withdrawn,
}

impl DecisionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Proceed => "proceed",
            Self::Cancel => "cancel",
            Self::AutoProceeded => "auto_proceeded",
            Self::AutoCancelled => "auto_cancelled",
            Self::Withdrawn => "withdrawn",
        }
    }
}

impl std::fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DecisionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "proceed" => Ok(Self::Proceed),
            "cancel" => Ok(Self::Cancel),
            "auto_proceeded" => Ok(Self::AutoProceeded),
            "auto_cancelled" => Ok(Self::AutoCancelled),
            "withdrawn" => Ok(Self::Withdrawn),
            _ => Err(format!("Unknown decision status: {s}")),
        }
    }
}

/// A pending go/no-go question to the job's requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeCaseDecision {
    pub id: Uuid,
    pub job_id: Uuid,
    pub requester_id: String,
    /// Staffing when the decision was raised.
    pub confirmed_count: u32,
    pub total_required: u32,
    pub status: DecisionStatus,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EdgeCaseDecision {
    pub fn new(
        job_id: Uuid,
        requester_id: impl Into<String>,
        confirmed_count: u32,
        total_required: u32,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            requester_id: requester_id.into(),
            confirmed_count,
            total_required,
            status: DecisionStatus::Pending,
            expires_at,
            decided_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The requester's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCaseChoice {
    Proceed,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// The job continues with the confirmed cleaners only.
    Proceeded {
        decision_id: Uuid,
        status: DecisionStatus,
        total_required: u32,
    },
    Cancelled {
        decision_id: Uuid,
        status: DecisionStatus,
        summary: CancelSummary,
    },
    NoLongerPending {
        decision_id: Uuid,
        status: DecisionStatus,
    },
}
