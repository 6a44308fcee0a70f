//! Job data model — the aggregate root for multi-cleaner staffing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IntegrityError, ValidationError};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Slots are still open.
    Open,
    /// Every slot is claimed.
    Filled,
    /// At least one cleaner has started.
    InProgress,
    /// Every cleaner reached a terminal state.
    Completed,
    /// Understaffed near start; waiting on the requester's go/no-go.
    EdgeCase,
    /// Cancelled before completion.
    Cancelled,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Open, Filled) | (Open, EdgeCase) | (Open, Cancelled) |
            (Filled, Open) | (Filled, InProgress) | (Filled, Cancelled) |
            (InProgress, Completed) | (InProgress, Cancelled) |
            (EdgeCase, Filled) | (EdgeCase, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Statuses that require every slot to be confirmed.
    pub fn requires_full_staffing(&self) -> bool {
        matches!(self, Self::Filled | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Filled => "filled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::EdgeCase => "edge_case",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "filled" => Ok(Self::Filled),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "edge_case" => Ok(Self::EdgeCase),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown job status: {s}")),
        }
    }
}

/// Commercial relationship that decides the platform fee rate and where the
/// fee is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    /// Standalone marketplace cleaners.
    Marketplace,
    /// Cleaners employed by a business owner; the fee is routed to the owner.
    BusinessEmployee,
    /// High-volume business discount tier.
    BusinessVolume,
}

impl Relationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Marketplace => "marketplace",
            Self::BusinessEmployee => "business_employee",
            Self::BusinessVolume => "business_volume",
        }
    }
}

impl std::str::FromStr for Relationship {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "marketplace" => Ok(Self::Marketplace),
            "business_employee" => Ok(Self::BusinessEmployee),
            "business_volume" => Ok(Self::BusinessVolume),
            _ => Err(format!("Unknown relationship: {s}")),
        }
    }
}

/// Fields the appointment record supplies when a job enters the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub appointment_id: String,
    pub requester_id: String,
    #[serde(default)]
    pub business_owner_id: Option<String>,
    pub relationship: Relationship,
    pub total_required: u32,
    /// Amount payable to cleaners across all rooms.
    pub payout_pool: Decimal,
    pub scheduled_start: DateTime<Utc>,
    /// Slots are reserved for `preferred_cleaners`; others need approval.
    #[serde(default)]
    pub restrict_to_preferred: bool,
    #[serde(default)]
    pub preferred_cleaners: Vec<String>,
}

/// A job requiring more than one cleaner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub appointment_id: String,
    pub requester_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_owner_id: Option<String>,
    pub relationship: Relationship,
    /// Slots currently required. Shrinks when an understaffed job proceeds.
    pub total_required: u32,
    /// Slots required when the job was registered.
    pub original_required: u32,
    pub confirmed_count: u32,
    pub status: JobStatus,
    pub payout_pool: Decimal,
    pub scheduled_start: DateTime<Utc>,
    pub restrict_to_preferred: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_cleaners: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Validate registration input and build an open job.
    pub fn new(input: NewJob, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        if input.total_required < 2 {
            return Err(ValidationError::InvalidInput {
                field: "total_required".into(),
                reason: format!(
                    "multi-cleaner jobs need at least 2 cleaners, got {}",
                    input.total_required
                ),
            });
        }
        if input.payout_pool <= Decimal::ZERO {
            return Err(ValidationError::InvalidInput {
                field: "payout_pool".into(),
                reason: format!("must be positive, got {}", input.payout_pool),
            });
        }
        if input.payout_pool.scale() > 2 {
            return Err(ValidationError::InvalidInput {
                field: "payout_pool".into(),
                reason: "must be expressed in whole cents".into(),
            });
        }
        if input.restrict_to_preferred && input.preferred_cleaners.is_empty() {
            return Err(ValidationError::InvalidInput {
                field: "preferred_cleaners".into(),
                reason: "restricted jobs need at least one preferred cleaner".into(),
            });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            appointment_id: input.appointment_id,
            requester_id: input.requester_id,
            business_owner_id: input.business_owner_id,
            relationship: input.relationship,
            total_required: input.total_required,
            original_required: input.total_required,
            confirmed_count: 0,
            status: JobStatus::Open,
            payout_pool: input.payout_pool,
            scheduled_start: input.scheduled_start,
            restrict_to_preferred: input.restrict_to_preferred,
            preferred_cleaners: input.preferred_cleaners,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn open_slots(&self) -> u32 {
        self.total_required.saturating_sub(self.confirmed_count)
    }

    pub fn is_preferred(&self, cleaner_id: &str) -> bool {
        self.preferred_cleaners.iter().any(|c| c == cleaner_id)
    }

    /// Per-slot quote used for offers: the pool split evenly over the
    /// originally required headcount, rounded to cents.
    pub fn per_slot_quote(&self) -> Decimal {
        crate::settlement::calculator::round_money(
            self.payout_pool / Decimal::from(self.original_required.max(1)),
        )
    }

    /// Check the slot-count invariants. A failure means a bug, not a
    /// business condition.
    pub fn check_invariants(&self) -> Result<(), IntegrityError> {
        if self.confirmed_count > self.total_required {
            return Err(IntegrityError::SlotOverflow {
                job_id: self.id,
                confirmed: self.confirmed_count,
                total: self.total_required,
            });
        }
        if self.status.requires_full_staffing() && self.confirmed_count != self.total_required {
            return Err(IntegrityError::Understaffed {
                job_id: self.id,
                status: self.status.to_string(),
                confirmed: self.confirmed_count,
                total: self.total_required,
            });
        }
        Ok(())
    }
}

/// A cleaner holding (or having vacated) a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHolder {
    pub cleaner_id: String,
    /// The holder dropped out mid-job; the slot still counts but can be
    /// taken over by a replacement.
    pub vacated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_cleaner_id: Option<String>,
    pub claimed_at: DateTime<Utc>,
}

/// Raw result of the store's atomic slot claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// A free slot was consumed.
    Claimed {
        confirmed_count: u32,
        total_required: u32,
        filled: bool,
    },
    /// A vacated slot was taken over from a departed cleaner.
    TookOver { previous_cleaner_id: String },
    /// The cleaner already holds a slot on this job.
    AlreadyHeld,
    /// No slot is available.
    Unavailable {
        confirmed_count: u32,
        total_required: u32,
    },
}

/// Raw result of the store's slot release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotRelease {
    /// The slot was freed and the confirmed count dropped.
    Released,
    /// The job already started; the slot stays counted but is open for a
    /// replacement.
    Vacated,
    /// The cleaner held no slot. Releasing twice lands here.
    NotHeld,
}

/// What a cascading cancellation touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CancelSummary {
    pub offers_withdrawn: u64,
    pub join_requests_cancelled: u64,
    pub extra_work_withdrawn: u64,
    pub decisions_withdrawn: u64,
    pub slots_released: Vec<String>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;

    fn input(total: u32) -> NewJob {
        NewJob {
            appointment_id: "appt-1".into(),
            requester_id: "home-1".into(),
            business_owner_id: None,
            relationship: Relationship::Marketplace,
            total_required: total,
            payout_pool: dec!(300.00),
            scheduled_start: Utc::now() + Duration::days(2),
            restrict_to_preferred: false,
            preferred_cleaners: Vec::new(),
        }
    }

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Open.can_transition_to(JobStatus::Filled));
        assert!(JobStatus::Filled.can_transition_to(JobStatus::Open));
        assert!(JobStatus::Filled.can_transition_to(JobStatus::InProgress));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::EdgeCase.can_transition_to(JobStatus::Filled));
        assert!(JobStatus::EdgeCase.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!JobStatus::Open.can_transition_to(JobStatus::InProgress));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Open));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Open));
        assert!(!JobStatus::InProgress.can_transition_to(JobStatus::Open));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::EdgeCase.is_terminal());
    }

    #[test]
    fn new_job_defaults() {
        let job = Job::new(input(3), Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Open);
        assert_eq!(job.confirmed_count, 0);
        assert_eq!(job.open_slots(), 3);
        assert_eq!(job.original_required, 3);
        assert_eq!(job.per_slot_quote(), dec!(100.00));
    }

    #[test]
    fn new_job_rejects_single_cleaner() {
        assert!(matches!(
            Job::new(input(1), Utc::now()),
            Err(ValidationError::InvalidInput { ref field, .. }) if field == "total_required"
        ));
    }

    #[test]
    fn new_job_rejects_fractional_cents() {
        let mut bad = input(2);
        bad.payout_pool = dec!(100.005);
        assert!(Job::new(bad, Utc::now()).is_err());
    }

    #[test]
    fn restricted_job_needs_preferred_list() {
        let mut bad = input(2);
        bad.restrict_to_preferred = true;
        assert!(Job::new(bad, Utc::now()).is_err());
    }

    #[test]
    fn invariants_detect_overflow_and_understaffing() {
        let mut job = Job::new(input(2), Utc::now()).unwrap();
        job.confirmed_count = 3;
        assert!(matches!(
            job.check_invariants(),
            Err(IntegrityError::SlotOverflow { confirmed: 3, total: 2, .. })
        ));

        job.confirmed_count = 1;
        job.status = JobStatus::Filled;
        assert!(matches!(
            job.check_invariants(),
            Err(IntegrityError::Understaffed { confirmed: 1, total: 2, .. })
        ));

        job.confirmed_count = 2;
        assert!(job.check_invariants().is_ok());
    }

    #[test]
    fn per_slot_quote_rounds_to_cents() {
        let mut job = Job::new(input(3), Utc::now()).unwrap();
        job.payout_pool = dec!(100.00);
        assert_eq!(job.per_slot_quote(), dec!(33.33));
    }

    #[test]
    fn status_serde_and_parse() {
        let json = serde_json::to_string(&JobStatus::EdgeCase).unwrap();
        assert_eq!(json, "\"edge_case\"");
        assert_eq!("in_progress".parse::<JobStatus>().unwrap(), JobStatus::InProgress);
        assert!("bogus".parse::<JobStatus>().is_err());
    }
}
