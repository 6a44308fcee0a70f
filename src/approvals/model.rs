//! Join request data model — a non-preferred cleaner asking the requester
//! for a slot on a restricted job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinRequestStatus {
    Pending,
    Approved,
    Declined,
    /// No decision before `expires_at`; access is granted by default.
    AutoApproved,
    /// Approved (explicitly or by default) but the slot was already gone.
    Expired,
    /// The job was cancelled while the request was pending.
    Cancelled,
}

impl JoinRequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::AutoApproved => "auto_approved",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JoinRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JoinRequestStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "declined" => Ok(Self::Declined),
            "auto_approved" => Ok(Self::AutoApproved),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown join request status: {s}")),
        }
    }
}

/// A cleaner's request to join a restricted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub id: Uuid,
    pub job_id: Uuid,
    pub cleaner_id: String,
    /// Who must decide (the job's requester).
    pub requester_id: String,
    pub status: JoinRequestStatus,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JoinRequest {
    pub fn new(
        job_id: Uuid,
        cleaner_id: impl Into<String>,
        requester_id: impl Into<String>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            cleaner_id: cleaner_id.into(),
            requester_id: requester_id.into(),
            status: JoinRequestStatus::Pending,
            expires_at,
            decline_reason: None,
            decided_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of an approval (explicit or by default).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    /// The cleaner now holds a slot.
    Approved {
        request_id: Uuid,
        status: JoinRequestStatus,
        job_filled: bool,
    },
    /// The requester turned the cleaner down.
    Declined { request_id: Uuid },
    /// Approved, but the last slot went to someone else first.
    SlotUnavailable { request_id: Uuid },
    /// The request was already resolved.
    NoLongerPending {
        request_id: Uuid,
        status: JoinRequestStatus,
    },
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn new_request_pending_with_deadline() {
        let now = Utc::now();
        let req = JoinRequest::new(Uuid::new_v4(), "c9", "home-1", now + Duration::hours(2), now);
        assert_eq!(req.status, JoinRequestStatus::Pending);
        assert!(!req.is_expired(now));
        assert!(req.is_expired(now + Duration::hours(2)));
    }

    #[test]
    fn status_roundtrip_strings() {
        for s in [
            JoinRequestStatus::Pending,
            JoinRequestStatus::Approved,
            JoinRequestStatus::Declined,
            JoinRequestStatus::AutoApproved,
            JoinRequestStatus::Expired,
            JoinRequestStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<JoinRequestStatus>().unwrap(), s);
        }
        assert_eq!(
            serde_json::to_string(&JoinRequestStatus::AutoApproved).unwrap(),
            "\"auto_approved\""
        );
    }
}
