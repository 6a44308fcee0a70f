//! Room assignment data model — indivisible units of work with a
//! pre-computed earnings share.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MissingRequirement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Pending,
    InProgress,
    Completed,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoomStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Unknown room status: {s}")),
        }
    }
}

/// Input describing one room, as supplied by the pricing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSpec {
    pub label: String,
    /// Estimated effort; shares are proportional to this.
    pub effort_minutes: u32,
    #[serde(default)]
    pub checklist_items: u32,
    #[serde(default)]
    pub photos_required: u32,
}

/// Evidence a cleaner submits when finishing a room.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RoomEvidence {
    pub checklist_done: u32,
    pub photos_uploaded: u32,
}

/// A unit of work on a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomAssignment {
    pub id: Uuid,
    pub job_id: Uuid,
    /// Order within the job's partition.
    pub position: u32,
    pub label: String,
    pub effort_minutes: u32,
    pub earnings_share: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaner_id: Option<String>,
    pub status: RoomStatus,
    pub checklist_items: u32,
    pub checklist_done: u32,
    pub photos_required: u32,
    pub photos_uploaded: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoomAssignment {
    pub fn from_spec(
        job_id: Uuid,
        position: u32,
        spec: &RoomSpec,
        earnings_share: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            position,
            label: spec.label.clone(),
            effort_minutes: spec.effort_minutes,
            earnings_share,
            cleaner_id: None,
            status: RoomStatus::Pending,
            checklist_items: spec.checklist_items,
            checklist_done: 0,
            photos_required: spec.photos_required,
            photos_uploaded: 0,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, cleaner_id: &str) -> bool {
        self.cleaner_id.as_deref() == Some(cleaner_id)
    }

    /// What is still missing before this room counts as completed.
    pub fn missing_requirements(&self, evidence: &RoomEvidence) -> Vec<MissingRequirement> {
        let mut missing = Vec::new();
        if evidence.checklist_done < self.checklist_items {
            missing.push(MissingRequirement::ChecklistIncomplete {
                room_id: self.id,
                label: self.label.clone(),
                done: evidence.checklist_done,
                required: self.checklist_items,
            });
        }
        if evidence.photos_uploaded < self.photos_required {
            missing.push(MissingRequirement::PhotosMissing {
                room_id: self.id,
                label: self.label.clone(),
                uploaded: evidence.photos_uploaded,
                required: self.photos_required,
            });
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn spec() -> RoomSpec {
        RoomSpec {
            label: "Kitchen".into(),
            effort_minutes: 60,
            checklist_items: 8,
            photos_required: 2,
        }
    }

    #[test]
    fn from_spec_starts_unowned() {
        let room = RoomAssignment::from_spec(Uuid::new_v4(), 0, &spec(), dec!(40.00), Utc::now());
        assert_eq!(room.status, RoomStatus::Pending);
        assert!(room.cleaner_id.is_none());
        assert_eq!(room.earnings_share, dec!(40.00));
    }

    #[test]
    fn missing_requirements_lists_each_gap() {
        let room = RoomAssignment::from_spec(Uuid::new_v4(), 0, &spec(), dec!(40.00), Utc::now());
        let missing = room.missing_requirements(&RoomEvidence {
            checklist_done: 5,
            photos_uploaded: 0,
        });
        assert_eq!(missing.len(), 2);
        assert!(matches!(
            missing[0],
            MissingRequirement::ChecklistIncomplete { done: 5, required: 8, .. }
        ));
        assert!(matches!(
            missing[1],
            MissingRequirement::PhotosMissing { uploaded: 0, required: 2, .. }
        ));

        assert!(
            room.missing_requirements(&RoomEvidence {
                checklist_done: 8,
                photos_uploaded: 2
            })
            .is_empty()
        );
    }
}
