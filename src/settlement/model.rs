//! Settlement lines and payment intents.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::completion::model::CompletionStatus;
use crate::jobs::model::Relationship;

/// Who a line pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    /// A cleaner's payout.
    Worker,
    /// Fees retained by the platform.
    PlatformFee,
    /// Fees routed to the business owner of employed cleaners.
    BusinessFee,
}

impl LineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::PlatformFee => "platform_fee",
            Self::BusinessFee => "business_fee",
        }
    }
}

impl std::str::FromStr for LineKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Self::Worker),
            "platform_fee" => Ok(Self::PlatformFee),
            "business_fee" => Ok(Self::BusinessFee),
            _ => Err(format!("Unknown line kind: {s}")),
        }
    }
}

/// Recipient id used for platform fee lines.
pub const PLATFORM_RECIPIENT: &str = "platform";

/// Calculator output for one recipient, before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineDraft {
    pub recipient_id: String,
    pub kind: LineKind,
    pub gross: Decimal,
    pub fee: Decimal,
    pub bonus: Decimal,
    pub net: Decimal,
    pub adjustment_reason: Option<String>,
}

impl LineDraft {
    /// Whether a persisted line carries the same amounts and reason.
    pub fn matches(&self, line: &SettlementLine) -> bool {
        self.kind == line.kind
            && self.recipient_id == line.recipient_id
            && self.gross == line.gross
            && self.fee == line.fee
            && self.bonus == line.bonus
            && self.net == line.net
            && self.adjustment_reason == line.adjustment_reason
    }
}

/// An immutable settlement record. Corrections append a new line pointing
/// at the one they supersede.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLine {
    pub id: Uuid,
    pub job_id: Uuid,
    pub recipient_id: String,
    pub kind: LineKind,
    pub gross: Decimal,
    pub fee: Decimal,
    pub bonus: Decimal,
    pub net: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<Uuid>,
    pub pricing_version: String,
    pub created_at: DateTime<Utc>,
}

impl SettlementLine {
    pub fn from_draft(
        job_id: Uuid,
        draft: LineDraft,
        supersedes: Option<Uuid>,
        pricing_version: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            recipient_id: draft.recipient_id,
            kind: draft.kind,
            gross: draft.gross,
            fee: draft.fee,
            bonus: draft.bonus,
            net: draft.net,
            adjustment_reason: draft.adjustment_reason,
            supersedes,
            pricing_version: pricing_version.to_string(),
            created_at: now,
        }
    }
}

/// Instruction handed to the payment executor. For a correction the
/// amount is the difference against the superseded line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub line_id: Uuid,
    pub job_id: Uuid,
    pub recipient_id: String,
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<Uuid>,
}

/// Final per-worker facts the calculator needs.
#[derive(Debug, Clone)]
pub struct WorkerInput {
    pub cleaner_id: String,
    pub status: CompletionStatus,
    /// Shares of the rooms this worker completed.
    pub completed_shares: Vec<Decimal>,
    /// Rooms taken back when the worker departed.
    pub released_rooms: u32,
    pub loyalty_tier: Option<String>,
}

/// Everything settlement depends on besides pricing.
#[derive(Debug, Clone)]
pub struct SettlementInput {
    pub job_id: Uuid,
    pub relationship: Relationship,
    pub business_owner_id: Option<String>,
    /// Sum of every room share on the job.
    pub room_pool: Decimal,
    pub workers: Vec<WorkerInput>,
}

/// Calculator result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementComputation {
    pub lines: Vec<LineDraft>,
    /// Room shares nobody completed.
    pub unallocated: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    /// First settlement for the job.
    Created,
    /// Re-run produced the same lines.
    Unchanged,
    /// Re-run appended correction lines.
    Corrected,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub job_id: Uuid,
    pub state: SettlementState,
    /// Lines currently in force (not superseded).
    pub lines: Vec<SettlementLine>,
    pub appended: usize,
    pub intents_submitted: usize,
    pub unallocated: Decimal,
    pub pricing_version: String,
}

/// Lines not superseded by a later line.
pub fn active_lines(lines: &[SettlementLine]) -> Vec<SettlementLine> {
    lines
        .iter()
        .filter(|l| !lines.iter().any(|o| o.supersedes == Some(l.id)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn draft(net: Decimal) -> LineDraft {
        LineDraft {
            recipient_id: "c1".into(),
            kind: LineKind::Worker,
            gross: dec!(100.00),
            fee: dec!(20.00),
            bonus: Decimal::ZERO,
            net,
            adjustment_reason: None,
        }
    }

    #[test]
    fn draft_matches_persisted_line() {
        let line = SettlementLine::from_draft(Uuid::new_v4(), draft(dec!(80.00)), None, "v1", Utc::now());
        assert!(draft(dec!(80.00)).matches(&line));
        assert!(!draft(dec!(79.99)).matches(&line));
    }

    #[test]
    fn active_lines_skip_superseded() {
        let job_id = Uuid::new_v4();
        let first = SettlementLine::from_draft(job_id, draft(dec!(80.00)), None, "v1", Utc::now());
        let second =
            SettlementLine::from_draft(job_id, draft(dec!(81.00)), Some(first.id), "v1", Utc::now());
        let active = active_lines(&[first, second.clone()]);
        assert_eq!(active, vec![second]);
    }

    #[test]
    fn line_kind_strings() {
        assert_eq!("business_fee".parse::<LineKind>().unwrap(), LineKind::BusinessFee);
        assert_eq!(LineKind::PlatformFee.as_str(), "platform_fee");
    }
}
