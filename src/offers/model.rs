//! Offer data model — invitations to claim a slot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the offer was sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferType {
    /// Sent to a designated/preferred cleaner first.
    PrimaryInvite,
    /// Sent to the general pool after the market delay.
    MarketOpen,
    /// Sent when time-to-start is short, or to replace a drop-out mid-job.
    UrgentFill,
}

impl OfferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryInvite => "primary_invite",
            Self::MarketOpen => "market_open",
            Self::UrgentFill => "urgent_fill",
        }
    }
}

impl std::str::FromStr for OfferType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary_invite" => Ok(Self::PrimaryInvite),
            "market_open" => Ok(Self::MarketOpen),
            "urgent_fill" => Ok(Self::UrgentFill),
            _ => Err(format!("Unknown offer type: {s}")),
        }
    }
}

/// Offer lifecycle. Every status except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
    Withdrawn,
}

impl OfferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Expired => "expired",
            Self::Withdrawn => "withdrawn",
        }
    }
}

impl std::fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OfferStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "declined" => Ok(Self::Declined),
            "expired" => Ok(Self::Expired),
            "withdrawn" => Ok(Self::Withdrawn),
            _ => Err(format!("Unknown offer status: {s}")),
        }
    }
}

/// An invitation to a specific cleaner to claim a slot on a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub job_id: Uuid,
    pub cleaner_id: String,
    pub offer_type: OfferType,
    pub status: OfferStatus,
    /// Quoted earnings. Never recalculated after creation.
    pub earnings_offered: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Offer {
    pub fn new(
        job_id: Uuid,
        cleaner_id: impl Into<String>,
        offer_type: OfferType,
        earnings_offered: Decimal,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            cleaner_id: cleaner_id.into(),
            offer_type,
            status: OfferStatus::Pending,
            earnings_offered,
            expires_at,
            decline_reason: None,
            responded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Result of a cleaner accepting an offer. Losing a race is an expected
/// outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcceptOutcome {
    /// The cleaner holds a slot on the job.
    Accepted {
        offer_id: Uuid,
        job_id: Uuid,
        /// The acceptance filled the last slot.
        job_filled: bool,
        /// The cleaner took over a vacated slot mid-job.
        replacement: bool,
    },
    /// Someone else took the last slot first.
    SlotUnavailable { offer_id: Uuid, job_id: Uuid },
    /// The offer was already resolved (expired, withdrawn, ...).
    NoLongerPending { offer_id: Uuid, status: OfferStatus },
}

/// Result of a cleaner declining an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeclineOutcome {
    Declined { offer_id: Uuid, reoffered: usize },
    NoLongerPending { offer_id: Uuid, status: OfferStatus },
}
