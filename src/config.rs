//! Configuration types.
//!
//! `EngineConfig` holds the timing windows and runtime settings, read from
//! `CREW_*` environment variables. `PricingSnapshot` holds fee percentages and
//! loyalty bonus tiers; it is consumed verbatim and passed explicitly into
//! settlement so a settlement is reproducible from its inputs alone.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::jobs::model::Relationship;

/// Upper bound for any configured window (one year).
const MAX_WINDOW_MINUTES: i64 = 366 * 24 * 60;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a regular offer stays open.
    pub offer_expiry: Duration,
    /// How long an urgent-fill offer stays open.
    pub urgent_offer_expiry: Duration,
    /// Delay after job creation before offers go to the general market.
    pub market_delay: Duration,
    /// Time-to-start below which offers are issued as urgent fills.
    pub urgent_threshold: Duration,
    /// Pending offers kept outstanding per open slot.
    pub offer_fanout: usize,
    /// How long the requester has to approve a join request.
    pub approval_window: Duration,
    /// Pre-start window in which an understaffed job escalates.
    pub edge_case_lead: Duration,
    /// Maximum time the requester gets for a go/no-go decision.
    pub edge_case_decision_window: Duration,
    /// How long co-workers have to take over a drop-out's rooms.
    pub extra_work_window: Duration,
    /// Grace period after scheduled start before a silent worker is a no-show.
    pub no_show_grace: Duration,
    /// Interval between background sweeps.
    pub sweep_interval: std::time::Duration,
    /// Settle automatically when a job completes.
    pub auto_settle: bool,
    /// Database file path.
    pub db_path: String,
    /// HTTP port for the decision API.
    pub http_port: u16,
    /// Optional pricing file (JSON). Built-in defaults are used when absent.
    pub pricing_path: Option<String>,
    /// Candidate cleaners for the built-in directory (`CREW_CLEANERS`,
    /// comma-separated).
    pub cleaner_pool: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            offer_expiry: Duration::minutes(30),
            urgent_offer_expiry: Duration::minutes(10),
            market_delay: Duration::hours(2),
            urgent_threshold: Duration::hours(12),
            offer_fanout: 3,
            approval_window: Duration::hours(2),
            edge_case_lead: Duration::hours(48),
            edge_case_decision_window: Duration::hours(24),
            extra_work_window: Duration::minutes(30),
            no_show_grace: Duration::minutes(30),
            sweep_interval: std::time::Duration::from_secs(60),
            auto_settle: true,
            db_path: "./data/crew-engine.db".to_string(),
            http_port: 8080,
            pricing_path: None,
            cleaner_pool: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Build configuration from `CREW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (env, file, test map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let minutes = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .filter(|m| (1..=MAX_WINDOW_MINUTES).contains(m))
                    .and_then(Duration::try_minutes)
                    .ok_or_else(|| ConfigError::InvalidValue {
                        key: key.to_string(),
                        message: format!(
                            "expected between 1 and {MAX_WINDOW_MINUTES} minutes, got '{raw}'"
                        ),
                    }),
                None => Ok(default),
            }
        };

        let sweep_interval = match lookup("CREW_SWEEP_INTERVAL_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .map(std::time::Duration::from_secs)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "CREW_SWEEP_INTERVAL_SECS".into(),
                    message: format!("expected a positive number of seconds, got '{raw}'"),
                })?,
            None => defaults.sweep_interval,
        };

        let offer_fanout = match lookup("CREW_OFFER_FANOUT") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "CREW_OFFER_FANOUT".into(),
                    message: format!("expected a positive integer, got '{raw}'"),
                })?,
            None => defaults.offer_fanout,
        };

        let http_port = match lookup("CREW_HTTP_PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "CREW_HTTP_PORT".into(),
                message: format!("expected a port number, got '{raw}'"),
            })?,
            None => defaults.http_port,
        };

        let auto_settle = lookup("CREW_AUTO_SETTLE")
            .map(|v| !matches!(v.trim(), "0" | "false" | "no"))
            .unwrap_or(defaults.auto_settle);

        Ok(Self {
            offer_expiry: minutes("CREW_OFFER_EXPIRY_MIN", defaults.offer_expiry)?,
            urgent_offer_expiry: minutes("CREW_URGENT_OFFER_EXPIRY_MIN", defaults.urgent_offer_expiry)?,
            market_delay: minutes("CREW_MARKET_DELAY_MIN", defaults.market_delay)?,
            urgent_threshold: minutes("CREW_URGENT_THRESHOLD_MIN", defaults.urgent_threshold)?,
            offer_fanout,
            approval_window: minutes("CREW_APPROVAL_WINDOW_MIN", defaults.approval_window)?,
            edge_case_lead: minutes("CREW_EDGE_CASE_LEAD_MIN", defaults.edge_case_lead)?,
            edge_case_decision_window: minutes(
                "CREW_EDGE_CASE_DECISION_MIN",
                defaults.edge_case_decision_window,
            )?,
            extra_work_window: minutes("CREW_EXTRA_WORK_WINDOW_MIN", defaults.extra_work_window)?,
            no_show_grace: minutes("CREW_NO_SHOW_GRACE_MIN", defaults.no_show_grace)?,
            sweep_interval,
            auto_settle,
            db_path: lookup("CREW_DB_PATH").unwrap_or(defaults.db_path),
            http_port,
            pricing_path: lookup("CREW_PRICING_PATH"),
            cleaner_pool: lookup("CREW_CLEANERS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

/// Platform fee rates per commercial relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Independent marketplace cleaner.
    pub marketplace: Decimal,
    /// Employee of a business owner on the platform.
    pub business_employee: Decimal,
    /// High-volume business discount tier.
    pub business_volume: Decimal,
}

/// Immutable pricing inputs for settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingSnapshot {
    /// Identifies the pricing table this snapshot was taken from.
    pub version: String,
    pub fees: FeeSchedule,
    /// Loyalty tier name -> bonus percentage (as a fraction of gross).
    #[serde(default)]
    pub loyalty_tiers: BTreeMap<String, Decimal>,
}

impl Default for PricingSnapshot {
    fn default() -> Self {
        let mut loyalty_tiers = BTreeMap::new();
        loyalty_tiers.insert("bronze".to_string(), Decimal::ZERO);
        loyalty_tiers.insert("silver".to_string(), dec!(0.02));
        loyalty_tiers.insert("gold".to_string(), dec!(0.05));
        loyalty_tiers.insert("platinum".to_string(), dec!(0.08));

        Self {
            version: "builtin-v1".to_string(),
            fees: FeeSchedule {
                marketplace: dec!(0.20),
                business_employee: dec!(0.10),
                business_volume: dec!(0.15),
            },
            loyalty_tiers,
        }
    }
}

impl PricingSnapshot {
    /// Load a pricing snapshot from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let snapshot: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Reject rates outside `[0, 1)`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let check = |key: String, rate: Decimal| {
            if rate < Decimal::ZERO || rate >= Decimal::ONE {
                Err(ConfigError::InvalidValue {
                    key,
                    message: format!("rate {rate} must be in [0, 1)"),
                })
            } else {
                Ok(())
            }
        };
        check("fees.marketplace".into(), self.fees.marketplace)?;
        check("fees.business_employee".into(), self.fees.business_employee)?;
        check("fees.business_volume".into(), self.fees.business_volume)?;
        for (tier, rate) in &self.loyalty_tiers {
            check(format!("loyalty_tiers.{tier}"), *rate)?;
        }
        Ok(())
    }

    /// Platform fee rate for a commercial relationship.
    pub fn fee_rate(&self, relationship: Relationship) -> Decimal {
        match relationship {
            Relationship::Marketplace => self.fees.marketplace,
            Relationship::BusinessEmployee => self.fees.business_employee,
            Relationship::BusinessVolume => self.fees.business_volume,
        }
    }

    /// Bonus rate for a loyalty tier. Unknown or absent tiers earn nothing.
    pub fn bonus_rate(&self, tier: Option<&str>) -> Decimal {
        tier.and_then(|t| self.loyalty_tiers.get(t))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}
