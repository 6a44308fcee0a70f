//! External collaborators, specified only at their interface boundary.
//!
//! - [`AppointmentGateway`] receives cancellation/completion signals.
//! - [`PaymentExecutor`] receives settlement intents and moves the money.
//! - [`CleanerDirectory`] supplies candidate cleaners and loyalty standing.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::GatewayError;
use crate::jobs::model::Job;
use crate::settlement::model::PaymentIntent;

/// The booking system that owns the underlying appointment.
#[async_trait]
pub trait AppointmentGateway: Send + Sync {
    async fn cancel_appointment(&self, appointment_id: &str, reason: &str)
    -> Result<(), GatewayError>;

    async fn complete_appointment(&self, appointment_id: &str) -> Result<(), GatewayError>;
}

/// Executes money movement for finalized settlement lines.
#[async_trait]
pub trait PaymentExecutor: Send + Sync {
    async fn submit(&self, intent: &PaymentIntent) -> Result<(), GatewayError>;
}

/// Source of cleaners eligible for market and urgent offers.
#[async_trait]
pub trait CleanerDirectory: Send + Sync {
    /// Up to `limit` candidates for the job, skipping anyone in `exclude`.
    async fn candidates(
        &self,
        job: &Job,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<String>, GatewayError>;

    /// The cleaner's loyalty tier, if any.
    async fn loyalty_tier(&self, cleaner_id: &str) -> Result<Option<String>, GatewayError>;
}

/// Logs every collaborator call. Used by the daemon when no real
/// collaborators are wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingGateway;

#[async_trait]
impl AppointmentGateway for TracingGateway {
    async fn cancel_appointment(
        &self,
        appointment_id: &str,
        reason: &str,
    ) -> Result<(), GatewayError> {
        info!(%appointment_id, %reason, "Appointment cancellation signalled");
        Ok(())
    }

    async fn complete_appointment(&self, appointment_id: &str) -> Result<(), GatewayError> {
        info!(%appointment_id, "Appointment completion signalled");
        Ok(())
    }
}

#[async_trait]
impl PaymentExecutor for TracingGateway {
    async fn submit(&self, intent: &PaymentIntent) -> Result<(), GatewayError> {
        info!(
            line_id = %intent.line_id,
            job_id = %intent.job_id,
            recipient = %intent.recipient_id,
            amount = %intent.amount,
            "Payment intent emitted"
        );
        Ok(())
    }
}

/// Records collaborator calls in memory.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    cancelled: Mutex<Vec<(String, String)>>,
    completed: Mutex<Vec<String>>,
    intents: Mutex<Vec<PaymentIntent>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cancelled(&self) -> Vec<(String, String)> {
        self.cancelled.lock().await.clone()
    }

    pub async fn completed(&self) -> Vec<String> {
        self.completed.lock().await.clone()
    }

    pub async fn intents(&self) -> Vec<PaymentIntent> {
        self.intents.lock().await.clone()
    }
}

#[async_trait]
impl AppointmentGateway for RecordingGateway {
    async fn cancel_appointment(
        &self,
        appointment_id: &str,
        reason: &str,
    ) -> Result<(), GatewayError> {
        self.cancelled
            .lock()
            .await
            .push((appointment_id.to_string(), reason.to_string()));
        Ok(())
    }

    async fn complete_appointment(&self, appointment_id: &str) -> Result<(), GatewayError> {
        self.completed.lock().await.push(appointment_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl PaymentExecutor for RecordingGateway {
    async fn submit(&self, intent: &PaymentIntent) -> Result<(), GatewayError> {
        self.intents.lock().await.push(intent.clone());
        Ok(())
    }
}

/// Fixed candidate pool and tier table.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    pool: Vec<String>,
    tiers: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new(pool: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            pool: pool.into_iter().map(Into::into).collect(),
            tiers: HashMap::new(),
        }
    }

    /// Builder: give a cleaner a loyalty tier.
    pub fn with_tier(mut self, cleaner_id: impl Into<String>, tier: impl Into<String>) -> Self {
        self.tiers.insert(cleaner_id.into(), tier.into());
        self
    }
}

#[async_trait]
impl CleanerDirectory for StaticDirectory {
    async fn candidates(
        &self,
        _job: &Job,
        exclude: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .pool
            .iter()
            .filter(|c| !exclude.contains(*c))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn loyalty_tier(&self, cleaner_id: &str) -> Result<Option<String>, GatewayError> {
        Ok(self.tiers.get(cleaner_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::jobs::model::{NewJob, Relationship};

    fn job() -> Job {
        Job::new(
            NewJob {
                appointment_id: "appt-1".into(),
                requester_id: "home-1".into(),
                business_owner_id: None,
                relationship: Relationship::Marketplace,
                total_required: 2,
                payout_pool: dec!(200),
                scheduled_start: Utc::now() + Duration::days(3),
                restrict_to_preferred: false,
                preferred_cleaners: Vec::new(),
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn static_directory_filters_and_limits() {
        let dir = StaticDirectory::new(["a", "b", "c", "d"]).with_tier("b", "gold");
        let exclude: HashSet<String> = ["a".to_string()].into_iter().collect();

        let picked = dir.candidates(&job(), &exclude, 2).await.unwrap();
        assert_eq!(picked, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(dir.loyalty_tier("b").await.unwrap().as_deref(), Some("gold"));
        assert!(dir.loyalty_tier("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recording_gateway_keeps_calls() {
        let gw = RecordingGateway::new();
        gw.cancel_appointment("appt-1", "requester cancelled")
            .await
            .unwrap();
        gw.complete_appointment("appt-2").await.unwrap();

        assert_eq!(
            gw.cancelled().await,
            vec![("appt-1".to_string(), "requester cancelled".to_string())]
        );
        assert_eq!(gw.completed().await, vec!["appt-2".to_string()]);
    }
}
