//! Engine — wires every component around one store, clock and set of
//! collaborators.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approvals::manager::JoinApprovalManager;
use crate::approvals::model::JoinRequest;
use crate::clock::Clock;
use crate::completion::model::{CompletionRecord, ExtraWorkBatch, ExtraWorkOffer};
use crate::completion::tracker::CompletionTracker;
use crate::config::{EngineConfig, PricingSnapshot};
use crate::edge_case::model::EdgeCaseDecision;
use crate::edge_case::resolver::EdgeCaseResolver;
use crate::error::Error;
use crate::gateway::{AppointmentGateway, CleanerDirectory, PaymentExecutor};
use crate::jobs::ledger::SlotLedger;
use crate::jobs::model::{Job, NewJob, SlotHolder};
use crate::notify::Notifier;
use crate::offers::manager::OfferManager;
use crate::offers::model::Offer;
use crate::rooms::model::{RoomAssignment, RoomSpec};
use crate::rooms::partitioner::{WorkPartitioner, validate_specs};
use crate::settlement::model::SettlementLine;
use crate::settlement::service::SettlementService;
use crate::store::Database;

/// Shared handles every component works against.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn Database>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn Notifier>,
    pub appointments: Arc<dyn AppointmentGateway>,
    pub payments: Arc<dyn PaymentExecutor>,
    pub directory: Arc<dyn CleanerDirectory>,
}

/// Everything the engine knows about one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job: Job,
    pub slots: Vec<SlotHolder>,
    pub offers: Vec<Offer>,
    pub join_requests: Vec<JoinRequest>,
    pub rooms: Vec<RoomAssignment>,
    pub completion_records: Vec<CompletionRecord>,
    pub extra_work: Vec<ExtraWorkSnapshot>,
    pub decisions: Vec<EdgeCaseDecision>,
    pub settlement_lines: Vec<SettlementLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtraWorkSnapshot {
    #[serde(flatten)]
    pub batch: ExtraWorkBatch,
    pub offers: Vec<ExtraWorkOffer>,
}

pub struct Engine {
    config: EngineConfig,
    deps: EngineDeps,
    ledger: Arc<SlotLedger>,
    partitioner: Arc<WorkPartitioner>,
    offers: Arc<OfferManager>,
    approvals: JoinApprovalManager,
    completion: CompletionTracker,
    edge_cases: Arc<EdgeCaseResolver>,
    settlement: Arc<SettlementService>,
}

impl Engine {
    pub fn new(config: EngineConfig, pricing: PricingSnapshot, deps: EngineDeps) -> Self {
        let ledger = Arc::new(SlotLedger::new(deps.store.clone(), deps.clock.clone()));
        let partitioner = Arc::new(WorkPartitioner::new(deps.store.clone(), deps.clock.clone()));
        let offers = Arc::new(OfferManager::new(
            config.clone(),
            deps.clone(),
            ledger.clone(),
            partitioner.clone(),
        ));
        let approvals = JoinApprovalManager::new(config.clone(), deps.clone(), ledger.clone(), offers.clone());
        let settlement = Arc::new(SettlementService::new(deps.clone(), pricing));
        let edge_cases = Arc::new(EdgeCaseResolver::new(
            config.clone(),
            deps.clone(),
            ledger.clone(),
            partitioner.clone(),
        ));
        let completion = CompletionTracker::new(
            config.clone(),
            deps.clone(),
            ledger.clone(),
            partitioner.clone(),
            offers.clone(),
            settlement.clone(),
        );

        Self {
            config,
            deps,
            ledger,
            partitioner,
            offers,
            approvals,
            completion,
            edge_cases,
            settlement,
        }
    }

    /// Bring a multi-cleaner appointment under management: store the job,
    /// partition its rooms and send the first offers.
    pub async fn register_job(&self, input: NewJob, rooms: Vec<RoomSpec>) -> Result<Job, Error> {
        let job = Job::new(input, self.deps.clock.now())?;
        if !rooms.is_empty() {
            validate_specs(&rooms)?;
        }
        self.deps.store.insert_job(&job).await?;
        info!(
            job_id = %job.id,
            appointment_id = %job.appointment_id,
            total_required = job.total_required,
            pool = %job.payout_pool,
            "Job registered"
        );

        if !rooms.is_empty() {
            self.partitioner.partition(job.id, &rooms).await?;
        }
        if let Err(e) = self.offers.issue_offers(job.id).await {
            // The open-job sweep retries.
            warn!(job_id = %job.id, error = %e, "Initial offers failed");
        }
        self.ledger.load(job.id).await
    }

    pub async fn snapshot(&self, job_id: Uuid) -> Result<JobSnapshot, Error> {
        let store = &self.deps.store;
        let job = self.ledger.load(job_id).await?;

        let mut extra_work = Vec::new();
        for batch in store.list_extra_work_batches(job_id).await? {
            let offers = store.list_extra_work_offers(batch.id).await?;
            extra_work.push(ExtraWorkSnapshot { batch, offers });
        }

        Ok(JobSnapshot {
            job,
            slots: store.list_slot_holders(job_id).await?,
            offers: store.list_offers(job_id).await?,
            join_requests: store.list_join_requests(job_id).await?,
            rooms: store.list_rooms(job_id).await?,
            completion_records: store.list_completion_records(job_id).await?,
            extra_work,
            decisions: store.list_decisions(job_id).await?,
            settlement_lines: store.list_settlement_lines(job_id).await?,
        })
    }

    /// The appointment was deleted upstream; drop the job and everything
    /// it owns.
    pub async fn delete_for_appointment(&self, appointment_id: &str) -> Result<bool, Error> {
        let deleted = self.deps.store.delete_job_for_appointment(appointment_id).await?;
        if deleted {
            info!(%appointment_id, "Job deleted with its appointment");
        }
        Ok(deleted)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.deps.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.deps.clock
    }

    pub fn ledger(&self) -> &SlotLedger {
        &self.ledger
    }

    pub fn partitioner(&self) -> &WorkPartitioner {
        &self.partitioner
    }

    pub fn offers(&self) -> &OfferManager {
        &self.offers
    }

    pub fn approvals(&self) -> &JoinApprovalManager {
        &self.approvals
    }

    pub fn completion(&self) -> &CompletionTracker {
        &self.completion
    }

    pub fn edge_cases(&self) -> &EdgeCaseResolver {
        &self.edge_cases
    }

    pub fn settlement(&self) -> &SettlementService {
        &self.settlement
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::jobs::model::JobStatus;
    use crate::test_support::{TestEngine, new_job, rooms};

    #[tokio::test]
    async fn register_partitions_and_offers() {
        let t = TestEngine::new().await;
        let mut input = new_job(2, dec!(240.00), Duration::days(3));
        input.preferred_cleaners = vec!["p1".into()];
        let job = t
            .engine
            .register_job(input, rooms(&[("Kitchen", 60), ("Bath", 30), ("Bed", 30)]))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Open);
        let snapshot = t.engine.snapshot(job.id).await.unwrap();
        assert_eq!(snapshot.rooms.len(), 3);
        assert_eq!(snapshot.rooms[0].earnings_share, dec!(120.00));
        assert_eq!(snapshot.offers.len(), 1);
        assert!(snapshot.settlement_lines.is_empty());
    }

    #[tokio::test]
    async fn register_rejects_single_cleaner_jobs() {
        let t = TestEngine::new().await;
        let err = t
            .engine
            .register_job(new_job(1, dec!(100.00), Duration::days(1)), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn invalid_rooms_leave_nothing_behind() {
        let t = TestEngine::new().await;
        let input = new_job(2, dec!(200.00), Duration::days(3));
        let appointment = input.appointment_id.clone();

        let err = t
            .engine
            .register_job(input, rooms(&[("Kitchen", 60), ("  ", 30)]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(t.store.get_job_by_appointment(&appointment).await.unwrap().is_none());
        assert!(t.store.list_jobs_by_status(JobStatus::Open).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_for_appointment_removes_job() {
        let t = TestEngine::new().await;
        let job = t.register_open_market(2).await;

        assert!(t.engine.delete_for_appointment(&job.appointment_id).await.unwrap());
        assert!(t.store.get_job(job.id).await.unwrap().is_none());
        assert!(t.store.list_offers(job.id).await.unwrap().is_empty());
        assert!(!t.engine.delete_for_appointment(&job.appointment_id).await.unwrap());
    }
}
