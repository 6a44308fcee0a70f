//! CompletionTracker — per-worker progress on a job.
//!
//! Worker states run `assigned -> started -> completed`, with exits to
//! `dropped_out` or `no_show`. A departure returns the worker's unfinished
//! rooms to the pool; confirmed co-workers get first refusal on them before
//! the rooms go out as urgent fills.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::completion::model::{
    CompletionRecord, CompletionStatus, Departure, DepartureOutcome, ExtraWorkBatch,
    ExtraWorkOffer, ExtraWorkOutcome, ExtraWorkStatus,
};
use crate::config::EngineConfig;
use crate::engine::EngineDeps;
use crate::error::{DatabaseError, Error, ValidationError};
use crate::jobs::ledger::SlotLedger;
use crate::jobs::model::{JobStatus, SlotRelease};
use crate::notify::{Notification, NotificationKind, dispatch};
use crate::offers::manager::OfferManager;
use crate::offers::model::OfferStatus;
use crate::rooms::model::{RoomAssignment, RoomEvidence};
use crate::rooms::partitioner::WorkPartitioner;
use crate::settlement::service::SettlementService;
use crate::store::ExtraWorkClaim;

pub struct CompletionTracker {
    config: EngineConfig,
    deps: EngineDeps,
    ledger: Arc<SlotLedger>,
    partitioner: Arc<WorkPartitioner>,
    offers: Arc<OfferManager>,
    settlement: Arc<SettlementService>,
}

impl CompletionTracker {
    pub fn new(
        config: EngineConfig,
        deps: EngineDeps,
        ledger: Arc<SlotLedger>,
        partitioner: Arc<WorkPartitioner>,
        offers: Arc<OfferManager>,
        settlement: Arc<SettlementService>,
    ) -> Self {
        Self {
            config,
            deps,
            ledger,
            partitioner,
            offers,
            settlement,
        }
    }

    /// The worker arrived. The first start moves the job to `in_progress`.
    pub async fn start(&self, job_id: Uuid, cleaner_id: &str) -> Result<CompletionRecord, Error> {
        let job = self.ledger.load(job_id).await?;
        if !job.status.requires_full_staffing() {
            return Err(ValidationError::InvalidTransition {
                entity: "job",
                id: job_id,
                state: job.status.to_string(),
                target: "started".into(),
            }
            .into());
        }

        let record = self.record(job_id, cleaner_id).await?;
        if record.status == CompletionStatus::Started {
            return Ok(record);
        }
        let moved = self
            .deps
            .store
            .transition_completion(
                job_id,
                cleaner_id,
                CompletionStatus::Assigned,
                CompletionStatus::Started,
                self.deps.clock.now(),
            )
            .await?;
        if !moved {
            return Err(worker_transition_error(&self.record(job_id, cleaner_id).await?, "started"));
        }

        self.ledger.start_job(job_id).await?;
        info!(job_id = %job_id, cleaner_id = %cleaner_id, "Worker started");
        self.record(job_id, cleaner_id).await
    }

    /// Start a room, starting the worker too if they had not checked in.
    pub async fn start_room(&self, room_id: Uuid, cleaner_id: &str) -> Result<RoomAssignment, Error> {
        let room = self.room(room_id).await?;
        self.ensure_started(room.job_id, cleaner_id).await?;
        self.partitioner.start_room(room_id, cleaner_id).await
    }

    pub async fn complete_room(
        &self,
        room_id: Uuid,
        cleaner_id: &str,
        evidence: RoomEvidence,
    ) -> Result<RoomAssignment, Error> {
        let room = self.room(room_id).await?;
        self.ensure_started(room.job_id, cleaner_id).await?;
        self.partitioner.complete_room(room_id, cleaner_id, evidence).await
    }

    /// Finish the worker. Every room they own must be completed; otherwise
    /// the unfinished rooms come back as missing requirements.
    pub async fn mark_completed(&self, job_id: Uuid, cleaner_id: &str) -> Result<CompletionRecord, Error> {
        let record = self.record(job_id, cleaner_id).await?;
        if record.status != CompletionStatus::Started {
            return Err(worker_transition_error(&record, "completed"));
        }

        let missing = self.partitioner.unfinished_rooms(job_id, cleaner_id).await?;
        if !missing.is_empty() {
            return Err(ValidationError::MissingRequirements(missing).into());
        }

        let moved = self
            .deps
            .store
            .transition_completion(
                job_id,
                cleaner_id,
                CompletionStatus::Started,
                CompletionStatus::Completed,
                self.deps.clock.now(),
            )
            .await?;
        if !moved {
            return Err(worker_transition_error(&self.record(job_id, cleaner_id).await?, "completed"));
        }
        info!(job_id = %job_id, cleaner_id = %cleaner_id, "Worker completed");

        self.check_job_completion(job_id).await?;
        self.record(job_id, cleaner_id).await
    }

    pub async fn drop_out(&self, job_id: Uuid, cleaner_id: &str) -> Result<DepartureOutcome, Error> {
        self.depart(job_id, cleaner_id, Departure::DroppedOut).await
    }

    /// A worker left early. Their unfinished rooms return to the pool and
    /// their slot is released (before start) or vacated (after start).
    pub async fn depart(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        departure: Departure,
    ) -> Result<DepartureOutcome, Error> {
        let record = self.record(job_id, cleaner_id).await?;
        let now = self.deps.clock.now();
        let Some(released_rooms) = self
            .deps
            .store
            .record_departure(job_id, cleaner_id, departure, now)
            .await?
        else {
            return Err(worker_transition_error(&record, departure.status().as_str()));
        };

        match departure {
            Departure::DroppedOut => {
                info!(job_id = %job_id, cleaner_id = %cleaner_id, released = released_rooms.len(), "Worker dropped out");
            }
            Departure::NoShow => {
                warn!(job_id = %job_id, cleaner_id = %cleaner_id, released = released_rooms.len(), "Worker declared no-show");
            }
        }

        let mut outcome = DepartureOutcome {
            released_rooms: released_rooms.clone(),
            ..Default::default()
        };

        match self.ledger.release_slot(job_id, cleaner_id).await? {
            SlotRelease::Released => {
                outcome.slot_offers = self.offers.issue_offers(job_id).await?.len();
            }
            SlotRelease::Vacated if !released_rooms.is_empty() => {
                let co_workers: Vec<String> = self
                    .deps
                    .store
                    .list_completion_records(job_id)
                    .await?
                    .into_iter()
                    .filter(|r| r.cleaner_id != cleaner_id && !r.status.is_terminal())
                    .map(|r| r.cleaner_id)
                    .collect();

                if co_workers.is_empty() {
                    outcome.slot_offers = self.offers.issue_replacement_offers(job_id).await?.len();
                } else {
                    let batch = self
                        .offer_extra_work(job_id, cleaner_id, &released_rooms, co_workers)
                        .await?;
                    outcome.extra_work_offers = batch.1;
                    outcome.extra_work_batch = Some(batch.0);
                }
            }
            SlotRelease::Vacated | SlotRelease::NotHeld => {}
        }

        self.check_job_completion(job_id).await?;
        Ok(outcome)
    }

    pub async fn accept_extra_work(
        &self,
        offer_id: Uuid,
        cleaner_id: &str,
    ) -> Result<ExtraWorkOutcome, Error> {
        let offer = self.extra_offer(offer_id, cleaner_id).await?;
        let record = self.record(offer.job_id, cleaner_id).await?;
        if record.status.is_terminal() {
            return Err(ValidationError::NotPermitted(format!(
                "cleaner {cleaner_id} is {} on job {}",
                record.status, offer.job_id
            ))
            .into());
        }

        match self
            .deps
            .store
            .accept_extra_work(offer_id, self.deps.clock.now())
            .await?
        {
            ExtraWorkClaim::Won { rooms } => {
                info!(
                    job_id = %offer.job_id,
                    batch_id = %offer.batch_id,
                    cleaner_id = %cleaner_id,
                    rooms = rooms.len(),
                    "Extra work accepted"
                );
                Ok(ExtraWorkOutcome::Accepted {
                    batch_id: offer.batch_id,
                    rooms,
                })
            }
            ExtraWorkClaim::Lost => {
                debug!(batch_id = %offer.batch_id, cleaner_id = %cleaner_id, "Extra work no longer available");
                Ok(ExtraWorkOutcome::NoLongerAvailable {
                    batch_id: offer.batch_id,
                })
            }
        }
    }

    /// Turn the rooms down. When the last co-worker declines, the rooms go
    /// out to the general pool.
    pub async fn decline_extra_work(
        &self,
        offer_id: Uuid,
        cleaner_id: &str,
        reason: &str,
    ) -> Result<ExtraWorkOutcome, Error> {
        let offer = self.extra_offer(offer_id, cleaner_id).await?;
        let Some(exhausted) = self
            .deps
            .store
            .decline_extra_work(offer_id, reason, self.deps.clock.now())
            .await?
        else {
            return Ok(ExtraWorkOutcome::NoLongerAvailable {
                batch_id: offer.batch_id,
            });
        };
        info!(batch_id = %offer.batch_id, cleaner_id = %cleaner_id, %reason, "Extra work declined");

        let escalated = exhausted && self.escalate(offer.batch_id, offer.job_id).await?;
        Ok(ExtraWorkOutcome::Declined {
            batch_id: offer.batch_id,
            escalated,
        })
    }

    /// Escalate every extra-work batch nobody took within its window.
    pub async fn sweep_extra_work(&self) -> Result<usize, Error> {
        let mut escalated = 0;
        for batch in self.deps.store.due_extra_work(self.deps.clock.now()).await? {
            warn!(job_id = %batch.job_id, batch_id = %batch.id, "No co-worker took the released rooms in time");
            match self.escalate(batch.id, batch.job_id).await {
                Ok(true) => escalated += 1,
                Ok(false) => {}
                Err(e) => warn!(batch_id = %batch.id, error = %e, "Extra work escalation failed"),
            }
        }
        Ok(escalated)
    }

    /// Declare no-shows: workers still `assigned`, with no room touched,
    /// `no_show_grace` after the scheduled start.
    pub async fn sweep_no_shows(&self) -> Result<usize, Error> {
        let cutoff = self.deps.clock.now() - self.config.no_show_grace;
        let mut declared = 0;
        for record in self.deps.store.due_no_shows(cutoff).await? {
            // Late replacements get their own grace period.
            if record.created_at > cutoff {
                continue;
            }
            match self.depart(record.job_id, &record.cleaner_id, Departure::NoShow).await {
                Ok(_) => declared += 1,
                Err(Error::Validation(e)) => {
                    debug!(job_id = %record.job_id, cleaner_id = %record.cleaner_id, error = %e, "No-show already resolved");
                }
                Err(e) => warn!(job_id = %record.job_id, cleaner_id = %record.cleaner_id, error = %e, "No-show declaration failed"),
            }
        }
        Ok(declared)
    }

    /// Complete the job once every worker is terminal, at least one
    /// finished, and no extra work or replacement offer is outstanding.
    pub async fn check_job_completion(&self, job_id: Uuid) -> Result<bool, Error> {
        let job = self.ledger.load(job_id).await?;
        if job.status != JobStatus::InProgress {
            return Ok(false);
        }

        let store = &self.deps.store;
        let records = store.list_completion_records(job_id).await?;
        let all_terminal = records.iter().all(|r| r.status.is_terminal());
        let any_completed = records.iter().any(|r| r.status == CompletionStatus::Completed);
        if !all_terminal || !any_completed {
            return Ok(false);
        }
        if store.count_open_extra_work(job_id).await? > 0
            || store.count_pending_offers(job_id, None).await? > 0
        {
            debug!(job_id = %job_id, "Workers done but replacements still outstanding");
            return Ok(false);
        }

        if !self
            .ledger
            .transition(job_id, JobStatus::InProgress, JobStatus::Completed)
            .await?
        {
            return Ok(false);
        }

        if let Err(e) = self.deps.appointments.complete_appointment(&job.appointment_id).await {
            warn!(job_id = %job_id, error = %e, "Appointment completion signal failed");
        }
        if self.config.auto_settle
            && let Err(e) = self.settlement.settle(job_id).await
        {
            warn!(job_id = %job_id, error = %e, "Automatic settlement failed; settle manually");
        }
        Ok(true)
    }

    /// Catch jobs whose last worker finished while a completion check was
    /// blocked by outstanding offers.
    pub async fn reconcile(&self) -> Result<usize, Error> {
        let mut completed = 0;
        for job in self.deps.store.list_jobs_by_status(JobStatus::InProgress).await? {
            match self.check_job_completion(job.id).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Completion check failed"),
            }
        }
        Ok(completed)
    }

    async fn offer_extra_work(
        &self,
        job_id: Uuid,
        departed: &str,
        room_ids: &[Uuid],
        co_workers: Vec<String>,
    ) -> Result<(Uuid, usize), Error> {
        let now = self.deps.clock.now();
        let earnings: Decimal = self
            .deps
            .store
            .list_rooms(job_id)
            .await?
            .iter()
            .filter(|r| room_ids.contains(&r.id))
            .map(|r| r.earnings_share)
            .sum();

        let batch = ExtraWorkBatch {
            id: Uuid::new_v4(),
            job_id,
            departed_cleaner_id: departed.to_string(),
            room_ids: room_ids.to_vec(),
            status: ExtraWorkStatus::Open,
            expires_at: now + self.config.extra_work_window,
            accepted_by: None,
            created_at: now,
            updated_at: now,
        };
        let offers: Vec<ExtraWorkOffer> = co_workers
            .into_iter()
            .map(|cleaner_id| ExtraWorkOffer {
                id: Uuid::new_v4(),
                batch_id: batch.id,
                job_id,
                cleaner_id,
                status: OfferStatus::Pending,
                earnings_offered: earnings,
                decline_reason: None,
                created_at: now,
                updated_at: now,
            })
            .collect();
        self.deps.store.insert_extra_work(&batch, &offers).await?;

        for offer in &offers {
            dispatch(
                self.deps.notifier.as_ref(),
                Notification::new(
                    NotificationKind::ExtraWorkAvailable,
                    &offer.cleaner_id,
                    job_id,
                    json!({
                        "extra_work_offer_id": offer.id,
                        "batch_id": batch.id,
                        "rooms": batch.room_ids,
                        "earnings_offered": earnings,
                        "expires_at": batch.expires_at,
                    }),
                ),
            )
            .await;
        }
        info!(job_id = %job_id, batch_id = %batch.id, offers = offers.len(), %earnings, "Extra work offered to co-workers");
        Ok((batch.id, offers.len()))
    }

    async fn escalate(&self, batch_id: Uuid, job_id: Uuid) -> Result<bool, Error> {
        if !self
            .deps
            .store
            .escalate_extra_work(batch_id, self.deps.clock.now())
            .await?
        {
            return Ok(false);
        }
        let issued = self.offers.issue_replacement_offers(job_id).await?.len();
        info!(job_id = %job_id, batch_id = %batch_id, issued, "Extra work escalated to urgent fill");
        Ok(true)
    }

    async fn ensure_started(&self, job_id: Uuid, cleaner_id: &str) -> Result<(), Error> {
        let record = self.record(job_id, cleaner_id).await?;
        if record.status == CompletionStatus::Assigned {
            self.start(job_id, cleaner_id).await?;
        } else if record.status != CompletionStatus::Started {
            return Err(worker_transition_error(&record, "working"));
        }
        Ok(())
    }

    async fn record(&self, job_id: Uuid, cleaner_id: &str) -> Result<CompletionRecord, Error> {
        self.deps
            .store
            .get_completion_record(job_id, cleaner_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("completion record", format!("{job_id}/{cleaner_id}")).into())
    }

    async fn room(&self, room_id: Uuid) -> Result<RoomAssignment, Error> {
        self.deps
            .store
            .get_room(room_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("room", room_id).into())
    }

    async fn extra_offer(&self, offer_id: Uuid, cleaner_id: &str) -> Result<ExtraWorkOffer, Error> {
        let offer = self
            .deps
            .store
            .get_extra_work_offer(offer_id)
            .await?
            .ok_or_else(|| Error::from(DatabaseError::not_found("extra work offer", offer_id)))?;
        if offer.cleaner_id != cleaner_id {
            return Err(ValidationError::NotPermitted(format!(
                "extra work offer {offer_id} was not extended to cleaner {cleaner_id}"
            ))
            .into());
        }
        Ok(offer)
    }
}

fn worker_transition_error(record: &CompletionRecord, target: &str) -> Error {
    ValidationError::InvalidTransition {
        entity: "worker",
        id: record.job_id,
        state: format!("{} ({})", record.status, record.cleaner_id),
        target: target.to_string(),
    }
    .into()
}
