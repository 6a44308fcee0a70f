//! EdgeCaseResolver — go/no-go decisions for jobs still short of cleaners
//! close to their start.
//!
//! When the requester does not answer in time the job proceeds with whoever
//! is confirmed; it is cancelled only if nobody is.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::edge_case::model::{DecisionOutcome, DecisionStatus, EdgeCaseChoice, EdgeCaseDecision};
use crate::engine::EngineDeps;
use crate::error::{DatabaseError, Error, ValidationError};
use crate::jobs::ledger::SlotLedger;
use crate::jobs::model::{CancelSummary, JobStatus};
use crate::notify::{Notification, NotificationKind, dispatch};
use crate::rooms::partitioner::WorkPartitioner;

pub struct EdgeCaseResolver {
    config: EngineConfig,
    deps: EngineDeps,
    ledger: Arc<SlotLedger>,
    partitioner: Arc<WorkPartitioner>,
}

impl EdgeCaseResolver {
    pub fn new(
        config: EngineConfig,
        deps: EngineDeps,
        ledger: Arc<SlotLedger>,
        partitioner: Arc<WorkPartitioner>,
    ) -> Self {
        Self {
            config,
            deps,
            ledger,
            partitioner,
        }
    }

    /// Escalate open jobs inside the lead window that are short of cleaners
    /// and have nothing outstanding that could still fill them.
    pub async fn detect(&self) -> Result<Vec<EdgeCaseDecision>, Error> {
        let now = self.deps.clock.now();
        let store = &self.deps.store;
        let mut raised = Vec::new();

        for job in store.list_jobs_by_status(JobStatus::Open).await? {
            if job.scheduled_start - now > self.config.edge_case_lead || job.open_slots() == 0 {
                continue;
            }
            if store.count_pending_offers(job.id, None).await? > 0
                || store.count_pending_join_requests(job.id).await? > 0
            {
                continue;
            }
            if !self
                .ledger
                .transition(job.id, JobStatus::Open, JobStatus::EdgeCase)
                .await?
            {
                continue;
            }

            let expires_at = (now + self.config.edge_case_decision_window)
                .min(job.scheduled_start)
                .max(now);
            let decision = EdgeCaseDecision::new(
                job.id,
                &job.requester_id,
                job.confirmed_count,
                job.total_required,
                expires_at,
                now,
            );
            if !store.insert_decision(&decision).await? {
                continue;
            }

            let default = if job.confirmed_count > 0 { "proceed" } else { "cancel" };
            dispatch(
                self.deps.notifier.as_ref(),
                Notification::new(
                    NotificationKind::EdgeCaseDecisionNeeded,
                    &job.requester_id,
                    job.id,
                    json!({
                        "decision_id": decision.id,
                        "confirmed_count": job.confirmed_count,
                        "total_required": job.total_required,
                        "scheduled_start": job.scheduled_start,
                        "expires_at": expires_at,
                        "default": default,
                    }),
                ),
            )
            .await;
            warn!(
                job_id = %job.id,
                decision_id = %decision.id,
                confirmed = job.confirmed_count,
                total = job.total_required,
                "Job understaffed near start; asking requester"
            );
            raised.push(decision);
        }
        Ok(raised)
    }

    /// The requester's go/no-go answer.
    pub async fn decide(
        &self,
        decision_id: Uuid,
        requester_id: &str,
        choice: EdgeCaseChoice,
    ) -> Result<DecisionOutcome, Error> {
        let decision = self.load(decision_id).await?;
        if decision.requester_id != requester_id {
            return Err(ValidationError::NotPermitted(format!(
                "only {} may decide on job {}",
                decision.requester_id, decision.job_id
            ))
            .into());
        }

        let status = match choice {
            EdgeCaseChoice::Proceed => {
                let job = self.ledger.load(decision.job_id).await?;
                if decision.status == DecisionStatus::Pending && job.confirmed_count == 0 {
                    return Err(ValidationError::NotPermitted(
                        "nobody is confirmed; the job can only be cancelled".into(),
                    )
                    .into());
                }
                DecisionStatus::Proceed
            }
            EdgeCaseChoice::Cancel => DecisionStatus::Cancel,
        };
        self.apply(&decision, status).await
    }

    /// Resolve every decision whose deadline passed.
    pub async fn sweep_timeouts(&self) -> Result<usize, Error> {
        let due = self.deps.store.due_decisions(self.deps.clock.now()).await?;
        let mut resolved = 0;
        for decision in due {
            let job = match self.ledger.load(decision.job_id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(decision_id = %decision.id, error = %e, "Decision timeout skipped");
                    continue;
                }
            };
            let status = if job.confirmed_count > 0 {
                DecisionStatus::AutoProceeded
            } else {
                DecisionStatus::AutoCancelled
            };
            warn!(job_id = %job.id, decision_id = %decision.id, %status, "No go/no-go answer; applying default");

            match self.apply(&decision, status).await {
                Ok(DecisionOutcome::NoLongerPending { .. }) => {}
                Ok(_) => resolved += 1,
                Err(e) => warn!(decision_id = %decision.id, error = %e, "Decision timeout failed"),
            }
        }
        Ok(resolved)
    }

    /// Cancel a job from any non-terminal status, telling the booking side
    /// and everyone who held a slot.
    pub async fn cancel_job(&self, job_id: Uuid, reason: &str) -> Result<CancelSummary, Error> {
        let job = self.ledger.load(job_id).await?;
        let Some(summary) = self.ledger.cancel(job_id).await? else {
            return Err(ValidationError::InvalidTransition {
                entity: "job",
                id: job_id,
                state: job.status.to_string(),
                target: JobStatus::Cancelled.to_string(),
            }
            .into());
        };

        if let Err(e) = self
            .deps
            .appointments
            .cancel_appointment(&job.appointment_id, reason)
            .await
        {
            warn!(job_id = %job_id, error = %e, "Appointment cancellation signal failed");
        }

        let recipients = std::iter::once(job.requester_id.clone()).chain(summary.slots_released.iter().cloned());
        for recipient in recipients {
            dispatch(
                self.deps.notifier.as_ref(),
                Notification::new(
                    NotificationKind::JobCancelled,
                    recipient,
                    job_id,
                    json!({ "reason": reason }),
                ),
            )
            .await;
        }
        info!(job_id = %job_id, %reason, "Job cancelled and appointment notified");
        Ok(summary)
    }

    async fn apply(&self, decision: &EdgeCaseDecision, status: DecisionStatus) -> Result<DecisionOutcome, Error> {
        let resolved = self
            .deps
            .store
            .resolve_decision(decision.id, status, self.deps.clock.now())
            .await?;
        if !resolved {
            return Ok(DecisionOutcome::NoLongerPending {
                decision_id: decision.id,
                status: self.load(decision.id).await?.status,
            });
        }

        match status {
            DecisionStatus::Proceed | DecisionStatus::AutoProceeded => {
                if let Some(total_required) = self.ledger.shrink(decision.job_id).await? {
                    let assigned = self.partitioner.repartition(decision.job_id).await?;
                    info!(job_id = %decision.job_id, total_required, assigned, "Job proceeding short-staffed");
                    return Ok(DecisionOutcome::Proceeded {
                        decision_id: decision.id,
                        status,
                        total_required,
                    });
                }
                // Nobody left to proceed with.
                let summary = self.cancel_job(decision.job_id, "understaffed").await?;
                Ok(DecisionOutcome::Cancelled {
                    decision_id: decision.id,
                    status,
                    summary,
                })
            }
            _ => {
                let summary = self.cancel_job(decision.job_id, "understaffed").await?;
                Ok(DecisionOutcome::Cancelled {
                    decision_id: decision.id,
                    status,
                    summary,
                })
            }
        }
    }

    async fn load(&self, decision_id: Uuid) -> Result<EdgeCaseDecision, Error> {
        self.deps
            .store
            .get_decision(decision_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("decision", decision_id).into())
    }
}
