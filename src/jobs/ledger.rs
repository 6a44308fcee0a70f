//! SlotLedger — the only path through which slots are consumed or freed.
//!
//! Claims are a single compare-and-increment in the store; the ledger
//! re-reads the job afterwards and refuses to continue if the count
//! invariants no longer hold.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::approvals::model::{JoinRequest, JoinRequestStatus};
use crate::clock::Clock;
use crate::completion::model::CompletionRecord;
use crate::error::{DatabaseError, Error, ValidationError};
use crate::jobs::model::{CancelSummary, ClaimResult, Job, JobStatus, SlotRelease};
use crate::store::Database;

/// A slot now held by the cleaner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotClaimed {
    pub job_id: Uuid,
    pub cleaner_id: String,
    pub confirmed_count: u32,
    pub total_required: u32,
    /// This claim took the last slot.
    pub filled: bool,
    /// Set when the claim took over a slot vacated by a drop-out.
    pub replaced_cleaner_id: Option<String>,
}

/// The claim lost: no slot was available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotUnavailable {
    pub job_id: Uuid,
    pub confirmed_count: u32,
    pub total_required: u32,
    /// The cleaner already holds (or walked away from) a slot on this job.
    pub already_held: bool,
}

pub struct SlotLedger {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
}

impl SlotLedger {
    pub fn new(store: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Atomically claim one slot for `cleaner_id`.
    ///
    /// Exactly one of any number of concurrent callers wins the last slot;
    /// the rest get `SlotUnavailable`. Filling the last slot moves the job
    /// to `filled`.
    pub async fn claim_slot(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
    ) -> Result<Result<SlotClaimed, SlotUnavailable>, Error> {
        let now = self.clock.now();
        let result = self.store.claim_slot(job_id, cleaner_id, now).await?;
        self.settle_claim(job_id, cleaner_id, result).await
    }

    /// Claim a slot for an approved join request. The claim, the request's
    /// resolution and the cleaner's completion record commit together.
    /// `None` when the request was already resolved.
    pub async fn claim_for_join_request(
        &self,
        request: &JoinRequest,
        to: JoinRequestStatus,
    ) -> Result<Option<Result<SlotClaimed, SlotUnavailable>>, Error> {
        let now = self.clock.now();
        let record = CompletionRecord::assigned(request.job_id, &request.cleaner_id, now);
        let Some(result) = self
            .store
            .grant_join_request(request.id, to, &record, now)
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(
            self.settle_claim(request.job_id, &request.cleaner_id, result)
                .await?,
        ))
    }

    async fn settle_claim(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        result: ClaimResult,
    ) -> Result<Result<SlotClaimed, SlotUnavailable>, Error> {
        let outcome = match result {
            ClaimResult::Claimed {
                confirmed_count,
                total_required,
                filled,
            } => Ok(SlotClaimed {
                job_id,
                cleaner_id: cleaner_id.to_string(),
                confirmed_count,
                total_required,
                filled,
                replaced_cleaner_id: None,
            }),
            ClaimResult::TookOver {
                previous_cleaner_id,
            } => {
                let job = self.load(job_id).await?;
                Ok(SlotClaimed {
                    job_id,
                    cleaner_id: cleaner_id.to_string(),
                    confirmed_count: job.confirmed_count,
                    total_required: job.total_required,
                    filled: false,
                    replaced_cleaner_id: Some(previous_cleaner_id),
                })
            }
            ClaimResult::AlreadyHeld => {
                let job = self.load(job_id).await?;
                Err(SlotUnavailable {
                    job_id,
                    confirmed_count: job.confirmed_count,
                    total_required: job.total_required,
                    already_held: true,
                })
            }
            ClaimResult::Unavailable {
                confirmed_count,
                total_required,
            } => Err(SlotUnavailable {
                job_id,
                confirmed_count,
                total_required,
                already_held: false,
            }),
        };

        match &outcome {
            Ok(claimed) => {
                self.verify(job_id).await?;
                info!(
                    job_id = %job_id,
                    cleaner_id = %cleaner_id,
                    confirmed = claimed.confirmed_count,
                    total = claimed.total_required,
                    filled = claimed.filled,
                    replaced = ?claimed.replaced_cleaner_id,
                    "Slot claimed"
                );
            }
            Err(unavailable) => {
                debug!(
                    job_id = %job_id,
                    cleaner_id = %cleaner_id,
                    confirmed = unavailable.confirmed_count,
                    total = unavailable.total_required,
                    already_held = unavailable.already_held,
                    "Slot claim lost"
                );
            }
        }

        Ok(outcome)
    }

    /// Undo a claim whose follow-up step lost a race.
    pub async fn revert(&self, claimed: &SlotClaimed) -> Result<SlotRelease, Error> {
        let raw = match &claimed.replaced_cleaner_id {
            Some(previous) => ClaimResult::TookOver {
                previous_cleaner_id: previous.clone(),
            },
            None => ClaimResult::Claimed {
                confirmed_count: claimed.confirmed_count,
                total_required: claimed.total_required,
                filled: claimed.filled,
            },
        };
        let released = self
            .store
            .revert_claim(claimed.job_id, &claimed.cleaner_id, &raw, self.clock.now())
            .await?;
        debug!(job_id = %claimed.job_id, cleaner_id = %claimed.cleaner_id, ?released, "Slot claim reverted");
        Ok(released)
    }

    /// Free the cleaner's slot. Idempotent: a second release is `NotHeld`.
    ///
    /// Before the job starts the slot returns to the pool (`filled -> open`).
    /// Once in progress the slot is only vacated, keeping the count intact
    /// until a replacement takes it over.
    pub async fn release_slot(&self, job_id: Uuid, cleaner_id: &str) -> Result<SlotRelease, Error> {
        let released = self
            .store
            .release_slot(job_id, cleaner_id, self.clock.now())
            .await?;

        if released != SlotRelease::NotHeld {
            self.verify(job_id).await?;
            info!(job_id = %job_id, cleaner_id = %cleaner_id, ?released, "Slot released");
        }
        Ok(released)
    }

    /// Conditional job transition. Returns false when the job was no longer
    /// in `from` (or lacked full staffing for `filled`/`in_progress`).
    pub async fn transition(&self, job_id: Uuid, from: JobStatus, to: JobStatus) -> Result<bool, Error> {
        if !from.can_transition_to(to) {
            return Err(ValidationError::InvalidTransition {
                entity: "job",
                id: job_id,
                state: from.to_string(),
                target: to.to_string(),
            }
            .into());
        }

        let moved = self
            .store
            .transition_job(job_id, from, to, self.clock.now())
            .await?;
        if moved {
            info!(job_id = %job_id, %from, %to, "Job status changed");
        }
        Ok(moved)
    }

    /// `filled -> in_progress`; true if the job is in progress afterwards.
    pub async fn start_job(&self, job_id: Uuid) -> Result<bool, Error> {
        if self.transition(job_id, JobStatus::Filled, JobStatus::InProgress).await? {
            return Ok(true);
        }
        Ok(self.load(job_id).await?.status == JobStatus::InProgress)
    }

    /// Shrink an understaffed job to its confirmed headcount and mark it
    /// filled. Returns the new total, or None if nobody is confirmed.
    pub async fn shrink(&self, job_id: Uuid) -> Result<Option<u32>, Error> {
        let total = self.store.shrink_job(job_id, self.clock.now()).await?;
        if let Some(total) = total {
            self.verify(job_id).await?;
            info!(job_id = %job_id, total_required = total, "Job shrunk to confirmed cleaners");
        }
        Ok(total)
    }

    /// Cascade-cancel: releases every slot and withdraws everything pending.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Option<CancelSummary>, Error> {
        let summary = self.store.cancel_job(job_id, self.clock.now()).await?;
        if let Some(summary) = &summary {
            info!(
                job_id = %job_id,
                offers = summary.offers_withdrawn,
                join_requests = summary.join_requests_cancelled,
                slots = summary.slots_released.len(),
                "Job cancelled"
            );
        }
        Ok(summary)
    }

    pub async fn load(&self, job_id: Uuid) -> Result<Job, Error> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("job", job_id).into())
    }

    async fn verify(&self, job_id: Uuid) -> Result<(), Error> {
        let job = self.load(job_id).await?;
        if let Err(e) = job.check_invariants() {
            error!(job_id = %job_id, error = %e, "Slot invariant violated");
            return Err(e.into());
        }
        Ok(())
    }
}
