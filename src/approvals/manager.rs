//! JoinApprovalManager — the requester-approval side channel for
//! non-preferred cleaners on restricted jobs.
//!
//! An undecided request is approved when its window runs out: silence from
//! the requester means access, not denial.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approvals::model::{ApprovalOutcome, JoinRequest, JoinRequestStatus};
use crate::config::EngineConfig;
use crate::engine::EngineDeps;
use crate::error::{DatabaseError, Error, ValidationError};
use crate::jobs::ledger::SlotLedger;
use crate::jobs::model::JobStatus;
use crate::notify::{Notification, NotificationKind, dispatch};
use crate::offers::manager::OfferManager;

pub struct JoinApprovalManager {
    config: EngineConfig,
    deps: EngineDeps,
    ledger: Arc<SlotLedger>,
    offers: Arc<OfferManager>,
}

impl JoinApprovalManager {
    pub fn new(
        config: EngineConfig,
        deps: EngineDeps,
        ledger: Arc<SlotLedger>,
        offers: Arc<OfferManager>,
    ) -> Self {
        Self {
            config,
            deps,
            ledger,
            offers,
        }
    }

    /// A non-preferred cleaner asks for a slot. The job's requester has
    /// `approval_window` to answer.
    pub async fn request(&self, job_id: Uuid, cleaner_id: &str) -> Result<JoinRequest, Error> {
        let job = self.ledger.load(job_id).await?;
        if job.status != JobStatus::Open {
            return Err(ValidationError::InvalidTransition {
                entity: "job",
                id: job_id,
                state: job.status.to_string(),
                target: "join request".into(),
            }
            .into());
        }
        if !job.restrict_to_preferred {
            return Err(not_permitted("job is open to every cleaner; join requests are not needed"));
        }
        if job.is_preferred(cleaner_id) {
            return Err(not_permitted("preferred cleaners are invited directly"));
        }
        let holds_slot = self
            .deps
            .store
            .list_slot_holders(job_id)
            .await?
            .iter()
            .any(|h| h.cleaner_id == cleaner_id);
        if holds_slot {
            return Err(not_permitted("cleaner already holds a slot on this job"));
        }

        let now = self.deps.clock.now();
        let request = JoinRequest::new(
            job_id,
            cleaner_id,
            &job.requester_id,
            now + self.config.approval_window,
            now,
        );
        if !self.deps.store.insert_join_request(&request).await? {
            return Err(not_permitted("cleaner already has a pending join request"));
        }

        dispatch(
            self.deps.notifier.as_ref(),
            Notification::new(
                NotificationKind::JoinRequestPending,
                &job.requester_id,
                job_id,
                json!({
                    "request_id": request.id,
                    "cleaner_id": cleaner_id,
                    "expires_at": request.expires_at,
                }),
            ),
        )
        .await;
        info!(job_id = %job_id, request_id = %request.id, cleaner_id = %cleaner_id, "Join request pending");
        Ok(request)
    }

    pub async fn approve(&self, request_id: Uuid, requester_id: &str) -> Result<ApprovalOutcome, Error> {
        let request = self.load(request_id).await?;
        ensure_requester(&request, requester_id)?;
        self.grant(&request, JoinRequestStatus::Approved).await
    }

    pub async fn decline(
        &self,
        request_id: Uuid,
        requester_id: &str,
        reason: Option<&str>,
    ) -> Result<ApprovalOutcome, Error> {
        let request = self.load(request_id).await?;
        ensure_requester(&request, requester_id)?;

        let declined = self
            .deps
            .store
            .transition_join_request(
                request_id,
                JoinRequestStatus::Pending,
                JoinRequestStatus::Declined,
                reason,
                self.deps.clock.now(),
            )
            .await?;
        if !declined {
            return Ok(ApprovalOutcome::NoLongerPending {
                request_id,
                status: self.load(request_id).await?.status,
            });
        }

        self.notify_cleaner(&request, JoinRequestStatus::Declined).await;
        info!(job_id = %request.job_id, request_id = %request_id, ?reason, "Join request declined");
        Ok(ApprovalOutcome::Declined { request_id })
    }

    /// Auto-approve every request whose window passed without a decision.
    pub async fn sweep_auto_approve(&self) -> Result<usize, Error> {
        let due = self.deps.store.due_join_requests(self.deps.clock.now()).await?;
        let mut granted = 0;
        for request in due {
            warn!(
                job_id = %request.job_id,
                request_id = %request.id,
                cleaner_id = %request.cleaner_id,
                "No decision on join request; approving by default"
            );
            match self.grant(&request, JoinRequestStatus::AutoApproved).await {
                Ok(ApprovalOutcome::Approved { .. }) => granted += 1,
                Ok(_) => {}
                Err(e) => warn!(request_id = %request.id, error = %e, "Auto-approval failed"),
            }
        }
        Ok(granted)
    }

    /// Approve (explicitly or by default) and claim the slot. The claim and
    /// the request's single `pending -> X` transition commit together, so a
    /// request is never approved without a slot.
    async fn grant(&self, request: &JoinRequest, to: JoinRequestStatus) -> Result<ApprovalOutcome, Error> {
        let Some(claim) = self.ledger.claim_for_join_request(request, to).await? else {
            return Ok(ApprovalOutcome::NoLongerPending {
                request_id: request.id,
                status: self.load(request.id).await?.status,
            });
        };

        match claim {
            Ok(claimed) => {
                self.offers.seat(&claimed).await?;
                self.notify_cleaner(request, to).await;
                info!(job_id = %request.job_id, request_id = %request.id, status = %to, "Join request granted");
                Ok(ApprovalOutcome::Approved {
                    request_id: request.id,
                    status: to,
                    job_filled: claimed.filled,
                })
            }
            Err(_) => {
                self.notify_cleaner(request, JoinRequestStatus::Expired).await;
                info!(job_id = %request.job_id, request_id = %request.id, "Join request approved but no slot left");
                Ok(ApprovalOutcome::SlotUnavailable {
                    request_id: request.id,
                })
            }
        }
    }

    async fn notify_cleaner(&self, request: &JoinRequest, status: JoinRequestStatus) {
        dispatch(
            self.deps.notifier.as_ref(),
            Notification::new(
                NotificationKind::JoinRequestResolved,
                &request.cleaner_id,
                request.job_id,
                json!({ "request_id": request.id, "status": status }),
            ),
        )
        .await;
    }

    async fn load(&self, request_id: Uuid) -> Result<JoinRequest, Error> {
        self.deps
            .store
            .get_join_request(request_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("join request", request_id).into())
    }
}

fn not_permitted(reason: &str) -> Error {
    ValidationError::NotPermitted(reason.to_string()).into()
}

fn ensure_requester(request: &JoinRequest, requester_id: &str) -> Result<(), Error> {
    if request.requester_id == requester_id {
        Ok(())
    } else {
        Err(ValidationError::NotPermitted(format!(
            "only {} may decide join request {}",
            request.requester_id, request.id
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::jobs::model::Job;
    use crate::test_support::{TestEngine, new_job};

    async fn restricted(t: &TestEngine) -> Job {
        let mut input = new_job(2, dec!(200.00), Duration::days(3));
        input.restrict_to_preferred = true;
        input.preferred_cleaners = vec!["p1".into(), "p2".into()];
        t.register(input).await
    }

    #[tokio::test]
    async fn approve_claims_slot() {
        let mut t = TestEngine::new().await;
        let job = restricted(&t).await;

        let request = t.engine.approvals().request(job.id, "x1").await.unwrap();
        assert_eq!(request.status, JoinRequestStatus::Pending);
        assert!(
            t.drain()
                .iter()
                .any(|n| n.kind == NotificationKind::JoinRequestPending && n.recipient == "home-1")
        );

        let outcome = t.engine.approvals().approve(request.id, "home-1").await.unwrap();
        assert_eq!(
            outcome,
            ApprovalOutcome::Approved {
                request_id: request.id,
                status: JoinRequestStatus::Approved,
                job_filled: false
            }
        );
        assert_eq!(t.engine.ledger().load(job.id).await.unwrap().confirmed_count, 1);
        assert!(
            t.store
                .get_completion_record(job.id, "x1")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn only_requester_decides() {
        let t = TestEngine::new().await;
        let job = restricted(&t).await;
        let request = t.engine.approvals().request(job.id, "x1").await.unwrap();

        let err = t.engine.approvals().approve(request.id, "someone-else").await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::NotPermitted(_))));
    }

    #[tokio::test]
    async fn request_rules() {
        let t = TestEngine::new().await;
        let job = restricted(&t).await;

        assert!(t.engine.approvals().request(job.id, "p1").await.is_err());
        t.engine.approvals().request(job.id, "x1").await.unwrap();
        assert!(t.engine.approvals().request(job.id, "x1").await.is_err());

        let open = t.register(new_job(2, dec!(200.00), Duration::days(3))).await;
        assert!(t.engine.approvals().request(open.id, "x1").await.is_err());
    }

    #[tokio::test]
    async fn decline_is_terminal() {
        let t = TestEngine::new().await;
        let job = restricted(&t).await;
        let request = t.engine.approvals().request(job.id, "x1").await.unwrap();

        let outcome = t
            .engine
            .approvals()
            .decline(request.id, "home-1", Some("prefer regulars"))
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::Declined { request_id: request.id });

        let again = t.engine.approvals().approve(request.id, "home-1").await.unwrap();
        assert_eq!(
            again,
            ApprovalOutcome::NoLongerPending {
                request_id: request.id,
                status: JoinRequestStatus::Declined
            }
        );
        assert_eq!(t.engine.ledger().load(job.id).await.unwrap().confirmed_count, 0);
    }

    #[tokio::test]
    async fn silence_means_access() {
        let t = TestEngine::new().await;
        let job = restricted(&t).await;
        let request = t.engine.approvals().request(job.id, "x1").await.unwrap();

        assert_eq!(t.engine.approvals().sweep_auto_approve().await.unwrap(), 0);
        t.clock.advance(t.engine.config().approval_window);
        assert_eq!(t.engine.approvals().sweep_auto_approve().await.unwrap(), 1);
        assert_eq!(t.engine.approvals().sweep_auto_approve().await.unwrap(), 0);

        let stored = t.store.get_join_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JoinRequestStatus::AutoApproved);
        assert_eq!(t.engine.ledger().load(job.id).await.unwrap().confirmed_count, 1);
    }

    #[tokio::test]
    async fn filling_the_job_expires_pending_requests() {
        let t = TestEngine::new().await;
        let job = restricted(&t).await;
        let request = t.engine.approvals().request(job.id, "x1").await.unwrap();
        t.staff(&job, &["p1", "p2"]).await;

        let stored = t.store.get_join_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JoinRequestStatus::Expired);
        assert_eq!(stored.decline_reason.as_deref(), Some("job_filled"));
        assert_eq!(t.store.count_pending_join_requests(job.id).await.unwrap(), 0);

        let outcome = t.engine.approvals().approve(request.id, "home-1").await.unwrap();
        assert_eq!(
            outcome,
            ApprovalOutcome::NoLongerPending {
                request_id: request.id,
                status: JoinRequestStatus::Expired
            }
        );
    }

    #[tokio::test]
    async fn approval_without_a_free_slot_expires_once() {
        let t = TestEngine::new().await;
        let job = restricted(&t).await;
        let request = t.engine.approvals().request(job.id, "x1").await.unwrap();
        // Slots taken without the fill bookkeeping, so the request is still pending.
        for cleaner in ["p1", "p2"] {
            t.engine.ledger().claim_slot(job.id, cleaner).await.unwrap().unwrap();
        }

        let outcome = t.engine.approvals().approve(request.id, "home-1").await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::SlotUnavailable { request_id: request.id });

        let stored = t.store.get_join_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JoinRequestStatus::Expired);
        assert_eq!(stored.decline_reason.as_deref(), Some("slot_unavailable"));
        assert!(t.store.get_completion_record(job.id, "x1").await.unwrap().is_none());
        assert_eq!(t.engine.ledger().load(job.id).await.unwrap().confirmed_count, 2);
    }

    #[tokio::test]
    async fn grant_commits_slot_record_and_status_together() {
        let t = TestEngine::new().await;
        let job = restricted(&t).await;
        let request = t.engine.approvals().request(job.id, "x1").await.unwrap();

        // Only the committed grant, as if the follow-up bookkeeping had failed.
        let claimed = t
            .engine
            .ledger()
            .claim_for_join_request(&request, JoinRequestStatus::Approved)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(claimed.confirmed_count, 1);

        let stored = t.store.get_join_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JoinRequestStatus::Approved);
        let holders = t.store.list_slot_holders(job.id).await.unwrap();
        assert!(holders.iter().any(|h| h.cleaner_id == "x1" && !h.vacated));
        assert!(t.store.get_completion_record(job.id, "x1").await.unwrap().is_some());

        // A second grant finds nothing pending and claims nothing.
        let again = t
            .engine
            .ledger()
            .claim_for_join_request(&request, JoinRequestStatus::AutoApproved)
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(t.engine.ledger().load(job.id).await.unwrap().confirmed_count, 1);
    }

    #[tokio::test]
    async fn cancelling_the_job_cancels_pending_requests() {
        let t = TestEngine::new().await;
        let job = restricted(&t).await;
        let request = t.engine.approvals().request(job.id, "x1").await.unwrap();

        let summary = t.engine.edge_cases().cancel_job(job.id, "plans changed").await.unwrap();
        assert_eq!(summary.join_requests_cancelled, 1);
        let stored = t.store.get_join_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JoinRequestStatus::Cancelled);
        assert_eq!(t.store.count_pending_join_requests(job.id).await.unwrap(), 0);

        t.clock.advance(t.engine.config().approval_window);
        assert_eq!(t.engine.approvals().sweep_auto_approve().await.unwrap(), 0);
        assert_eq!(t.engine.ledger().load(job.id).await.unwrap().confirmed_count, 0);
    }
}
