//! SettlementService — persists calculator output as append-only lines and
//! hands payment intents to the executor.
//!
//! Re-running settlement for a job compares the fresh computation against
//! the lines currently in force. Identical lines are left alone; anything
//! that differs gets a correction line pointing at the one it supersedes,
//! and the intent carries only the difference.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::completion::model::CompletionStatus;
use crate::config::PricingSnapshot;
use crate::engine::EngineDeps;
use crate::error::{DatabaseError, Error, IntegrityError, ValidationError};
use crate::jobs::model::{Job, JobStatus};
use crate::rooms::model::RoomStatus;
use crate::settlement::calculator::settle;
use crate::settlement::model::{
    LineDraft, LineKind, PaymentIntent, SettlementInput, SettlementLine, SettlementReport,
    SettlementState, WorkerInput, active_lines,
};

const REVERSAL_REASON: &str = "reversed: recipient no longer entitled";

pub struct SettlementService {
    deps: EngineDeps,
    pricing: PricingSnapshot,
}

impl SettlementService {
    pub fn new(deps: EngineDeps, pricing: PricingSnapshot) -> Self {
        Self { deps, pricing }
    }

    /// The snapshot new jobs are settled under.
    pub fn pricing(&self) -> &PricingSnapshot {
        &self.pricing
    }

    /// Settle a completed job. Safe to call any number of times.
    pub async fn settle(&self, job_id: Uuid) -> Result<SettlementReport, Error> {
        let store = &self.deps.store;
        let job = store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("job", job_id))?;
        if job.status != JobStatus::Completed {
            return Err(ValidationError::InvalidTransition {
                entity: "job",
                id: job_id,
                state: job.status.to_string(),
                target: "settled".into(),
            }
            .into());
        }

        let now = self.deps.clock.now();
        let pricing = store.pin_job_pricing(job_id, &self.pricing, now).await?;
        let input = self.input(&job).await?;
        let computation = settle(&input, &pricing)?;

        let existing = store.list_settlement_lines(job_id).await?;
        let (lines, intents) = diff(job_id, &existing, computation.lines, &pricing.version, now);

        let state = if lines.is_empty() {
            SettlementState::Unchanged
        } else {
            if !store
                .append_settlement(job_id, existing.len(), &lines, &intents, now)
                .await?
            {
                let conflict = IntegrityError::SettlementConflict {
                    job_id,
                    reason: "lines were appended while this run was computing".into(),
                };
                error!(job_id = %job_id, error = %conflict, "Settlement aborted");
                return Err(conflict.into());
            }
            if existing.is_empty() {
                SettlementState::Created
            } else {
                SettlementState::Corrected
            }
        };

        let intents_submitted = self.submit_pending(job_id).await?;
        let all = store.list_settlement_lines(job_id).await?;
        info!(
            job_id = %job_id,
            ?state,
            appended = lines.len(),
            intents_submitted,
            unallocated = %computation.unallocated,
            pricing_version = %pricing.version,
            "Job settled"
        );

        Ok(SettlementReport {
            job_id,
            state,
            lines: active_lines(&all),
            appended: lines.len(),
            intents_submitted,
            unallocated: computation.unallocated,
            pricing_version: pricing.version,
        })
    }

    async fn input(&self, job: &Job) -> Result<SettlementInput, Error> {
        let store = &self.deps.store;
        let rooms = store.list_rooms(job.id).await?;
        let mut workers = Vec::new();

        for record in store.list_completion_records(job.id).await? {
            let completed_shares = rooms
                .iter()
                .filter(|r| r.is_owned_by(&record.cleaner_id) && r.status == RoomStatus::Completed)
                .map(|r| r.earnings_share)
                .collect();
            let loyalty_tier = if record.status == CompletionStatus::Completed {
                self.deps.directory.loyalty_tier(&record.cleaner_id).await?
            } else {
                None
            };
            workers.push(WorkerInput {
                cleaner_id: record.cleaner_id,
                status: record.status,
                completed_shares,
                released_rooms: record.released_rooms,
                loyalty_tier,
            });
        }

        Ok(SettlementInput {
            job_id: job.id,
            relationship: job.relationship,
            business_owner_id: job.business_owner_id.clone(),
            room_pool: rooms.iter().map(|r| r.earnings_share).sum(),
            workers,
        })
    }

    /// Hand every unsubmitted intent to the executor, oldest first. Stops at
    /// the first failure so intents reach the executor in order.
    async fn submit_pending(&self, job_id: Uuid) -> Result<usize, Error> {
        let mut submitted = 0;
        for intent in self.deps.store.list_unsubmitted_intents(job_id).await? {
            if let Err(e) = self.deps.payments.submit(&intent).await {
                warn!(
                    job_id = %job_id,
                    line_id = %intent.line_id,
                    error = %e,
                    "Payment intent not accepted; will retry on next settlement"
                );
                break;
            }
            self.deps
                .store
                .mark_intent_submitted(intent.line_id, self.deps.clock.now())
                .await?;
            submitted += 1;
        }
        Ok(submitted)
    }
}

/// Lines to append and their intents, given what is already in force.
fn diff(
    job_id: Uuid,
    existing: &[SettlementLine],
    drafts: Vec<LineDraft>,
    pricing_version: &str,
    now: DateTime<Utc>,
) -> (Vec<SettlementLine>, Vec<PaymentIntent>) {
    let mut in_force: BTreeMap<(LineKind, String), SettlementLine> = active_lines(existing)
        .into_iter()
        .map(|l| ((l.kind, l.recipient_id.clone()), l))
        .collect();
    let mut lines = Vec::new();
    let mut intents = Vec::new();

    for draft in drafts {
        let previous = in_force.remove(&(draft.kind, draft.recipient_id.clone()));
        if let Some(prev) = &previous
            && draft.matches(prev)
        {
            continue;
        }
        let already_paid = previous.as_ref().map_or(Decimal::ZERO, |p| p.net);
        let line = SettlementLine::from_draft(
            job_id,
            draft,
            previous.as_ref().map(|p| p.id),
            pricing_version,
            now,
        );
        push_intent(&mut intents, &line, line.net - already_paid);
        lines.push(line);
    }

    // Recipients that dropped out of the computation are zeroed.
    for (_, prev) in in_force {
        if is_zero(&prev) {
            continue;
        }
        let reversal = SettlementLine::from_draft(
            job_id,
            LineDraft {
                recipient_id: prev.recipient_id.clone(),
                kind: prev.kind,
                gross: Decimal::ZERO,
                fee: Decimal::ZERO,
                bonus: Decimal::ZERO,
                net: Decimal::ZERO,
                adjustment_reason: Some(REVERSAL_REASON.into()),
            },
            Some(prev.id),
            pricing_version,
            now,
        );
        push_intent(&mut intents, &reversal, -prev.net);
        lines.push(reversal);
    }

    (lines, intents)
}

fn push_intent(intents: &mut Vec<PaymentIntent>, line: &SettlementLine, amount: Decimal) {
    if amount.is_zero() {
        return;
    }
    intents.push(PaymentIntent {
        line_id: line.id,
        job_id: line.job_id,
        recipient_id: line.recipient_id.clone(),
        amount,
        supersedes: line.supersedes,
    });
}

fn is_zero(line: &SettlementLine) -> bool {
    line.gross.is_zero() && line.fee.is_zero() && line.bonus.is_zero() && line.net.is_zero()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::gateway::StaticDirectory;
    use crate::notify::ChannelNotifier;
    use crate::settlement::model::PLATFORM_RECIPIENT;
    use crate::test_support::{TestEngine, full_evidence, new_job, rooms};

    /// Rooms K(120) for `a`, B(60) and L(60) for `b`; `b` drops out after
    /// finishing one room and `a` takes the other.
    async fn settled_with_partial(t: &TestEngine) -> Job {
        let job = t
            .engine
            .register_job(
                new_job(2, dec!(240.00), Duration::days(3)),
                rooms(&[("Kitchen", 60), ("Bath", 30), ("Living", 30)]),
            )
            .await
            .unwrap();
        t.staff(&job, &["a", "b"]).await;

        let owned = |cleaner: &'static str| {
            let store = t.store.clone();
            let job_id = job.id;
            async move {
                store
                    .list_rooms(job_id)
                    .await
                    .unwrap()
                    .into_iter()
                    .filter(|r| r.is_owned_by(cleaner) && r.status != RoomStatus::Completed)
                    .collect::<Vec<_>>()
            }
        };

        let b_rooms = owned("b").await;
        t.engine
            .completion()
            .complete_room(b_rooms[0].id, "b", full_evidence())
            .await
            .unwrap();
        let outcome = t.engine.completion().drop_out(job.id, "b").await.unwrap();
        let batch_id = outcome.extra_work_batch.unwrap();
        let offer = t.store.list_extra_work_offers(batch_id).await.unwrap()[0].clone();
        t.engine.completion().accept_extra_work(offer.id, "a").await.unwrap();

        for room in owned("a").await {
            t.engine
                .completion()
                .complete_room(room.id, "a", full_evidence())
                .await
                .unwrap();
        }
        t.engine.completion().mark_completed(job.id, "a").await.unwrap();
        job
    }

    fn line<'a>(report: &'a SettlementReport, recipient: &str) -> &'a SettlementLine {
        report
            .lines
            .iter()
            .find(|l| l.recipient_id == recipient)
            .unwrap()
    }

    #[tokio::test]
    async fn partial_payout_for_dropped_worker() {
        let t = TestEngine::new().await;
        let job = settled_with_partial(&t).await;

        let report = t.engine.settlement().settle(job.id).await.unwrap();
        assert_eq!(report.state, SettlementState::Unchanged);
        assert_eq!(report.unallocated, Decimal::ZERO);

        let b = line(&report, "b");
        assert_eq!(b.gross, dec!(60.00));
        assert_eq!(
            b.adjustment_reason.as_deref(),
            Some("partial_completion: 1 of 2 rooms completed before drop-out")
        );
        let a = line(&report, "a");
        assert_eq!(a.gross, dec!(180.00));
        assert!(a.adjustment_reason.is_none());

        let fee = line(&report, PLATFORM_RECIPIENT);
        assert_eq!(fee.gross, dec!(48.00));
    }

    #[tokio::test]
    async fn rerun_never_duplicates_payments() {
        let t = TestEngine::new().await;
        let job = settled_with_partial(&t).await;
        let submitted = t.gateway.intents().await.len();
        assert_eq!(submitted, 3);

        for _ in 0..3 {
            let report = t.engine.settlement().settle(job.id).await.unwrap();
            assert_eq!(report.appended, 0);
            assert_eq!(report.intents_submitted, 0);
        }
        assert_eq!(t.gateway.intents().await.len(), submitted);
        assert_eq!(t.store.list_settlement_lines(job.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unfinished_job_is_not_settled() {
        let t = TestEngine::new().await;
        let job = t.register_open_market(2).await;

        let err = t.engine.settlement().settle(job.id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::InvalidTransition { .. })));
        assert!(t.store.list_settlement_lines(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn changed_inputs_append_corrections() {
        let t = TestEngine::new().await;
        let job = settled_with_partial(&t).await;
        let first = t.store.list_settlement_lines(job.id).await.unwrap();

        // Same store, but `a` has since been recognised as gold and pricing
        // has moved on.
        let mut newer = PricingSnapshot::default();
        newer.version = "v2".into();
        newer.fees.marketplace = dec!(0.30);
        let deps = EngineDeps {
            store: t.store.clone(),
            clock: t.clock.clone(),
            notifier: Arc::new(ChannelNotifier::new().0),
            appointments: t.gateway.clone(),
            payments: t.gateway.clone(),
            directory: Arc::new(StaticDirectory::new(["a"]).with_tier("a", "gold")),
        };
        let service = SettlementService::new(deps, newer);

        let report = service.settle(job.id).await.unwrap();
        assert_eq!(report.state, SettlementState::Corrected);
        assert_eq!(report.appended, 2);
        // Pinned pricing still applies.
        assert_eq!(report.pricing_version, "builtin-v1");

        let a = line(&report, "a");
        assert_eq!(a.bonus, dec!(9.00));
        assert_eq!(a.net, dec!(153.00));
        let old_a = first.iter().find(|l| l.recipient_id == "a").unwrap();
        assert_eq!(a.supersedes, Some(old_a.id));

        let intents = t.gateway.intents().await;
        let deltas: Vec<_> = intents[3..]
            .iter()
            .map(|i| (i.recipient_id.as_str(), i.amount))
            .collect();
        assert_eq!(deltas, vec![("a", dec!(9.00)), (PLATFORM_RECIPIENT, dec!(-9.00))]);

        let all = t.store.list_settlement_lines(job.id).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(active_lines(&all).len(), 3);
    }

    #[test]
    fn diff_reverses_missing_recipients() {
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        let draft = |recipient: &str, net: Decimal| LineDraft {
            recipient_id: recipient.into(),
            kind: LineKind::Worker,
            gross: net,
            fee: Decimal::ZERO,
            bonus: Decimal::ZERO,
            net,
            adjustment_reason: None,
        };
        let (existing, _) = diff(
            job_id,
            &[],
            vec![draft("a", dec!(50)), draft("b", dec!(30))],
            "v1",
            now,
        );

        let (lines, intents) = diff(job_id, &existing, vec![draft("a", dec!(50))], "v1", now);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].recipient_id, "b");
        assert_eq!(lines[0].adjustment_reason.as_deref(), Some(REVERSAL_REASON));
        assert_eq!(intents[0].amount, dec!(-30));

        let mut all = existing.clone();
        all.extend(lines);
        let (again, _) = diff(job_id, &all, vec![draft("a", dec!(50))], "v1", now);
        assert!(again.is_empty());
    }
}
