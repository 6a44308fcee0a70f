//! OfferManager — issues slot offers, resolves cleaner responses and sweeps
//! expired offers.
//!
//! Every response goes through a conditional `pending -> X` update, so an
//! offer resolves exactly once no matter how many callers race on it. Slot
//! consumption always goes through the [`SlotLedger`].

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::completion::model::CompletionRecord;
use crate::config::EngineConfig;
use crate::engine::EngineDeps;
use crate::error::{DatabaseError, Error, ValidationError};
use crate::jobs::ledger::{SlotClaimed, SlotLedger};
use crate::jobs::model::{Job, JobStatus};
use crate::notify::{Notification, NotificationKind, dispatch};
use crate::offers::model::{AcceptOutcome, DeclineOutcome, Offer, OfferStatus, OfferType};
use crate::rooms::model::RoomStatus;
use crate::rooms::partitioner::WorkPartitioner;
use crate::settlement::calculator::round_money;

/// What one expiry sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OfferSweep {
    pub expired: usize,
    pub reissued: usize,
}

pub struct OfferManager {
    config: EngineConfig,
    deps: EngineDeps,
    ledger: Arc<SlotLedger>,
    partitioner: Arc<WorkPartitioner>,
}

impl OfferManager {
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

    /// Top up pending offers on an open job.
    ///
    /// Preferred cleaners are invited first. Unrestricted jobs go to the
    /// general market once `market_delay` has passed since registration.
    /// Inside the urgent threshold every new offer is an urgent fill with
    /// the short expiry.
    pub async fn issue_offers(&self, job_id: Uuid) -> Result<Vec<Offer>, Error> {
        let job = self.ledger.load(job_id).await?;
        if job.status != JobStatus::Open {
            return Ok(Vec::new());
        }

        let pending = self.deps.store.count_pending_offers(job_id, None).await? as usize;
        let need = (job.open_slots() as usize * self.config.offer_fanout).saturating_sub(pending);
        if need == 0 {
            return Ok(Vec::new());
        }

        let now = self.deps.clock.now();
        let mut exclude = self.already_involved(&job).await?;
        let urgent = job.scheduled_start - now < self.config.urgent_threshold;

        let mut preferred: Vec<String> = job
            .preferred_cleaners
            .iter()
            .filter(|c| !exclude.contains(*c))
            .take(need)
            .cloned()
            .collect();
        exclude.extend(preferred.iter().cloned());

        let mut market = Vec::new();
        let market_open = now >= job.created_at + self.config.market_delay;
        if !job.restrict_to_preferred && preferred.len() < need && (urgent || market_open) {
            market = self
                .deps
                .directory
                .candidates(&job, &exclude, need - preferred.len())
                .await?;
        }

        let quote = job.per_slot_quote();
        let mut issued = Vec::new();
        if urgent {
            preferred.append(&mut market);
            let expires = now + self.config.urgent_offer_expiry;
            issued.extend(self.issue(&job, OfferType::UrgentFill, quote, expires, preferred).await?);
        } else {
            let expires = now + self.config.offer_expiry;
            issued.extend(self.issue(&job, OfferType::PrimaryInvite, quote, expires, preferred).await?);
            issued.extend(self.issue(&job, OfferType::MarketOpen, quote, expires, market).await?);
        }

        if !issued.is_empty() {
            info!(job_id = %job_id, issued = issued.len(), urgent, "Offers issued");
        }
        Ok(issued)
    }

    /// Urgent-fill offers for slots vacated after the job started, as long
    /// as released rooms are still unowned. The quote is the value of those
    /// rooms, split per vacated slot.
    pub async fn issue_replacement_offers(&self, job_id: Uuid) -> Result<Vec<Offer>, Error> {
        let job = self.ledger.load(job_id).await?;
        if job.status != JobStatus::InProgress {
            return Ok(Vec::new());
        }

        let vacated = self
            .deps
            .store
            .list_slot_holders(job_id)
            .await?
            .iter()
            .filter(|h| h.vacated)
            .count();
        if vacated == 0 {
            return Ok(Vec::new());
        }

        let unowned: Vec<Decimal> = self
            .deps
            .store
            .list_rooms(job_id)
            .await?
            .iter()
            .filter(|r| r.cleaner_id.is_none() && r.status == RoomStatus::Pending)
            .map(|r| r.earnings_share)
            .collect();
        if unowned.is_empty() {
            // A co-worker already took the released rooms.
            return Ok(Vec::new());
        }

        let pending = self
            .deps
            .store
            .count_pending_offers(job_id, Some(OfferType::UrgentFill))
            .await? as usize;
        let need = (vacated * self.config.offer_fanout).saturating_sub(pending);
        if need == 0 {
            return Ok(Vec::new());
        }

        let mut exclude = self.already_involved(&job).await?;
        let mut cleaners: Vec<String> = job
            .preferred_cleaners
            .iter()
            .filter(|c| !exclude.contains(*c))
            .take(need)
            .cloned()
            .collect();
        exclude.extend(cleaners.iter().cloned());
        if !job.restrict_to_preferred && cleaners.len() < need {
            cleaners.extend(
                self.deps
                    .directory
                    .candidates(&job, &exclude, need - cleaners.len())
                    .await?,
            );
        }

        let quote = round_money(unowned.iter().copied().sum::<Decimal>() / Decimal::from(vacated));
        let expires = self.deps.clock.now() + self.config.urgent_offer_expiry;
        let issued = self
            .issue(&job, OfferType::UrgentFill, quote, expires, cleaners)
            .await?;
        if !issued.is_empty() {
            info!(job_id = %job_id, issued = issued.len(), vacated, "Replacement offers issued");
        }
        Ok(issued)
    }

    /// Re-run offer logic for a job that may still be short of cleaners.
    pub async fn refill(&self, job_id: Uuid) -> Result<usize, Error> {
        let job = self.ledger.load(job_id).await?;
        match job.status {
            JobStatus::Open => Ok(self.issue_offers(job_id).await?.len()),
            JobStatus::InProgress => {
                // Co-workers get first refusal on released rooms.
                if self.deps.store.count_open_extra_work(job_id).await? > 0 {
                    return Ok(0);
                }
                Ok(self.issue_replacement_offers(job_id).await?.len())
            }
            _ => Ok(0),
        }
    }

    /// Accept an offer on behalf of its cleaner.
    ///
    /// Losing the last slot is an outcome, not an error: the offer is
    /// expired and `SlotUnavailable` comes back.
    pub async fn accept(&self, offer_id: Uuid, cleaner_id: &str) -> Result<AcceptOutcome, Error> {
        let offer = self.load(offer_id).await?;
        ensure_recipient(&offer, cleaner_id)?;

        if offer.status != OfferStatus::Pending {
            return self.not_pending(offer_id).await;
        }

        let now = self.deps.clock.now();
        if offer.is_expired(now) {
            self.deps
                .store
                .resolve_offer(offer_id, OfferStatus::Expired, Some("expired"), now)
                .await?;
            return self.not_pending(offer_id).await;
        }

        let claimed = match self.ledger.claim_slot(offer.job_id, cleaner_id).await? {
            Ok(claimed) => claimed,
            Err(unavailable) => {
                let resolved = self
                    .deps
                    .store
                    .resolve_offer(offer_id, OfferStatus::Expired, Some("slot_unavailable"), now)
                    .await?;
                if !resolved {
                    return self.not_pending(offer_id).await;
                }
                info!(
                    offer_id = %offer_id,
                    job_id = %offer.job_id,
                    cleaner_id = %cleaner_id,
                    confirmed = unavailable.confirmed_count,
                    total = unavailable.total_required,
                    "Offer lost the race for the last slot"
                );
                return Ok(AcceptOutcome::SlotUnavailable {
                    offer_id,
                    job_id: offer.job_id,
                });
            }
        };

        let resolved = self
            .deps
            .store
            .resolve_offer(offer_id, OfferStatus::Accepted, None, now)
            .await?;
        if !resolved {
            // Expired or withdrawn between the read and the claim.
            self.ledger.revert(&claimed).await?;
            return self.not_pending(offer_id).await;
        }

        self.seat(&claimed).await?;
        info!(offer_id = %offer_id, job_id = %offer.job_id, cleaner_id = %cleaner_id, "Offer accepted");

        Ok(AcceptOutcome::Accepted {
            offer_id,
            job_id: offer.job_id,
            job_filled: claimed.filled,
            replacement: claimed.replaced_cleaner_id.is_some(),
        })
    }

    pub async fn decline(
        &self,
        offer_id: Uuid,
        cleaner_id: &str,
        reason: Option<&str>,
    ) -> Result<DeclineOutcome, Error> {
        let offer = self.load(offer_id).await?;
        ensure_recipient(&offer, cleaner_id)?;

        let now = self.deps.clock.now();
        if !self
            .deps
            .store
            .resolve_offer(offer_id, OfferStatus::Declined, reason, now)
            .await?
        {
            return Ok(DeclineOutcome::NoLongerPending {
                offer_id,
                status: self.load(offer_id).await?.status,
            });
        }
        info!(offer_id = %offer_id, job_id = %offer.job_id, cleaner_id = %cleaner_id, ?reason, "Offer declined");

        let reoffered = match self.refill(offer.job_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(job_id = %offer.job_id, error = %e, "Re-offer after decline failed");
                0
            }
        };
        Ok(DeclineOutcome::Declined {
            offer_id,
            reoffered,
        })
    }

    /// Expire every overdue pending offer and re-offer on the affected
    /// jobs. Running it twice expires nothing the second time.
    pub async fn sweep_expired(&self) -> Result<OfferSweep, Error> {
        let expired = self.deps.store.expire_offers(self.deps.clock.now()).await?;
        let jobs: BTreeSet<Uuid> = expired.iter().map(|o| o.job_id).collect();

        let mut reissued = 0;
        for job_id in jobs {
            match self.refill(job_id).await {
                Ok(n) => reissued += n,
                Err(e) => warn!(job_id = %job_id, error = %e, "Re-offer after expiry failed"),
            }
        }

        if !expired.is_empty() {
            info!(expired = expired.len(), reissued, "Offer expiry sweep");
        }
        Ok(OfferSweep {
            expired: expired.len(),
            reissued,
        })
    }

    /// Top up offers on every open job. Picks up jobs whose market delay
    /// has just passed.
    pub async fn sweep_open_jobs(&self) -> Result<usize, Error> {
        let mut issued = 0;
        for job in self.deps.store.list_jobs_by_status(JobStatus::Open).await? {
            match self.issue_offers(job.id).await {
                Ok(offers) => issued += offers.len(),
                Err(e) => warn!(job_id = %job.id, error = %e, "Offer top-up failed"),
            }
        }
        Ok(issued)
    }

    /// Bookkeeping once a cleaner holds a slot: their completion record,
    /// and room hand-out when the job just filled or a replacement arrived.
    pub(crate) async fn seat(&self, claimed: &SlotClaimed) -> Result<(), Error> {
        let job_id = claimed.job_id;
        let now = self.deps.clock.now();
        self.deps
            .store
            .insert_completion_record(&CompletionRecord::assigned(job_id, &claimed.cleaner_id, now))
            .await?;

        if claimed.filled {
            let withdrawn = self.deps.store.withdraw_pending_offers(job_id, now).await?;
            let expired = self
                .deps
                .store
                .expire_pending_join_requests(job_id, "job_filled", now)
                .await?;
            debug!(job_id = %job_id, withdrawn, expired, "Outstanding offers and join requests closed on fill");

            let job = self.ledger.load(job_id).await?;
            dispatch(
                self.deps.notifier.as_ref(),
                Notification::new(
                    NotificationKind::JobFilled,
                    &job.requester_id,
                    job_id,
                    json!({ "confirmed_count": claimed.confirmed_count }),
                ),
            )
            .await;
            self.partitioner.auto_assign(job_id).await?;
        }

        if let Some(previous) = &claimed.replaced_cleaner_id {
            self.partitioner
                .assign_unowned(job_id, &claimed.cleaner_id)
                .await?;
            // The replacement took every released room; nothing is left to offer.
            self.deps.store.withdraw_pending_offers(job_id, now).await?;
            info!(job_id = %job_id, cleaner_id = %claimed.cleaner_id, replaced = %previous, "Replacement seated");
        }
        Ok(())
    }

    /// Anyone who already had a shot at this job: offered, holding a slot,
    /// asked to join, or worked on it.
    async fn already_involved(&self, job: &Job) -> Result<HashSet<String>, Error> {
        let store = &self.deps.store;
        let mut involved: HashSet<String> = store
            .list_offers(job.id)
            .await?
            .into_iter()
            .map(|o| o.cleaner_id)
            .collect();
        involved.extend(store.list_slot_holders(job.id).await?.into_iter().map(|h| h.cleaner_id));
        involved.extend(store.list_join_requests(job.id).await?.into_iter().map(|r| r.cleaner_id));
        involved.extend(
            store
                .list_completion_records(job.id)
                .await?
                .into_iter()
                .map(|r| r.cleaner_id),
        );
        Ok(involved)
    }

    async fn issue(
        &self,
        job: &Job,
        offer_type: OfferType,
        quote: Decimal,
        expires_at: chrono::DateTime<chrono::Utc>,
        cleaners: Vec<String>,
    ) -> Result<Vec<Offer>, Error> {
        let now = self.deps.clock.now();
        let mut issued = Vec::new();
        for cleaner in cleaners {
            let offer = Offer::new(job.id, cleaner, offer_type, quote, Some(expires_at), now);
            if !self.deps.store.insert_offer(&offer).await? {
                continue;
            }
            dispatch(
                self.deps.notifier.as_ref(),
                Notification::new(
                    NotificationKind::OfferIssued,
                    &offer.cleaner_id,
                    job.id,
                    json!({
                        "offer_id": offer.id,
                        "offer_type": offer_type.as_str(),
                        "earnings_offered": offer.earnings_offered,
                        "expires_at": offer.expires_at,
                        "scheduled_start": job.scheduled_start,
                    }),
                ),
            )
            .await;
            debug!(job_id = %job.id, offer_id = %offer.id, cleaner_id = %offer.cleaner_id, offer_type = offer_type.as_str(), "Offer issued");
            issued.push(offer);
        }
        Ok(issued)
    }

    /// The offer was resolved before this response landed. An offer
    /// withdrawn because the job filled reads as a lost slot race.
    async fn not_pending(&self, offer_id: Uuid) -> Result<AcceptOutcome, Error> {
        let offer = self.load(offer_id).await?;
        if offer.status == OfferStatus::Withdrawn {
            let job = self.ledger.load(offer.job_id).await?;
            if job.status.requires_full_staffing() {
                debug!(offer_id = %offer_id, job_id = %job.id, "Offer withdrawn after the job filled");
                return Ok(AcceptOutcome::SlotUnavailable {
                    offer_id,
                    job_id: job.id,
                });
            }
        }
        Ok(AcceptOutcome::NoLongerPending {
            offer_id,
            status: offer.status,
        })
    }

    async fn load(&self, offer_id: Uuid) -> Result<Offer, Error> {
        self.deps
            .store
            .get_offer(offer_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("offer", offer_id).into())
    }
}

fn ensure_recipient(offer: &Offer, cleaner_id: &str) -> Result<(), Error> {
    if offer.cleaner_id == cleaner_id {
        Ok(())
    } else {
        Err(ValidationError::NotPermitted(format!(
            "offer {} was not extended to cleaner {cleaner_id}",
            offer.id
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use futures::future::join_all;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::clock::Clock;
    use crate::test_support::{TestEngine, new_job};

    #[tokio::test]
    async fn preferred_cleaners_invited_first() {
        let mut t = TestEngine::new().await;
        let mut input = new_job(2, dec!(200.00), Duration::days(3));
        input.preferred_cleaners = vec!["p1".into(), "p2".into()];
        let job = t.register(input).await;

        let offers = t.store.list_offers(job.id).await.unwrap();
        assert_eq!(offers.len(), 2);
        assert!(offers.iter().all(|o| o.offer_type == OfferType::PrimaryInvite));
        assert!(offers.iter().all(|o| o.earnings_offered == dec!(100.00)));

        let issued = t.drain();
        assert_eq!(
            issued.iter().filter(|n| n.kind == NotificationKind::OfferIssued).count(),
            2
        );
    }

    #[tokio::test]
    async fn market_opens_after_delay() {
        let t = TestEngine::new().await;
        let job = t.register(new_job(2, dec!(200.00), Duration::days(3))).await;
        assert!(t.store.list_offers(job.id).await.unwrap().is_empty());

        t.clock.advance(t.engine.config().market_delay);
        let issued = t.engine.offers().sweep_open_jobs().await.unwrap();
        assert_eq!(issued, 2 * t.engine.config().offer_fanout);

        let offers = t.store.list_offers(job.id).await.unwrap();
        assert!(offers.iter().all(|o| o.offer_type == OfferType::MarketOpen));
    }

    #[tokio::test]
    async fn near_start_offers_are_urgent() {
        let t = TestEngine::new().await;
        let job = t.register(new_job(2, dec!(200.00), Duration::hours(3))).await;

        let offers = t.store.list_offers(job.id).await.unwrap();
        assert!(!offers.is_empty());
        assert!(offers.iter().all(|o| o.offer_type == OfferType::UrgentFill));
        let expiry = t.clock.now() + t.engine.config().urgent_offer_expiry;
        assert!(offers.iter().all(|o| o.expires_at == Some(expiry)));
    }

    #[tokio::test]
    async fn restricted_job_never_goes_to_market() {
        let t = TestEngine::new().await;
        let mut input = new_job(3, dec!(300.00), Duration::days(3));
        input.restrict_to_preferred = true;
        input.preferred_cleaners = vec!["p1".into()];
        let job = t.register(input).await;

        t.clock.advance(t.engine.config().market_delay);
        t.engine.offers().sweep_open_jobs().await.unwrap();

        let offers = t.store.list_offers(job.id).await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].cleaner_id, "p1");
    }

    #[tokio::test]
    async fn accept_fills_job_and_withdraws_the_rest() {
        let mut t = TestEngine::new().await;
        let job = t.register_open_market(2).await;
        let offers = t.store.list_offers(job.id).await.unwrap();

        let first = t.engine.offers().accept(offers[0].id, &offers[0].cleaner_id).await.unwrap();
        assert!(matches!(first, AcceptOutcome::Accepted { job_filled: false, .. }));
        let second = t.engine.offers().accept(offers[1].id, &offers[1].cleaner_id).await.unwrap();
        assert!(matches!(second, AcceptOutcome::Accepted { job_filled: true, .. }));

        let job = t.engine.ledger().load(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Filled);
        let remaining = t.store.list_offers(job.id).await.unwrap();
        assert!(remaining.iter().all(|o| o.status != OfferStatus::Pending));
        assert_eq!(t.store.list_completion_records(job.id).await.unwrap().len(), 2);
        assert!(t.drain().iter().any(|n| n.kind == NotificationKind::JobFilled));
    }

    #[tokio::test]
    async fn concurrent_accepts_on_last_slot() {
        let t = TestEngine::new().await;
        let job = t.register_open_market(2).await;
        let offers = t.store.list_offers(job.id).await.unwrap();

        let first = &offers[0];
        t.engine.offers().accept(first.id, &first.cleaner_id).await.unwrap();

        let racers = offers[1..].to_vec();
        let engine = t.engine.clone();
        let results = join_all(racers.into_iter().map(|offer| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.offers().accept(offer.id, &offer.cleaner_id).await })
        }))
        .await;

        let outcomes: Vec<AcceptOutcome> = results.into_iter().map(|r| r.unwrap().unwrap()).collect();
        let won = outcomes
            .iter()
            .filter(|o| matches!(o, AcceptOutcome::Accepted { job_filled: true, .. }))
            .count();
        let lost = outcomes
            .iter()
            .filter(|o| matches!(o, AcceptOutcome::SlotUnavailable { .. }))
            .count();
        assert_eq!(won, 1);
        assert_eq!(lost, outcomes.len() - 1);

        let job = t.engine.ledger().load(job.id).await.unwrap();
        assert_eq!(job.confirmed_count, 2);
    }

    #[tokio::test]
    async fn accept_by_other_cleaner_rejected() {
        let t = TestEngine::new().await;
        let job = t.register_open_market(2).await;
        let offer = &t.store.list_offers(job.id).await.unwrap()[0];

        let err = t.engine.offers().accept(offer.id, "intruder").await.unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::NotPermitted(_))));
    }

    #[tokio::test]
    async fn expired_offer_cannot_be_accepted() {
        let t = TestEngine::new().await;
        let job = t.register_open_market(2).await;
        let offer = t.store.list_offers(job.id).await.unwrap()[0].clone();

        t.clock.advance(t.engine.config().offer_expiry);
        let outcome = t.engine.offers().accept(offer.id, &offer.cleaner_id).await.unwrap();
        assert_eq!(
            outcome,
            AcceptOutcome::NoLongerPending {
                offer_id: offer.id,
                status: OfferStatus::Expired
            }
        );
        assert_eq!(t.engine.ledger().load(job.id).await.unwrap().confirmed_count, 0);
    }

    #[tokio::test]
    async fn decline_triggers_reoffer() {
        let t = TestEngine::new().await;
        let job = t.register_open_market(2).await;
        let before = t.store.list_offers(job.id).await.unwrap();
        let offer = &before[0];

        let outcome = t
            .engine
            .offers()
            .decline(offer.id, &offer.cleaner_id, Some("busy"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeclineOutcome::Declined {
                offer_id: offer.id,
                reoffered: 1
            }
        );

        let again = t
            .engine
            .offers()
            .decline(offer.id, &offer.cleaner_id, None)
            .await
            .unwrap();
        assert!(matches!(again, DeclineOutcome::NoLongerPending { status: OfferStatus::Declined, .. }));
    }

    #[tokio::test]
    async fn sweep_expired_is_idempotent() {
        let t = TestEngine::new().await;
        let job = t.register_open_market(2).await;
        let pending = t.store.count_pending_offers(job.id, None).await.unwrap() as usize;

        t.clock.advance(t.engine.config().offer_expiry);
        let first = t.engine.offers().sweep_expired().await.unwrap();
        assert_eq!(first.expired, pending);
        let states: Vec<(Uuid, OfferStatus)> = t
            .store
            .list_offers(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|o| (o.id, o.status))
            .collect();

        let second = t.engine.offers().sweep_expired().await.unwrap();
        assert_eq!(second.expired, 0);
        let after: Vec<(Uuid, OfferStatus)> = t
            .store
            .list_offers(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|o| (o.id, o.status))
            .collect();
        assert_eq!(states, after);
    }
}
