//! Periodic background sweeps.
//!
//! Every sweep is an independent, idempotent pass over records whose
//! deadline passed. A failing step is logged and the remaining steps still
//! run; the next tick retries it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::Error;

/// Counts from one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub offers_expired: usize,
    pub offers_reissued: usize,
    pub offers_topped_up: usize,
    pub join_requests_approved: usize,
    pub extra_work_escalated: usize,
    pub no_shows: usize,
    pub decisions_timed_out: usize,
    pub edge_cases_raised: usize,
    pub jobs_completed: usize,
    /// Steps that failed this pass.
    pub failed: Vec<&'static str>,
}

impl SweepReport {
    fn tally(&mut self, step: &'static str, result: Result<usize, Error>) -> usize {
        result.unwrap_or_else(|e| {
            warn!(step, error = %e, "Sweep step failed");
            self.failed.push(step);
            0
        })
    }
}

/// Run every sweep once.
pub async fn sweep_once(engine: &Engine) -> SweepReport {
    let mut report = SweepReport::default();

    match engine.offers().sweep_expired().await {
        Ok(sweep) => {
            report.offers_expired = sweep.expired;
            report.offers_reissued = sweep.reissued;
        }
        Err(e) => {
            report.tally("offer expiry", Err(e));
        }
    }
    report.offers_topped_up = report.tally("open job top-up", engine.offers().sweep_open_jobs().await);
    report.join_requests_approved = report.tally(
        "join request auto-approval",
        engine.approvals().sweep_auto_approve().await,
    );
    report.extra_work_escalated =
        report.tally("extra work escalation", engine.completion().sweep_extra_work().await);
    report.no_shows = report.tally("no-show declaration", engine.completion().sweep_no_shows().await);
    report.decisions_timed_out =
        report.tally("edge case timeout", engine.edge_cases().sweep_timeouts().await);
    report.edge_cases_raised = report.tally(
        "edge case detection",
        engine.edge_cases().detect().await.map(|raised| raised.len()),
    );
    report.jobs_completed = report.tally("completion reconcile", engine.completion().reconcile().await);

    if report == SweepReport::default() {
        debug!("Sweep found nothing due");
    } else {
        info!(?report, "Sweep finished");
    }
    report
}

/// Spawn a background task that sweeps on a fixed interval.
pub fn spawn_sweeper(engine: Arc<Engine>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            sweep_once(&engine).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::jobs::model::JobStatus;
    use crate::test_support::{TestEngine, new_job, rooms};

    #[tokio::test]
    async fn idle_sweep_reports_nothing() {
        let t = TestEngine::new().await;
        let report = sweep_once(&t.engine).await;
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn time_alone_resolves_understaffed_job() {
        let t = TestEngine::new().await;
        let mut input = new_job(2, dec!(200.00), ChronoDuration::days(3));
        input.restrict_to_preferred = true;
        input.preferred_cleaners = vec!["p1".into()];
        let job = t
            .engine
            .register_job(input, rooms(&[("Kitchen", 40), ("Bath", 20)]))
            .await
            .unwrap();
        t.staff(&job, &["a"]).await;

        assert_eq!(sweep_once(&t.engine).await.edge_cases_raised, 0);

        t.clock.set(job.scheduled_start - ChronoDuration::hours(40));
        let report = sweep_once(&t.engine).await;
        assert_eq!(report.edge_cases_raised, 1);

        t.clock.advance(ChronoDuration::hours(24));
        let report = sweep_once(&t.engine).await;
        assert_eq!(report.decisions_timed_out, 1);
        assert!(report.failed.is_empty());

        let job = t.engine.ledger().load(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Filled);
        assert_eq!(job.total_required, 1);

        // A second pass over the same instant changes nothing.
        assert_eq!(sweep_once(&t.engine).await, SweepReport::default());
    }

    #[tokio::test]
    async fn sweeps_expire_and_reissue_offers() {
        let t = TestEngine::new().await;
        let job = t.register_open_market(2).await;
        let issued = t.store.list_offers(job.id).await.unwrap().len();

        t.clock.advance(t.engine.config().offer_expiry);
        let report = sweep_once(&t.engine).await;
        assert_eq!(report.offers_expired, issued);
        assert_eq!(
            t.store.count_pending_offers(job.id, None).await.unwrap(),
            (2 * t.engine.config().offer_fanout) as u64
        );
    }

    #[tokio::test]
    async fn spawned_sweeper_runs_until_aborted() {
        let t = TestEngine::new().await;
        let mut input = new_job(2, dec!(200.00), ChronoDuration::days(3));
        input.restrict_to_preferred = true;
        input.preferred_cleaners = vec!["p1".into()];
        let job = t.register(input).await;
        t.clock.set(job.scheduled_start - ChronoDuration::hours(40));

        let handle = spawn_sweeper(t.engine.clone(), Duration::from_millis(10));
        let mut status = JobStatus::Open;
        for _ in 0..100 {
            status = t.engine.ledger().load(job.id).await.unwrap().status;
            if status == JobStatus::EdgeCase {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(status, JobStatus::EdgeCase);
    }
}
