//! End-to-end scenarios against an in-memory engine: staffing, races,
//! short-staffed starts, drop-outs and settlement.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use crew_engine::clock::FakeClock;
use crew_engine::completion::model::{CompletionStatus, ExtraWorkOutcome};
use crew_engine::config::{EngineConfig, PricingSnapshot};
use crew_engine::edge_case::model::DecisionStatus;
use crew_engine::gateway::{RecordingGateway, StaticDirectory};
use crew_engine::jobs::model::{Job, JobStatus, NewJob, Relationship};
use crew_engine::notify::ChannelNotifier;
use crew_engine::offers::model::{AcceptOutcome, Offer, OfferStatus};
use crew_engine::rooms::model::{RoomEvidence, RoomSpec, RoomStatus};
use crew_engine::settlement::model::{LineKind, active_lines};
use crew_engine::store::{Database, LibSqlBackend};
use crew_engine::sweeper::sweep_once;
use crew_engine::{Engine, EngineDeps};

struct Harness {
    engine: Arc<Engine>,
    store: Arc<dyn Database>,
    clock: Arc<FakeClock>,
    gateway: Arc<RecordingGateway>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).single().unwrap()
}

async fn harness() -> Harness {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let clock = Arc::new(FakeClock::new(start()));
    let gateway = Arc::new(RecordingGateway::new());
    let (notifier, mut rx) = ChannelNotifier::new();
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let deps = EngineDeps {
        store: store.clone(),
        clock: clock.clone(),
        notifier: Arc::new(notifier),
        appointments: gateway.clone(),
        payments: gateway.clone(),
        directory: Arc::new(StaticDirectory::new((1..=20).map(|i| format!("cleaner-{i}")))),
    };
    Harness {
        engine: Arc::new(Engine::new(EngineConfig::default(), PricingSnapshot::default(), deps)),
        store,
        clock,
        gateway,
    }
}

fn room(label: &str, effort: u32) -> RoomSpec {
    RoomSpec {
        label: label.into(),
        effort_minutes: effort,
        checklist_items: 3,
        photos_required: 2,
    }
}

const DONE: RoomEvidence = RoomEvidence {
    checklist_done: 3,
    photos_uploaded: 2,
};

impl Harness {
    /// A two-cleaner marketplace job four days out with four equal rooms.
    /// A restricted job reserves its slots for one favourite cleaner.
    async fn job(&self, restricted: bool) -> Job {
        let input = NewJob {
            appointment_id: format!("appt-{}", Uuid::new_v4()),
            requester_id: "household-9".into(),
            business_owner_id: None,
            relationship: Relationship::Marketplace,
            total_required: 2,
            payout_pool: dec!(200.00),
            scheduled_start: start() + Duration::days(4),
            restrict_to_preferred: restricted,
            preferred_cleaners: if restricted {
                vec!["favourite".into()]
            } else {
                Vec::new()
            },
        };
        let rooms = vec![
            room("Kitchen", 30),
            room("Bathroom", 30),
            room("Bedroom", 30),
            room("Living room", 30),
        ];
        self.engine.register_job(input, rooms).await.unwrap()
    }

    async fn pending_offers(&self, job: &Job) -> Vec<Offer> {
        self.store
            .list_offers(job.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|o| o.status == OfferStatus::Pending)
            .collect()
    }

    /// Open the market and let the first `n` offered cleaners accept.
    async fn staff(&self, job: &Job, n: usize) -> Vec<String> {
        self.clock.advance(self.engine.config().market_delay);
        sweep_once(&self.engine).await;
        let mut accepted = Vec::new();
        for offer in self.pending_offers(job).await.into_iter().take(n) {
            let outcome = self.engine.offers().accept(offer.id, &offer.cleaner_id).await.unwrap();
            assert!(matches!(outcome, AcceptOutcome::Accepted { .. }));
            accepted.push(offer.cleaner_id);
        }
        accepted
    }

    async fn finish_rooms(&self, job: &Job, cleaner: &str, limit: usize) {
        let rooms: Vec<_> = self
            .store
            .list_rooms(job.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.is_owned_by(cleaner) && r.status != RoomStatus::Completed)
            .take(limit)
            .collect();
        for r in rooms {
            self.engine.completion().complete_room(r.id, cleaner, DONE).await.unwrap();
        }
    }

    async fn load(&self, job: &Job) -> Job {
        self.store.get_job(job.id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn two_cleaners_staff_work_and_settle() {
    let h = harness().await;
    let job = h.job(false).await;

    let cleaners = h.staff(&job, 2).await;
    let filled = h.load(&job).await;
    assert_eq!(filled.status, JobStatus::Filled);
    assert_eq!(filled.confirmed_count, 2);
    assert!(h.pending_offers(&job).await.is_empty());

    for c in &cleaners {
        h.finish_rooms(&job, c, usize::MAX).await;
        assert_eq!(h.load(&job).await.status, JobStatus::InProgress);
    }
    for c in &cleaners {
        let record = h.engine.completion().mark_completed(job.id, c).await.unwrap();
        assert_eq!(record.status, CompletionStatus::Completed);
    }
    assert_eq!(h.load(&job).await.status, JobStatus::Completed);

    let lines = active_lines(&h.store.list_settlement_lines(job.id).await.unwrap());
    let workers: Vec<_> = lines.iter().filter(|l| l.kind == LineKind::Worker).collect();
    assert_eq!(workers.len(), 2);
    for line in &workers {
        assert_eq!(line.gross, dec!(100.00));
        assert_eq!(line.net, dec!(80.00));
    }
    let paid: Decimal = workers.iter().map(|l| l.gross).sum();
    assert_eq!(paid, job.payout_pool);
    assert_eq!(h.gateway.intents().await.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_slot_goes_to_exactly_one_cleaner() {
    let h = harness().await;
    let job = h.job(false).await;
    h.staff(&job, 1).await;

    let contenders = h.pending_offers(&job).await;
    assert!(contenders.len() >= 4);

    let mut tasks = Vec::new();
    for offer in contenders.clone() {
        let engine = h.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.offers().accept(offer.id, &offer.cleaner_id).await.unwrap()
        }));
    }
    let mut accepted = 0;
    let mut unavailable = 0;
    for task in tasks {
        match task.await.unwrap() {
            AcceptOutcome::Accepted { job_filled, .. } => {
                assert!(job_filled);
                accepted += 1;
            }
            AcceptOutcome::SlotUnavailable { .. } => unavailable += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(unavailable, contenders.len() - 1);

    let job = h.load(&job).await;
    assert_eq!(job.confirmed_count, 2);
    assert_eq!(job.status, JobStatus::Filled);
}

#[tokio::test]
async fn expiry_sweep_is_idempotent() {
    let h = harness().await;
    let job = h.job(false).await;
    h.clock.advance(h.engine.config().market_delay);
    h.engine.offers().sweep_open_jobs().await.unwrap();
    let issued = h.pending_offers(&job).await;

    h.clock.advance(h.engine.config().offer_expiry);
    h.engine.offers().sweep_expired().await.unwrap();
    let after_first = h.store.list_offers(job.id).await.unwrap();
    h.engine.offers().sweep_expired().await.unwrap();
    let after_second = h.store.list_offers(job.id).await.unwrap();

    assert_eq!(after_first.len(), after_second.len());
    for offer in &issued {
        let status = after_second.iter().find(|o| o.id == offer.id).unwrap().status;
        assert_eq!(status, OfferStatus::Expired);
    }
}

#[tokio::test]
async fn unanswered_edge_case_proceeds_with_one_cleaner() {
    let h = harness().await;
    let job = h.job(true).await;
    let request = h.engine.approvals().request(job.id, "outsider").await.unwrap();
    h.engine.approvals().approve(request.id, "household-9").await.unwrap();

    h.clock.set(job.scheduled_start - Duration::hours(36));
    assert_eq!(sweep_once(&h.engine).await.edge_cases_raised, 1);
    assert_eq!(h.load(&job).await.status, JobStatus::EdgeCase);

    h.clock.advance(Duration::hours(24));
    sweep_once(&h.engine).await;

    let decision = &h.store.list_decisions(job.id).await.unwrap()[0];
    assert_eq!(decision.status, DecisionStatus::AutoProceeded);
    let job = h.load(&job).await;
    assert_eq!((job.status, job.total_required, job.confirmed_count), (JobStatus::Filled, 1, 1));

    let rooms = h.store.list_rooms(job.id).await.unwrap();
    assert!(rooms.iter().all(|r| r.is_owned_by("outsider")));
    let covered: Decimal = rooms.iter().map(|r| r.earnings_share).sum();
    assert_eq!(covered, job.payout_pool);
}

#[tokio::test]
async fn drop_out_hands_rooms_to_co_worker_and_pays_partially() {
    let h = harness().await;
    let job = h.job(false).await;
    let cleaners = h.staff(&job, 2).await;
    let (leaver, stayer) = (&cleaners[0], &cleaners[1]);

    h.finish_rooms(&job, leaver, 1).await;
    let departure = h.engine.completion().drop_out(job.id, leaver).await.unwrap();
    assert_eq!(departure.released_rooms.len(), 1);
    assert_eq!(departure.extra_work_offers, 1);

    let batch = departure.extra_work_batch.unwrap();
    let offer = h.store.list_extra_work_offers(batch).await.unwrap()[0].clone();
    assert_eq!(&offer.cleaner_id, stayer);
    let taken = h.engine.completion().accept_extra_work(offer.id, stayer).await.unwrap();
    assert!(matches!(taken, ExtraWorkOutcome::Accepted { .. }));

    h.finish_rooms(&job, stayer, usize::MAX).await;
    h.engine.completion().mark_completed(job.id, stayer).await.unwrap();
    assert_eq!(h.load(&job).await.status, JobStatus::Completed);

    let report = h.engine.settlement().settle(job.id).await.unwrap();
    let leaver_line = report.lines.iter().find(|l| &l.recipient_id == leaver).unwrap();
    assert_eq!(leaver_line.gross, dec!(50.00));
    assert!(leaver_line.adjustment_reason.is_some());
    let stayer_line = report.lines.iter().find(|l| &l.recipient_id == stayer).unwrap();
    assert_eq!(stayer_line.gross, dec!(150.00));
    assert_eq!(report.unallocated, Decimal::ZERO);
}

#[tokio::test]
async fn cancelling_withdraws_everything_outstanding() {
    let h = harness().await;
    let open = h.job(false).await;
    h.staff(&open, 1).await;

    let job = h.job(true).await;
    h.engine.approvals().request(job.id, "hopeful").await.unwrap();

    let summary = h.engine.edge_cases().cancel_job(open.id, "household moved").await.unwrap();
    assert_eq!(summary.slots_released.len(), 1);
    assert!(summary.offers_withdrawn > 0);
    assert!(h.pending_offers(&open).await.is_empty());
    let open = h.load(&open).await;
    assert_eq!((open.status, open.confirmed_count), (JobStatus::Cancelled, 0));

    let summary = h.engine.edge_cases().cancel_job(job.id, "household moved").await.unwrap();
    assert_eq!(summary.join_requests_cancelled, 1);
    assert_eq!(h.store.count_pending_join_requests(job.id).await.unwrap(), 0);
    assert!(h.pending_offers(&job).await.is_empty());
    assert_eq!(h.gateway.cancelled().await.len(), 2);
}
