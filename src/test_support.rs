//! Shared fixtures for unit tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::clock::FakeClock;
use crate::config::{EngineConfig, PricingSnapshot};
use crate::engine::{Engine, EngineDeps};
use crate::gateway::{RecordingGateway, StaticDirectory};
use crate::jobs::model::{Job, NewJob, Relationship};
use crate::notify::{ChannelNotifier, Notification};
use crate::rooms::model::{RoomEvidence, RoomSpec};
use crate::store::{Database, LibSqlBackend};

pub(crate) fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// A marketplace job starting `starts_in` after [`base_time`].
pub(crate) fn new_job(total: u32, pool: Decimal, starts_in: Duration) -> NewJob {
    NewJob {
        appointment_id: format!("appt-{}", uuid::Uuid::new_v4()),
        requester_id: "home-1".into(),
        business_owner_id: None,
        relationship: Relationship::Marketplace,
        total_required: total,
        payout_pool: pool,
        scheduled_start: base_time() + starts_in,
        restrict_to_preferred: false,
        preferred_cleaners: Vec::new(),
    }
}

/// Rooms with two checklist items and one photo each.
pub(crate) fn rooms(specs: &[(&str, u32)]) -> Vec<RoomSpec> {
    specs
        .iter()
        .map(|(label, effort)| RoomSpec {
            label: (*label).into(),
            effort_minutes: *effort,
            checklist_items: 2,
            photos_required: 1,
        })
        .collect()
}

pub(crate) fn full_evidence() -> RoomEvidence {
    RoomEvidence {
        checklist_done: 2,
        photos_uploaded: 1,
    }
}

pub(crate) struct TestEngine {
    pub engine: Arc<Engine>,
    pub store: Arc<dyn Database>,
    pub clock: Arc<FakeClock>,
    pub gateway: Arc<RecordingGateway>,
    pub notifications: mpsc::Receiver<Notification>,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default(), StaticDirectory::new((1..=12).map(|i| format!("c{i:02}")))).await
    }

    pub async fn with_config(config: EngineConfig, directory: StaticDirectory) -> Self {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock = Arc::new(FakeClock::new(base_time()));
        let gateway = Arc::new(RecordingGateway::new());
        let (notifier, notifications) = ChannelNotifier::with_capacity(4096);

        let deps = EngineDeps {
            store: store.clone(),
            clock: clock.clone(),
            notifier: Arc::new(notifier),
            appointments: gateway.clone(),
            payments: gateway.clone(),
            directory: Arc::new(directory),
        };
        let engine = Arc::new(Engine::new(config, PricingSnapshot::default(), deps));

        Self {
            engine,
            store,
            clock,
            gateway,
            notifications,
        }
    }

    pub async fn register(&self, input: NewJob) -> Job {
        self.engine.register_job(input, Vec::new()).await.unwrap()
    }

    /// An unrestricted job three days out whose market offers are already
    /// outstanding.
    pub async fn register_open_market(&self, total: u32) -> Job {
        let job = self
            .register(new_job(total, Decimal::from(100 * total), Duration::days(3)))
            .await;
        self.clock.advance(self.engine.config().market_delay);
        self.engine.offers().sweep_open_jobs().await.unwrap();
        job
    }

    /// Claim slots for the given cleaners through their offers, bypassing
    /// the directory.
    pub async fn staff(&self, job: &Job, cleaners: &[&str]) {
        for cleaner in cleaners {
            let claimed = self
                .engine
                .ledger()
                .claim_slot(job.id, cleaner)
                .await
                .unwrap()
                .unwrap();
            self.engine.offers().seat(&claimed).await.unwrap();
        }
    }

    pub fn drain(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n);
        }
        out
    }
}
