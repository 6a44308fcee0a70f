use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;

use crew_engine::api::engine_routes;
use crew_engine::clock::SystemClock;
use crew_engine::config::{EngineConfig, PricingSnapshot};
use crew_engine::gateway::{StaticDirectory, TracingGateway};
use crew_engine::notify::ChannelNotifier;
use crew_engine::store::{Database, LibSqlBackend};
use crew_engine::sweeper::spawn_sweeper;
use crew_engine::{Engine, EngineDeps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env().context("reading CREW_* configuration")?;
    let pricing = match &config.pricing_path {
        Some(path) => PricingSnapshot::load(path).with_context(|| format!("loading pricing from {path}"))?,
        None => PricingSnapshot::default(),
    };

    eprintln!("Crew engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Pricing: {}", pricing.version);
    eprintln!("   API: http://0.0.0.0:{}/api", config.http_port);
    eprintln!("   Sweeps: every {}s", config.sweep_interval.as_secs());
    eprintln!("   Directory: {} cleaners\n", config.cleaner_pool.len());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&config.db_path))
            .await
            .with_context(|| format!("opening database at {}", config.db_path))?,
    );

    // ── Notifications ────────────────────────────────────────────────────
    // No dispatcher is wired in; log what would be delivered.
    let (notifier, mut notifications) = ChannelNotifier::new();
    tokio::spawn(async move {
        while let Some(n) = notifications.recv().await {
            tracing::info!(
                kind = ?n.kind,
                recipient = %n.recipient,
                job_id = %n.job_id,
                payload = %n.payload,
                "Notification"
            );
        }
    });

    // ── Engine ───────────────────────────────────────────────────────────
    let deps = EngineDeps {
        store: db,
        clock: Arc::new(SystemClock),
        notifier: Arc::new(notifier),
        appointments: Arc::new(TracingGateway),
        payments: Arc::new(TracingGateway),
        directory: Arc::new(StaticDirectory::new(config.cleaner_pool.clone())),
    };
    let port = config.http_port;
    let sweep_every = config.sweep_interval;
    let engine = Arc::new(Engine::new(config, pricing, deps));

    let sweeper = spawn_sweeper(Arc::clone(&engine), sweep_every);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = engine_routes(Arc::clone(&engine)).layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    tracing::info!(port, "Crew engine API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
        })
        .await
        .context("serving API")?;

    sweeper.abort();
    Ok(())
}
