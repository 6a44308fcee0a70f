//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "staffing_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                appointment_id TEXT NOT NULL UNIQUE,
                requester_id TEXT NOT NULL,
                business_owner_id TEXT,
                relationship TEXT NOT NULL,
                total_required INTEGER NOT NULL,
                original_required INTEGER NOT NULL,
                confirmed_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'open',
                payout_pool TEXT NOT NULL,
                scheduled_start TEXT NOT NULL,
                restrict_to_preferred INTEGER NOT NULL DEFAULT 0,
                preferred_cleaners TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (confirmed_count >= 0 AND confirmed_count <= total_required)
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);

            CREATE TABLE IF NOT EXISTS slot_claims (
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                cleaner_id TEXT NOT NULL,
                vacated INTEGER NOT NULL DEFAULT 0,
                replaced_cleaner_id TEXT,
                claimed_at TEXT NOT NULL,
                PRIMARY KEY (job_id, cleaner_id)
            );

            CREATE TABLE IF NOT EXISTS offers (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                cleaner_id TEXT NOT NULL,
                offer_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                earnings_offered TEXT NOT NULL,
                expires_at TEXT,
                decline_reason TEXT,
                responded_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_offers_job ON offers(job_id, status);
            CREATE INDEX IF NOT EXISTS idx_offers_expiry ON offers(status, expires_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_offers_one_pending
                ON offers(job_id, cleaner_id) WHERE status = 'pending';

            CREATE TABLE IF NOT EXISTS join_requests (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                cleaner_id TEXT NOT NULL,
                requester_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                expires_at TEXT NOT NULL,
                decline_reason TEXT,
                decided_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_join_requests_job ON join_requests(job_id, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_join_requests_one_pending
                ON join_requests(job_id, cleaner_id) WHERE status = 'pending';

            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                label TEXT NOT NULL,
                effort_minutes INTEGER NOT NULL,
                earnings_share TEXT NOT NULL,
                cleaner_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                checklist_items INTEGER NOT NULL DEFAULT 0,
                checklist_done INTEGER NOT NULL DEFAULT 0,
                photos_required INTEGER NOT NULL DEFAULT 0,
                photos_uploaded INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (job_id, position)
            );
            CREATE INDEX IF NOT EXISTS idx_rooms_owner ON rooms(job_id, cleaner_id);

            CREATE TABLE IF NOT EXISTS completion_records (
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                cleaner_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'assigned',
                released_rooms INTEGER NOT NULL DEFAULT 0,
                extra_work_accepted INTEGER NOT NULL DEFAULT 0,
                extra_work_decline_reason TEXT,
                started_at TEXT,
                finished_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (job_id, cleaner_id)
            );
            CREATE INDEX IF NOT EXISTS idx_completion_status ON completion_records(status);
        "#,
    },
    Migration {
        version: 2,
        name: "extra_work_and_decisions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS extra_work_batches (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                departed_cleaner_id TEXT NOT NULL,
                room_ids TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'open',
                expires_at TEXT NOT NULL,
                accepted_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_extra_work_batches_job ON extra_work_batches(job_id, status);

            CREATE TABLE IF NOT EXISTS extra_work_offers (
                id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL REFERENCES extra_work_batches(id) ON DELETE CASCADE,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                cleaner_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                earnings_offered TEXT NOT NULL,
                decline_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_extra_work_offers_batch ON extra_work_offers(batch_id, status);

            CREATE TABLE IF NOT EXISTS edge_case_decisions (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                requester_id TEXT NOT NULL,
                confirmed_count INTEGER NOT NULL,
                total_required INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                expires_at TEXT NOT NULL,
                decided_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_decisions_one_pending
                ON edge_case_decisions(job_id) WHERE status = 'pending';
        "#,
    },
    Migration {
        version: 3,
        name: "settlement_ledger",
        sql: r#"
            CREATE TABLE IF NOT EXISTS job_pricing (
                job_id TEXT PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
                version TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settlement_lines (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                recipient_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                gross TEXT NOT NULL,
                fee TEXT NOT NULL,
                bonus TEXT NOT NULL,
                net TEXT NOT NULL,
                adjustment_reason TEXT,
                supersedes TEXT REFERENCES settlement_lines(id),
                pricing_version TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_settlement_lines_job ON settlement_lines(job_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_settlement_lines_supersedes
                ON settlement_lines(supersedes) WHERE supersedes IS NOT NULL;

            CREATE TABLE IF NOT EXISTS payment_intents (
                line_id TEXT PRIMARY KEY REFERENCES settlement_lines(id) ON DELETE CASCADE,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                recipient_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                supersedes TEXT,
                submitted_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payment_intents_pending
                ON payment_intents(job_id, submitted_at);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "jobs",
            "slot_claims",
            "offers",
            "join_requests",
            "rooms",
            "completion_records",
            "extra_work_batches",
            "extra_work_offers",
            "edge_case_decisions",
            "job_pricing",
            "settlement_lines",
            "payment_intents",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_run_on_spawned_task() {
        let conn = test_conn().await;
        let handle = tokio::spawn(async move { run_migrations(&conn).await });
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let v: i64 = row.get(0).unwrap();
            let n: String = row.get(1).unwrap();
            seen.push((v, n));
        }
        assert_eq!(
            seen,
            vec![
                (1, "staffing_schema".to_string()),
                (2, "extra_work_and_decisions".to_string()),
                (3, "settlement_ledger".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn confirmed_count_check_constraint() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let result = conn
            .execute(
                "INSERT INTO jobs (id, appointment_id, requester_id, relationship, total_required, original_required, confirmed_count, payout_pool, scheduled_start, created_at, updated_at)
                 VALUES ('j1', 'a1', 'r1', 'marketplace', 2, 2, 3, '100', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                (),
            )
            .await;
        assert!(result.is_err());
    }
}
