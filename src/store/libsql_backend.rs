//! libSQL backend — async `Database` trait implementation.
//!
//! One connection serves every operation. Mutations serialize on
//! `write_lock`; the ones touching more than one row run inside a
//! `BEGIN IMMEDIATE` transaction so a failure leaves nothing half-applied.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, Transaction, TransactionBehavior, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::approvals::model::{JoinRequest, JoinRequestStatus};
use crate::completion::model::{
    CompletionRecord, CompletionStatus, Departure, ExtraWorkBatch, ExtraWorkOffer,
};
use crate::config::PricingSnapshot;
use crate::edge_case::model::{DecisionStatus, EdgeCaseDecision};
use crate::error::DatabaseError;
use crate::jobs::model::{CancelSummary, ClaimResult, Job, JobStatus, SlotHolder, SlotRelease};
use crate::offers::model::{Offer, OfferStatus, OfferType};
use crate::rooms::model::{RoomAssignment, RoomEvidence};
use crate::settlement::model::{PaymentIntent, SettlementLine};
use crate::store::migrations;
use crate::store::traits::{Database, ExtraWorkClaim};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn begin(&self) -> Result<Transaction, DatabaseError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(query_err("begin"))
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(tx: Transaction, result: Result<T, DatabaseError>) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit().await.map_err(query_err("commit"))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                debug!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

/// Canonical write format: fixed-width so stored timestamps sort as text.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

fn parse_decimal(s: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(s).map_err(|e| DatabaseError::Serialization(format!("bad amount '{s}': {e}")))
}

fn parse_enum<T: FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

fn get_text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn get_u32(row: &libsql::Row, idx: i32) -> Result<u32, DatabaseError> {
    let v = row
        .get::<i64>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))?;
    u32::try_from(v).map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn get_bool(row: &libsql::Row, idx: i32) -> Result<bool, DatabaseError> {
    Ok(get_u32(row, idx)? != 0)
}

async fn collect<T>(
    mut rows: libsql::Rows,
    op: &'static str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err(op))? {
        out.push(map(&row)?);
    }
    Ok(out)
}

async fn first<T>(
    mut rows: libsql::Rows,
    op: &'static str,
    map: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await.map_err(query_err(op))? {
        Some(row) => Ok(Some(map(&row)?)),
        None => Ok(None),
    }
}

async fn count(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
    op: &'static str,
) -> Result<u64, DatabaseError> {
    let mut rows = conn.query(sql, params).await.map_err(query_err(op))?;
    match rows.next().await.map_err(query_err(op))? {
        Some(row) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
        None => Ok(0),
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, appointment_id, requester_id, business_owner_id, relationship, total_required, original_required, confirmed_count, status, payout_pool, scheduled_start, restrict_to_preferred, preferred_cleaners, created_at, updated_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let preferred: Vec<String> = serde_json::from_str(&get_text(row, 12)?)
        .map_err(|e| DatabaseError::Serialization(format!("preferred_cleaners: {e}")))?;

    Ok(Job {
        id: parse_uuid(&get_text(row, 0)?)?,
        appointment_id: get_text(row, 1)?,
        requester_id: get_text(row, 2)?,
        business_owner_id: get_opt_text(row, 3),
        relationship: parse_enum(&get_text(row, 4)?)?,
        total_required: get_u32(row, 5)?,
        original_required: get_u32(row, 6)?,
        confirmed_count: get_u32(row, 7)?,
        status: parse_enum(&get_text(row, 8)?)?,
        payout_pool: parse_decimal(&get_text(row, 9)?)?,
        scheduled_start: parse_datetime(&get_text(row, 10)?),
        restrict_to_preferred: get_bool(row, 11)?,
        preferred_cleaners: preferred,
        created_at: parse_datetime(&get_text(row, 13)?),
        updated_at: parse_datetime(&get_text(row, 14)?),
    })
}

const OFFER_COLUMNS: &str = "id, job_id, cleaner_id, offer_type, status, earnings_offered, expires_at, decline_reason, responded_at, created_at, updated_at";

fn row_to_offer(row: &libsql::Row) -> Result<Offer, DatabaseError> {
    Ok(Offer {
        id: parse_uuid(&get_text(row, 0)?)?,
        job_id: parse_uuid(&get_text(row, 1)?)?,
        cleaner_id: get_text(row, 2)?,
        offer_type: parse_enum(&get_text(row, 3)?)?,
        status: parse_enum(&get_text(row, 4)?)?,
        earnings_offered: parse_decimal(&get_text(row, 5)?)?,
        expires_at: parse_optional_datetime(&get_opt_text(row, 6)),
        decline_reason: get_opt_text(row, 7),
        responded_at: parse_optional_datetime(&get_opt_text(row, 8)),
        created_at: parse_datetime(&get_text(row, 9)?),
        updated_at: parse_datetime(&get_text(row, 10)?),
    })
}

const JOIN_REQUEST_COLUMNS: &str = "id, job_id, cleaner_id, requester_id, status, expires_at, decline_reason, decided_at, created_at, updated_at";

fn row_to_join_request(row: &libsql::Row) -> Result<JoinRequest, DatabaseError> {
    Ok(JoinRequest {
        id: parse_uuid(&get_text(row, 0)?)?,
        job_id: parse_uuid(&get_text(row, 1)?)?,
        cleaner_id: get_text(row, 2)?,
        requester_id: get_text(row, 3)?,
        status: parse_enum(&get_text(row, 4)?)?,
        expires_at: parse_datetime(&get_text(row, 5)?),
        decline_reason: get_opt_text(row, 6),
        decided_at: parse_optional_datetime(&get_opt_text(row, 7)),
        created_at: parse_datetime(&get_text(row, 8)?),
        updated_at: parse_datetime(&get_text(row, 9)?),
    })
}

const ROOM_COLUMNS: &str = "id, job_id, position, label, effort_minutes, earnings_share, cleaner_id, status, checklist_items, checklist_done, photos_required, photos_uploaded, started_at, completed_at, created_at, updated_at";

fn row_to_room(row: &libsql::Row) -> Result<RoomAssignment, DatabaseError> {
    Ok(RoomAssignment {
        id: parse_uuid(&get_text(row, 0)?)?,
        job_id: parse_uuid(&get_text(row, 1)?)?,
        position: get_u32(row, 2)?,
        label: get_text(row, 3)?,
        effort_minutes: get_u32(row, 4)?,
        earnings_share: parse_decimal(&get_text(row, 5)?)?,
        cleaner_id: get_opt_text(row, 6),
        status: parse_enum(&get_text(row, 7)?)?,
        checklist_items: get_u32(row, 8)?,
        checklist_done: get_u32(row, 9)?,
        photos_required: get_u32(row, 10)?,
        photos_uploaded: get_u32(row, 11)?,
        started_at: parse_optional_datetime(&get_opt_text(row, 12)),
        completed_at: parse_optional_datetime(&get_opt_text(row, 13)),
        created_at: parse_datetime(&get_text(row, 14)?),
        updated_at: parse_datetime(&get_text(row, 15)?),
    })
}

const COMPLETION_COLUMNS: &str = "job_id, cleaner_id, status, released_rooms, extra_work_accepted, extra_work_decline_reason, started_at, finished_at, created_at, updated_at";

fn row_to_completion(row: &libsql::Row) -> Result<CompletionRecord, DatabaseError> {
    Ok(CompletionRecord {
        job_id: parse_uuid(&get_text(row, 0)?)?,
        cleaner_id: get_text(row, 1)?,
        status: parse_enum(&get_text(row, 2)?)?,
        released_rooms: get_u32(row, 3)?,
        extra_work_accepted: get_bool(row, 4)?,
        extra_work_decline_reason: get_opt_text(row, 5),
        started_at: parse_optional_datetime(&get_opt_text(row, 6)),
        finished_at: parse_optional_datetime(&get_opt_text(row, 7)),
        created_at: parse_datetime(&get_text(row, 8)?),
        updated_at: parse_datetime(&get_text(row, 9)?),
    })
}

const BATCH_COLUMNS: &str = "id, job_id, departed_cleaner_id, room_ids, status, expires_at, accepted_by, created_at, updated_at";

fn row_to_batch(row: &libsql::Row) -> Result<ExtraWorkBatch, DatabaseError> {
    let room_ids: Vec<Uuid> = serde_json::from_str(&get_text(row, 3)?)
        .map_err(|e| DatabaseError::Serialization(format!("room_ids: {e}")))?;

    Ok(ExtraWorkBatch {
        id: parse_uuid(&get_text(row, 0)?)?,
        job_id: parse_uuid(&get_text(row, 1)?)?,
        departed_cleaner_id: get_text(row, 2)?,
        room_ids,
        status: parse_enum(&get_text(row, 4)?)?,
        expires_at: parse_datetime(&get_text(row, 5)?),
        accepted_by: get_opt_text(row, 6),
        created_at: parse_datetime(&get_text(row, 7)?),
        updated_at: parse_datetime(&get_text(row, 8)?),
    })
}

const EXTRA_OFFER_COLUMNS: &str = "id, batch_id, job_id, cleaner_id, status, earnings_offered, decline_reason, created_at, updated_at";

fn row_to_extra_offer(row: &libsql::Row) -> Result<ExtraWorkOffer, DatabaseError> {
    Ok(ExtraWorkOffer {
        id: parse_uuid(&get_text(row, 0)?)?,
        batch_id: parse_uuid(&get_text(row, 1)?)?,
        job_id: parse_uuid(&get_text(row, 2)?)?,
        cleaner_id: get_text(row, 3)?,
        status: parse_enum(&get_text(row, 4)?)?,
        earnings_offered: parse_decimal(&get_text(row, 5)?)?,
        decline_reason: get_opt_text(row, 6),
        created_at: parse_datetime(&get_text(row, 7)?),
        updated_at: parse_datetime(&get_text(row, 8)?),
    })
}

const DECISION_COLUMNS: &str = "id, job_id, requester_id, confirmed_count, total_required, status, expires_at, decided_at, created_at, updated_at";

fn row_to_decision(row: &libsql::Row) -> Result<EdgeCaseDecision, DatabaseError> {
    Ok(EdgeCaseDecision {
        id: parse_uuid(&get_text(row, 0)?)?,
        job_id: parse_uuid(&get_text(row, 1)?)?,
        requester_id: get_text(row, 2)?,
        confirmed_count: get_u32(row, 3)?,
        total_required: get_u32(row, 4)?,
        status: parse_enum(&get_text(row, 5)?)?,
        expires_at: parse_datetime(&get_text(row, 6)?),
        decided_at: parse_optional_datetime(&get_opt_text(row, 7)),
        created_at: parse_datetime(&get_text(row, 8)?),
        updated_at: parse_datetime(&get_text(row, 9)?),
    })
}

const LINE_COLUMNS: &str = "id, job_id, recipient_id, kind, gross, fee, bonus, net, adjustment_reason, supersedes, pricing_version, created_at";

fn row_to_line(row: &libsql::Row) -> Result<SettlementLine, DatabaseError> {
    Ok(SettlementLine {
        id: parse_uuid(&get_text(row, 0)?)?,
        job_id: parse_uuid(&get_text(row, 1)?)?,
        recipient_id: get_text(row, 2)?,
        kind: parse_enum(&get_text(row, 3)?)?,
        gross: parse_decimal(&get_text(row, 4)?)?,
        fee: parse_decimal(&get_text(row, 5)?)?,
        bonus: parse_decimal(&get_text(row, 6)?)?,
        net: parse_decimal(&get_text(row, 7)?)?,
        adjustment_reason: get_opt_text(row, 8),
        supersedes: get_opt_text(row, 9).map(|s| parse_uuid(&s)).transpose()?,
        pricing_version: get_text(row, 10)?,
        created_at: parse_datetime(&get_text(row, 11)?),
    })
}

const INTENT_COLUMNS: &str = "line_id, job_id, recipient_id, amount, supersedes";

fn row_to_intent(row: &libsql::Row) -> Result<PaymentIntent, DatabaseError> {
    Ok(PaymentIntent {
        line_id: parse_uuid(&get_text(row, 0)?)?,
        job_id: parse_uuid(&get_text(row, 1)?)?,
        recipient_id: get_text(row, 2)?,
        amount: parse_decimal(&get_text(row, 3)?)?,
        supersedes: get_opt_text(row, 4).map(|s| parse_uuid(&s)).transpose()?,
    })
}

fn row_to_holder(row: &libsql::Row) -> Result<SlotHolder, DatabaseError> {
    Ok(SlotHolder {
        cleaner_id: get_text(row, 0)?,
        vacated: get_bool(row, 1)?,
        replaced_cleaner_id: get_opt_text(row, 2),
        claimed_at: parse_datetime(&get_text(row, 3)?),
    })
}

fn row_to_uuid(row: &libsql::Row) -> Result<Uuid, DatabaseError> {
    parse_uuid(&get_text(row, 0)?)
}

fn row_to_string(row: &libsql::Row) -> Result<String, DatabaseError> {
    get_text(row, 0)
}

// ── Transaction bodies ──────────────────────────────────────────────

/// (confirmed_count, total_required, status) for a job.
async fn job_counts(
    conn: &Connection,
    job_id: Uuid,
) -> Result<(u32, u32, JobStatus), DatabaseError> {
    let rows = conn
        .query(
            "SELECT confirmed_count, total_required, status FROM jobs WHERE id = ?1",
            params![job_id.to_string()],
        )
        .await
        .map_err(query_err("job_counts"))?;

    first(rows, "job_counts", |row| {
        Ok((get_u32(row, 0)?, get_u32(row, 1)?, parse_enum(&get_text(row, 2)?)?))
    })
    .await?
    .ok_or_else(|| DatabaseError::not_found("job", job_id))
}

async fn claim_slot_tx(
    conn: &Connection,
    job_id: Uuid,
    cleaner_id: &str,
    now: DateTime<Utc>,
) -> Result<ClaimResult, DatabaseError> {
    let job_key = job_id.to_string();
    let now_s = ts(now);

    let rows = conn
        .query(
            "SELECT vacated FROM slot_claims WHERE job_id = ?1 AND cleaner_id = ?2",
            params![job_key.clone(), cleaner_id],
        )
        .await
        .map_err(query_err("claim_slot"))?;
    if let Some(vacated) = first(rows, "claim_slot", |row| get_bool(row, 0)).await? {
        if !vacated {
            return Ok(ClaimResult::AlreadyHeld);
        }
        // A cleaner who walked away from this job cannot take their own slot back.
        let (confirmed, total, _) = job_counts(conn, job_id).await?;
        return Ok(ClaimResult::Unavailable {
            confirmed_count: confirmed,
            total_required: total,
        });
    }

    // The compare-and-increment: the WHERE clause is the whole guard.
    let updated = conn
        .execute(
            "UPDATE jobs SET confirmed_count = confirmed_count + 1,
                 status = CASE WHEN confirmed_count + 1 >= total_required THEN 'filled' ELSE status END,
                 updated_at = ?1
             WHERE id = ?2 AND status = 'open' AND confirmed_count < total_required",
            params![now_s.clone(), job_key.clone()],
        )
        .await
        .map_err(query_err("claim_slot"))?;

    if updated == 1 {
        conn.execute(
            "INSERT INTO slot_claims (job_id, cleaner_id, vacated, claimed_at) VALUES (?1, ?2, 0, ?3)",
            params![job_key, cleaner_id, now_s],
        )
        .await
        .map_err(query_err("claim_slot insert"))?;

        let (confirmed, total, status) = job_counts(conn, job_id).await?;
        return Ok(ClaimResult::Claimed {
            confirmed_count: confirmed,
            total_required: total,
            filled: status == JobStatus::Filled,
        });
    }

    let (confirmed, total, status) = job_counts(conn, job_id).await?;
    if matches!(status, JobStatus::Filled | JobStatus::InProgress) {
        let rows = conn
            .query(
                "SELECT cleaner_id FROM slot_claims WHERE job_id = ?1 AND vacated = 1 ORDER BY claimed_at LIMIT 1",
                params![job_key.clone()],
            )
            .await
            .map_err(query_err("claim_slot vacated"))?;
        if let Some(previous) = first(rows, "claim_slot vacated", row_to_string).await? {
            let taken = conn
                .execute(
                    "UPDATE slot_claims SET cleaner_id = ?1, vacated = 0, replaced_cleaner_id = ?2, claimed_at = ?3
                     WHERE job_id = ?4 AND cleaner_id = ?2 AND vacated = 1",
                    params![cleaner_id, previous.clone(), now_s, job_key],
                )
                .await
                .map_err(query_err("claim_slot takeover"))?;
            if taken == 1 {
                return Ok(ClaimResult::TookOver {
                    previous_cleaner_id: previous,
                });
            }
        }
    }

    Ok(ClaimResult::Unavailable {
        confirmed_count: confirmed,
        total_required: total,
    })
}

async fn release_slot_tx(
    conn: &Connection,
    job_id: Uuid,
    cleaner_id: &str,
    now: DateTime<Utc>,
) -> Result<SlotRelease, DatabaseError> {
    let job_key = job_id.to_string();
    let (_, _, status) = job_counts(conn, job_id).await?;

    if status.is_terminal() {
        return Ok(SlotRelease::NotHeld);
    }

    if status == JobStatus::InProgress {
        let vacated = conn
            .execute(
                "UPDATE slot_claims SET vacated = 1 WHERE job_id = ?1 AND cleaner_id = ?2 AND vacated = 0",
                params![job_key, cleaner_id],
            )
            .await
            .map_err(query_err("release_slot vacate"))?;
        return Ok(if vacated == 1 {
            SlotRelease::Vacated
        } else {
            SlotRelease::NotHeld
        });
    }

    let deleted = conn
        .execute(
            "DELETE FROM slot_claims WHERE job_id = ?1 AND cleaner_id = ?2 AND vacated = 0",
            params![job_key.clone(), cleaner_id],
        )
        .await
        .map_err(query_err("release_slot"))?;
    if deleted == 0 {
        return Ok(SlotRelease::NotHeld);
    }

    conn.execute(
        "UPDATE jobs SET confirmed_count = confirmed_count - 1,
             status = CASE WHEN status = 'filled' THEN 'open' ELSE status END,
             updated_at = ?1
         WHERE id = ?2 AND confirmed_count > 0",
        params![ts(now), job_key],
    )
    .await
    .map_err(query_err("release_slot decrement"))?;

    Ok(SlotRelease::Released)
}

async fn revert_claim_tx(
    conn: &Connection,
    job_id: Uuid,
    cleaner_id: &str,
    claim: &ClaimResult,
    now: DateTime<Utc>,
) -> Result<SlotRelease, DatabaseError> {
    match claim {
        ClaimResult::Claimed { .. } => release_slot_tx(conn, job_id, cleaner_id, now).await,
        ClaimResult::TookOver {
            previous_cleaner_id,
        } => {
            let restored = conn
                .execute(
                    "UPDATE slot_claims SET cleaner_id = ?1, vacated = 1, replaced_cleaner_id = NULL
                     WHERE job_id = ?2 AND cleaner_id = ?3 AND vacated = 0",
                    params![previous_cleaner_id.as_str(), job_id.to_string(), cleaner_id],
                )
                .await
                .map_err(query_err("revert_claim"))?;
            Ok(if restored == 1 {
                SlotRelease::Vacated
            } else {
                SlotRelease::NotHeld
            })
        }
        ClaimResult::AlreadyHeld | ClaimResult::Unavailable { .. } => Ok(SlotRelease::NotHeld),
    }
}

async fn insert_completion_record_tx(
    conn: &Connection,
    record: &CompletionRecord,
) -> Result<bool, DatabaseError> {
    let inserted = conn
        .execute(
            &format!(
                "INSERT OR IGNORE INTO completion_records ({COMPLETION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                record.job_id.to_string(),
                record.cleaner_id.as_str(),
                record.status.as_str(),
                record.released_rooms as i64,
                record.extra_work_accepted as i64,
                opt_text(record.extra_work_decline_reason.as_deref()),
                opt_ts(record.started_at),
                opt_ts(record.finished_at),
                ts(record.created_at),
                ts(record.updated_at),
            ],
        )
        .await
        .map_err(query_err("insert_completion_record"))?;
    Ok(inserted == 1)
}

async fn grant_join_request_tx(
    conn: &Connection,
    id: Uuid,
    to: JoinRequestStatus,
    record: &CompletionRecord,
    now: DateTime<Utc>,
) -> Result<Option<ClaimResult>, DatabaseError> {
    let rows = conn
        .query(
            "SELECT job_id, cleaner_id FROM join_requests WHERE id = ?1 AND status = 'pending'",
            params![id.to_string()],
        )
        .await
        .map_err(query_err("grant_join_request"))?;
    let Some((job_key, cleaner_id)) = first(rows, "grant_join_request", |row| {
        Ok((get_text(row, 0)?, get_text(row, 1)?))
    })
    .await?
    else {
        return Ok(None);
    };
    let job_id = parse_uuid(&job_key)?;

    let claim = claim_slot_tx(conn, job_id, &cleaner_id, now).await?;
    let (status, reason) = match claim {
        ClaimResult::Claimed { .. } | ClaimResult::TookOver { .. } => {
            insert_completion_record_tx(conn, record).await?;
            (to, None)
        }
        ClaimResult::AlreadyHeld | ClaimResult::Unavailable { .. } => {
            (JoinRequestStatus::Expired, Some("slot_unavailable"))
        }
    };

    conn.execute(
        "UPDATE join_requests SET status = ?1, decline_reason = COALESCE(?2, decline_reason),
             decided_at = ?3, updated_at = ?3
         WHERE id = ?4 AND status = 'pending'",
        params![status.as_str(), opt_text(reason), ts(now), id.to_string()],
    )
    .await
    .map_err(query_err("grant_join_request resolve"))?;

    Ok(Some(claim))
}

async fn cancel_job_tx(
    conn: &Connection,
    job_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<CancelSummary>, DatabaseError> {
    let job_key = job_id.to_string();
    let now_s = ts(now);

    let cancelled = conn
        .execute(
            "UPDATE jobs SET status = 'cancelled', confirmed_count = 0, updated_at = ?1
             WHERE id = ?2 AND status NOT IN ('completed', 'cancelled')",
            params![now_s.clone(), job_key.clone()],
        )
        .await
        .map_err(query_err("cancel_job"))?;
    if cancelled == 0 {
        return Ok(None);
    }

    let offers_withdrawn = conn
        .execute(
            "UPDATE offers SET status = 'withdrawn', responded_at = ?1, updated_at = ?1
             WHERE job_id = ?2 AND status = 'pending'",
            params![now_s.clone(), job_key.clone()],
        )
        .await
        .map_err(query_err("cancel_job offers"))?;

    let join_requests_cancelled = conn
        .execute(
            "UPDATE join_requests SET status = 'cancelled', decided_at = ?1, updated_at = ?1
             WHERE job_id = ?2 AND status = 'pending'",
            params![now_s.clone(), job_key.clone()],
        )
        .await
        .map_err(query_err("cancel_job join_requests"))?;

    let extra_work_withdrawn = conn
        .execute(
            "UPDATE extra_work_batches SET status = 'withdrawn', updated_at = ?1
             WHERE job_id = ?2 AND status = 'open'",
            params![now_s.clone(), job_key.clone()],
        )
        .await
        .map_err(query_err("cancel_job extra_work"))?;

    conn.execute(
        "UPDATE extra_work_offers SET status = 'withdrawn', updated_at = ?1
         WHERE job_id = ?2 AND status = 'pending'",
        params![now_s.clone(), job_key.clone()],
    )
    .await
    .map_err(query_err("cancel_job extra_work_offers"))?;

    let decisions_withdrawn = conn
        .execute(
            "UPDATE edge_case_decisions SET status = 'withdrawn', decided_at = ?1, updated_at = ?1
             WHERE job_id = ?2 AND status = 'pending'",
            params![now_s, job_key.clone()],
        )
        .await
        .map_err(query_err("cancel_job decisions"))?;

    let rows = conn
        .query(
            "DELETE FROM slot_claims WHERE job_id = ?1 RETURNING cleaner_id",
            params![job_key],
        )
        .await
        .map_err(query_err("cancel_job slots"))?;
    let slots_released = collect(rows, "cancel_job slots", row_to_string).await?;

    Ok(Some(CancelSummary {
        offers_withdrawn,
        join_requests_cancelled,
        extra_work_withdrawn,
        decisions_withdrawn,
        slots_released,
    }))
}

async fn record_departure_tx(
    conn: &Connection,
    job_id: Uuid,
    cleaner_id: &str,
    departure: Departure,
    now: DateTime<Utc>,
) -> Result<Option<Vec<Uuid>>, DatabaseError> {
    let job_key = job_id.to_string();
    let now_s = ts(now);

    let departed = conn
        .execute(
            "UPDATE completion_records SET status = ?1, finished_at = ?2, updated_at = ?2
             WHERE job_id = ?3 AND cleaner_id = ?4 AND status IN ('assigned', 'started')",
            params![departure.status().as_str(), now_s.clone(), job_key.clone(), cleaner_id],
        )
        .await
        .map_err(query_err("record_departure"))?;
    if departed == 0 {
        return Ok(None);
    }

    let rows = conn
        .query(
            "UPDATE rooms SET cleaner_id = NULL, status = 'pending', started_at = NULL,
                 checklist_done = 0, photos_uploaded = 0, updated_at = ?1
             WHERE job_id = ?2 AND cleaner_id = ?3 AND status != 'completed'
             RETURNING id",
            params![now_s, job_key.clone(), cleaner_id],
        )
        .await
        .map_err(query_err("record_departure rooms"))?;
    let released = collect(rows, "record_departure rooms", row_to_uuid).await?;

    conn.execute(
        "UPDATE completion_records SET released_rooms = ?1 WHERE job_id = ?2 AND cleaner_id = ?3",
        params![released.len() as i64, job_key, cleaner_id],
    )
    .await
    .map_err(query_err("record_departure count"))?;

    Ok(Some(released))
}

async fn accept_extra_work_tx(
    conn: &Connection,
    offer_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ExtraWorkClaim, DatabaseError> {
    let now_s = ts(now);
    let rows = conn
        .query(
            &format!("SELECT {EXTRA_OFFER_COLUMNS} FROM extra_work_offers WHERE id = ?1"),
            params![offer_id.to_string()],
        )
        .await
        .map_err(query_err("accept_extra_work"))?;
    let Some(offer) = first(rows, "accept_extra_work", row_to_extra_offer).await? else {
        return Err(DatabaseError::not_found("extra_work_offer", offer_id));
    };
    if offer.status != OfferStatus::Pending {
        return Ok(ExtraWorkClaim::Lost);
    }

    let won = conn
        .execute(
            "UPDATE extra_work_batches SET status = 'accepted', accepted_by = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'open'",
            params![offer.cleaner_id.as_str(), now_s.clone(), offer.batch_id.to_string()],
        )
        .await
        .map_err(query_err("accept_extra_work batch"))?;
    if won == 0 {
        return Ok(ExtraWorkClaim::Lost);
    }

    conn.execute(
        "UPDATE extra_work_offers SET status = 'accepted', updated_at = ?1 WHERE id = ?2",
        params![now_s.clone(), offer_id.to_string()],
    )
    .await
    .map_err(query_err("accept_extra_work offer"))?;

    conn.execute(
        "UPDATE extra_work_offers SET status = 'withdrawn', updated_at = ?1
         WHERE batch_id = ?2 AND status = 'pending'",
        params![now_s.clone(), offer.batch_id.to_string()],
    )
    .await
    .map_err(query_err("accept_extra_work siblings"))?;

    let rows = conn
        .query(
            "SELECT room_ids FROM extra_work_batches WHERE id = ?1",
            params![offer.batch_id.to_string()],
        )
        .await
        .map_err(query_err("accept_extra_work rooms"))?;
    let room_ids: Vec<Uuid> = match first(rows, "accept_extra_work rooms", row_to_string).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| DatabaseError::Serialization(format!("room_ids: {e}")))?,
        None => Vec::new(),
    };

    let mut rooms = Vec::with_capacity(room_ids.len());
    for room_id in room_ids {
        let assigned = conn
            .execute(
                "UPDATE rooms SET cleaner_id = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending' AND cleaner_id IS NULL",
                params![offer.cleaner_id.as_str(), now_s.clone(), room_id.to_string()],
            )
            .await
            .map_err(query_err("accept_extra_work assign"))?;
        if assigned == 1 {
            rooms.push(room_id);
        }
    }

    conn.execute(
        "UPDATE completion_records SET extra_work_accepted = 1, updated_at = ?1
         WHERE job_id = ?2 AND cleaner_id = ?3",
        params![now_s, offer.job_id.to_string(), offer.cleaner_id.as_str()],
    )
    .await
    .map_err(query_err("accept_extra_work record"))?;

    Ok(ExtraWorkClaim::Won { rooms })
}

async fn decline_extra_work_tx(
    conn: &Connection,
    offer_id: Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Option<bool>, DatabaseError> {
    let now_s = ts(now);
    let rows = conn
        .query(
            &format!("SELECT {EXTRA_OFFER_COLUMNS} FROM extra_work_offers WHERE id = ?1"),
            params![offer_id.to_string()],
        )
        .await
        .map_err(query_err("decline_extra_work"))?;
    let Some(offer) = first(rows, "decline_extra_work", row_to_extra_offer).await? else {
        return Err(DatabaseError::not_found("extra_work_offer", offer_id));
    };

    let declined = conn
        .execute(
            "UPDATE extra_work_offers SET status = 'declined', decline_reason = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![reason, now_s.clone(), offer_id.to_string()],
        )
        .await
        .map_err(query_err("decline_extra_work"))?;
    if declined == 0 {
        return Ok(None);
    }

    conn.execute(
        "UPDATE completion_records SET extra_work_decline_reason = ?1, updated_at = ?2
         WHERE job_id = ?3 AND cleaner_id = ?4",
        params![reason, now_s, offer.job_id.to_string(), offer.cleaner_id.as_str()],
    )
    .await
    .map_err(query_err("decline_extra_work record"))?;

    let remaining = count(
        conn,
        "SELECT COUNT(*) FROM extra_work_offers WHERE batch_id = ?1 AND status = 'pending'",
        params![offer.batch_id.to_string()],
        "decline_extra_work remaining",
    )
    .await?;

    Ok(Some(remaining == 0))
}

async fn append_settlement_tx(
    conn: &Connection,
    job_id: Uuid,
    expected_existing: usize,
    lines: &[SettlementLine],
    intents: &[PaymentIntent],
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let existing = count(
        conn,
        "SELECT COUNT(*) FROM settlement_lines WHERE job_id = ?1",
        params![job_id.to_string()],
        "append_settlement",
    )
    .await?;
    if existing != expected_existing as u64 {
        return Ok(false);
    }

    for line in lines {
        conn.execute(
            &format!(
                "INSERT INTO settlement_lines ({LINE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                line.id.to_string(),
                line.job_id.to_string(),
                line.recipient_id.as_str(),
                line.kind.as_str(),
                line.gross.to_string(),
                line.fee.to_string(),
                line.bonus.to_string(),
                line.net.to_string(),
                opt_text(line.adjustment_reason.as_deref()),
                opt_text(line.supersedes.map(|id| id.to_string()).as_deref()),
                line.pricing_version.as_str(),
                ts(line.created_at),
            ],
        )
        .await
        .map_err(query_err("append_settlement line"))?;
    }

    for intent in intents {
        conn.execute(
            "INSERT INTO payment_intents (line_id, job_id, recipient_id, amount, supersedes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                intent.line_id.to_string(),
                intent.job_id.to_string(),
                intent.recipient_id.as_str(),
                intent.amount.to_string(),
                opt_text(intent.supersedes.map(|id| id.to_string()).as_deref()),
                ts(now),
            ],
        )
        .await
        .map_err(query_err("append_settlement intent"))?;
    }

    Ok(true)
}

async fn shrink_job_tx(
    conn: &Connection,
    job_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<u32>, DatabaseError> {
    let updated = conn
        .execute(
            "UPDATE jobs SET total_required = confirmed_count, status = 'filled', updated_at = ?1
             WHERE id = ?2 AND status = 'edge_case' AND confirmed_count > 0",
            params![ts(now), job_id.to_string()],
        )
        .await
        .map_err(query_err("shrink_job"))?;
    if updated == 0 {
        return Ok(None);
    }
    let (_, total, _) = job_counts(conn, job_id).await?;
    Ok(Some(total))
}

async fn insert_rooms_tx(
    conn: &Connection,
    job_id: Uuid,
    rooms: &[RoomAssignment],
) -> Result<bool, DatabaseError> {
    let existing = count(
        conn,
        "SELECT COUNT(*) FROM rooms WHERE job_id = ?1",
        params![job_id.to_string()],
        "insert_rooms",
    )
    .await?;
    if existing > 0 {
        return Ok(false);
    }

    for room in rooms {
        conn.execute(
            &format!(
                "INSERT INTO rooms ({ROOM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                room.id.to_string(),
                room.job_id.to_string(),
                room.position as i64,
                room.label.as_str(),
                room.effort_minutes as i64,
                room.earnings_share.to_string(),
                opt_text(room.cleaner_id.as_deref()),
                room.status.as_str(),
                room.checklist_items as i64,
                room.checklist_done as i64,
                room.photos_required as i64,
                room.photos_uploaded as i64,
                opt_ts(room.started_at),
                opt_ts(room.completed_at),
                ts(room.created_at),
                ts(room.updated_at),
            ],
        )
        .await
        .map_err(query_err("insert_rooms"))?;
    }
    Ok(true)
}

async fn insert_extra_work_tx(
    conn: &Connection,
    batch: &ExtraWorkBatch,
    offers: &[ExtraWorkOffer],
) -> Result<(), DatabaseError> {
    let room_ids = serde_json::to_string(&batch.room_ids)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        &format!(
            "INSERT INTO extra_work_batches ({BATCH_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            batch.id.to_string(),
            batch.job_id.to_string(),
            batch.departed_cleaner_id.as_str(),
            room_ids,
            batch.status.as_str(),
            ts(batch.expires_at),
            opt_text(batch.accepted_by.as_deref()),
            ts(batch.created_at),
            ts(batch.updated_at),
        ],
    )
    .await
    .map_err(query_err("insert_extra_work batch"))?;

    for offer in offers {
        conn.execute(
            &format!(
                "INSERT INTO extra_work_offers ({EXTRA_OFFER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                offer.id.to_string(),
                offer.batch_id.to_string(),
                offer.job_id.to_string(),
                offer.cleaner_id.as_str(),
                offer.status.as_str(),
                offer.earnings_offered.to_string(),
                opt_text(offer.decline_reason.as_deref()),
                ts(offer.created_at),
                ts(offer.updated_at),
            ],
        )
        .await
        .map_err(query_err("insert_extra_work offer"))?;
    }
    Ok(())
}

async fn escalate_extra_work_tx(
    conn: &Connection,
    batch_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let escalated = conn
        .execute(
            "UPDATE extra_work_batches SET status = 'escalated', updated_at = ?1
             WHERE id = ?2 AND status = 'open'",
            params![ts(now), batch_id.to_string()],
        )
        .await
        .map_err(query_err("escalate_extra_work"))?;
    if escalated == 0 {
        return Ok(false);
    }
    conn.execute(
        "UPDATE extra_work_offers SET status = 'withdrawn', updated_at = ?1
         WHERE batch_id = ?2 AND status = 'pending'",
        params![ts(now), batch_id.to_string()],
    )
    .await
    .map_err(query_err("escalate_extra_work offers"))?;
    Ok(true)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let preferred = serde_json::to_string(&job.preferred_cleaners)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    job.id.to_string(),
                    job.appointment_id.as_str(),
                    job.requester_id.as_str(),
                    opt_text(job.business_owner_id.as_deref()),
                    job.relationship.as_str(),
                    job.total_required as i64,
                    job.original_required as i64,
                    job.confirmed_count as i64,
                    job.status.as_str(),
                    job.payout_pool.to_string(),
                    ts(job.scheduled_start),
                    job.restrict_to_preferred as i64,
                    preferred,
                    ts(job.created_at),
                    ts(job.updated_at),
                ],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    DatabaseError::Constraint(format!(
                        "appointment {} already has a job",
                        job.appointment_id
                    ))
                } else {
                    DatabaseError::Query(format!("insert_job: {e}"))
                }
            })?;

        debug!(job_id = %job.id, appointment_id = %job.appointment_id, "Job inserted into DB");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_job"))?;
        first(rows, "get_job", row_to_job).await
    }

    async fn get_job_by_appointment(
        &self,
        appointment_id: &str,
    ) -> Result<Option<Job>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE appointment_id = ?1"),
                params![appointment_id],
            )
            .await
            .map_err(query_err("get_job_by_appointment"))?;
        first(rows, "get_job_by_appointment", row_to_job).await
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY scheduled_start"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(query_err("list_jobs_by_status"))?;
        collect(rows, "list_jobs_by_status", row_to_job).await
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = ?4
                   AND (?1 NOT IN ('filled', 'in_progress') OR confirmed_count = total_required)",
                params![to.as_str(), ts(now), id.to_string(), from.as_str()],
            )
            .await
            .map_err(query_err("transition_job"))?;

        if updated == 1 {
            debug!(job_id = %id, %from, %to, "Job status updated in DB");
        }
        Ok(updated == 1)
    }

    async fn shrink_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<u32>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = shrink_job_tx(&tx, id, now).await;
        finish(tx, result).await
    }

    async fn cancel_job(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<CancelSummary>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = cancel_job_tx(&tx, id, now).await;
        finish(tx, result).await
    }

    async fn delete_job_for_appointment(
        &self,
        appointment_id: &str,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE appointment_id = ?1",
                params![appointment_id],
            )
            .await
            .map_err(query_err("delete_job_for_appointment"))?;

        if deleted > 0 {
            info!(%appointment_id, "Job and owned records deleted");
        }
        Ok(deleted > 0)
    }

    // ── Slots ───────────────────────────────────────────────────────

    async fn claim_slot(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = claim_slot_tx(&tx, job_id, cleaner_id, now).await;
        finish(tx, result).await
    }

    async fn revert_claim(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        claim: &ClaimResult,
        now: DateTime<Utc>,
    ) -> Result<SlotRelease, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = revert_claim_tx(&tx, job_id, cleaner_id, claim, now).await;
        finish(tx, result).await
    }

    async fn release_slot(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SlotRelease, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = release_slot_tx(&tx, job_id, cleaner_id, now).await;
        finish(tx, result).await
    }

    async fn list_slot_holders(&self, job_id: Uuid) -> Result<Vec<SlotHolder>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT cleaner_id, vacated, replaced_cleaner_id, claimed_at FROM slot_claims
                 WHERE job_id = ?1 ORDER BY claimed_at",
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("list_slot_holders"))?;
        collect(rows, "list_slot_holders", row_to_holder).await
    }

    // ── Offers ──────────────────────────────────────────────────────

    async fn insert_offer(&self, offer: &Offer) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO offers ({OFFER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    offer.id.to_string(),
                    offer.job_id.to_string(),
                    offer.cleaner_id.as_str(),
                    offer.offer_type.as_str(),
                    offer.status.as_str(),
                    offer.earnings_offered.to_string(),
                    opt_ts(offer.expires_at),
                    opt_text(offer.decline_reason.as_deref()),
                    opt_ts(offer.responded_at),
                    ts(offer.created_at),
                    ts(offer.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_offer"))?;
        Ok(inserted == 1)
    }

    async fn get_offer(&self, id: Uuid) -> Result<Option<Offer>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {OFFER_COLUMNS} FROM offers WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_offer"))?;
        first(rows, "get_offer", row_to_offer).await
    }

    async fn list_offers(&self, job_id: Uuid) -> Result<Vec<Offer>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {OFFER_COLUMNS} FROM offers WHERE job_id = ?1 ORDER BY created_at, rowid"),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("list_offers"))?;
        collect(rows, "list_offers", row_to_offer).await
    }

    async fn count_pending_offers(
        &self,
        job_id: Uuid,
        offer_type: Option<OfferType>,
    ) -> Result<u64, DatabaseError> {
        match offer_type {
            Some(t) => {
                count(
                    self.conn(),
                    "SELECT COUNT(*) FROM offers WHERE job_id = ?1 AND status = 'pending' AND offer_type = ?2",
                    params![job_id.to_string(), t.as_str()],
                    "count_pending_offers",
                )
                .await
            }
            None => {
                count(
                    self.conn(),
                    "SELECT COUNT(*) FROM offers WHERE job_id = ?1 AND status = 'pending'",
                    params![job_id.to_string()],
                    "count_pending_offers",
                )
                .await
            }
        }
    }

    async fn resolve_offer(
        &self,
        id: Uuid,
        to: OfferStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE offers SET status = ?1, decline_reason = COALESCE(?2, decline_reason),
                     responded_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![to.as_str(), opt_text(reason), ts(now), id.to_string()],
            )
            .await
            .map_err(query_err("resolve_offer"))?;
        Ok(updated == 1)
    }

    async fn expire_offers(&self, now: DateTime<Utc>) -> Result<Vec<Offer>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE offers SET status = 'expired', responded_at = ?1, updated_at = ?1
                     WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at <= ?1
                     RETURNING {OFFER_COLUMNS}"
                ),
                params![ts(now)],
            )
            .await
            .map_err(query_err("expire_offers"))?;
        let expired = collect(rows, "expire_offers", row_to_offer).await?;

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired offers in DB");
        }
        Ok(expired)
    }

    async fn withdraw_pending_offers(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE offers SET status = 'withdrawn', responded_at = ?1, updated_at = ?1
                 WHERE job_id = ?2 AND status = 'pending'
                   AND cleaner_id NOT IN (
                       SELECT cleaner_id FROM slot_claims WHERE job_id = ?2 AND vacated = 0
                   )",
                params![ts(now), job_id.to_string()],
            )
            .await
            .map_err(query_err("withdraw_pending_offers"))
    }

    // ── Join requests ───────────────────────────────────────────────

    async fn insert_join_request(&self, request: &JoinRequest) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO join_requests ({JOIN_REQUEST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    request.id.to_string(),
                    request.job_id.to_string(),
                    request.cleaner_id.as_str(),
                    request.requester_id.as_str(),
                    request.status.as_str(),
                    ts(request.expires_at),
                    opt_text(request.decline_reason.as_deref()),
                    opt_ts(request.decided_at),
                    ts(request.created_at),
                    ts(request.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_join_request"))?;
        Ok(inserted == 1)
    }

    async fn get_join_request(&self, id: Uuid) -> Result<Option<JoinRequest>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {JOIN_REQUEST_COLUMNS} FROM join_requests WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_join_request"))?;
        first(rows, "get_join_request", row_to_join_request).await
    }

    async fn list_join_requests(&self, job_id: Uuid) -> Result<Vec<JoinRequest>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOIN_REQUEST_COLUMNS} FROM join_requests WHERE job_id = ?1 ORDER BY created_at, rowid"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("list_join_requests"))?;
        collect(rows, "list_join_requests", row_to_join_request).await
    }

    async fn count_pending_join_requests(&self, job_id: Uuid) -> Result<u64, DatabaseError> {
        count(
            self.conn(),
            "SELECT COUNT(*) FROM join_requests WHERE job_id = ?1 AND status = 'pending'",
            params![job_id.to_string()],
            "count_pending_join_requests",
        )
        .await
    }

    async fn transition_join_request(
        &self,
        id: Uuid,
        from: JoinRequestStatus,
        to: JoinRequestStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE join_requests SET status = ?1, decline_reason = COALESCE(?2, decline_reason),
                     decided_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    to.as_str(),
                    opt_text(reason),
                    ts(now),
                    id.to_string(),
                    from.as_str()
                ],
            )
            .await
            .map_err(query_err("transition_join_request"))?;
        Ok(updated == 1)
    }

    async fn grant_join_request(
        &self,
        id: Uuid,
        to: JoinRequestStatus,
        record: &CompletionRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimResult>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = grant_join_request_tx(&tx, id, to, record, now).await;
        finish(tx, result).await
    }

    async fn expire_pending_join_requests(
        &self,
        job_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE join_requests SET status = 'expired', decline_reason = ?1,
                     decided_at = ?2, updated_at = ?2
                 WHERE job_id = ?3 AND status = 'pending'",
                params![reason, ts(now), job_id.to_string()],
            )
            .await
            .map_err(query_err("expire_pending_join_requests"))
    }

    async fn due_join_requests(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinRequest>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOIN_REQUEST_COLUMNS} FROM join_requests
                     WHERE status = 'pending' AND expires_at <= ?1 ORDER BY expires_at"
                ),
                params![ts(now)],
            )
            .await
            .map_err(query_err("due_join_requests"))?;
        collect(rows, "due_join_requests", row_to_join_request).await
    }

    // ── Rooms ───────────────────────────────────────────────────────

    async fn insert_rooms(
        &self,
        job_id: Uuid,
        rooms: &[RoomAssignment],
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = insert_rooms_tx(&tx, job_id, rooms).await;
        finish(tx, result).await
    }

    async fn get_room(&self, id: Uuid) -> Result<Option<RoomAssignment>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_room"))?;
        first(rows, "get_room", row_to_room).await
    }

    async fn list_rooms(&self, job_id: Uuid) -> Result<Vec<RoomAssignment>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE job_id = ?1 ORDER BY position"),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("list_rooms"))?;
        collect(rows, "list_rooms", row_to_room).await
    }

    async fn assign_room(
        &self,
        room_id: Uuid,
        cleaner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE rooms SET cleaner_id = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending'
                   AND job_id IN (SELECT id FROM jobs WHERE status NOT IN ('completed', 'cancelled'))",
                params![cleaner_id, ts(now), room_id.to_string()],
            )
            .await
            .map_err(query_err("assign_room"))?;
        Ok(updated == 1)
    }

    async fn start_room(
        &self,
        room_id: Uuid,
        cleaner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE rooms SET status = 'in_progress', started_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND cleaner_id = ?3 AND status = 'pending'",
                params![ts(now), room_id.to_string(), cleaner_id],
            )
            .await
            .map_err(query_err("start_room"))?;
        Ok(updated == 1)
    }

    async fn complete_room(
        &self,
        room_id: Uuid,
        cleaner_id: &str,
        evidence: &RoomEvidence,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE rooms SET status = 'completed', checklist_done = ?1, photos_uploaded = ?2,
                     started_at = COALESCE(started_at, ?3), completed_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND cleaner_id = ?5 AND status != 'completed'",
                params![
                    evidence.checklist_done as i64,
                    evidence.photos_uploaded as i64,
                    ts(now),
                    room_id.to_string(),
                    cleaner_id
                ],
            )
            .await
            .map_err(query_err("complete_room"))?;
        Ok(updated == 1)
    }

    async fn unassign_pending_rooms(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE rooms SET cleaner_id = NULL, updated_at = ?1
                 WHERE job_id = ?2 AND status = 'pending' AND cleaner_id IS NOT NULL",
                params![ts(now), job_id.to_string()],
            )
            .await
            .map_err(query_err("unassign_pending_rooms"))
    }

    // ── Completion records ──────────────────────────────────────────

    async fn insert_completion_record(
        &self,
        record: &CompletionRecord,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        insert_completion_record_tx(self.conn(), record).await
    }

    async fn get_completion_record(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
    ) -> Result<Option<CompletionRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMPLETION_COLUMNS} FROM completion_records WHERE job_id = ?1 AND cleaner_id = ?2"
                ),
                params![job_id.to_string(), cleaner_id],
            )
            .await
            .map_err(query_err("get_completion_record"))?;
        first(rows, "get_completion_record", row_to_completion).await
    }

    async fn list_completion_records(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<CompletionRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMPLETION_COLUMNS} FROM completion_records WHERE job_id = ?1 ORDER BY created_at, rowid"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("list_completion_records"))?;
        collect(rows, "list_completion_records", row_to_completion).await
    }

    async fn transition_completion(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        from: CompletionStatus,
        to: CompletionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE completion_records SET status = ?1,
                     started_at = CASE WHEN ?1 = 'started' THEN ?2 ELSE started_at END,
                     finished_at = CASE WHEN ?1 IN ('completed', 'dropped_out', 'no_show') THEN ?2 ELSE finished_at END,
                     updated_at = ?2
                 WHERE job_id = ?3 AND cleaner_id = ?4 AND status = ?5",
                params![
                    to.as_str(),
                    ts(now),
                    job_id.to_string(),
                    cleaner_id,
                    from.as_str()
                ],
            )
            .await
            .map_err(query_err("transition_completion"))?;
        Ok(updated == 1)
    }

    async fn record_departure(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        departure: Departure,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Uuid>>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = record_departure_tx(&tx, job_id, cleaner_id, departure, now).await;
        finish(tx, result).await
    }

    async fn due_no_shows(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CompletionRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT c.job_id, c.cleaner_id, c.status, c.released_rooms, c.extra_work_accepted,
                        c.extra_work_decline_reason, c.started_at, c.finished_at, c.created_at, c.updated_at
                 FROM completion_records c
                 JOIN jobs j ON j.id = c.job_id
                 WHERE c.status = 'assigned'
                   AND j.status IN ('filled', 'in_progress')
                   AND j.scheduled_start <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM rooms r
                       WHERE r.job_id = c.job_id AND r.cleaner_id = c.cleaner_id AND r.status != 'pending'
                   )
                 ORDER BY j.scheduled_start",
                params![ts(cutoff)],
            )
            .await
            .map_err(query_err("due_no_shows"))?;
        collect(rows, "due_no_shows", row_to_completion).await
    }

    // ── Extra work ──────────────────────────────────────────────────

    async fn insert_extra_work(
        &self,
        batch: &ExtraWorkBatch,
        offers: &[ExtraWorkOffer],
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = insert_extra_work_tx(&tx, batch, offers).await;
        finish(tx, result).await
    }

    async fn get_extra_work_batch(
        &self,
        id: Uuid,
    ) -> Result<Option<ExtraWorkBatch>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {BATCH_COLUMNS} FROM extra_work_batches WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_extra_work_batch"))?;
        first(rows, "get_extra_work_batch", row_to_batch).await
    }

    async fn get_extra_work_offer(
        &self,
        id: Uuid,
    ) -> Result<Option<ExtraWorkOffer>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {EXTRA_OFFER_COLUMNS} FROM extra_work_offers WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_extra_work_offer"))?;
        first(rows, "get_extra_work_offer", row_to_extra_offer).await
    }

    async fn list_extra_work_batches(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<ExtraWorkBatch>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {BATCH_COLUMNS} FROM extra_work_batches WHERE job_id = ?1 ORDER BY created_at, rowid"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("list_extra_work_batches"))?;
        collect(rows, "list_extra_work_batches", row_to_batch).await
    }

    async fn list_extra_work_offers(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<ExtraWorkOffer>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXTRA_OFFER_COLUMNS} FROM extra_work_offers WHERE batch_id = ?1 ORDER BY created_at, rowid"
                ),
                params![batch_id.to_string()],
            )
            .await
            .map_err(query_err("list_extra_work_offers"))?;
        collect(rows, "list_extra_work_offers", row_to_extra_offer).await
    }

    async fn accept_extra_work(
        &self,
        offer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ExtraWorkClaim, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = accept_extra_work_tx(&tx, offer_id, now).await;
        finish(tx, result).await
    }

    async fn decline_extra_work(
        &self,
        offer_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = decline_extra_work_tx(&tx, offer_id, reason, now).await;
        finish(tx, result).await
    }

    async fn escalate_extra_work(
        &self,
        batch_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = escalate_extra_work_tx(&tx, batch_id, now).await;
        finish(tx, result).await
    }

    async fn due_extra_work(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExtraWorkBatch>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {BATCH_COLUMNS} FROM extra_work_batches
                     WHERE status = 'open' AND expires_at <= ?1 ORDER BY expires_at"
                ),
                params![ts(now)],
            )
            .await
            .map_err(query_err("due_extra_work"))?;
        collect(rows, "due_extra_work", row_to_batch).await
    }

    async fn count_open_extra_work(&self, job_id: Uuid) -> Result<u64, DatabaseError> {
        count(
            self.conn(),
            "SELECT COUNT(*) FROM extra_work_batches WHERE job_id = ?1 AND status = 'open'",
            params![job_id.to_string()],
            "count_open_extra_work",
        )
        .await
    }

    // ── Edge-case decisions ─────────────────────────────────────────

    async fn insert_decision(&self, decision: &EdgeCaseDecision) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO edge_case_decisions ({DECISION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    decision.id.to_string(),
                    decision.job_id.to_string(),
                    decision.requester_id.as_str(),
                    decision.confirmed_count as i64,
                    decision.total_required as i64,
                    decision.status.as_str(),
                    ts(decision.expires_at),
                    opt_ts(decision.decided_at),
                    ts(decision.created_at),
                    ts(decision.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_decision"))?;
        Ok(inserted == 1)
    }

    async fn get_decision(&self, id: Uuid) -> Result<Option<EdgeCaseDecision>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {DECISION_COLUMNS} FROM edge_case_decisions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_decision"))?;
        first(rows, "get_decision", row_to_decision).await
    }

    async fn list_decisions(&self, job_id: Uuid) -> Result<Vec<EdgeCaseDecision>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DECISION_COLUMNS} FROM edge_case_decisions WHERE job_id = ?1 ORDER BY created_at, rowid"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("list_decisions"))?;
        collect(rows, "list_decisions", row_to_decision).await
    }

    async fn resolve_decision(
        &self,
        id: Uuid,
        to: DecisionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE edge_case_decisions SET status = ?1, decided_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![to.as_str(), ts(now), id.to_string()],
            )
            .await
            .map_err(query_err("resolve_decision"))?;
        Ok(updated == 1)
    }

    async fn due_decisions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EdgeCaseDecision>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {DECISION_COLUMNS} FROM edge_case_decisions
                     WHERE status = 'pending' AND expires_at <= ?1 ORDER BY expires_at"
                ),
                params![ts(now)],
            )
            .await
            .map_err(query_err("due_decisions"))?;
        collect(rows, "due_decisions", row_to_decision).await
    }

    // ── Settlement ──────────────────────────────────────────────────

    async fn pin_job_pricing(
        &self,
        job_id: Uuid,
        snapshot: &PricingSnapshot,
        now: DateTime<Utc>,
    ) -> Result<PricingSnapshot, DatabaseError> {
        let raw = serde_json::to_string(snapshot)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO job_pricing (job_id, version, snapshot, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![job_id.to_string(), snapshot.version.as_str(), raw, ts(now)],
            )
            .await
            .map_err(query_err("pin_job_pricing"))?;

        let rows = self
            .conn()
            .query(
                "SELECT snapshot FROM job_pricing WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("pin_job_pricing read"))?;
        let stored = first(rows, "pin_job_pricing read", row_to_string)
            .await?
            .ok_or_else(|| DatabaseError::not_found("job_pricing", job_id))?;

        serde_json::from_str(&stored).map_err(|e| DatabaseError::Serialization(e.to_string()))
    }

    async fn list_settlement_lines(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<SettlementLine>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LINE_COLUMNS} FROM settlement_lines WHERE job_id = ?1 ORDER BY rowid"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("list_settlement_lines"))?;
        collect(rows, "list_settlement_lines", row_to_line).await
    }

    async fn append_settlement(
        &self,
        job_id: Uuid,
        expected_existing: usize,
        lines: &[SettlementLine],
        intents: &[PaymentIntent],
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result =
            append_settlement_tx(&tx, job_id, expected_existing, lines, intents, now).await;
        finish(tx, result).await
    }

    async fn list_unsubmitted_intents(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<PaymentIntent>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INTENT_COLUMNS} FROM payment_intents
                     WHERE job_id = ?1 AND submitted_at IS NULL ORDER BY rowid"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("list_unsubmitted_intents"))?;
        collect(rows, "list_unsubmitted_intents", row_to_intent).await
    }

    async fn mark_intent_submitted(
        &self,
        line_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE payment_intents SET submitted_at = ?1 WHERE line_id = ?2 AND submitted_at IS NULL",
                params![ts(now), line_id.to_string()],
            )
            .await
            .map_err(query_err("mark_intent_submitted"))?;
        Ok(updated == 1)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::clock::{Clock, SystemClock};
    use crate::jobs::model::{NewJob, Relationship};
    use crate::rooms::model::RoomSpec;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn job(total: u32) -> Job {
        Job::new(
            NewJob {
                appointment_id: format!("appt-{}", Uuid::new_v4()),
                requester_id: "home-1".into(),
                business_owner_id: None,
                relationship: Relationship::Marketplace,
                total_required: total,
                payout_pool: dec!(200.00),
                scheduled_start: Utc::now() + Duration::days(2),
                restrict_to_preferred: false,
                preferred_cleaners: vec!["pref-1".into()],
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn job_roundtrip() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();

        let loaded = db.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(loaded.appointment_id, j.appointment_id);
        assert_eq!(loaded.payout_pool, dec!(200.00));
        assert_eq!(loaded.preferred_cleaners, vec!["pref-1".to_string()]);
        assert_eq!(loaded.status, JobStatus::Open);

        let by_appt = db.get_job_by_appointment(&j.appointment_id).await.unwrap();
        assert_eq!(by_appt.map(|j| j.id), Some(j.id));
    }

    #[tokio::test]
    async fn duplicate_appointment_rejected() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        let mut dup = job(2);
        dup.appointment_id = j.appointment_id.clone();
        assert!(matches!(
            db.insert_job(&dup).await,
            Err(DatabaseError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn claim_until_filled_then_unavailable() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        let now = Utc::now();

        assert_eq!(
            db.claim_slot(j.id, "a", now).await.unwrap(),
            ClaimResult::Claimed {
                confirmed_count: 1,
                total_required: 2,
                filled: false
            }
        );
        assert_eq!(
            db.claim_slot(j.id, "a", now).await.unwrap(),
            ClaimResult::AlreadyHeld
        );
        assert_eq!(
            db.claim_slot(j.id, "b", now).await.unwrap(),
            ClaimResult::Claimed {
                confirmed_count: 2,
                total_required: 2,
                filled: true
            }
        );
        assert!(matches!(
            db.claim_slot(j.id, "c", now).await.unwrap(),
            ClaimResult::Unavailable { confirmed_count: 2, .. }
        ));
        assert_eq!(db.get_job(j.id).await.unwrap().unwrap().status, JobStatus::Filled);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_reopens() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        let now = Utc::now();
        db.claim_slot(j.id, "a", now).await.unwrap();
        db.claim_slot(j.id, "b", now).await.unwrap();

        assert_eq!(db.release_slot(j.id, "a", now).await.unwrap(), SlotRelease::Released);
        assert_eq!(db.release_slot(j.id, "a", now).await.unwrap(), SlotRelease::NotHeld);

        let loaded = db.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Open);
        assert_eq!(loaded.confirmed_count, 1);
    }

    #[tokio::test]
    async fn vacated_slot_taken_over_once_started() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        let now = Utc::now();
        db.claim_slot(j.id, "a", now).await.unwrap();
        db.claim_slot(j.id, "b", now).await.unwrap();
        assert!(db
            .transition_job(j.id, JobStatus::Filled, JobStatus::InProgress, now)
            .await
            .unwrap());

        assert_eq!(db.release_slot(j.id, "a", now).await.unwrap(), SlotRelease::Vacated);
        assert_eq!(db.get_job(j.id).await.unwrap().unwrap().confirmed_count, 2);

        assert!(matches!(
            db.claim_slot(j.id, "a", now).await.unwrap(),
            ClaimResult::Unavailable { .. }
        ));
        assert_eq!(
            db.claim_slot(j.id, "c", now).await.unwrap(),
            ClaimResult::TookOver {
                previous_cleaner_id: "a".into()
            }
        );
        assert!(matches!(
            db.claim_slot(j.id, "d", now).await.unwrap(),
            ClaimResult::Unavailable { .. }
        ));

        let holders = db.list_slot_holders(j.id).await.unwrap();
        let c = holders.iter().find(|h| h.cleaner_id == "c").unwrap();
        assert_eq!(c.replaced_cleaner_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn revert_takeover_restores_vacated_holder() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        let now = Utc::now();
        db.claim_slot(j.id, "a", now).await.unwrap();
        db.claim_slot(j.id, "b", now).await.unwrap();
        db.transition_job(j.id, JobStatus::Filled, JobStatus::InProgress, now)
            .await
            .unwrap();
        db.release_slot(j.id, "a", now).await.unwrap();

        let claim = db.claim_slot(j.id, "c", now).await.unwrap();
        assert_eq!(
            db.revert_claim(j.id, "c", &claim, now).await.unwrap(),
            SlotRelease::Vacated
        );
        let holders = db.list_slot_holders(j.id).await.unwrap();
        assert!(holders.iter().any(|h| h.cleaner_id == "a" && h.vacated));
        assert!(!holders.iter().any(|h| h.cleaner_id == "c"));
    }

    #[tokio::test]
    async fn filled_requires_full_staffing() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        assert!(!db
            .transition_job(j.id, JobStatus::Open, JobStatus::Filled, Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expire_offers_only_once() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        let now = Utc::now();
        let offer = Offer::new(
            j.id,
            "a",
            OfferType::PrimaryInvite,
            dec!(100.00),
            Some(now - Duration::minutes(1)),
            now - Duration::minutes(31),
        );
        assert!(db.insert_offer(&offer).await.unwrap());

        assert_eq!(db.expire_offers(now).await.unwrap().len(), 1);
        assert!(db.expire_offers(now).await.unwrap().is_empty());
        assert!(!db
            .resolve_offer(offer.id, OfferStatus::Accepted, None, now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn one_pending_offer_per_cleaner() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        let now = Utc::now();
        let first_offer = Offer::new(j.id, "a", OfferType::PrimaryInvite, dec!(100), None, now);
        let second_offer = Offer::new(j.id, "a", OfferType::MarketOpen, dec!(100), None, now);
        assert!(db.insert_offer(&first_offer).await.unwrap());
        assert!(!db.insert_offer(&second_offer).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_cascades() {
        let db = backend().await;
        let j = job(3);
        db.insert_job(&j).await.unwrap();
        let now = Utc::now();
        db.claim_slot(j.id, "a", now).await.unwrap();
        db.insert_offer(&Offer::new(j.id, "b", OfferType::MarketOpen, dec!(1), None, now))
            .await
            .unwrap();
        db.insert_join_request(&JoinRequest::new(j.id, "c", "home-1", now, now))
            .await
            .unwrap();

        let summary = db.cancel_job(j.id, now).await.unwrap().unwrap();
        assert_eq!(summary.offers_withdrawn, 1);
        assert_eq!(summary.join_requests_cancelled, 1);
        assert_eq!(summary.slots_released, vec!["a".to_string()]);

        let loaded = db.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Cancelled);
        assert_eq!(loaded.confirmed_count, 0);
        assert!(db.cancel_job(j.id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_cascades_to_children() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        let now = Utc::now();
        db.claim_slot(j.id, "a", now).await.unwrap();
        db.insert_offer(&Offer::new(j.id, "b", OfferType::MarketOpen, dec!(1), None, now))
            .await
            .unwrap();

        assert!(db.delete_job_for_appointment(&j.appointment_id).await.unwrap());
        assert!(db.get_job(j.id).await.unwrap().is_none());
        assert!(db.list_offers(j.id).await.unwrap().is_empty());
        assert!(db.list_slot_holders(j.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rooms_insert_once_and_depart_releases_unfinished() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        let now = Utc::now();
        let specs = [
            RoomSpec { label: "Kitchen".into(), effort_minutes: 60, checklist_items: 0, photos_required: 0 },
            RoomSpec { label: "Bath".into(), effort_minutes: 40, checklist_items: 0, photos_required: 0 },
        ];
        let rooms: Vec<_> = specs
            .iter()
            .enumerate()
            .map(|(i, s)| RoomAssignment::from_spec(j.id, i as u32, s, dec!(100.00), now))
            .collect();
        assert!(db.insert_rooms(j.id, &rooms).await.unwrap());
        assert!(!db.insert_rooms(j.id, &rooms).await.unwrap());

        db.insert_completion_record(&CompletionRecord::assigned(j.id, "a", now))
            .await
            .unwrap();
        for room in &rooms {
            assert!(db.assign_room(room.id, "a", now).await.unwrap());
        }
        assert!(db
            .complete_room(rooms[0].id, "a", &RoomEvidence::default(), now)
            .await
            .unwrap());

        let released = db
            .record_departure(j.id, "a", Departure::DroppedOut, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released, vec![rooms[1].id]);
        let record = db.get_completion_record(j.id, "a").await.unwrap().unwrap();
        assert_eq!(record.status, CompletionStatus::DroppedOut);
        assert_eq!(record.released_rooms, 1);

        assert!(db
            .record_departure(j.id, "a", Departure::DroppedOut, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn settlement_append_guards_concurrent_writers() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        let now = SystemClock.now();
        let line = SettlementLine::from_draft(
            j.id,
            crate::settlement::model::LineDraft {
                recipient_id: "a".into(),
                kind: crate::settlement::model::LineKind::Worker,
                gross: dec!(100.00),
                fee: dec!(20.00),
                bonus: dec!(0),
                net: dec!(80.00),
                adjustment_reason: None,
            },
            None,
            "v1",
            now,
        );
        let intent = PaymentIntent {
            line_id: line.id,
            job_id: j.id,
            recipient_id: "a".into(),
            amount: dec!(80.00),
            supersedes: None,
        };

        assert!(db
            .append_settlement(j.id, 0, &[line.clone()], &[intent.clone()], now)
            .await
            .unwrap());
        assert!(!db.append_settlement(j.id, 0, &[], &[], now).await.unwrap());

        assert_eq!(db.list_settlement_lines(j.id).await.unwrap(), vec![line.clone()]);
        assert_eq!(db.list_unsubmitted_intents(j.id).await.unwrap(), vec![intent]);
        assert!(db.mark_intent_submitted(line.id, now).await.unwrap());
        assert!(db.list_unsubmitted_intents(j.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pricing_pinned_on_first_use() {
        let db = backend().await;
        let j = job(2);
        db.insert_job(&j).await.unwrap();
        let now = Utc::now();

        let original = PricingSnapshot::default();
        let mut changed = PricingSnapshot::default();
        changed.version = "v2".into();
        changed.fees.marketplace = dec!(0.30);

        assert_eq!(db.pin_job_pricing(j.id, &original, now).await.unwrap(), original);
        assert_eq!(db.pin_job_pricing(j.id, &changed, now).await.unwrap(), original);
    }

    #[tokio::test]
    async fn file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crew.db");
        let j = job(2);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_job(&j).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_job(j.id).await.unwrap().is_some());
    }
}
