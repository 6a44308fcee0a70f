//! WorkPartitioner — splits a job's payout pool across rooms and hands
//! rooms to cleaners.
//!
//! Shares are proportional to each room's estimated effort minutes, floored
//! to the cent; the rounding remainder goes to the largest share so the
//! shares always sum exactly to the pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{DatabaseError, Error, IntegrityError, MissingRequirement, ValidationError};
use crate::jobs::model::Job;
use crate::rooms::model::{RoomAssignment, RoomEvidence, RoomSpec, RoomStatus};
use crate::store::Database;

/// Split `pool` across rooms in proportion to `efforts`.
///
/// When every effort is zero the pool is split evenly.
pub fn compute_shares(pool: Decimal, efforts: &[u32]) -> Vec<Decimal> {
    if efforts.is_empty() {
        return Vec::new();
    }

    let floor = |d: Decimal| d.round_dp_with_strategy(2, RoundingStrategy::ToZero);
    let total: u64 = efforts.iter().map(|e| u64::from(*e)).sum();

    let mut shares: Vec<Decimal> = if total == 0 {
        let each = floor(pool / Decimal::from(efforts.len()));
        vec![each; efforts.len()]
    } else {
        let total = Decimal::from(total);
        efforts
            .iter()
            .map(|e| floor(pool * Decimal::from(*e) / total))
            .collect()
    };

    let remainder = pool - shares.iter().copied().sum::<Decimal>();
    if !remainder.is_zero() {
        // First of the largest shares takes the remainder.
        let mut largest = 0;
        for (i, share) in shares.iter().enumerate() {
            if *share > shares[largest] {
                largest = i;
            }
        }
        shares[largest] += remainder;
    }
    shares
}

pub struct WorkPartitioner {
    store: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
}

/// Reject room specs that cannot be partitioned.
pub fn validate_specs(specs: &[RoomSpec]) -> Result<(), ValidationError> {
    if specs.is_empty() {
        return Err(ValidationError::InvalidInput {
            field: "rooms".into(),
            reason: "at least one room is required".into(),
        });
    }
    if let Some(blank) = specs.iter().position(|s| s.label.trim().is_empty()) {
        return Err(ValidationError::InvalidInput {
            field: format!("rooms[{blank}].label"),
            reason: "must not be empty".into(),
        });
    }
    Ok(())
}

impl WorkPartitioner {
    pub fn new(store: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create the job's rooms with their earnings shares.
    ///
    /// A job is partitioned once; repeating the call returns the existing
    /// rooms unchanged. If the job is already staffed the new rooms are
    /// handed out straight away.
    pub async fn partition(
        &self,
        job_id: Uuid,
        specs: &[RoomSpec],
    ) -> Result<Vec<RoomAssignment>, Error> {
        let job = self.load_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(ValidationError::InvalidTransition {
                entity: "job",
                id: job_id,
                state: job.status.to_string(),
                target: "partitioned".into(),
            }
            .into());
        }
        validate_specs(specs)?;

        let now = self.clock.now();
        let efforts: Vec<u32> = specs.iter().map(|s| s.effort_minutes).collect();
        let shares = compute_shares(job.payout_pool, &efforts);
        let rooms: Vec<RoomAssignment> = specs
            .iter()
            .zip(shares)
            .enumerate()
            .map(|(i, (spec, share))| RoomAssignment::from_spec(job_id, i as u32, spec, share, now))
            .collect();

        if !self.store.insert_rooms(job_id, &rooms).await? {
            debug!(job_id = %job_id, "Job already partitioned");
            return Ok(self.store.list_rooms(job_id).await?);
        }
        self.verify_shares(job_id).await?;
        info!(job_id = %job_id, rooms = rooms.len(), pool = %job.payout_pool, "Job partitioned");

        if job.status.requires_full_staffing() {
            self.auto_assign(job_id).await?;
        }
        Ok(self.store.list_rooms(job_id).await?)
    }

    /// Give a pending room to a cleaner holding an active slot.
    pub async fn assign(&self, room_id: Uuid, cleaner_id: &str) -> Result<RoomAssignment, Error> {
        let room = self.load_room(room_id).await?;
        let job = self.load_job(room.job_id).await?;
        if job.status.is_terminal() {
            return Err(ValidationError::InvalidTransition {
                entity: "job",
                id: job.id,
                state: job.status.to_string(),
                target: "room assignment".into(),
            }
            .into());
        }

        let holds_slot = self
            .store
            .list_slot_holders(job.id)
            .await?
            .iter()
            .any(|h| h.cleaner_id == cleaner_id && !h.vacated);
        if !holds_slot {
            return Err(ValidationError::NotPermitted(format!(
                "cleaner {cleaner_id} holds no slot on job {}",
                job.id
            ))
            .into());
        }

        if room.status != RoomStatus::Pending
            || !self.store.assign_room(room_id, cleaner_id, self.clock.now()).await?
        {
            return Err(room_transition_error(&self.load_room(room_id).await?, "assigned"));
        }

        info!(job_id = %job.id, room_id = %room_id, cleaner_id = %cleaner_id, "Room assigned");
        self.load_room(room_id).await
    }

    /// Hand every unowned pending room to the active cleaners, largest room
    /// first, each to whoever currently carries the least effort.
    pub async fn auto_assign(&self, job_id: Uuid) -> Result<usize, Error> {
        let job = self.load_job(job_id).await?;
        if !job.status.requires_full_staffing() {
            return Ok(0);
        }

        let mut load: BTreeMap<String, u64> = self
            .store
            .list_completion_records(job_id)
            .await?
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| (r.cleaner_id, 0))
            .collect();
        if load.is_empty() {
            return Ok(0);
        }

        let rooms = self.store.list_rooms(job_id).await?;
        for room in &rooms {
            if let Some(owner) = &room.cleaner_id
                && let Some(l) = load.get_mut(owner)
            {
                *l += u64::from(room.effort_minutes);
            }
        }

        let mut unowned: Vec<&RoomAssignment> = rooms
            .iter()
            .filter(|r| r.cleaner_id.is_none() && r.status == RoomStatus::Pending)
            .collect();
        unowned.sort_by(|a, b| {
            b.effort_minutes
                .cmp(&a.effort_minutes)
                .then(a.position.cmp(&b.position))
        });

        let now = self.clock.now();
        let mut assigned = 0;
        for room in unowned {
            let Some(cleaner) = load
                .iter()
                .min_by_key(|(id, l)| (**l, (*id).clone()))
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            if self.store.assign_room(room.id, &cleaner, now).await? {
                *load.entry(cleaner.clone()).or_default() += u64::from(room.effort_minutes);
                assigned += 1;
                debug!(job_id = %job_id, room_id = %room.id, cleaner_id = %cleaner, "Room auto-assigned");
            }
        }

        if assigned > 0 {
            info!(job_id = %job_id, assigned, "Rooms distributed");
        }
        Ok(assigned)
    }

    /// Give every unowned pending room to one cleaner (a replacement taking
    /// over a departed cleaner's work).
    pub async fn assign_unowned(&self, job_id: Uuid, cleaner_id: &str) -> Result<usize, Error> {
        let now = self.clock.now();
        let mut assigned = 0;
        for room in self.store.list_rooms(job_id).await? {
            if room.cleaner_id.is_none()
                && room.status == RoomStatus::Pending
                && self.store.assign_room(room.id, cleaner_id, now).await?
            {
                assigned += 1;
            }
        }
        if assigned > 0 {
            info!(job_id = %job_id, cleaner_id = %cleaner_id, assigned, "Released rooms handed to replacement");
        }
        Ok(assigned)
    }

    /// Redistribute every room nobody has started among the current
    /// cleaners. Used when a job proceeds short-staffed.
    pub async fn repartition(&self, job_id: Uuid) -> Result<usize, Error> {
        let cleared = self
            .store
            .unassign_pending_rooms(job_id, self.clock.now())
            .await?;
        debug!(job_id = %job_id, cleared, "Pending rooms cleared for repartition");
        self.auto_assign(job_id).await
    }

    pub async fn start_room(&self, room_id: Uuid, cleaner_id: &str) -> Result<RoomAssignment, Error> {
        let room = self.load_room(room_id).await?;
        ensure_owner(&room, cleaner_id)?;

        if room.status != RoomStatus::Pending
            || !self.store.start_room(room_id, cleaner_id, self.clock.now()).await?
        {
            return Err(room_transition_error(&self.load_room(room_id).await?, "in_progress"));
        }

        debug!(room_id = %room_id, cleaner_id = %cleaner_id, "Room started");
        self.load_room(room_id).await
    }

    /// Mark a room done. Every checklist item and required photo must be
    /// accounted for; otherwise the missing pieces are reported.
    pub async fn complete_room(
        &self,
        room_id: Uuid,
        cleaner_id: &str,
        evidence: RoomEvidence,
    ) -> Result<RoomAssignment, Error> {
        let room = self.load_room(room_id).await?;
        ensure_owner(&room, cleaner_id)?;
        if room.status == RoomStatus::Completed {
            return Err(room_transition_error(&room, "completed"));
        }

        let missing = room.missing_requirements(&evidence);
        if !missing.is_empty() {
            return Err(ValidationError::MissingRequirements(missing).into());
        }

        if !self
            .store
            .complete_room(room_id, cleaner_id, &evidence, self.clock.now())
            .await?
        {
            return Err(room_transition_error(&self.load_room(room_id).await?, "completed"));
        }

        info!(job_id = %room.job_id, room_id = %room_id, cleaner_id = %cleaner_id, "Room completed");
        self.load_room(room_id).await
    }

    /// Rooms the cleaner owns that are not completed yet.
    pub async fn unfinished_rooms(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
    ) -> Result<Vec<MissingRequirement>, Error> {
        Ok(self
            .store
            .list_rooms(job_id)
            .await?
            .into_iter()
            .filter(|r| r.is_owned_by(cleaner_id) && r.status != RoomStatus::Completed)
            .map(|r| MissingRequirement::RoomNotCompleted {
                room_id: r.id,
                label: r.label,
            })
            .collect())
    }

    /// Check that the room shares add up to the job's pool.
    pub async fn verify_shares(&self, job_id: Uuid) -> Result<(), Error> {
        let job = self.load_job(job_id).await?;
        let actual: Decimal = self
            .store
            .list_rooms(job_id)
            .await?
            .iter()
            .map(|r| r.earnings_share)
            .sum();

        if actual != job.payout_pool {
            let err = IntegrityError::ShareMismatch {
                job_id,
                expected: job.payout_pool,
                actual,
            };
            error!(job_id = %job_id, error = %err, "Room shares out of balance");
            return Err(err.into());
        }
        Ok(())
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Job, Error> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("job", job_id).into())
    }

    async fn load_room(&self, room_id: Uuid) -> Result<RoomAssignment, Error> {
        self.store
            .get_room(room_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("room", room_id).into())
    }
}

fn ensure_owner(room: &RoomAssignment, cleaner_id: &str) -> Result<(), Error> {
    if room.is_owned_by(cleaner_id) {
        Ok(())
    } else {
        Err(ValidationError::NotPermitted(format!(
            "room {} is not assigned to cleaner {cleaner_id}",
            room.id
        ))
        .into())
    }
}

fn room_transition_error(room: &RoomAssignment, target: &str) -> Error {
    ValidationError::InvalidTransition {
        entity: "room",
        id: room.id,
        state: room.status.to_string(),
        target: target.to_string(),
    }
    .into()
}
