//! Unified `Database` trait — single async interface for all persistence.
//!
//! Every terminal-state transition is a conditional update: the `bool` (or
//! `Option`) a method returns says whether this caller won the transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
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

/// Result of a co-worker taking an extra-work batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraWorkClaim {
    /// The caller won; these rooms are now theirs.
    Won { rooms: Vec<Uuid> },
    /// The offer or its batch was already resolved.
    Lost,
}

/// Backend-agnostic database trait covering the whole job aggregate.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    async fn get_job_by_appointment(
        &self,
        appointment_id: &str,
    ) -> Result<Option<Job>, DatabaseError>;

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError>;

    /// Conditional status change. Returns false when the job is not in `from`.
    async fn transition_job(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Let an understaffed job go ahead with whoever is confirmed:
    /// `edge_case -> filled` with `total_required = confirmed_count`.
    /// Returns the new total, or None when the job was not in `edge_case`
    /// or has nobody confirmed.
    async fn shrink_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<u32>, DatabaseError>;

    /// Cancel from any non-terminal status, withdrawing everything pending
    /// and releasing every slot in one transaction. None when the job was
    /// already terminal.
    async fn cancel_job(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<CancelSummary>, DatabaseError>;

    /// Delete the job and everything it owns. Returns false if no job
    /// belongs to the appointment.
    async fn delete_job_for_appointment(&self, appointment_id: &str)
    -> Result<bool, DatabaseError>;

    // ── Slots ───────────────────────────────────────────────────────

    /// Atomic compare-and-increment of `confirmed_count`, or takeover of a
    /// vacated slot on a started job.
    async fn claim_slot(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, DatabaseError>;

    /// Undo a claim whose follow-up transition lost a race.
    async fn revert_claim(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        claim: &ClaimResult,
        now: DateTime<Utc>,
    ) -> Result<SlotRelease, DatabaseError>;

    /// Free the cleaner's slot, or vacate it if the job already started.
    async fn release_slot(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SlotRelease, DatabaseError>;

    async fn list_slot_holders(&self, job_id: Uuid) -> Result<Vec<SlotHolder>, DatabaseError>;

    // ── Offers ──────────────────────────────────────────────────────

    /// Insert unless the cleaner already has a pending offer on the job.
    async fn insert_offer(&self, offer: &Offer) -> Result<bool, DatabaseError>;

    async fn get_offer(&self, id: Uuid) -> Result<Option<Offer>, DatabaseError>;

    async fn list_offers(&self, job_id: Uuid) -> Result<Vec<Offer>, DatabaseError>;

    async fn count_pending_offers(
        &self,
        job_id: Uuid,
        offer_type: Option<OfferType>,
    ) -> Result<u64, DatabaseError>;

    /// `pending -> to`. Returns false if the offer was no longer pending.
    async fn resolve_offer(
        &self,
        id: Uuid,
        to: OfferStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Expire every pending offer past its deadline, returning the ones
    /// this call expired.
    async fn expire_offers(&self, now: DateTime<Utc>) -> Result<Vec<Offer>, DatabaseError>;

    /// Withdraw pending offers on the job, except those of cleaners who
    /// already hold a slot and are mid-way through accepting.
    async fn withdraw_pending_offers(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    // ── Join requests ───────────────────────────────────────────────

    /// Insert unless the cleaner already has a pending request on the job.
    async fn insert_join_request(&self, request: &JoinRequest) -> Result<bool, DatabaseError>;

    async fn get_join_request(&self, id: Uuid) -> Result<Option<JoinRequest>, DatabaseError>;

    async fn list_join_requests(&self, job_id: Uuid) -> Result<Vec<JoinRequest>, DatabaseError>;

    async fn count_pending_join_requests(&self, job_id: Uuid) -> Result<u64, DatabaseError>;

    /// `from -> to`. Returns false if the request was not in `from`.
    async fn transition_join_request(
        &self,
        id: Uuid,
        from: JoinRequestStatus,
        to: JoinRequestStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Resolve a pending request and its slot claim in one transaction.
    ///
    /// The slot is claimed first. On success the request moves to `to` and
    /// `record` is written; when no slot is left the request moves to
    /// `expired` instead. `None` (and no claim) when the request was no
    /// longer pending.
    async fn grant_join_request(
        &self,
        id: Uuid,
        to: JoinRequestStatus,
        record: &CompletionRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimResult>, DatabaseError>;

    /// Expire every pending request on a job whose slots are all taken.
    async fn expire_pending_join_requests(
        &self,
        job_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Pending requests whose approval window has passed.
    async fn due_join_requests(&self, now: DateTime<Utc>)
    -> Result<Vec<JoinRequest>, DatabaseError>;

    // ── Rooms ───────────────────────────────────────────────────────

    /// Insert the job's partition. Returns false if the job already has rooms.
    async fn insert_rooms(
        &self,
        job_id: Uuid,
        rooms: &[RoomAssignment],
    ) -> Result<bool, DatabaseError>;

    async fn get_room(&self, id: Uuid) -> Result<Option<RoomAssignment>, DatabaseError>;

    async fn list_rooms(&self, job_id: Uuid) -> Result<Vec<RoomAssignment>, DatabaseError>;

    /// Give a pending room to a cleaner. Returns false if it is no longer pending.
    async fn assign_room(
        &self,
        room_id: Uuid,
        cleaner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// `pending -> in_progress` for the owning cleaner.
    async fn start_room(
        &self,
        room_id: Uuid,
        cleaner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Mark an owned, unfinished room completed with the given evidence.
    async fn complete_room(
        &self,
        room_id: Uuid,
        cleaner_id: &str,
        evidence: &RoomEvidence,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Clear ownership on every still-pending room of the job.
    async fn unassign_pending_rooms(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    // ── Completion records ──────────────────────────────────────────

    /// Insert unless a record already exists for the pair.
    async fn insert_completion_record(
        &self,
        record: &CompletionRecord,
    ) -> Result<bool, DatabaseError>;

    async fn get_completion_record(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
    ) -> Result<Option<CompletionRecord>, DatabaseError>;

    async fn list_completion_records(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<CompletionRecord>, DatabaseError>;

    /// `from -> to` for one worker. Returns false if the record was not in `from`.
    async fn transition_completion(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        from: CompletionStatus,
        to: CompletionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Move a non-terminal worker to the departure status, return their
    /// unfinished rooms to the pool and record how many were taken back.
    /// Returns the released room ids, or None if the worker was already
    /// terminal.
    async fn record_departure(
        &self,
        job_id: Uuid,
        cleaner_id: &str,
        departure: Departure,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Uuid>>, DatabaseError>;

    /// `assigned` workers on filled or in-progress jobs whose start was at
    /// or before `cutoff` and who have not touched a room.
    async fn due_no_shows(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CompletionRecord>, DatabaseError>;

    // ── Extra work ──────────────────────────────────────────────────

    async fn insert_extra_work(
        &self,
        batch: &ExtraWorkBatch,
        offers: &[ExtraWorkOffer],
    ) -> Result<(), DatabaseError>;

    async fn get_extra_work_batch(&self, id: Uuid)
    -> Result<Option<ExtraWorkBatch>, DatabaseError>;

    async fn get_extra_work_offer(&self, id: Uuid)
    -> Result<Option<ExtraWorkOffer>, DatabaseError>;

    async fn list_extra_work_batches(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<ExtraWorkBatch>, DatabaseError>;

    async fn list_extra_work_offers(
        &self,
        batch_id: Uuid,
    ) -> Result<Vec<ExtraWorkOffer>, DatabaseError>;

    /// First acceptance wins the batch: the batch and offer move to
    /// `accepted`, sibling offers are withdrawn, and the batch's rooms
    /// are assigned to the accepting cleaner.
    async fn accept_extra_work(
        &self,
        offer_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ExtraWorkClaim, DatabaseError>;

    /// `pending -> declined`. Returns None if the offer was no longer
    /// pending, otherwise whether the batch has no pending offers left.
    async fn decline_extra_work(
        &self,
        offer_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>, DatabaseError>;

    /// `open -> escalated`, withdrawing any pending offers.
    async fn escalate_extra_work(
        &self,
        batch_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Open batches whose window has passed.
    async fn due_extra_work(&self, now: DateTime<Utc>) -> Result<Vec<ExtraWorkBatch>, DatabaseError>;

    async fn count_open_extra_work(&self, job_id: Uuid) -> Result<u64, DatabaseError>;

    // ── Edge-case decisions ─────────────────────────────────────────

    /// Insert unless the job already has a pending decision.
    async fn insert_decision(&self, decision: &EdgeCaseDecision) -> Result<bool, DatabaseError>;

    async fn get_decision(&self, id: Uuid) -> Result<Option<EdgeCaseDecision>, DatabaseError>;

    async fn list_decisions(&self, job_id: Uuid) -> Result<Vec<EdgeCaseDecision>, DatabaseError>;

    /// `pending -> to`. Returns false if the decision was already resolved.
    async fn resolve_decision(
        &self,
        id: Uuid,
        to: DecisionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn due_decisions(&self, now: DateTime<Utc>)
    -> Result<Vec<EdgeCaseDecision>, DatabaseError>;

    // ── Settlement ──────────────────────────────────────────────────

    /// Store the pricing a job is settled under, unless one is already
    /// stored. Returns the snapshot in force for the job.
    async fn pin_job_pricing(
        &self,
        job_id: Uuid,
        snapshot: &PricingSnapshot,
        now: DateTime<Utc>,
    ) -> Result<PricingSnapshot, DatabaseError>;

    async fn list_settlement_lines(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<SettlementLine>, DatabaseError>;

    /// Append lines and their payment intents, provided the job still has
    /// exactly `expected_existing` lines. Returns false otherwise.
    async fn append_settlement(
        &self,
        job_id: Uuid,
        expected_existing: usize,
        lines: &[SettlementLine],
        intents: &[PaymentIntent],
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn list_unsubmitted_intents(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<PaymentIntent>, DatabaseError>;

    async fn mark_intent_submitted(
        &self,
        line_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;
}
