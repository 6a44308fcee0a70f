//! Pure settlement math.
//!
//! `settle` is a function of its inputs only: the final completion state of a
//! job and the pricing snapshot in force when the job was first settled.
//! Re-running it with the same inputs always yields the same lines.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::completion::model::CompletionStatus;
use crate::config::PricingSnapshot;
use crate::error::ValidationError;
use crate::jobs::model::Relationship;
use crate::settlement::model::{
    LineDraft, LineKind, PLATFORM_RECIPIENT, SettlementComputation, SettlementInput,
};

/// Round to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Compute one line per worker plus a fee line.
///
/// A loyalty bonus is a rebate out of the fee taken on that worker, so it is
/// capped at that fee and the fee line's net never goes negative.
pub fn settle(
    input: &SettlementInput,
    pricing: &PricingSnapshot,
) -> Result<SettlementComputation, ValidationError> {
    let fee_rate = pricing.fee_rate(input.relationship);
    let mut lines = Vec::with_capacity(input.workers.len() + 1);
    let mut total_fee = Decimal::ZERO;
    let mut total_bonus = Decimal::ZERO;
    let mut paid_gross = Decimal::ZERO;

    for worker in &input.workers {
        let gross: Decimal = worker.completed_shares.iter().copied().sum();
        let completed = worker.completed_shares.len();

        let (bonus_rate, reason) = match worker.status {
            CompletionStatus::Completed => (pricing.bonus_rate(worker.loyalty_tier.as_deref()), None),
            CompletionStatus::DroppedOut => {
                let assigned = completed + worker.released_rooms as usize;
                (
                    Decimal::ZERO,
                    Some(format!(
                        "partial_completion: {completed} of {assigned} rooms completed before drop-out"
                    )),
                )
            }
            CompletionStatus::NoShow => (Decimal::ZERO, Some("no_show".to_string())),
            other => {
                return Err(ValidationError::InvalidTransition {
                    entity: "job",
                    id: input.job_id,
                    state: format!("worker {} {other}", worker.cleaner_id),
                    target: "settled".into(),
                });
            }
        };

        let fee = round_money(gross * fee_rate);
        let bonus = round_money(gross * bonus_rate).min(fee);
        total_fee += fee;
        total_bonus += bonus;
        paid_gross += gross;

        lines.push(LineDraft {
            recipient_id: worker.cleaner_id.clone(),
            kind: LineKind::Worker,
            gross,
            fee,
            bonus,
            net: gross - fee + bonus,
            adjustment_reason: reason,
        });
    }

    if !total_fee.is_zero() || !total_bonus.is_zero() {
        let (recipient_id, kind) = match (input.relationship, &input.business_owner_id) {
            (Relationship::BusinessEmployee, Some(owner)) => (owner.clone(), LineKind::BusinessFee),
            _ => (PLATFORM_RECIPIENT.to_string(), LineKind::PlatformFee),
        };
        lines.push(LineDraft {
            recipient_id,
            kind,
            gross: total_fee,
            fee: Decimal::ZERO,
            bonus: total_bonus,
            net: total_fee - total_bonus,
            adjustment_reason: None,
        });
    }

    Ok(SettlementComputation {
        lines,
        unallocated: input.room_pool - paid_gross,
    })
}
