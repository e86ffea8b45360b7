//! Refund lifecycle of a confirmed donation.
//!
//! ```text
//! Donated ─request─► WaitingRefund ─assign─► WaitingRefundPhase2 ─complete─► RefundComplete
//!    ▲                  │    ▲                      │
//!    └─────cancel───────┘    └────────cancel────────┘
//! ```
//!
//! Donors open and cancel refunds, admins take them over and settle them.
//! Completing a refund also refunds the backing deposit and takes the amount
//! back out of the funding total in the same transaction.

use tracing::info;

use crate::db::{self, User};
use crate::deposit::DepositEvent;
use crate::donation::{Donation, DonationEvent};
use crate::effects::Effects;
use crate::errors::{ReconcileError, Result};
use crate::fsm::Label;
use crate::notify::{NewNotification, NotificationKind};
use crate::state::ServiceState;

/// Donor asks for their money back.
pub async fn request_refund(state: &ServiceState, donation_id: i64, donor_id: i64) -> Result<Donation> {
    let donation = step(state, donation_id, donor_id, DonationEvent::RefundRequested, |actor, d| {
        actor.id == d.user_id
    })
    .await?;
    notify_donor(state, &donation, NotificationKind::RefundRequested).await;
    Ok(donation)
}

/// Donor withdraws the request, or an admin hands a phase-2 refund back.
pub async fn cancel_refund(state: &ServiceState, donation_id: i64, user_id: i64) -> Result<Donation> {
    let donation = step(state, donation_id, user_id, DonationEvent::RefundCancelled, |actor, d| {
        actor.is_admin || actor.id == d.user_id
    })
    .await?;
    notify_donor(state, &donation, NotificationKind::RefundCancelled).await;
    Ok(donation)
}

/// An admin takes charge of a pending refund.
pub async fn assign_refund_admin(state: &ServiceState, donation_id: i64, admin_id: i64) -> Result<Donation> {
    let donation = step(state, donation_id, admin_id, DonationEvent::AdminAssigned, |actor, _| {
        actor.is_admin
    })
    .await?;
    notify_donor(state, &donation, NotificationKind::RefundInProgress).await;
    Ok(donation)
}

/// The money went back to the donor.
pub async fn complete_refund(state: &ServiceState, donation_id: i64, admin_id: i64) -> Result<Donation> {
    let mut tx = state.pool.begin().await?;
    let mut donation = authorize(&mut tx, donation_id, admin_id, |actor, _| actor.is_admin).await?;
    let mut deposit = db::find_deposit(&mut tx, donation.deposit_id)
        .await?
        .ok_or_else(|| ReconcileError::deposit_not_found(donation.deposit_id))?;

    let (donation_was, deposit_was) = (donation.status, deposit.status);
    donation.apply(DonationEvent::RefundCompleted)?;
    deposit.apply(DepositEvent::Refund)?;
    db::save_donation(&mut tx, &donation, donation_was).await?;
    db::save_deposit(&mut tx, &deposit, deposit_was).await?;
    db::adjust_fund_sum(&mut tx, donation.funding_id, -donation.amount).await?;
    tx.commit().await?;

    info!(
        donation_id,
        deposit_id = deposit.id,
        amount = donation.amount,
        "Refund completed"
    );
    notify_donor(state, &donation, NotificationKind::RefundCompleted).await;
    Ok(donation)
}

async fn step(
    state: &ServiceState,
    donation_id: i64,
    actor_id: i64,
    event: DonationEvent,
    allowed: impl Fn(&User, &Donation) -> bool,
) -> Result<Donation> {
    let mut conn = state.pool.acquire().await?;
    let mut donation = authorize(&mut conn, donation_id, actor_id, allowed).await?;
    let from = donation.status;
    donation.apply(event)?;
    db::save_donation(&mut conn, &donation, from).await?;
    info!(
        donation_id,
        actor_id,
        from = from.as_str(),
        to = donation.status.as_str(),
        "Refund step"
    );
    Ok(donation)
}

async fn authorize(
    conn: &mut sqlx::SqliteConnection,
    donation_id: i64,
    actor_id: i64,
    allowed: impl Fn(&User, &Donation) -> bool,
) -> Result<Donation> {
    let donation = db::find_donation(conn, donation_id)
        .await?
        .ok_or_else(|| ReconcileError::donation_not_found(donation_id))?;
    let actor = db::find_user(conn, actor_id)
        .await?
        .ok_or_else(|| ReconcileError::user_not_found(actor_id))?;
    if !allowed(&actor, &donation) {
        return Err(ReconcileError::Forbidden(format!(
            "user {actor_id} may not change the refund of donation {donation_id}"
        )));
    }
    Ok(donation)
}

async fn notify_donor(state: &ServiceState, donation: &Donation, kind: NotificationKind) {
    let mut effects = Effects::new("refund", donation.id);
    effects.add(
        "notify_donor",
        state.notifier.notify(NewNotification {
            recipient_id: donation.user_id,
            sender_id: None,
            kind,
            subject_id: donation.id,
        }),
    );
    effects.join().await;
}
