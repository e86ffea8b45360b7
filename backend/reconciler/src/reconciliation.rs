//! # Reconciliation handlers
//!
//! React to the outcome events published by [`crate::matching`]. Each
//! handler first commits whatever must stay consistent with the aggregates
//! (the donation row for a match, the deposit's classification for a partial
//! match), then fans the remaining side effects out through
//! [`Effects`] and raises `ReconciliationFinished` once they have all
//! settled, whether or not they succeeded.

use chrono::Utc;
use tracing::info;

use crate::db;
use crate::deposit::{DepositEvent, DepositStatus};
use crate::donation::NewDonation;
use crate::effects::Effects;
use crate::errors::{ReconcileError, Result};
use crate::events::{Event, Outcome, Reconciliation};
use crate::fsm::Label;
use crate::notify::{self, NewNotification, NotificationKind};
use crate::state::ServiceState;

/// Matched: create the donation for the deposit, then bump the funding total
/// and tell the donor and the funding owner.
pub async fn on_matched(state: &ServiceState, rec: Reconciliation) -> Result<()> {
    let Reconciliation {
        deposit,
        pledge,
        funding,
        donor,
    } = rec;

    let donation = {
        let mut tx = state.pool.begin().await?;
        let current = db::find_deposit(&mut tx, deposit.id)
            .await?
            .ok_or_else(|| ReconcileError::deposit_not_found(deposit.id))?;
        if current.status != DepositStatus::Matched {
            return Err(ReconcileError::InvalidStatus {
                entity: "Deposit",
                expected: DepositStatus::Matched.as_str(),
                actual: current.status.as_str(),
            });
        }
        stand_back_from_deletion(state, deposit.id)?;
        let new = NewDonation::for_match(&current, &pledge, funding.goal, Utc::now())?;
        let donation = db::insert_donation(&mut tx, &new).await?;
        tx.commit().await?;
        donation
    };
    info!(
        deposit_id = deposit.id,
        donation_id = donation.id,
        order_id = %donation.order_id,
        "Donation confirmed"
    );

    let pool = &state.pool;
    let notifier = state.notifier.as_ref();
    let (funding_id, amount) = (funding.id, donation.amount);
    let mut effects = Effects::new(Outcome::Matched.as_str(), deposit.id);
    effects
        .add("increase_fund_sum", async move {
            let mut conn = pool.acquire().await?;
            db::adjust_fund_sum(&mut conn, funding_id, amount).await
        })
        .add(
            "notify_donor",
            notifier.notify(NewNotification {
                recipient_id: donor.id,
                sender_id: None,
                kind: NotificationKind::DonationSucceeded,
                subject_id: donation.id,
            }),
        )
        .add(
            "notify_funding_owner",
            notifier.notify(NewNotification {
                recipient_id: funding.owner_id,
                sender_id: Some(donor.id),
                kind: NotificationKind::NewDonation,
                subject_id: donation.id,
            }),
        );
    effects.join().await;

    state.bus.publish(Event::ReconciliationFinished {
        deposit_id: deposit.id,
        outcome: Outcome::Matched,
    });
    Ok(())
}

/// Partially matched: classify the deposit against the rejected pledge, tell
/// the donor why, and ask the admins to sort out the amount.
pub async fn on_partially_matched(state: &ServiceState, rec: Reconciliation) -> Result<()> {
    let Reconciliation {
        deposit,
        pledge,
        donor,
        ..
    } = rec;

    {
        let mut tx = state.pool.begin().await?;
        let mut current = db::find_deposit(&mut tx, deposit.id)
            .await?
            .ok_or_else(|| ReconcileError::deposit_not_found(deposit.id))?;
        stand_back_from_deletion(state, deposit.id)?;
        let from = current.status;
        current.apply(DepositEvent::PartialMatch)?;
        current.provisional_donation_id = Some(pledge.id);
        db::save_deposit(&mut tx, &current, from).await?;
        tx.commit().await?;
    }
    info!(
        deposit_id = deposit.id,
        provisional_id = pledge.id,
        "Deposit marked partially matched"
    );

    let pool = &state.pool;
    let notifier = state.notifier.as_ref();
    let mut effects = Effects::new(Outcome::PartiallyMatched.as_str(), deposit.id);
    effects
        .add(
            "notify_donor",
            notifier.notify(NewNotification {
                recipient_id: donor.id,
                sender_id: None,
                kind: NotificationKind::DonationRejected,
                subject_id: pledge.id,
            }),
        )
        .add(
            "notify_admins",
            notify::notify_admins(
                pool,
                notifier,
                NotificationKind::DepositPartiallyMatched,
                Some(donor.id),
                deposit.id,
            ),
        );
    effects.join().await;

    state.bus.publish(Event::ReconciliationFinished {
        deposit_id: deposit.id,
        outcome: Outcome::PartiallyMatched,
    });
    Ok(())
}

/// Unmatched: the deposit must already be an orphan; ask the admins to
/// identify the sender.
pub async fn on_orphaned(state: &ServiceState, deposit_id: i64) -> Result<()> {
    let current = {
        let mut conn = state.pool.acquire().await?;
        db::find_deposit(&mut conn, deposit_id)
            .await?
            .ok_or_else(|| ReconcileError::deposit_not_found(deposit_id))?
    };
    if current.status != DepositStatus::Orphan {
        return Err(ReconcileError::InvalidStatus {
            entity: "Deposit",
            expected: DepositStatus::Orphan.as_str(),
            actual: current.status.as_str(),
        });
    }

    let mut effects = Effects::new(Outcome::Unmatched.as_str(), deposit_id);
    effects.add(
        "notify_admins",
        notify::notify_admins(
            &state.pool,
            state.notifier.as_ref(),
            NotificationKind::DepositOrphaned,
            None,
            deposit_id,
        ),
    );
    effects.join().await;

    state.bus.publish(Event::ReconciliationFinished {
        deposit_id,
        outcome: Outcome::Unmatched,
    });
    Ok(())
}

/// A live deletion owns the deposit; the reactor redelivers the event once
/// the workflow has finished.
fn stand_back_from_deletion(state: &ServiceState, deposit_id: i64) -> Result<()> {
    if state.deletions.is_live(deposit_id) {
        return Err(ReconcileError::DepositLocked { deposit_id });
    }
    Ok(())
}
