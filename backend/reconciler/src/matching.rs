//! # Matching service
//!
//! Classifies a freshly uploaded deposit against the pledge that carries the
//! same sender signature and commits the resulting state changes:
//!
//! | Pledge found | Amounts equal | Pledge     | Deposit   | Result                 |
//! |--------------|---------------|------------|-----------|------------------------|
//! | no           | —             | —          | `Orphan`  | `Err(Unmatched)`       |
//! | yes          | yes           | `Approved` | `Matched` | `Ok(deposit)`          |
//! | yes          | no            | `Rejected` | unchanged | `Err(PartiallyMatched)`|
//!
//! Matching is exact on both the signature string and the integer amount.
//! In every row the deposit stays stored; the error variants only tell the
//! uploader that the transfer was recorded but not accepted. One outcome
//! event is published after the commit.

use chrono::Utc;
use tracing::{info, warn};

use crate::db::{self, PledgeContext};
use crate::deposit::{Deposit, DepositEvent, DepositStatus, NewDeposit};
use crate::errors::{ReconcileError, Result};
use crate::events::{Event, Outcome, Reconciliation};
use crate::fsm::Label;
use crate::provisional::{NewPledge, ProvisionalDonation, ProvisionalEvent};
use crate::state::ServiceState;

/// Pure classification of `deposit` against the pledge found for its signature.
pub fn classify(deposit: &Deposit, pledge: Option<&ProvisionalDonation>) -> Outcome {
    match pledge {
        None => Outcome::Unmatched,
        Some(p) if p.amount == deposit.amount => Outcome::Matched,
        Some(_) => Outcome::PartiallyMatched,
    }
}

/// Record an uploaded transfer, then reconcile it.
pub async fn upload_deposit(state: &ServiceState, new: NewDeposit) -> Result<Deposit> {
    let deposit = {
        let mut conn = state.pool.acquire().await?;
        db::insert_deposit(&mut conn, &new, Utc::now().timestamp()).await?
    };
    info!(
        deposit_id = deposit.id,
        sender_sig = %deposit.sender_sig,
        amount = deposit.amount,
        "Deposit uploaded"
    );
    reconcile(state, deposit).await
}

/// Register a donor's pledge to pay `amount` towards a funding.
pub async fn register_pledge(state: &ServiceState, new: NewPledge) -> Result<ProvisionalDonation> {
    let mut tx = state.pool.begin().await?;
    db::find_user(&mut tx, new.user_id)
        .await?
        .ok_or_else(|| ReconcileError::user_not_found(new.user_id))?;
    let funding = db::find_funding(&mut tx, new.funding_id)
        .await?
        .ok_or_else(|| ReconcileError::funding_not_found(new.funding_id))?;
    new.validate(funding.goal)?;

    let pledge = db::insert_pledge(&mut tx, &new, Utc::now().timestamp()).await?;
    tx.commit().await?;

    info!(
        provisional_id = pledge.id,
        sender_sig = %pledge.sender_sig,
        amount = pledge.amount,
        "Pledge registered"
    );
    Ok(pledge)
}

/// Classify an `Unmatched` deposit and apply the outcome.
///
/// Holds the sender signature's lock for the whole read-modify-write so two
/// deposits with the same signature settle the pledge one after the other.
pub async fn reconcile(state: &ServiceState, mut deposit: Deposit) -> Result<Deposit> {
    if deposit.status != DepositStatus::Unmatched {
        return Err(ReconcileError::InvalidStatus {
            entity: "Deposit",
            expected: DepositStatus::Unmatched.as_str(),
            actual: deposit.status.as_str(),
        });
    }

    let _guard = state.locks.acquire(&deposit.sender_sig).await;
    let mut tx = state.pool.begin().await?;

    let found = db::find_pledge_context(&mut tx, &deposit.sender_sig).await?;
    match classify(&deposit, found.as_ref().map(|c| &c.pledge)) {
        Outcome::Unmatched => {
            deposit.apply(DepositEvent::Orphan)?;
            db::save_deposit(&mut tx, &deposit, DepositStatus::Unmatched).await?;
            tx.commit().await?;

            warn!(
                deposit_id = deposit.id,
                sender_sig = %deposit.sender_sig,
                "No pledge for sender signature; deposit orphaned"
            );
            let err = ReconcileError::Unmatched {
                deposit_id: deposit.id,
                sender_sig: deposit.sender_sig.clone(),
            };
            state.bus.publish(Event::DepositOrphaned(deposit));
            Err(err)
        }
        Outcome::Matched => {
            let PledgeContext {
                mut pledge,
                funding,
                donor,
            } = found.ok_or_else(|| ReconcileError::pledge_not_found(&deposit.sender_sig))?;

            let pledge_was = pledge.status;
            pledge.apply(ProvisionalEvent::DepositMatched)?;
            deposit.apply(DepositEvent::Match)?;
            deposit.provisional_donation_id = Some(pledge.id);
            db::save_pledge(&mut tx, &pledge, pledge_was).await?;
            db::save_deposit(&mut tx, &deposit, DepositStatus::Unmatched).await?;
            tx.commit().await?;

            info!(
                deposit_id = deposit.id,
                provisional_id = pledge.id,
                amount = deposit.amount,
                "Deposit matched"
            );
            state
                .bus
                .publish(Event::DepositMatched(Box::new(Reconciliation {
                    deposit: deposit.clone(),
                    pledge,
                    funding,
                    donor,
                })));
            Ok(deposit)
        }
        Outcome::PartiallyMatched => {
            let PledgeContext {
                mut pledge,
                funding,
                donor,
            } = found.ok_or_else(|| ReconcileError::pledge_not_found(&deposit.sender_sig))?;

            // Only the pledge settles here; the deposit is classified by the
            // partial-match handler.
            let pledge_was = pledge.status;
            pledge.apply(ProvisionalEvent::DepositPartiallyMatched)?;
            db::save_pledge(&mut tx, &pledge, pledge_was).await?;
            tx.commit().await?;

            warn!(
                deposit_id = deposit.id,
                provisional_id = pledge.id,
                pledged = pledge.amount,
                received = deposit.amount,
                "Deposit amount differs from pledge"
            );
            let err = ReconcileError::PartiallyMatched {
                deposit_id: deposit.id,
                pledged: pledge.amount,
                received: deposit.amount,
            };
            state
                .bus
                .publish(Event::DepositPartiallyMatched(Box::new(Reconciliation {
                    deposit,
                    pledge,
                    funding,
                    donor,
                })));
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::donation::DonationStatus;
    use crate::notify::NotificationKind;
    use crate::provisional::ProvisionalStatus;
    use crate::testing::{
        count_notifications, drain, fund_sum, load_deposit, load_pledge, new_deposit, seed,
        test_state,
    };

    #[test]
    fn classification_is_exact() {
        let deposit = crate::testing::deposit_fixture("HONG-1234", 10_000);
        let mut pledge = crate::testing::pledge_fixture("HONG-1234", 10_000);
        assert_eq!(classify(&deposit, None), Outcome::Unmatched);
        assert_eq!(classify(&deposit, Some(&pledge)), Outcome::Matched);
        pledge.amount = 10_001;
        assert_eq!(classify(&deposit, Some(&pledge)), Outcome::PartiallyMatched);
        pledge.amount = 9_999;
        assert_eq!(classify(&deposit, Some(&pledge)), Outcome::PartiallyMatched);
    }

    #[tokio::test]
    async fn exact_match_confirms_donation() {
        let (state, mut rx) = test_state().await;
        let world = seed(&state.pool).await;
        let pledge = register_pledge(&state, world.pledge("HONG-1234", 10_000))
            .await
            .unwrap();

        let deposit = upload_deposit(&state, new_deposit("HONG-1234", 10_000))
            .await
            .unwrap();
        let seen = drain(&state, &mut rx).await;

        assert_eq!(seen, vec!["deposit_matched", "reconciliation_finished"]);
        assert_eq!(deposit.status, DepositStatus::Matched);
        assert_eq!(load_deposit(&state.pool, deposit.id).await.status, DepositStatus::Matched);
        assert_eq!(load_pledge(&state.pool, pledge.id).await.status, ProvisionalStatus::Approved);

        let mut conn = state.pool.acquire().await.unwrap();
        assert_eq!(db::count_donations_for_deposit(&mut conn, deposit.id).await.unwrap(), 1);
        let donation = db::find_donation_by_deposit(&mut conn, deposit.id)
            .await
            .unwrap()
            .unwrap();
        drop(conn);
        assert_eq!(donation.amount, 10_000);
        assert_eq!(donation.status, DonationStatus::Donated);
        assert_eq!(donation.user_id, world.donor);

        assert_eq!(fund_sum(&state.pool, world.funding).await, 10_000);
        assert_eq!(count_notifications(&state.pool, NotificationKind::DonationSucceeded).await, 1);
        assert_eq!(count_notifications(&state.pool, NotificationKind::NewDonation).await, 1);
    }

    #[tokio::test]
    async fn unknown_signature_orphans_deposit() {
        let (state, mut rx) = test_state().await;
        let world = seed(&state.pool).await;

        let err = upload_deposit(&state, new_deposit("UNKNOWN-1234", 10_000))
            .await
            .unwrap_err();
        let deposit_id = match err {
            ReconcileError::Unmatched { deposit_id, .. } => deposit_id,
            other => panic!("expected Unmatched, got {other:?}"),
        };
        drain(&state, &mut rx).await;

        assert_eq!(load_deposit(&state.pool, deposit_id).await.status, DepositStatus::Orphan);
        let mut conn = state.pool.acquire().await.unwrap();
        assert_eq!(db::count_donations_for_deposit(&mut conn, deposit_id).await.unwrap(), 0);
        drop(conn);
        assert_eq!(fund_sum(&state.pool, world.funding).await, 0);
        assert_eq!(count_notifications(&state.pool, NotificationKind::DepositOrphaned).await, 1);
    }

    #[tokio::test]
    async fn amount_mismatch_rejects_pledge() {
        let (state, mut rx) = test_state().await;
        let world = seed(&state.pool).await;
        let pledge = register_pledge(&state, world.pledge("PARK-1234", 20_000))
            .await
            .unwrap();

        let err = upload_deposit(&state, new_deposit("PARK-1234", 10_000))
            .await
            .unwrap_err();
        let (deposit_id, pledged, received) = match err {
            ReconcileError::PartiallyMatched {
                deposit_id,
                pledged,
                received,
            } => (deposit_id, pledged, received),
            other => panic!("expected PartiallyMatched, got {other:?}"),
        };
        assert_eq!((pledged, received), (20_000, 10_000));
        assert_eq!(load_pledge(&state.pool, pledge.id).await.status, ProvisionalStatus::Rejected);

        drain(&state, &mut rx).await;

        let deposit = load_deposit(&state.pool, deposit_id).await;
        assert_eq!(deposit.status, DepositStatus::PartiallyMatched);
        assert_eq!(deposit.provisional_donation_id, Some(pledge.id));
        let mut conn = state.pool.acquire().await.unwrap();
        assert_eq!(db::count_donations_for_deposit(&mut conn, deposit_id).await.unwrap(), 0);
        drop(conn);
        assert_eq!(count_notifications(&state.pool, NotificationKind::DonationRejected).await, 1);
        assert_eq!(
            count_notifications(&state.pool, NotificationKind::DepositPartiallyMatched).await,
            1
        );
    }

    #[tokio::test]
    async fn same_snapshot_gives_same_result() {
        let mut results = Vec::new();
        for _ in 0..2 {
            let (state, mut rx) = test_state().await;
            let world = seed(&state.pool).await;
            register_pledge(&state, world.pledge("PARK-1234", 20_000))
                .await
                .unwrap();
            let res = upload_deposit(&state, new_deposit("PARK-1234", 10_000)).await;
            drain(&state, &mut rx).await;
            let deposit_id = match res {
                Err(ReconcileError::PartiallyMatched { deposit_id, .. }) => deposit_id,
                other => panic!("unexpected {other:?}"),
            };
            results.push(load_deposit(&state.pool, deposit_id).await.status);
        }
        assert_eq!(results[0], results[1]);
    }

    #[tokio::test]
    async fn second_deposit_for_settled_pledge_is_refused() {
        let (state, mut rx) = test_state().await;
        let world = seed(&state.pool).await;
        register_pledge(&state, world.pledge("HONG-1234", 10_000))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            upload_deposit(&state, new_deposit("HONG-1234", 10_000)),
            upload_deposit(&state, new_deposit("HONG-1234", 10_000)),
        );
        drain(&state, &mut rx).await;

        let (ok, refused): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(|r| r.is_ok());
        assert_eq!(ok.len(), 1);
        assert!(matches!(
            refused[0],
            Err(ReconcileError::InvalidTransition {
                entity: "ProvisionalDonation",
                ..
            })
        ));
        assert_eq!(fund_sum(&state.pool, world.funding).await, 10_000);
    }

    #[tokio::test]
    async fn pledge_over_goal_is_refused() {
        let (state, _rx) = test_state().await;
        let world = seed(&state.pool).await;
        let err = register_pledge(&state, world.pledge("HONG-1234", world.goal + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::AmountExceeded { .. }));
    }

    #[tokio::test]
    async fn only_unmatched_deposits_are_reconciled() {
        let (state, _rx) = test_state().await;
        let mut deposit = crate::testing::deposit_fixture("HONG-1234", 1);
        deposit.status = DepositStatus::Orphan;
        assert!(matches!(
            reconcile(&state, deposit).await,
            Err(ReconcileError::InvalidStatus { .. })
        ));
    }
}
