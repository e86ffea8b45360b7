//! Event loop: hands every published event to the one handler that owns it.
//!
//! A handler that fails transiently (database contention, a guarded write
//! that lost a race, a deposit held by a deletion) gets the same event again
//! after a growing pause, up to [`Redelivery::attempts`] times in all.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::events::Event;
use crate::reconciliation;
use crate::saga;
use crate::state::ServiceState;

/// Route one event. Terminal notifications (`ReconciliationFinished`,
/// `DeletionFinished`) have no handler and are only logged.
pub async fn dispatch(state: &ServiceState, event: Event) -> Result<()> {
    match event {
        Event::DepositMatched(rec) => reconciliation::on_matched(state, *rec).await,
        Event::DepositPartiallyMatched(rec) => {
            reconciliation::on_partially_matched(state, *rec).await
        }
        Event::DepositOrphaned(deposit) => reconciliation::on_orphaned(state, deposit.id).await,
        Event::DeletionRequested {
            deposit_id,
            admin_id,
        } => saga::on_deletion_requested(state, deposit_id, admin_id).await,
        Event::DonationDeleted { deposit_id, .. } | Event::MatchCancelled { deposit_id, .. } => {
            saga::on_dependent_released(state, deposit_id).await
        }
        Event::ReconciliationFinished {
            deposit_id,
            outcome,
        } => {
            info!(deposit_id, outcome = ?outcome, "Reconciliation finished");
            Ok(())
        }
        Event::DeletionFinished { deposit_id, step } => {
            info!(deposit_id, step = ?step, "Deposit deletion finished");
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Redelivery {
    /// Deliveries in total, the first one included.
    pub attempts: u32,
    /// Pause before the second delivery; doubles after each failure.
    pub backoff: Duration,
}

impl Default for Redelivery {
    fn default() -> Self {
        Self {
            attempts: 6,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Run `deliver` until it succeeds, fails permanently or uses up the policy.
pub async fn redeliver<F, Fut>(
    policy: Redelivery,
    kind: &'static str,
    deposit_id: i64,
    mut deliver: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut delay = policy.backoff;
    let mut attempt = 1;
    loop {
        match deliver().await {
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                warn!(event = kind, deposit_id, attempt, "Handler failed, redelivering: {e}");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            res => return res,
        }
    }
}

/// Consume the bus until it closes or `cancel` fires. Each event gets its own
/// task so a slow handler never holds up the rest.
pub async fn run(state: ServiceState, mut rx: UnboundedReceiver<Event>, cancel: CancellationToken) {
    info!("Event reactor starting");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(event) => event,
                None => {
                    warn!("Event bus closed");
                    break;
                }
            },
        };

        let state = state.clone();
        tokio::spawn(async move {
            let kind = event.kind();
            let deposit_id = event.deposit_id();
            debug!(event = kind, deposit_id, "Dispatching");
            let (state, event) = (&state, &event);
            let res = redeliver(Redelivery::default(), kind, deposit_id, move || {
                dispatch(state, event.clone())
            })
            .await;
            if let Err(e) = res {
                error!(event = kind, deposit_id, "Handler failed: {e}");
            }
        });
    }
    info!("Event reactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::deposit::DepositStatus;
    use crate::errors::ReconcileError;
    use crate::matching::{register_pledge, upload_deposit};
    use crate::testing::{fund_sum, load_deposit, new_deposit, seed, test_state};

    const QUICK: Redelivery = Redelivery {
        attempts: 3,
        backoff: Duration::from_millis(1),
    };

    #[tokio::test]
    async fn failed_match_is_delivered_again() {
        let (state, mut rx) = test_state().await;
        let world = seed(&state.pool).await;
        register_pledge(&state, world.pledge("HONG-1234", 10_000))
            .await
            .unwrap();
        let deposit = upload_deposit(&state, new_deposit("HONG-1234", 10_000))
            .await
            .unwrap();
        let event = rx.try_recv().unwrap();

        let mut deliveries = 0;
        redeliver(QUICK, event.kind(), deposit.id, || {
            deliveries += 1;
            let first = deliveries == 1;
            let (state, event) = (&state, event.clone());
            async move {
                if first {
                    return Err(ReconcileError::Database(sqlx::Error::PoolTimedOut));
                }
                dispatch(state, event).await
            }
        })
        .await
        .unwrap();

        assert_eq!(deliveries, 2);
        let mut conn = state.pool.acquire().await.unwrap();
        assert!(db::find_donation_by_deposit(&mut conn, deposit.id)
            .await
            .unwrap()
            .is_some());
        drop(conn);
        assert_eq!(fund_sum(&state.pool, world.funding).await, 10_000);
    }

    #[tokio::test]
    async fn redelivery_is_bounded_and_skips_permanent_errors() {
        let mut deliveries = 0;
        let err = redeliver(QUICK, "deposit_matched", 1, || {
            deliveries += 1;
            async { Err(ReconcileError::DepositLocked { deposit_id: 1 }) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ReconcileError::DepositLocked { .. }));
        assert_eq!(deliveries, 3);

        let mut deliveries = 0;
        let err = redeliver(QUICK, "deposit_matched", 1, || {
            deliveries += 1;
            async { Err(ReconcileError::deposit_not_found(1)) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ReconcileError::NotFound { .. }));
        assert_eq!(deliveries, 1);
    }

    #[tokio::test]
    async fn background_loop_runs_handlers() {
        let (state, rx) = test_state().await;
        let world = seed(&state.pool).await;
        let cancel = CancellationToken::new();
        let reactor = tokio::spawn(run(state.clone(), rx, cancel.clone()));

        register_pledge(&state, world.pledge("PARK-1234", 20_000))
            .await
            .unwrap();
        let deposit_id = match upload_deposit(&state, new_deposit("PARK-1234", 10_000)).await {
            Err(crate::errors::ReconcileError::PartiallyMatched { deposit_id, .. }) => deposit_id,
            other => panic!("unexpected {other:?}"),
        };

        let mut status = DepositStatus::Unmatched;
        for _ in 0..50 {
            status = load_deposit(&state.pool, deposit_id).await.status;
            if status == DepositStatus::PartiallyMatched {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, DepositStatus::PartiallyMatched);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), reactor)
            .await
            .unwrap()
            .unwrap();
    }
}
