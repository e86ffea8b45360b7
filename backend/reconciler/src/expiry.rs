//! Background task that rejects pledges nobody paid for in time.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db;
use crate::effects::Effects;
use crate::errors::{ReconcileError, Result};
use crate::notify::{NewNotification, NotificationKind};
use crate::provisional::{ProvisionalDonation, ProvisionalEvent};
use crate::state::ServiceState;

/// Run the sweep every `expiry_poll_interval_secs` until cancelled.
pub async fn run(state: ServiceState, config: Config, cancel: CancellationToken) {
    info!(
        timeout_secs = config.pledge_timeout_secs,
        "Pledge expiry sweep starting"
    );
    let mut ticker = tokio::time::interval(Duration::from_secs(config.expiry_poll_interval_secs));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Pledge expiry sweep stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = sweep_once(&state, config.pledge_timeout_secs, Utc::now().timestamp()).await {
                    error!("Pledge expiry sweep error: {e}");
                }
            }
        }
    }
}

/// Time out every `Pending` pledge created more than `timeout_secs` before
/// `now`. Returns how many were rejected.
pub async fn sweep_once(state: &ServiceState, timeout_secs: u64, now: i64) -> Result<usize> {
    let cutoff = now.saturating_sub(i64::try_from(timeout_secs).unwrap_or(i64::MAX));
    let candidates = {
        let mut conn = state.pool.acquire().await?;
        db::pending_pledges_before(&mut conn, cutoff).await?
    };
    if candidates.is_empty() {
        return Ok(0);
    }

    let mut expired = Vec::new();
    for candidate in candidates {
        if let Some(pledge) = expire(state, &candidate.sender_sig, candidate.id).await? {
            expired.push(pledge);
        }
    }

    let mut effects = Effects::new("pledge_expiry", cutoff);
    for pledge in &expired {
        effects.add(
            "notify_donor",
            state.notifier.notify(NewNotification {
                recipient_id: pledge.user_id,
                sender_id: None,
                kind: NotificationKind::PledgeExpired,
                subject_id: pledge.id,
            }),
        );
    }
    let report = effects.join().await;
    if !report.all_succeeded() {
        warn!(missed = report.failed.len(), "Some donors were not told their pledge expired");
    }

    info!(expired = expired.len(), "Pledge expiry sweep finished");
    Ok(expired.len())
}

/// Re-check the pledge under its signature lock; a deposit may have settled
/// it since the candidate list was read.
async fn expire(state: &ServiceState, sender_sig: &str, id: i64) -> Result<Option<ProvisionalDonation>> {
    let _guard = state.locks.acquire(sender_sig).await;
    let mut conn = state.pool.acquire().await?;
    let Some(mut pledge) = db::find_pledge(&mut conn, id).await? else {
        return Ok(None);
    };
    let from = pledge.status;
    match pledge.apply(ProvisionalEvent::TimedOut) {
        Ok(_) => {}
        Err(ReconcileError::InvalidTransition { state: from, .. }) => {
            debug!(provisional_id = id, from, "Pledge settled before expiry");
            return Ok(None);
        }
        Err(e) => return Err(e),
    }
    db::save_pledge(&mut conn, &pledge, from).await?;
    info!(provisional_id = id, sender_sig, "Pledge timed out");
    Ok(Some(pledge))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::{register_pledge, upload_deposit};
    use crate::provisional::ProvisionalStatus;
    use crate::testing::{count_notifications, load_pledge, new_deposit, seed, test_state};

    const DAY: i64 = 86_400;

    #[tokio::test]
    async fn only_old_pending_pledges_expire() {
        let (state, _rx) = test_state().await;
        let world = seed(&state.pool).await;
        let stale = register_pledge(&state, world.pledge("HONG-1234", 10_000))
            .await
            .unwrap();
        let paid = register_pledge(&state, world.pledge("KIM-5678", 5_000))
            .await
            .unwrap();
        upload_deposit(&state, new_deposit("KIM-5678", 5_000))
            .await
            .unwrap();

        let later = Utc::now().timestamp() + 4 * DAY;
        assert_eq!(sweep_once(&state, 3 * DAY as u64, later).await.unwrap(), 1);

        assert_eq!(load_pledge(&state.pool, stale.id).await.status, ProvisionalStatus::Rejected);
        assert_eq!(load_pledge(&state.pool, paid.id).await.status, ProvisionalStatus::Approved);
        assert_eq!(count_notifications(&state.pool, NotificationKind::PledgeExpired).await, 1);

        // Nothing left to do on the next tick.
        assert_eq!(sweep_once(&state, 3 * DAY as u64, later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fresh_pledges_are_left_alone() {
        let (state, _rx) = test_state().await;
        let world = seed(&state.pool).await;
        let pledge = register_pledge(&state, world.pledge("HONG-1234", 10_000))
            .await
            .unwrap();

        let now = Utc::now().timestamp();
        assert_eq!(sweep_once(&state, 3 * DAY as u64, now).await.unwrap(), 0);
        assert_eq!(load_pledge(&state.pool, pledge.id).await.status, ProvisionalStatus::Pending);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (state, _rx) = test_state().await;
        let config = Config {
            database_url: "sqlite::memory:".into(),
            api_port: 0,
            pledge_timeout_secs: 60,
            expiry_poll_interval_secs: 3_600,
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(state, config, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
