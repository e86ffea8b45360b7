//! Shared test fixtures: an in-memory database, a seeded funding with its
//! users, and a synchronous event drain.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::db;
use crate::deposit::{Deposit, DepositStatus, NewDeposit};
use crate::donation::{Donation, DonationStatus};
use crate::errors::{ReconcileError, Result};
use crate::events::{Event, EventBus};
use crate::fsm::Label;
use crate::notify::{NewNotification, NotificationKind, Notifier, SqliteNotifier};
use crate::provisional::{NewPledge, ProvisionalDonation, ProvisionalStatus};
use crate::reactor;
use crate::state::ServiceState;

pub(crate) type Rx = UnboundedReceiver<Event>;

/// In-memory SQLite with all migrations applied. A single connection that
/// never expires, since every new connection would open an empty database.
pub(crate) async fn setup_test_db() -> SqlitePool {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub(crate) async fn test_state() -> (ServiceState, Rx) {
    test_state_with(|pool| Arc::new(SqliteNotifier::new(pool.clone()))).await
}

pub(crate) async fn test_state_with(
    notifier: impl FnOnce(&SqlitePool) -> Arc<dyn Notifier>,
) -> (ServiceState, Rx) {
    let pool = setup_test_db().await;
    let (bus, rx) = EventBus::new();
    let notifier = notifier(&pool);
    (ServiceState::new(pool, bus, notifier), rx)
}

/// Ids of the rows created by [`seed`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct World {
    pub owner: i64,
    pub donor: i64,
    pub admin: i64,
    pub funding: i64,
    pub goal: i64,
}

impl World {
    pub fn pledge(&self, sender_sig: &str, amount: i64) -> NewPledge {
        NewPledge {
            user_id: self.donor,
            funding_id: self.funding,
            sender_sig: sender_sig.to_string(),
            amount,
        }
    }
}

/// A funding owner, a donor, exactly one admin and one funding.
pub(crate) async fn seed(pool: &SqlitePool) -> World {
    let mut conn = pool.acquire().await.unwrap();
    let owner = db::insert_user(&mut conn, "owner", false).await.unwrap();
    let donor = db::insert_user(&mut conn, "hong", false).await.unwrap();
    let admin = db::insert_user(&mut conn, "admin", true).await.unwrap();
    let goal = 50_000;
    let funding = db::insert_funding(&mut conn, owner, "school supplies", goal)
        .await
        .unwrap();
    World {
        owner,
        donor,
        admin,
        funding,
        goal,
    }
}

pub(crate) fn new_deposit(sender_sig: &str, amount: i64) -> NewDeposit {
    NewDeposit {
        sender_sig: sender_sig.to_string(),
        receiver_name: "school supplies".to_string(),
        amount,
        transfer_date: 1_700_000_000,
        bank: "KB".to_string(),
        account: "123-456".to_string(),
        withdrawal_account: "987-654".to_string(),
    }
}

/// An unsaved `Unmatched` deposit.
pub(crate) fn deposit_fixture(sender_sig: &str, amount: i64) -> Deposit {
    let new = new_deposit(sender_sig, amount);
    Deposit {
        id: 1,
        sender_sig: new.sender_sig,
        receiver_name: new.receiver_name,
        amount: new.amount,
        transfer_date: new.transfer_date,
        bank: new.bank,
        account: new.account,
        withdrawal_account: new.withdrawal_account,
        status: DepositStatus::Unmatched,
        provisional_donation_id: None,
        created_at: 0,
        deleted_at: None,
    }
}

/// An unsaved `Pending` pledge.
pub(crate) fn pledge_fixture(sender_sig: &str, amount: i64) -> ProvisionalDonation {
    ProvisionalDonation {
        id: 1,
        sender_sig: sender_sig.to_string(),
        user_id: 1,
        funding_id: 1,
        amount,
        status: ProvisionalStatus::Pending,
        created_at: 0,
        deleted_at: None,
    }
}

pub(crate) async fn load_deposit(pool: &SqlitePool, id: i64) -> Deposit {
    let mut conn = pool.acquire().await.unwrap();
    db::find_deposit(&mut conn, id).await.unwrap().unwrap()
}

pub(crate) async fn load_pledge(pool: &SqlitePool, id: i64) -> ProvisionalDonation {
    let mut conn = pool.acquire().await.unwrap();
    db::find_pledge(&mut conn, id).await.unwrap().unwrap()
}

pub(crate) async fn load_donation(pool: &SqlitePool, id: i64) -> Donation {
    let mut conn = pool.acquire().await.unwrap();
    db::find_donation(&mut conn, id).await.unwrap().unwrap()
}

/// Force the donation of `deposit_id` into `status`, returning its id.
pub(crate) async fn set_donation_status(
    pool: &SqlitePool,
    deposit_id: i64,
    status: DonationStatus,
) -> i64 {
    let (id,): (i64,) =
        sqlx::query_as("UPDATE donations SET status = ?1 WHERE deposit_id = ?2 RETURNING id")
            .bind(status.as_str())
            .bind(deposit_id)
            .fetch_one(pool)
            .await
            .unwrap();
    id
}

pub(crate) async fn fund_sum(pool: &SqlitePool, funding_id: i64) -> i64 {
    let mut conn = pool.acquire().await.unwrap();
    db::find_funding(&mut conn, funding_id)
        .await
        .unwrap()
        .unwrap()
        .fund_sum
}

pub(crate) async fn count_notifications(pool: &SqlitePool, kind: NotificationKind) -> i64 {
    let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notifications WHERE kind = ?1")
        .bind(kind.as_str())
        .fetch_one(pool)
        .await
        .unwrap();
    n
}

/// Deliver every queued event, including the ones handlers publish while
/// running, one at a time. Returns the kinds in delivery order.
pub(crate) async fn drain(state: &ServiceState, rx: &mut Rx) -> Vec<&'static str> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event.kind());
        let _ = reactor::dispatch(state, event).await;
    }
    seen
}

/// Notifier whose every send fails.
pub(crate) struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, n: NewNotification) -> Result<()> {
        Err(ReconcileError::Notification(format!(
            "refusing to send {} to user {}",
            n.kind.as_str(),
            n.recipient_id
        )))
    }
}
