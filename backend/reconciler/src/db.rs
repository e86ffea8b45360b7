//! Database layer — migrations, aggregate persistence and lookups.
//!
//! Every function takes a plain `&mut SqliteConnection` so the same query can
//! run on a pooled connection or inside a caller-owned transaction
//! (`&mut *tx`). Callers that write more than one row open the transaction
//! themselves; nothing in here commits on its own.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteQueryResult};
use sqlx::{SqliteConnection, SqlitePool};
use std::str::FromStr;
use tracing::info;

use crate::deposit::{Deposit, DepositStatus, NewDeposit};
use crate::donation::{Donation, DonationStatus, NewDonation};
use crate::errors::{ReconcileError, Result};
use crate::fsm::Label;
use crate::provisional::{NewPledge, ProvisionalDonation, ProvisionalStatus};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Make sure the file is created if it doesn't exist yet.
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.is_unique_violation())
}

// ─────────────────────────────────────────────────────────
// Users & fundings
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub nickname: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, sqlx::FromRow)]
pub struct Funding {
    pub id: i64,
    pub owner_id: i64,
    pub title: String,
    pub goal: i64,
    pub fund_sum: i64,
}

pub async fn insert_user(conn: &mut SqliteConnection, nickname: &str, is_admin: bool) -> Result<i64> {
    let id = sqlx::query("INSERT INTO users (nickname, is_admin) VALUES (?1, ?2)")
        .bind(nickname)
        .bind(is_admin)
        .execute(conn)
        .await?
        .last_insert_rowid();
    Ok(id)
}

pub async fn find_user(conn: &mut SqliteConnection, id: i64) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>("SELECT id, nickname, is_admin FROM users WHERE id = ?1")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    Ok(user)
}

/// Ids of every admin, ascending.
pub async fn admin_ids(conn: &mut SqliteConnection) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE is_admin = 1 ORDER BY id")
        .fetch_all(conn)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn insert_funding(
    conn: &mut SqliteConnection,
    owner_id: i64,
    title: &str,
    goal: i64,
) -> Result<i64> {
    if goal < 0 {
        return Err(ReconcileError::NegativeAmount(goal));
    }
    let id = sqlx::query("INSERT INTO fundings (owner_id, title, goal) VALUES (?1, ?2, ?3)")
        .bind(owner_id)
        .bind(title)
        .bind(goal)
        .execute(conn)
        .await?
        .last_insert_rowid();
    Ok(id)
}

pub async fn find_funding(conn: &mut SqliteConnection, id: i64) -> Result<Option<Funding>> {
    let funding = sqlx::query_as::<_, Funding>(
        "SELECT id, owner_id, title, goal, fund_sum FROM fundings WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(funding)
}

/// Add `delta` (possibly negative) to a funding's accumulated sum.
pub async fn adjust_fund_sum(conn: &mut SqliteConnection, funding_id: i64, delta: i64) -> Result<()> {
    let affected = sqlx::query("UPDATE fundings SET fund_sum = fund_sum + ?1 WHERE id = ?2")
        .bind(delta)
        .bind(funding_id)
        .execute(conn)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(ReconcileError::funding_not_found(funding_id));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Provisional donations (pledges)
// ─────────────────────────────────────────────────────────

const PLEDGE_COLUMNS: &str =
    "id, sender_sig, user_id, funding_id, amount, status, created_at, deleted_at";

/// A pledge together with the funding it targets and the pledging user.
#[derive(Debug, Clone)]
pub struct PledgeContext {
    pub pledge: ProvisionalDonation,
    pub funding: Funding,
    pub donor: User,
}

pub async fn insert_pledge(
    conn: &mut SqliteConnection,
    new: &NewPledge,
    now: i64,
) -> Result<ProvisionalDonation> {
    let res = sqlx::query(
        r#"
        INSERT INTO provisional_donations (sender_sig, user_id, funding_id, amount, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&new.sender_sig)
    .bind(new.user_id)
    .bind(new.funding_id)
    .bind(new.amount)
    .bind(ProvisionalStatus::Pending.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await;

    let id = match res {
        Ok(done) => done.last_insert_rowid(),
        Err(e) if unique_violation(&e) => return Err(ReconcileError::pledge_exists(&new.sender_sig)),
        Err(e) => return Err(e.into()),
    };
    find_pledge(conn, id)
        .await?
        .ok_or_else(|| ReconcileError::pledge_not_found(id))
}

pub async fn find_pledge(conn: &mut SqliteConnection, id: i64) -> Result<Option<ProvisionalDonation>> {
    let pledge = sqlx::query_as::<_, ProvisionalDonation>(&format!(
        "SELECT {PLEDGE_COLUMNS} FROM provisional_donations WHERE id = ?1 AND deleted_at IS NULL"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(pledge)
}

pub async fn find_pledge_by_signature(
    conn: &mut SqliteConnection,
    sender_sig: &str,
) -> Result<Option<ProvisionalDonation>> {
    let pledge = sqlx::query_as::<_, ProvisionalDonation>(&format!(
        "SELECT {PLEDGE_COLUMNS} FROM provisional_donations WHERE sender_sig = ?1 AND deleted_at IS NULL"
    ))
    .bind(sender_sig)
    .fetch_optional(conn)
    .await?;
    Ok(pledge)
}

/// Load the pledge for `sender_sig` with its funding and donor.
pub async fn find_pledge_context(
    conn: &mut SqliteConnection,
    sender_sig: &str,
) -> Result<Option<PledgeContext>> {
    let Some(pledge) = find_pledge_by_signature(conn, sender_sig).await? else {
        return Ok(None);
    };
    let funding = find_funding(conn, pledge.funding_id)
        .await?
        .ok_or_else(|| ReconcileError::funding_not_found(pledge.funding_id))?;
    let donor = find_user(conn, pledge.user_id)
        .await?
        .ok_or_else(|| ReconcileError::user_not_found(pledge.user_id))?;
    Ok(Some(PledgeContext {
        pledge,
        funding,
        donor,
    }))
}

/// Pending pledges created strictly before `cutoff`.
pub async fn pending_pledges_before(
    conn: &mut SqliteConnection,
    cutoff: i64,
) -> Result<Vec<ProvisionalDonation>> {
    let rows = sqlx::query_as::<_, ProvisionalDonation>(&format!(
        r#"
        SELECT {PLEDGE_COLUMNS}
        FROM   provisional_donations
        WHERE  status = ?1 AND created_at < ?2 AND deleted_at IS NULL
        ORDER  BY id ASC
        "#
    ))
    .bind(ProvisionalStatus::Pending.as_str())
    .bind(cutoff)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

/// Write the pledge's new status, provided the row is still in `from`.
pub async fn save_pledge(
    conn: &mut SqliteConnection,
    pledge: &ProvisionalDonation,
    from: ProvisionalStatus,
) -> Result<()> {
    let res = sqlx::query("UPDATE provisional_donations SET status = ?1 WHERE id = ?2 AND status = ?3")
        .bind(pledge.status.as_str())
        .bind(pledge.id)
        .bind(from.as_str())
        .execute(conn)
        .await?;
    swapped(res, "ProvisionalDonation", pledge.id, from.as_str())
}

/// A guarded update that touched nothing lost a race with another writer.
fn swapped(res: SqliteQueryResult, entity: &'static str, id: i64, expected: &'static str) -> Result<()> {
    if res.rows_affected() == 0 {
        return Err(ReconcileError::StaleWrite {
            entity,
            id,
            expected,
        });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Deposits
// ─────────────────────────────────────────────────────────

const DEPOSIT_COLUMNS: &str = "id, sender_sig, receiver_name, amount, transfer_date, bank, account, \
     withdrawal_account, status, provisional_donation_id, created_at, deleted_at";

/// Insert a freshly uploaded deposit in the `Unmatched` state.
pub async fn insert_deposit(conn: &mut SqliteConnection, new: &NewDeposit, now: i64) -> Result<Deposit> {
    new.validate()?;
    let id = sqlx::query(
        r#"
        INSERT INTO deposits
            (sender_sig, receiver_name, amount, transfer_date, bank, account,
             withdrawal_account, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'unmatched', ?8)
        "#,
    )
    .bind(&new.sender_sig)
    .bind(&new.receiver_name)
    .bind(new.amount)
    .bind(new.transfer_date)
    .bind(&new.bank)
    .bind(&new.account)
    .bind(&new.withdrawal_account)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    find_deposit(conn, id)
        .await?
        .ok_or_else(|| ReconcileError::deposit_not_found(id))
}

/// Look a deposit up by id. Soft-deleted rows are returned too (with status
/// `deleted`) so that callers hit the state machine rather than a miss.
pub async fn find_deposit(conn: &mut SqliteConnection, id: i64) -> Result<Option<Deposit>> {
    let deposit = sqlx::query_as::<_, Deposit>(&format!(
        "SELECT {DEPOSIT_COLUMNS} FROM deposits WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(deposit)
}

pub async fn save_deposit(conn: &mut SqliteConnection, deposit: &Deposit, from: DepositStatus) -> Result<()> {
    let res = sqlx::query(
        "UPDATE deposits SET status = ?1, provisional_donation_id = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(deposit.status.as_str())
    .bind(deposit.provisional_donation_id)
    .bind(deposit.id)
    .bind(from.as_str())
    .execute(conn)
    .await?;
    swapped(res, "Deposit", deposit.id, from.as_str())
}

pub async fn soft_delete_deposit(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<()> {
    sqlx::query("UPDATE deposits SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL")
        .bind(now)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Donations
// ─────────────────────────────────────────────────────────

const DONATION_COLUMNS: &str =
    "id, funding_id, user_id, deposit_id, order_id, amount, status, created_at, deleted_at";

/// Insert a `Donated` donation. A deposit can back at most one donation.
pub async fn insert_donation(conn: &mut SqliteConnection, new: &NewDonation) -> Result<Donation> {
    let res = sqlx::query(
        r#"
        INSERT INTO donations (funding_id, user_id, deposit_id, order_id, amount, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'donated', ?6)
        "#,
    )
    .bind(new.funding_id)
    .bind(new.user_id)
    .bind(new.deposit_id)
    .bind(&new.order_id)
    .bind(new.amount)
    .bind(new.created_at)
    .execute(&mut *conn)
    .await;

    let id = match res {
        Ok(done) => done.last_insert_rowid(),
        Err(e) if unique_violation(&e) => {
            return Err(ReconcileError::AlreadyExists {
                entity: "Donation",
                key: format!("deposit {}", new.deposit_id),
            })
        }
        Err(e) => return Err(e.into()),
    };
    find_donation(conn, id)
        .await?
        .ok_or_else(|| ReconcileError::donation_not_found(id))
}

pub async fn find_donation(conn: &mut SqliteConnection, id: i64) -> Result<Option<Donation>> {
    let donation = sqlx::query_as::<_, Donation>(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?;
    Ok(donation)
}

/// The live donation backed by `deposit_id`, if any.
pub async fn find_donation_by_deposit(
    conn: &mut SqliteConnection,
    deposit_id: i64,
) -> Result<Option<Donation>> {
    let donation = sqlx::query_as::<_, Donation>(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE deposit_id = ?1 AND deleted_at IS NULL"
    ))
    .bind(deposit_id)
    .fetch_optional(conn)
    .await?;
    Ok(donation)
}

pub async fn save_donation(conn: &mut SqliteConnection, donation: &Donation, from: DonationStatus) -> Result<()> {
    let res = sqlx::query("UPDATE donations SET status = ?1 WHERE id = ?2 AND status = ?3")
        .bind(donation.status.as_str())
        .bind(donation.id)
        .bind(from.as_str())
        .execute(conn)
        .await?;
    swapped(res, "Donation", donation.id, from.as_str())
}

pub async fn soft_delete_donation(conn: &mut SqliteConnection, id: i64, now: i64) -> Result<()> {
    sqlx::query("UPDATE donations SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL")
        .bind(now)
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
pub async fn count_donations_for_deposit(conn: &mut SqliteConnection, deposit_id: i64) -> Result<i64> {
    let (n,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM donations WHERE deposit_id = ?1")
        .bind(deposit_id)
        .fetch_one(conn)
        .await?;
    Ok(n)
}
