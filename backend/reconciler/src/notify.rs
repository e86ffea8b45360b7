//! Notification collaborator.
//!
//! Reconciliation only ever *creates* notifications; formatting and delivery
//! happen elsewhere. Failures here are reported to the caller, which decides
//! whether they matter (for the fan-outs in [`crate::reconciliation`] and
//! [`crate::saga`] they never do).

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqliteConnection, SqlitePool};
use tracing::warn;

use crate::db;
use crate::deposit::decode_label;
use crate::errors::{ReconcileError, Result};
use crate::fsm::Label;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// To the donor: the transfer matched and the donation is confirmed.
    DonationSucceeded,
    /// To the funding owner: someone donated.
    NewDonation,
    /// To the donor: the transfer amount did not match the pledge.
    DonationRejected,
    /// To admins: a deposit needs its amount corrected.
    DepositPartiallyMatched,
    /// To admins: a deposit needs its sender identified.
    DepositOrphaned,
    DonationDeleted,
    DonationDeleteFailed,
    MatchCancelFailed,
    PledgeExpired,
    RefundRequested,
    RefundCancelled,
    RefundInProgress,
    RefundCompleted,
}

impl Label for NotificationKind {
    const ALL: &'static [Self] = &[
        Self::DonationSucceeded,
        Self::NewDonation,
        Self::DonationRejected,
        Self::DepositPartiallyMatched,
        Self::DepositOrphaned,
        Self::DonationDeleted,
        Self::DonationDeleteFailed,
        Self::MatchCancelFailed,
        Self::PledgeExpired,
        Self::RefundRequested,
        Self::RefundCancelled,
        Self::RefundInProgress,
        Self::RefundCompleted,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::DonationSucceeded => "donation_succeeded",
            Self::NewDonation => "new_donation",
            Self::DonationRejected => "donation_rejected",
            Self::DepositPartiallyMatched => "deposit_partially_matched",
            Self::DepositOrphaned => "deposit_orphaned",
            Self::DonationDeleted => "donation_deleted",
            Self::DonationDeleteFailed => "donation_delete_failed",
            Self::MatchCancelFailed => "match_cancel_failed",
            Self::PledgeExpired => "pledge_expired",
            Self::RefundRequested => "refund_requested",
            Self::RefundCancelled => "refund_cancelled",
            Self::RefundInProgress => "refund_in_progress",
            Self::RefundCompleted => "refund_completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub recipient_id: i64,
    pub sender_id: Option<i64>,
    pub kind: NotificationKind,
    /// Id of the deposit, donation or pledge the notification is about.
    pub subject_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub recipient_id: i64,
    pub sender_id: Option<i64>,
    pub kind: NotificationKind,
    pub subject_id: i64,
    pub created_at: i64,
}

impl<'r> FromRow<'r, SqliteRow> for NotificationRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        Ok(NotificationRecord {
            id: row.try_get("id")?,
            recipient_id: row.try_get("recipient_id")?,
            sender_id: row.try_get("sender_id")?,
            kind: decode_label(&kind, "kind")?,
            subject_id: row.try_get("subject_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: NewNotification) -> Result<()>;
}

/// Persists notifications to the `notifications` table for the delivery
/// side to pick up.
#[derive(Debug, Clone)]
pub struct SqliteNotifier {
    pool: SqlitePool,
}

impl SqliteNotifier {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for SqliteNotifier {
    async fn notify(&self, n: NewNotification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (recipient_id, sender_id, kind, subject_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(n.recipient_id)
        .bind(n.sender_id)
        .bind(n.kind.as_str())
        .bind(n.subject_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Send `kind` about `subject_id` to every admin. Each admin is attempted even
/// if an earlier send failed; the error reports how many were missed.
pub async fn notify_admins(
    pool: &SqlitePool,
    notifier: &dyn Notifier,
    kind: NotificationKind,
    sender_id: Option<i64>,
    subject_id: i64,
) -> Result<()> {
    let admins = {
        let mut conn = pool.acquire().await?;
        db::admin_ids(&mut conn).await?
    };

    let mut missed = 0usize;
    for admin in &admins {
        let sent = notifier
            .notify(NewNotification {
                recipient_id: *admin,
                sender_id,
                kind,
                subject_id,
            })
            .await;
        if let Err(e) = sent {
            warn!(admin_id = admin, kind = kind.as_str(), "Admin notification failed: {e}");
            missed += 1;
        }
    }

    if missed > 0 {
        return Err(ReconcileError::Notification(format!(
            "{missed} of {} admins not notified of {}",
            admins.len(),
            kind.as_str()
        )));
    }
    Ok(())
}

/// Notifications addressed to `recipient_id`, newest first.
pub async fn notifications_for(
    conn: &mut SqliteConnection,
    recipient_id: i64,
) -> Result<Vec<NotificationRecord>> {
    let rows = sqlx::query_as::<_, NotificationRecord>(
        r#"
        SELECT id, recipient_id, sender_id, kind, subject_id, created_at
        FROM   notifications
        WHERE  recipient_id = ?1
        ORDER  BY id DESC
        "#,
    )
    .bind(recipient_id)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}
