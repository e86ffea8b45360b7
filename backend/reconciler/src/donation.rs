//! # Donation aggregate
//!
//! A confirmed contribution. It only ever comes into existence from a matched
//! deposit and is tied to that deposit one-to-one.
//!
//! ```text
//! Donated ◄──► WaitingRefund ◄──► WaitingRefundPhase2 ──► RefundComplete
//! Donated ──► Deleted
//! Donated ──(delete failed)──► Donated
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::deposit::{decode_label, Deposit};
use crate::errors::{ReconcileError, Result};
use crate::fsm::{self, Label, Lifecycle, Transition};
use crate::provisional::ProvisionalDonation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    Donated,
    WaitingRefund,
    /// An admin has picked up the refund.
    WaitingRefundPhase2,
    RefundComplete,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationEvent {
    RefundRequested,
    RefundCancelled,
    AdminAssigned,
    RefundCompleted,
    Delete,
    DeleteFailed,
}

impl Label for DonationStatus {
    const ALL: &'static [Self] = &[
        Self::Donated,
        Self::WaitingRefund,
        Self::WaitingRefundPhase2,
        Self::RefundComplete,
        Self::Deleted,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Donated => "donated",
            Self::WaitingRefund => "waiting_refund",
            Self::WaitingRefundPhase2 => "waiting_refund_phase2",
            Self::RefundComplete => "refund_complete",
            Self::Deleted => "deleted",
        }
    }
}

impl Label for DonationEvent {
    const ALL: &'static [Self] = &[
        Self::RefundRequested,
        Self::RefundCancelled,
        Self::AdminAssigned,
        Self::RefundCompleted,
        Self::Delete,
        Self::DeleteFailed,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::RefundRequested => "refund_requested",
            Self::RefundCancelled => "refund_cancelled",
            Self::AdminAssigned => "admin_assigned",
            Self::RefundCompleted => "refund_completed",
            Self::Delete => "delete",
            Self::DeleteFailed => "delete_failed",
        }
    }
}

impl Lifecycle for DonationStatus {
    type Event = DonationEvent;
    const ENTITY: &'static str = "Donation";

    const TABLE: &'static [Transition<Self, DonationEvent>] = {
        use DonationEvent as E;
        use DonationStatus as S;
        &[
            Transition::new(S::Donated, E::RefundRequested, S::WaitingRefund),
            Transition::new(S::WaitingRefund, E::RefundCancelled, S::Donated),
            Transition::new(S::WaitingRefund, E::AdminAssigned, S::WaitingRefundPhase2),
            Transition::new(S::WaitingRefundPhase2, E::RefundCancelled, S::WaitingRefund),
            Transition::new(S::WaitingRefundPhase2, E::RefundCompleted, S::RefundComplete),
            Transition::new(S::Donated, E::Delete, S::Deleted),
            Transition::new(S::Donated, E::DeleteFailed, S::Donated),
        ]
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Donation {
    pub id: i64,
    pub funding_id: i64,
    pub user_id: i64,
    pub deposit_id: i64,
    pub order_id: String,
    pub amount: i64,
    pub status: DonationStatus,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

/// A donation about to be inserted for a matched deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDonation {
    pub funding_id: i64,
    pub user_id: i64,
    pub deposit_id: i64,
    pub order_id: String,
    pub amount: i64,
    pub created_at: i64,
}

impl NewDonation {
    /// Build the donation for `deposit` settling `pledge`, checking the amount
    /// against the funding goal.
    pub fn for_match(
        deposit: &Deposit,
        pledge: &ProvisionalDonation,
        funding_goal: i64,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        ReconcileError::check_within_goal(deposit.amount, funding_goal)?;
        Ok(NewDonation {
            funding_id: pledge.funding_id,
            user_id: pledge.user_id,
            deposit_id: deposit.id,
            order_id: order_id(deposit.id, now),
            amount: deposit.amount,
            created_at: now.timestamp(),
        })
    }
}

/// Externally visible order number: date of confirmation plus deposit id.
/// Unique because a deposit yields at most one donation.
pub fn order_id(deposit_id: i64, at: DateTime<Utc>) -> String {
    format!("DN{}-{deposit_id:08}", at.format("%Y%m%d"))
}

impl Donation {
    pub fn apply(&mut self, event: DonationEvent) -> Result<DonationStatus> {
        let next = fsm::transition(self.status, event)?;
        tracing::debug!(
            donation_id = self.id,
            from = self.status.as_str(),
            to = next.as_str(),
            "Donation transition"
        );
        self.status = next;
        Ok(next)
    }
}

impl<'r> FromRow<'r, SqliteRow> for Donation {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Donation {
            id: row.try_get("id")?,
            funding_id: row.try_get("funding_id")?,
            user_id: row.try_get("user_id")?,
            deposit_id: row.try_get("deposit_id")?,
            order_id: row.try_get("order_id")?,
            amount: row.try_get("amount")?,
            status: decode_label(&status, "status")?,
            created_at: row.try_get("created_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}
