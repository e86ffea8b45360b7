//! # Deposit aggregate
//!
//! One bank-transfer record. The transfer facts (sender, amount, accounts,
//! date) never change after upload; only [`DepositStatus`] moves, and only
//! through [`Deposit::apply`].
//!
//! ```text
//! Unmatched ──► Matched ──► Refunded
//!     │  └────► Orphan
//!     └───────► PartiallyMatched
//! {Unmatched, Orphan, Matched, PartiallyMatched} ──► Deleted
//! Matched ──(delete failed)──► Matched
//! ```

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::errors::{ReconcileError, Result};
use crate::fsm::{self, Label, Lifecycle, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// Uploaded, not yet classified.
    Unmatched,
    Matched,
    /// No pledge carries this sender signature.
    Orphan,
    /// A pledge exists but the amounts differ.
    PartiallyMatched,
    Refunded,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositEvent {
    Match,
    Orphan,
    PartialMatch,
    Refund,
    DeleteFailed,
    Delete,
}

impl Label for DepositStatus {
    const ALL: &'static [Self] = &[
        Self::Unmatched,
        Self::Matched,
        Self::Orphan,
        Self::PartiallyMatched,
        Self::Refunded,
        Self::Deleted,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Matched => "matched",
            Self::Orphan => "orphan",
            Self::PartiallyMatched => "partially_matched",
            Self::Refunded => "refunded",
            Self::Deleted => "deleted",
        }
    }
}

impl Label for DepositEvent {
    const ALL: &'static [Self] = &[
        Self::Match,
        Self::Orphan,
        Self::PartialMatch,
        Self::Refund,
        Self::DeleteFailed,
        Self::Delete,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Orphan => "orphan",
            Self::PartialMatch => "partial_match",
            Self::Refund => "refund",
            Self::DeleteFailed => "delete_failed",
            Self::Delete => "delete",
        }
    }
}

impl Lifecycle for DepositStatus {
    type Event = DepositEvent;
    const ENTITY: &'static str = "Deposit";

    const TABLE: &'static [Transition<Self, DepositEvent>] = {
        use DepositEvent as E;
        use DepositStatus as S;
        &[
            Transition::new(S::Unmatched, E::Match, S::Matched),
            Transition::new(S::Unmatched, E::Orphan, S::Orphan),
            Transition::new(S::Unmatched, E::PartialMatch, S::PartiallyMatched),
            Transition::new(S::Matched, E::Refund, S::Refunded),
            Transition::new(S::Matched, E::DeleteFailed, S::Matched),
            Transition::new(S::Unmatched, E::Delete, S::Deleted),
            Transition::new(S::Orphan, E::Delete, S::Deleted),
            Transition::new(S::Matched, E::Delete, S::Deleted),
            Transition::new(S::PartiallyMatched, E::Delete, S::Deleted),
        ]
    };
}

/// Bank-transfer facts as delivered by the upload channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeposit {
    pub sender_sig: String,
    pub receiver_name: String,
    pub amount: i64,
    /// Unix seconds.
    pub transfer_date: i64,
    pub bank: String,
    pub account: String,
    pub withdrawal_account: String,
}

impl NewDeposit {
    pub fn validate(&self) -> Result<()> {
        if self.amount < 0 {
            return Err(ReconcileError::NegativeAmount(self.amount));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deposit {
    pub id: i64,
    pub sender_sig: String,
    pub receiver_name: String,
    pub amount: i64,
    pub transfer_date: i64,
    pub bank: String,
    pub account: String,
    pub withdrawal_account: String,
    pub status: DepositStatus,
    /// Pledge this deposit was classified against (Matched or PartiallyMatched).
    pub provisional_donation_id: Option<i64>,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

impl Deposit {
    /// Move to the state the table assigns to `event`. On error the status is
    /// left untouched.
    pub fn apply(&mut self, event: DepositEvent) -> Result<DepositStatus> {
        let next = fsm::transition(self.status, event)?;
        if next != self.status {
            tracing::debug!(
                deposit_id = self.id,
                from = self.status.as_str(),
                to = next.as_str(),
                "Deposit transition"
            );
        }
        self.status = next;
        Ok(next)
    }
}

impl<'r> FromRow<'r, SqliteRow> for Deposit {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Deposit {
            id: row.try_get("id")?,
            sender_sig: row.try_get("sender_sig")?,
            receiver_name: row.try_get("receiver_name")?,
            amount: row.try_get("amount")?,
            transfer_date: row.try_get("transfer_date")?,
            bank: row.try_get("bank")?,
            account: row.try_get("account")?,
            withdrawal_account: row.try_get("withdrawal_account")?,
            status: decode_label(&status, "status")?,
            provisional_donation_id: row.try_get("provisional_donation_id")?,
            created_at: row.try_get("created_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

/// Turn a stored status string back into its enum, reporting a decode error
/// on unknown values.
pub(crate) fn decode_label<L: Label>(raw: &str, column: &str) -> std::result::Result<L, sqlx::Error> {
    L::parse(raw).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("unknown value `{raw}`").into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::table_checks;

    fn deposit(status: DepositStatus) -> Deposit {
        Deposit {
            id: 1,
            sender_sig: "HONG-1234".into(),
            receiver_name: "Rolling Paper".into(),
            amount: 10_000,
            transfer_date: 1_704_067_200,
            bank: "KB".into(),
            account: "123-456".into(),
            withdrawal_account: "987-654".into(),
            status,
            provisional_donation_id: None,
            created_at: 1_704_067_200,
            deleted_at: None,
        }
    }

    #[test]
    fn table_is_authoritative() {
        table_checks::assert_table_is_authoritative::<DepositStatus>();
        table_checks::assert_no_silent_repeat::<DepositStatus>();
        table_checks::assert_labels_round_trip::<DepositStatus>();
        table_checks::assert_labels_round_trip::<DepositEvent>();
    }

    #[test]
    fn every_live_classification_can_be_deleted() {
        for s in [
            DepositStatus::Unmatched,
            DepositStatus::Orphan,
            DepositStatus::Matched,
            DepositStatus::PartiallyMatched,
        ] {
            let mut d = deposit(s);
            assert_eq!(d.apply(DepositEvent::Delete).unwrap(), DepositStatus::Deleted);
        }
    }

    #[test]
    fn deleting_twice_is_invalid() {
        let mut d = deposit(DepositStatus::Orphan);
        d.apply(DepositEvent::Delete).unwrap();
        let err = d.apply(DepositEvent::Delete).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidTransition { entity: "Deposit", .. }));
        assert_eq!(d.status, DepositStatus::Deleted);
    }

    #[test]
    fn delete_failure_is_tolerated_only_when_matched() {
        let mut d = deposit(DepositStatus::Matched);
        assert_eq!(d.apply(DepositEvent::DeleteFailed).unwrap(), DepositStatus::Matched);
        let mut d = deposit(DepositStatus::Orphan);
        assert!(d.apply(DepositEvent::DeleteFailed).is_err());
        assert_eq!(d.status, DepositStatus::Orphan);
    }

    #[test]
    fn terminal_states() {
        assert!(fsm::is_terminal(DepositStatus::Deleted));
        assert!(fsm::is_terminal(DepositStatus::Refunded));
        assert!(!fsm::is_terminal(DepositStatus::Matched));
    }

    #[test]
    fn negative_upload_is_rejected() {
        let upload = NewDeposit {
            sender_sig: "HONG-1234".into(),
            receiver_name: "r".into(),
            amount: -5,
            transfer_date: 0,
            bank: "b".into(),
            account: "a".into(),
            withdrawal_account: "w".into(),
        };
        assert!(matches!(upload.validate(), Err(ReconcileError::NegativeAmount(-5))));
    }
}
