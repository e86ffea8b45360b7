//! # ProvisionalDonation aggregate
//!
//! A donor's pledge, keyed by the sender signature they promise to use on
//! the bank transfer. Reconciliation settles it; the deletion saga may roll
//! it back to `Pending`.
//!
//! ```text
//! Pending ──► Approved      (deposit matched)
//! Pending ──► Rejected      (deposit partially matched, or timed out)
//! {Approved, Rejected} ──► Pending   (match cancelled)
//! ```

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::deposit::decode_label;
use crate::errors::{ReconcileError, Result};
use crate::fsm::{self, Label, Lifecycle, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionalEvent {
    DepositMatched,
    DepositPartiallyMatched,
    TimedOut,
    MatchCancelled,
}

impl Label for ProvisionalStatus {
    const ALL: &'static [Self] = &[Self::Pending, Self::Approved, Self::Rejected];

    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl Label for ProvisionalEvent {
    const ALL: &'static [Self] = &[
        Self::DepositMatched,
        Self::DepositPartiallyMatched,
        Self::TimedOut,
        Self::MatchCancelled,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::DepositMatched => "deposit_matched",
            Self::DepositPartiallyMatched => "deposit_partially_matched",
            Self::TimedOut => "timed_out",
            Self::MatchCancelled => "match_cancelled",
        }
    }
}

impl Lifecycle for ProvisionalStatus {
    type Event = ProvisionalEvent;
    const ENTITY: &'static str = "ProvisionalDonation";

    const TABLE: &'static [Transition<Self, ProvisionalEvent>] = {
        use ProvisionalEvent as E;
        use ProvisionalStatus as S;
        &[
            Transition::new(S::Pending, E::DepositMatched, S::Approved),
            Transition::new(S::Pending, E::DepositPartiallyMatched, S::Rejected),
            Transition::new(S::Pending, E::TimedOut, S::Rejected),
            Transition::new(S::Approved, E::MatchCancelled, S::Pending),
            Transition::new(S::Rejected, E::MatchCancelled, S::Pending),
        ]
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionalDonation {
    pub id: i64,
    pub sender_sig: String,
    pub user_id: i64,
    pub funding_id: i64,
    pub amount: i64,
    pub status: ProvisionalStatus,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

/// Input for a new pledge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPledge {
    pub user_id: i64,
    pub funding_id: i64,
    pub sender_sig: String,
    pub amount: i64,
}

impl NewPledge {
    /// A pledge may not exceed the goal of the funding it targets.
    pub fn validate(&self, funding_goal: i64) -> Result<()> {
        if self.sender_sig.trim().is_empty() {
            return Err(ReconcileError::Validation(
                "sender signature must not be empty".to_string(),
            ));
        }
        ReconcileError::check_within_goal(self.amount, funding_goal)
    }
}

impl ProvisionalDonation {
    pub fn apply(&mut self, event: ProvisionalEvent) -> Result<ProvisionalStatus> {
        let next = fsm::transition(self.status, event)?;
        tracing::debug!(
            provisional_id = self.id,
            from = self.status.as_str(),
            to = next.as_str(),
            "ProvisionalDonation transition"
        );
        self.status = next;
        Ok(next)
    }
}

impl<'r> FromRow<'r, SqliteRow> for ProvisionalDonation {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(ProvisionalDonation {
            id: row.try_get("id")?,
            sender_sig: row.try_get("sender_sig")?,
            user_id: row.try_get("user_id")?,
            funding_id: row.try_get("funding_id")?,
            amount: row.try_get("amount")?,
            status: decode_label(&status, "status")?,
            created_at: row.try_get("created_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::table_checks;

    fn pledge(status: ProvisionalStatus) -> ProvisionalDonation {
        ProvisionalDonation {
            id: 3,
            sender_sig: "PARK-1234".into(),
            user_id: 1,
            funding_id: 1,
            amount: 20_000,
            status,
            created_at: 0,
            deleted_at: None,
        }
    }

    #[test]
    fn table_is_authoritative() {
        table_checks::assert_table_is_authoritative::<ProvisionalStatus>();
        table_checks::assert_no_silent_repeat::<ProvisionalStatus>();
        table_checks::assert_labels_round_trip::<ProvisionalStatus>();
        table_checks::assert_labels_round_trip::<ProvisionalEvent>();
    }

    #[test]
    fn settled_pledges_roll_back_to_pending() {
        for s in [ProvisionalStatus::Approved, ProvisionalStatus::Rejected] {
            let mut p = pledge(s);
            assert_eq!(
                p.apply(ProvisionalEvent::MatchCancelled).unwrap(),
                ProvisionalStatus::Pending
            );
        }
    }

    #[test]
    fn only_pending_pledges_can_be_settled() {
        let mut p = pledge(ProvisionalStatus::Approved);
        assert!(p.apply(ProvisionalEvent::DepositMatched).is_err());
        assert!(p.apply(ProvisionalEvent::TimedOut).is_err());
        assert_eq!(p.status, ProvisionalStatus::Approved);
    }

    #[test]
    fn pledge_is_bounded_by_goal() {
        let new = NewPledge {
            user_id: 1,
            funding_id: 1,
            sender_sig: "PARK-1234".into(),
            amount: 20_000,
        };
        assert!(new.validate(20_000).is_ok());
        assert!(matches!(
            new.validate(19_999),
            Err(ReconcileError::AmountExceeded { .. })
        ));
    }
}
