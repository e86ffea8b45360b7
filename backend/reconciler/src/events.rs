//! Events exchanged between the reconciliation steps, and the bus that
//! carries them.
//!
//! Dispatch is by enum variant, never by name: adding an event forces every
//! `match` in [`crate::reactor`] to handle it.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::db::{Funding, User};
use crate::deposit::Deposit;
use crate::fsm::Label;
use crate::provisional::ProvisionalDonation;
use crate::saga::DeletionStep;

/// Classification of a reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Signature and amount both agree.
    Matched,
    /// Signature agrees, amount does not.
    PartiallyMatched,
    /// No pledge carries the signature.
    Unmatched,
}

impl Label for Outcome {
    const ALL: &'static [Self] = &[Self::Matched, Self::PartiallyMatched, Self::Unmatched];

    fn as_str(self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::PartiallyMatched => "partially_matched",
            Self::Unmatched => "unmatched",
        }
    }
}

/// Snapshot handed to the reconciliation handlers: everything they need
/// without another round-trip for the funding or the donor.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub deposit: Deposit,
    pub pledge: ProvisionalDonation,
    pub funding: Funding,
    pub donor: User,
}

#[derive(Debug, Clone)]
pub enum Event {
    DepositMatched(Box<Reconciliation>),
    DepositPartiallyMatched(Box<Reconciliation>),
    DepositOrphaned(Deposit),
    /// Raised once all side effects of an outcome have been attempted.
    ReconciliationFinished { deposit_id: i64, outcome: Outcome },
    DeletionRequested { deposit_id: i64, admin_id: i64 },
    /// The deposit's donation (if it had one) is gone; the deposit is next.
    DonationDeleted {
        deposit_id: i64,
        donation_id: Option<i64>,
        admin_id: i64,
    },
    /// The deposit's pledge was rolled back to pending; the deposit is next.
    MatchCancelled {
        deposit_id: i64,
        provisional_id: i64,
        admin_id: i64,
    },
    /// A deletion workflow reached `Completed`, `Aborted` or `Failed`.
    DeletionFinished { deposit_id: i64, step: DeletionStep },
}

impl Event {
    /// Short identifier for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DepositMatched(_) => "deposit_matched",
            Self::DepositPartiallyMatched(_) => "deposit_partially_matched",
            Self::DepositOrphaned(_) => "deposit_orphaned",
            Self::ReconciliationFinished { .. } => "reconciliation_finished",
            Self::DeletionRequested { .. } => "deletion_requested",
            Self::DonationDeleted { .. } => "donation_deleted",
            Self::MatchCancelled { .. } => "match_cancelled",
            Self::DeletionFinished { .. } => "deletion_finished",
        }
    }

    pub fn deposit_id(&self) -> i64 {
        match self {
            Self::DepositMatched(r) | Self::DepositPartiallyMatched(r) => r.deposit.id,
            Self::DepositOrphaned(d) => d.id,
            Self::ReconciliationFinished { deposit_id, .. }
            | Self::DeletionRequested { deposit_id, .. }
            | Self::DonationDeleted { deposit_id, .. }
            | Self::MatchCancelled { deposit_id, .. }
            | Self::DeletionFinished { deposit_id, .. } => *deposit_id,
        }
    }
}

/// Fire-and-forget publisher. The channel is unbounded so a producer never
/// waits on a slow consumer.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: UnboundedSender<Event>,
}

impl EventBus {
    pub fn new() -> (Self, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let deposit_id = event.deposit_id();
        match self.tx.send(event) {
            Ok(()) => debug!(event = kind, deposit_id, "Published"),
            Err(_) => warn!(event = kind, deposit_id, "Event bus closed; event dropped"),
        }
    }
}
