//! # Deposit deletion saga
//!
//! An admin deletes a deposit; whatever depends on it has to go (or be rolled
//! back) first:
//!
//! | Deposit status       | Dependent step                         | On dependent failure |
//! |----------------------|----------------------------------------|----------------------|
//! | `Matched`            | delete the donation                    | abort, notify admin  |
//! | `PartiallyMatched`   | cancel the match on the pledge         | abort, notify admin  |
//! | `Unmatched`/`Orphan` | none                                   | —                    |
//!
//! The work is split into single-purpose handlers chained by events
//! (`DeletionRequested` → `DonationDeleted` / `MatchCancelled` → deposit
//! deletion). Progress for each request lives in a [`DeletionWorkflow`]
//! keyed by deposit id, whose `step` is driven by the same transition engine
//! as the aggregates, so the compensation path is a table row rather than an
//! ad hoc branch:
//!
//! ```text
//! Requested ──► DeletingDonation ──► DeletingDeposit ──► Completed
//!     │              └──(delete refused)──► Aborted
//!     ├───────► CancellingMatch ───► DeletingDeposit
//!     │              └──(cancel refused)──► Aborted
//!     └───────► DeletingDeposit ──(dependent appeared)──► Aborted
//! any live step ──(fault)──► Failed
//! ```
//!
//! A refused dependent step deletes nothing, so aborting needs no undo. The
//! reconciliation handlers stand back while a workflow for their deposit is
//! live, and the deposit step re-checks for dependents inside its own
//! transaction, so a donation can never outlive its deposit.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::db;
use crate::deposit::{Deposit, DepositEvent, DepositStatus};
use crate::donation::DonationEvent;
use crate::effects::Effects;
use crate::errors::{ReconcileError, Result};
use crate::events::Event;
use crate::fsm::{self, Label, Lifecycle, Transition};
use crate::notify::{NewNotification, NotificationKind};
use crate::provisional::{ProvisionalEvent, ProvisionalStatus};
use crate::state::ServiceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStep {
    Requested,
    DeletingDonation,
    CancellingMatch,
    DeletingDeposit,
    Completed,
    /// A dependent refused to go; nothing was deleted.
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionSignal {
    DonationDependent,
    PledgeDependent,
    NoDependent,
    DonationDeleted,
    DonationDeleteRefused,
    MatchCancelled,
    MatchCancelRefused,
    DepositDeleted,
    /// A donation or pledge match committed after the dependent step ran.
    DependentAppeared,
    Fault,
}

impl Label for DeletionStep {
    const ALL: &'static [Self] = &[
        Self::Requested,
        Self::DeletingDonation,
        Self::CancellingMatch,
        Self::DeletingDeposit,
        Self::Completed,
        Self::Aborted,
        Self::Failed,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::DeletingDonation => "deleting_donation",
            Self::CancellingMatch => "cancelling_match",
            Self::DeletingDeposit => "deleting_deposit",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }
}

impl Label for DeletionSignal {
    const ALL: &'static [Self] = &[
        Self::DonationDependent,
        Self::PledgeDependent,
        Self::NoDependent,
        Self::DonationDeleted,
        Self::DonationDeleteRefused,
        Self::MatchCancelled,
        Self::MatchCancelRefused,
        Self::DepositDeleted,
        Self::DependentAppeared,
        Self::Fault,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Self::DonationDependent => "donation_dependent",
            Self::PledgeDependent => "pledge_dependent",
            Self::NoDependent => "no_dependent",
            Self::DonationDeleted => "donation_deleted",
            Self::DonationDeleteRefused => "donation_delete_refused",
            Self::MatchCancelled => "match_cancelled",
            Self::MatchCancelRefused => "match_cancel_refused",
            Self::DepositDeleted => "deposit_deleted",
            Self::DependentAppeared => "dependent_appeared",
            Self::Fault => "fault",
        }
    }
}

impl Lifecycle for DeletionStep {
    type Event = DeletionSignal;
    const ENTITY: &'static str = "DeletionWorkflow";

    const TABLE: &'static [Transition<Self, DeletionSignal>] = {
        use DeletionSignal as E;
        use DeletionStep as S;
        &[
            Transition::new(S::Requested, E::DonationDependent, S::DeletingDonation),
            Transition::new(S::Requested, E::PledgeDependent, S::CancellingMatch),
            Transition::new(S::Requested, E::NoDependent, S::DeletingDeposit),
            Transition::new(S::DeletingDonation, E::DonationDeleted, S::DeletingDeposit),
            Transition::new(S::DeletingDonation, E::DonationDeleteRefused, S::Aborted),
            Transition::new(S::CancellingMatch, E::MatchCancelled, S::DeletingDeposit),
            Transition::new(S::CancellingMatch, E::MatchCancelRefused, S::Aborted),
            Transition::new(S::DeletingDeposit, E::DepositDeleted, S::Completed),
            Transition::new(S::DeletingDeposit, E::DependentAppeared, S::Aborted),
            Transition::new(S::Requested, E::Fault, S::Failed),
            Transition::new(S::DeletingDonation, E::Fault, S::Failed),
            Transition::new(S::CancellingMatch, E::Fault, S::Failed),
            Transition::new(S::DeletingDeposit, E::Fault, S::Failed),
        ]
    };
}

/// Progress of one deletion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionWorkflow {
    pub deposit_id: i64,
    pub admin_id: i64,
    pub step: DeletionStep,
    /// Why the workflow aborted or failed.
    pub reason: Option<String>,
    pub started_at: i64,
    pub updated_at: i64,
}

impl DeletionWorkflow {
    pub fn is_finished(&self) -> bool {
        fsm::is_terminal(self.step)
    }
}

/// In-flight and finished deletion workflows, one per deposit.
#[derive(Debug, Clone, Default)]
pub struct DeletionRegistry {
    inner: Arc<DashMap<i64, DeletionWorkflow>>,
}

impl DeletionRegistry {
    /// Open a workflow for `deposit_id`. A finished one is replaced; a live
    /// one makes this fail.
    fn begin(&self, deposit_id: i64, admin_id: i64) -> Result<()> {
        let now = Utc::now().timestamp();
        let fresh = DeletionWorkflow {
            deposit_id,
            admin_id,
            step: DeletionStep::Requested,
            reason: None,
            started_at: now,
            updated_at: now,
        };
        match self.inner.entry(deposit_id) {
            Entry::Occupied(e) if !e.get().is_finished() => {
                Err(ReconcileError::deletion_in_progress(deposit_id))
            }
            Entry::Occupied(mut e) => {
                e.insert(fresh);
                Ok(())
            }
            Entry::Vacant(e) => {
                e.insert(fresh);
                Ok(())
            }
        }
    }

    fn advance(&self, deposit_id: i64, signal: DeletionSignal) -> Result<DeletionStep> {
        let mut wf = self.inner.get_mut(&deposit_id).ok_or(ReconcileError::NotFound {
            entity: "DeletionWorkflow",
            key: deposit_id.to_string(),
        })?;
        let next = fsm::transition(wf.step, signal)?;
        info!(
            deposit_id,
            from = wf.step.as_str(),
            to = next.as_str(),
            "Deletion step"
        );
        wf.step = next;
        wf.updated_at = Utc::now().timestamp();
        Ok(next)
    }

    fn set_reason(&self, deposit_id: i64, reason: String) {
        if let Some(mut wf) = self.inner.get_mut(&deposit_id) {
            wf.reason = Some(reason);
        }
    }

    pub fn get(&self, deposit_id: i64) -> Option<DeletionWorkflow> {
        self.inner.get(&deposit_id).map(|wf| wf.clone())
    }

    /// Whether a workflow for `deposit_id` has started and not yet finished.
    pub fn is_live(&self, deposit_id: i64) -> bool {
        self.inner
            .get(&deposit_id)
            .is_some_and(|wf| !wf.is_finished())
    }
}

/// Entry point: validate the request, open a workflow and hand off to the
/// event chain. Completion is only observable through `DeletionFinished` or
/// [`deletion_status`].
pub async fn request_delete(state: &ServiceState, deposit_id: i64, admin_id: i64) -> Result<()> {
    {
        let mut conn = state.pool.acquire().await?;
        let admin = db::find_user(&mut conn, admin_id)
            .await?
            .ok_or_else(|| ReconcileError::user_not_found(admin_id))?;
        if !admin.is_admin {
            return Err(ReconcileError::Forbidden(format!(
                "user {admin_id} may not delete deposits"
            )));
        }
        db::find_deposit(&mut conn, deposit_id)
            .await?
            .ok_or_else(|| ReconcileError::deposit_not_found(deposit_id))?;
    }

    state.deletions.begin(deposit_id, admin_id)?;
    info!(deposit_id, admin_id, "Deposit deletion requested");
    state
        .bus
        .publish(Event::DeletionRequested { deposit_id, admin_id });
    Ok(())
}

pub fn deletion_status(state: &ServiceState, deposit_id: i64) -> Option<DeletionWorkflow> {
    state.deletions.get(deposit_id)
}

/// Handler for `DeletionRequested`: pick the branch for the deposit's status
/// and run its first step.
pub async fn on_deletion_requested(state: &ServiceState, deposit_id: i64, admin_id: i64) -> Result<()> {
    let res = start(state, deposit_id, admin_id).await;
    fail_on_error(state, deposit_id, res)
}

/// Handler for `DonationDeleted` and `MatchCancelled`: the dependent is out
/// of the way, delete the deposit itself.
pub async fn on_dependent_released(state: &ServiceState, deposit_id: i64) -> Result<()> {
    let res = delete_deposit(state, deposit_id).await;
    fail_on_error(state, deposit_id, res)
}

async fn start(state: &ServiceState, deposit_id: i64, admin_id: i64) -> Result<()> {
    let deposit = {
        let mut conn = state.pool.acquire().await?;
        db::find_deposit(&mut conn, deposit_id)
            .await?
            .ok_or_else(|| ReconcileError::deposit_not_found(deposit_id))?
    };

    match deposit.status {
        DepositStatus::Matched => {
            state.deletions.advance(deposit_id, DeletionSignal::DonationDependent)?;
            delete_donation(state, deposit, admin_id).await
        }
        DepositStatus::PartiallyMatched => {
            state.deletions.advance(deposit_id, DeletionSignal::PledgeDependent)?;
            cancel_match(state, &deposit, admin_id).await
        }
        // Unmatched and Orphan have no dependents; anything else is refused
        // by the deposit's own table in `delete_deposit`.
        _ => {
            state.deletions.advance(deposit_id, DeletionSignal::NoDependent)?;
            delete_deposit(state, deposit_id).await
        }
    }
}

async fn delete_donation(state: &ServiceState, mut deposit: Deposit, admin_id: i64) -> Result<()> {
    let mut tx = state.pool.begin().await?;
    let Some(mut donation) = db::find_donation_by_deposit(&mut tx, deposit.id).await? else {
        tx.rollback().await?;
        warn!(deposit_id = deposit.id, "Matched deposit has no donation; deleting deposit only");
        state.deletions.advance(deposit.id, DeletionSignal::DonationDeleted)?;
        state.bus.publish(Event::DonationDeleted {
            deposit_id: deposit.id,
            donation_id: None,
            admin_id,
        });
        return Ok(());
    };

    let donation_was = donation.status;
    match donation.apply(DonationEvent::Delete) {
        Ok(_) => {}
        Err(refused @ ReconcileError::InvalidTransition { .. }) => {
            // Record the failed attempt; the deposit stays `Matched`.
            let deposit_was = deposit.status;
            deposit.apply(DepositEvent::DeleteFailed)?;
            db::save_deposit(&mut tx, &deposit, deposit_was).await?;
            tx.commit().await?;
            warn!(
                deposit_id = deposit.id,
                donation_id = donation.id,
                donation_status = donation.status.as_str(),
                accepted = ?fsm::accepted_events(donation.status),
                "Donation refused deletion; deposit kept"
            );
            notify_admin(state, admin_id, NotificationKind::DonationDeleteFailed, donation.id).await;
            return abort(state, deposit.id, DeletionSignal::DonationDeleteRefused, refused);
        }
        Err(e) => return Err(e),
    }

    let now = Utc::now().timestamp();
    db::save_donation(&mut tx, &donation, donation_was).await?;
    db::soft_delete_donation(&mut tx, donation.id, now).await?;
    db::adjust_fund_sum(&mut tx, donation.funding_id, -donation.amount).await?;
    tx.commit().await?;

    info!(
        deposit_id = deposit.id,
        donation_id = donation.id,
        "Donation deleted"
    );
    notify_admin(state, admin_id, NotificationKind::DonationDeleted, donation.id).await;
    state.deletions.advance(deposit.id, DeletionSignal::DonationDeleted)?;
    state.bus.publish(Event::DonationDeleted {
        deposit_id: deposit.id,
        donation_id: Some(donation.id),
        admin_id,
    });
    Ok(())
}

async fn cancel_match(state: &ServiceState, deposit: &Deposit, admin_id: i64) -> Result<()> {
    let mut conn = state.pool.acquire().await?;
    let pledge = match deposit.provisional_donation_id {
        Some(id) => db::find_pledge(&mut conn, id).await?,
        None => db::find_pledge_by_signature(&mut conn, &deposit.sender_sig).await?,
    };
    let mut pledge = pledge.ok_or_else(|| ReconcileError::pledge_not_found(&deposit.sender_sig))?;

    let pledge_was = pledge.status;
    if let Err(refused) = pledge.apply(ProvisionalEvent::MatchCancelled) {
        drop(conn);
        warn!(
            deposit_id = deposit.id,
            provisional_id = pledge.id,
            "Pledge refused match cancellation; deposit kept"
        );
        notify_admin(state, admin_id, NotificationKind::MatchCancelFailed, pledge.id).await;
        return abort(state, deposit.id, DeletionSignal::MatchCancelRefused, refused);
    }

    db::save_pledge(&mut conn, &pledge, pledge_was).await?;
    drop(conn);

    info!(
        deposit_id = deposit.id,
        provisional_id = pledge.id,
        "Pledge match cancelled"
    );
    state.deletions.advance(deposit.id, DeletionSignal::MatchCancelled)?;
    state.bus.publish(Event::MatchCancelled {
        deposit_id: deposit.id,
        provisional_id: pledge.id,
        admin_id,
    });
    Ok(())
}

/// A dependent that committed after the workflow picked its branch.
struct LateDependent {
    kind: NotificationKind,
    subject_id: i64,
    cause: ReconcileError,
}

/// A `Matched` deposit must have no live donation left, and a
/// `PartiallyMatched` one must have had its pledge rolled back.
async fn late_dependent(conn: &mut sqlx::SqliteConnection, deposit: &Deposit) -> Result<Option<LateDependent>> {
    match deposit.status {
        DepositStatus::Matched => Ok(db::find_donation_by_deposit(conn, deposit.id)
            .await?
            .map(|donation| LateDependent {
                kind: NotificationKind::DonationDeleteFailed,
                subject_id: donation.id,
                cause: ReconcileError::AlreadyExists {
                    entity: "Donation",
                    key: donation.order_id,
                },
            })),
        DepositStatus::PartiallyMatched => {
            let Some(pledge_id) = deposit.provisional_donation_id else {
                return Ok(None);
            };
            Ok(db::find_pledge(conn, pledge_id)
                .await?
                .filter(|p| p.status == ProvisionalStatus::Rejected)
                .map(|pledge| LateDependent {
                    kind: NotificationKind::MatchCancelFailed,
                    subject_id: pledge.id,
                    cause: ReconcileError::InvalidStatus {
                        entity: "ProvisionalDonation",
                        expected: ProvisionalStatus::Pending.as_str(),
                        actual: pledge.status.as_str(),
                    },
                }))
        }
        _ => Ok(None),
    }
}

/// Status change and soft-delete marker commit together.
async fn delete_deposit(state: &ServiceState, deposit_id: i64) -> Result<()> {
    let mut tx = state.pool.begin().await?;
    let mut deposit = db::find_deposit(&mut tx, deposit_id)
        .await?
        .ok_or_else(|| ReconcileError::deposit_not_found(deposit_id))?;

    if let Some(late) = late_dependent(&mut tx, &deposit).await? {
        tx.rollback().await?;
        warn!(
            deposit_id,
            status = deposit.status.as_str(),
            subject_id = late.subject_id,
            "Dependent appeared during deletion; deposit kept"
        );
        if let Some(wf) = state.deletions.get(deposit_id) {
            notify_admin(state, wf.admin_id, late.kind, late.subject_id).await;
        }
        return abort(state, deposit_id, DeletionSignal::DependentAppeared, late.cause);
    }

    let from = deposit.status;
    deposit.apply(DepositEvent::Delete)?;
    db::save_deposit(&mut tx, &deposit, from).await?;
    db::soft_delete_deposit(&mut tx, deposit_id, Utc::now().timestamp()).await?;
    tx.commit().await?;

    info!(deposit_id, "Deposit deleted");
    let step = state.deletions.advance(deposit_id, DeletionSignal::DepositDeleted)?;
    state.bus.publish(Event::DeletionFinished { deposit_id, step });
    Ok(())
}

fn abort(
    state: &ServiceState,
    deposit_id: i64,
    signal: DeletionSignal,
    cause: ReconcileError,
) -> Result<()> {
    let step = state.deletions.advance(deposit_id, signal)?;
    state.deletions.set_reason(deposit_id, cause.to_string());
    state.bus.publish(Event::DeletionFinished { deposit_id, step });
    Ok(())
}

/// Move a still-live workflow to `Failed` and pass the error on.
fn fail_on_error(state: &ServiceState, deposit_id: i64, res: Result<()>) -> Result<()> {
    let Err(e) = res else {
        return Ok(());
    };
    error!(deposit_id, "Deposit deletion failed: {e}");
    if let Ok(step) = state.deletions.advance(deposit_id, DeletionSignal::Fault) {
        state.deletions.set_reason(deposit_id, e.to_string());
        state.bus.publish(Event::DeletionFinished { deposit_id, step });
    }
    Err(e)
}

async fn notify_admin(state: &ServiceState, admin_id: i64, kind: NotificationKind, subject_id: i64) {
    let mut effects = Effects::new("deposit_deletion", subject_id);
    effects.add(
        "notify_admin",
        state.notifier.notify(NewNotification {
            recipient_id: admin_id,
            sender_id: None,
            kind,
            subject_id,
        }),
    );
    effects.join().await;
}
