//! Application-wide error types.
//!
//! Besides the infrastructure failures (database, migrations, config) this
//! enum is also the domain-error catalog: the named constructors at the bottom
//! are the only way the rest of the crate builds "not found", "already exists"
//! and similar values, so their messages stay uniform.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The transition table of `entity` has no row for `(state, event)`.
    #[error("Invalid transition for {entity}: no `{event}` event from `{state}`")]
    InvalidTransition {
        entity: &'static str,
        state: &'static str,
        event: &'static str,
    },

    #[error("Deposit {deposit_id} is unmatched: no pledge for sender `{sender_sig}`")]
    Unmatched { deposit_id: i64, sender_sig: String },

    #[error("Deposit {deposit_id} is partially matched: pledged {pledged}, received {received}")]
    PartiallyMatched {
        deposit_id: i64,
        pledged: i64,
        received: i64,
    },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Amount {amount} exceeds the funding goal {goal}")]
    AmountExceeded { amount: i64, goal: i64 },

    #[error("Amount must not be negative (got {0})")]
    NegativeAmount(i64),

    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("{entity} has status `{actual}`, expected `{expected}`")]
    InvalidStatus {
        entity: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    /// A compare-and-swap save found the row no longer in `expected`.
    #[error("{entity} {id} changed concurrently; expected status `{expected}`")]
    StaleWrite {
        entity: &'static str,
        id: i64,
        expected: &'static str,
    },

    #[error("Deposit {deposit_id} has a deletion in progress")]
    DepositLocked { deposit_id: i64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Notification error: {0}")]
    Notification(String),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

impl ReconcileError {
    pub fn deposit_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "Deposit",
            key: id.to_string(),
        }
    }

    pub fn donation_not_found(key: impl ToString) -> Self {
        Self::NotFound {
            entity: "Donation",
            key: key.to_string(),
        }
    }

    pub fn pledge_not_found(key: impl ToString) -> Self {
        Self::NotFound {
            entity: "ProvisionalDonation",
            key: key.to_string(),
        }
    }

    pub fn funding_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "Funding",
            key: id.to_string(),
        }
    }

    pub fn user_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "User",
            key: id.to_string(),
        }
    }

    pub fn pledge_exists(sender_sig: &str) -> Self {
        Self::AlreadyExists {
            entity: "ProvisionalDonation",
            key: sender_sig.to_string(),
        }
    }

    pub fn deletion_in_progress(deposit_id: i64) -> Self {
        Self::AlreadyExists {
            entity: "DeletionWorkflow",
            key: deposit_id.to_string(),
        }
    }

    /// Fail unless `amount` fits within a funding `goal`.
    pub fn check_within_goal(amount: i64, goal: i64) -> Result<()> {
        if amount < 0 {
            return Err(Self::NegativeAmount(amount));
        }
        if amount > goal {
            return Err(Self::AmountExceeded { amount, goal });
        }
        Ok(())
    }

    /// Business outcomes of reconciliation, as opposed to bugs or outages.
    pub fn is_reconcile_outcome(&self) -> bool {
        matches!(self, Self::Unmatched { .. } | Self::PartiallyMatched { .. })
    }

    /// Failures a later delivery of the same event may get past.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::StaleWrite { .. } | Self::DepositLocked { .. }
        )
    }
}
