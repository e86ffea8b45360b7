//! # State machine engine
//!
//! A declarative transition-table evaluator shared by every aggregate.
//!
//! Each entity type declares a closed status enum, a closed event enum and a
//! `'static` table of [`Transition`] rows. [`transition`] returns the `to`
//! state of the first row whose `from` and `event` match, or
//! [`ReconcileError::InvalidTransition`] when none does. The table is the
//! only guard against illegal state changes, so it must list every legal
//! move, self-loops included:
//!
//! ```text
//! (Matched, DeleteFailed) ──► Matched     // tolerated, no state change
//! (Deleted, *)            ──► error       // terminal
//! ```
//!
//! Tables are compile-time constants and cannot be extended at runtime.

use std::fmt::Debug;

use crate::errors::{ReconcileError, Result};

/// A closed set of named values (statuses or events).
pub trait Label: Copy + Eq + Debug + Send + Sync + 'static {
    /// Every variant, in declaration order.
    const ALL: &'static [Self];

    /// Stable snake_case identifier, also used as the storage representation.
    fn as_str(self) -> &'static str;

    /// Inverse of [`Label::as_str`].
    fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }
}

/// One `{from, event, to}` row of a transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, E> {
    pub from: S,
    pub event: E,
    pub to: S,
}

impl<S, E> Transition<S, E> {
    pub const fn new(from: S, event: E, to: S) -> Self {
        Self { from, event, to }
    }
}

/// A status enum governed by a static transition table.
pub trait Lifecycle: Label {
    type Event: Label;

    /// Entity name used in error messages and logs.
    const ENTITY: &'static str;

    const TABLE: &'static [Transition<Self, Self::Event>];
}

/// Look up `(from, event)` in the table of `S`.
pub fn transition<S: Lifecycle>(from: S, event: S::Event) -> Result<S> {
    S::TABLE
        .iter()
        .find(|row| row.from == from && row.event == event)
        .map(|row| row.to)
        .ok_or(ReconcileError::InvalidTransition {
            entity: S::ENTITY,
            state: from.as_str(),
            event: event.as_str(),
        })
}

/// `true` when `state` has no outgoing rows at all.
pub fn is_terminal<S: Lifecycle>(state: S) -> bool {
    !S::TABLE.iter().any(|row| row.from == state)
}

/// Events accepted in `state`, in table order.
pub fn accepted_events<S: Lifecycle>(state: S) -> Vec<S::Event> {
    S::TABLE
        .iter()
        .filter(|row| row.from == state)
        .map(|row| row.event)
        .collect()
}

/// Shared table checks, run by each aggregate's test module.
#[cfg(test)]
pub(crate) mod table_checks {
    use super::*;

    /// Every `(state, event)` pair outside the table must be rejected, and
    /// every pair inside must yield the first matching row's `to`.
    pub fn assert_table_is_authoritative<S: Lifecycle>() {
        for &state in S::ALL {
            for &event in S::Event::ALL {
                let row = S::TABLE
                    .iter()
                    .find(|r| r.from == state && r.event == event);
                match (row, transition(state, event)) {
                    (Some(r), Ok(next)) => assert_eq!(next, r.to),
                    (None, Err(ReconcileError::InvalidTransition {
                        entity,
                        state: s,
                        event: e,
                    })) => {
                        assert_eq!(entity, S::ENTITY);
                        assert_eq!(s, state.as_str());
                        assert_eq!(e, event.as_str());
                    }
                    (row, res) => panic!(
                        "{} ({state:?}, {event:?}): row {row:?} but got {res:?}",
                        S::ENTITY
                    ),
                }
            }
        }
    }

    /// Applying a state-changing row twice fails the second time unless the
    /// destination state itself accepts the same event.
    pub fn assert_no_silent_repeat<S: Lifecycle>() {
        for row in S::TABLE.iter().filter(|r| r.from != r.to) {
            let next = transition(row.from, row.event).unwrap();
            let reaccepts = S::TABLE
                .iter()
                .any(|r| r.from == next && r.event == row.event);
            assert_eq!(transition(next, row.event).is_ok(), reaccepts);
        }
    }

    pub fn assert_labels_round_trip<L: Label>() {
        for &v in L::ALL {
            assert_eq!(L::parse(v.as_str()), Some(v));
        }
        assert_eq!(L::parse("no_such_label"), None);
    }
}
