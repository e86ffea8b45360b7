//! Shared handles passed to every handler.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::events::EventBus;
use crate::locks::SignatureLocks;
use crate::notify::Notifier;
use crate::saga::DeletionRegistry;

#[derive(Clone)]
pub struct ServiceState {
    pub pool: SqlitePool,
    pub bus: EventBus,
    pub notifier: Arc<dyn Notifier>,
    pub locks: SignatureLocks,
    pub deletions: DeletionRegistry,
}

impl ServiceState {
    pub fn new(pool: SqlitePool, bus: EventBus, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            pool,
            bus,
            notifier,
            locks: SignatureLocks::new(),
            deletions: DeletionRegistry::default(),
        }
    }
}
