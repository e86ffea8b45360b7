//! Best-effort fan-out of side effects.
//!
//! Once an aggregate's new state is committed, the follow-up work
//! (notifications, funding totals) runs concurrently and is joined here.
//! Every failure is logged on its own and collected into the
//! [`EffectReport`]; nothing is re-raised and nothing is retried. Delivery is
//! therefore at most once per effect.

use std::future::Future;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use tracing::{info, warn};

use crate::errors::Result;

pub struct Effects<'a> {
    scope: &'static str,
    subject_id: i64,
    tasks: Vec<(&'static str, BoxFuture<'a, Result<()>>)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EffectReport {
    pub succeeded: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

impl EffectReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

impl<'a> Effects<'a> {
    /// `scope` names the outcome being handled, `subject_id` the record it is
    /// about; both only feed the logs.
    pub fn new(scope: &'static str, subject_id: i64) -> Self {
        Self {
            scope,
            subject_id,
            tasks: Vec::new(),
        }
    }

    pub fn add<F>(&mut self, name: &'static str, effect: F) -> &mut Self
    where
        F: Future<Output = Result<()>> + Send + 'a,
    {
        self.tasks.push((name, effect.boxed()));
        self
    }

    /// Drive all effects to completion, in no particular order.
    pub async fn join(self) -> EffectReport {
        let (names, futures): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let results = join_all(futures).await;

        let mut report = EffectReport::default();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => report.succeeded.push(name),
                Err(e) => {
                    warn!(
                        scope = self.scope,
                        subject_id = self.subject_id,
                        effect = name,
                        "Side effect failed: {e}"
                    );
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        info!(
            scope = self.scope,
            subject_id = self.subject_id,
            ok = report.succeeded.len(),
            failed = report.failed.len(),
            "Side effects settled"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ReconcileError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn one_failure_does_not_stop_the_others() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut effects = Effects::new("test", 1);
        for name in ["a", "b"] {
            let ran = ran.clone();
            effects.add(name, async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        effects.add("boom", async { Err(ReconcileError::Notification("down".into())) });

        let report = effects.join().await;

        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(report.succeeded, vec!["a", "b"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "boom");
        assert!(!report.all_succeeded());
    }

    #[tokio::test]
    async fn effects_run_concurrently() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut effects = Effects::new("test", 2);
        // The waiter can only finish if the sender is polled alongside it.
        effects.add("waiter", async move {
            rx.await
                .map_err(|e| ReconcileError::Notification(e.to_string()))
        });
        effects.add("sender", async move {
            let _ = tx.send(());
            Ok(())
        });
        assert!(effects.join().await.all_succeeded());
    }

    #[tokio::test]
    async fn empty_fan_out_is_fine() {
        let report = Effects::new("test", 3).join().await;
        assert_eq!(report, EffectReport::default());
    }
}
