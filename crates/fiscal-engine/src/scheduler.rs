//! # Reconciliation Scheduler
//!
//! Background loop that finishes what direct submission left behind.
//!
//! ## Each Tick
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Select: pending older than min_age, processing older than          │
//! │             stale_after (oldest first, batch_size at most)             │
//! │                                                                         │
//! │  2. Run:    one task per attempt; claim() / reclaim_stale() decide     │
//! │             which worker owns it, the rest are skipped                 │
//! │                                                                         │
//! │  3. Correct: error attempts with an auto-correctable rejection get     │
//! │             their inferred fix and go back to pending, at most         │
//! │             auto_rearm_limit times each                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The loop owns no attempt state of its own. Running several schedulers
//! (or a scheduler next to direct submissions) is safe because every move
//! is a conditional update in the database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use fiscal_core::rejection::correction_for;
use fiscal_core::AttemptState;
use fiscal_db::DbError;

use crate::config::SchedulerSettings;
use crate::error::{FiscalError, FiscalResult};
use crate::processor::InvoiceProcessor;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Attempts the selection returned.
    pub selected: usize,
    pub completed: usize,
    pub failed: usize,
    /// Still `processing` after the pass.
    pub deferred: usize,
    /// Claimed by another worker first.
    pub skipped: usize,
    /// Passes that ended in an unexpected error.
    pub errors: usize,
    /// `error` attempts re-armed by a corrective rule.
    pub rearmed: usize,
}

impl ReconcileReport {
    fn record(&mut self, state: AttemptState) {
        match state {
            AttemptState::Completed => self.completed += 1,
            AttemptState::Error => self.failed += 1,
            AttemptState::Processing | AttemptState::Pending => self.deferred += 1,
        }
    }
}

type Trigger = oneshot::Sender<FiscalResult<ReconcileReport>>;

pub struct ReconciliationScheduler {
    processor: Arc<InvoiceProcessor>,
    settings: SchedulerSettings,

    /// Manual tick requests.
    trigger_rx: mpsc::Receiver<Trigger>,

    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for controlling a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    trigger_tx: mpsc::Sender<Trigger>,
    shutdown_tx: mpsc::Sender<()>,
}

impl SchedulerHandle {
    /// Runs a tick now and waits for its report.
    pub async fn run_once(&self) -> FiscalResult<ReconcileReport> {
        let (tx, rx) = oneshot::channel();
        self.trigger_tx
            .send(tx)
            .await
            .map_err(|_| FiscalError::ChannelClosed("scheduler is not running".into()))?;
        rx.await
            .map_err(|_| FiscalError::ChannelClosed("scheduler stopped mid-tick".into()))?
    }

    /// Stops the loop after the current tick.
    pub async fn shutdown(&self) -> FiscalResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| FiscalError::ChannelClosed("scheduler is not running".into()))
    }
}

impl ReconciliationScheduler {
    pub fn new(
        processor: Arc<InvoiceProcessor>,
        settings: SchedulerSettings,
    ) -> (Self, SchedulerHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let scheduler = ReconciliationScheduler {
            processor,
            settings,
            trigger_rx,
            shutdown_rx,
        };
        let handle = SchedulerHandle {
            trigger_tx,
            shutdown_tx,
        };

        (scheduler, handle)
    }

    /// Runs the loop until shutdown.
    ///
    /// This should be spawned as a background task. With `enabled = false`
    /// only manual ticks run.
    pub async fn run(mut self) {
        info!(
            enabled = self.settings.enabled,
            interval_secs = self.settings.interval_secs,
            "Reconciliation scheduler starting"
        );

        let period = self.settings.interval().max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick(), if self.settings.enabled => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Reconciliation tick failed");
                    }
                }

                Some(reply) = self.trigger_rx.recv() => {
                    let report = self.run_once().await;
                    if reply.send(report).is_err() {
                        debug!("Manual tick requester went away");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Reconciliation scheduler shutting down");
                    break;
                }
            }
        }

        info!("Reconciliation scheduler stopped");
    }

    /// One tick: run eligible attempts, then apply corrective rules.
    pub async fn run_once(&self) -> FiscalResult<ReconcileReport> {
        let now = Utc::now();
        let stale_before = now - self.settings.stale_after();
        let candidates = self
            .processor
            .db()
            .attempts()
            .list_reclaimable(
                now - self.settings.min_age(),
                stale_before,
                self.settings.batch_size,
            )
            .await?;

        let mut report = ReconcileReport {
            selected: candidates.len(),
            ..Default::default()
        };

        let mut passes = JoinSet::new();
        for attempt in candidates {
            let processor = self.processor.clone();
            passes.spawn(async move {
                let id = attempt.id.clone();
                (id, processor.run_candidate(attempt, stale_before).await)
            });
        }

        while let Some(joined) = passes.join_next().await {
            match joined {
                Ok((_, Ok(Some(attempt)))) => report.record(attempt.state),
                Ok((_, Ok(None))) => report.skipped += 1,
                Ok((id, Err(e))) => {
                    error!(attempt_id = %id, error = %e, "Pass failed");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "Pass task aborted");
                    report.errors += 1;
                }
            }
        }

        report.rearmed = self.auto_correct().await?;

        if report.selected > 0 || report.rearmed > 0 {
            info!(?report, "Reconciliation tick finished");
        } else {
            debug!("Nothing to reconcile");
        }
        Ok(report)
    }

    async fn auto_correct(&self) -> FiscalResult<usize> {
        let limit = self.settings.auto_rearm_limit;
        if limit == 0 {
            return Ok(0);
        }

        let repo = self.processor.db().attempts();
        let mut rearmed = 0;

        for attempt in repo
            .list_auto_correctable(limit, self.settings.batch_size)
            .await?
        {
            let Some(correction) = correction_for(&attempt) else {
                debug!(attempt_id = %attempt.id, "No correction applies");
                continue;
            };

            match repo.auto_rearm(&attempt.id, correction, limit).await {
                Ok(_) => rearmed += 1,
                Err(DbError::StateConflict { .. }) => {
                    debug!(attempt_id = %attempt.id, "Attempt changed before re-arm");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(rearmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixtures, test_config, FakeAuthority, Scripted, TestEngine};
    use fiscal_core::{ReceiverTaxCondition, RejectionClass, RemoteMessage};

    fn missing_condition() -> Scripted {
        Scripted::Reject(vec![RemoteMessage::new(
            10242,
            "El campo Condicion Frente al IVA del receptor es obligatorio",
        )])
    }

    async fn create_without_condition(engine: &TestEngine, sale_id: &str) {
        let mut input = fixtures::new_attempt(sale_id);
        input.receiver.tax_condition = None;
        engine.processor.create_attempt(input).await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_processes_pending() {
        let engine = TestEngine::start().await;
        engine.create("sale-1").await;
        engine.create("sale-2").await;
        let (scheduler, _handle) = engine.scheduler();

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.selected, 2);
        assert_eq!(report.completed, 2);

        let mut numbers = vec![
            engine.reload("sale-1").await.number.unwrap(),
            engine.reload("sale-2").await.number.unwrap(),
        ];
        numbers.sort_unstable();
        assert_eq!(numbers, vec![1, 2]);

        let idle = scheduler.run_once().await.unwrap();
        assert_eq!(idle, ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_young_pending_left_alone() {
        let mut config = test_config();
        config.scheduler.min_age_secs = 3_600;
        let engine = TestEngine::with_parts(config, FakeAuthority::new()).await;
        engine.create("sale-1").await;
        let (scheduler, _handle) = engine.scheduler();

        assert_eq!(scheduler.run_once().await.unwrap().selected, 0);
        assert_eq!(engine.reload("sale-1").await.state, AttemptState::Pending);
    }

    #[tokio::test]
    async fn test_abandoned_processing_is_reclaimed() {
        let engine = TestEngine::start().await;
        let attempt = engine.create("sale-1").await;
        // A worker claimed it and died.
        engine.db.attempts().claim(&attempt.id).await.unwrap();
        let (scheduler, _handle) = engine.scheduler();

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(engine.reload("sale-1").await.passes, 2);
    }

    #[tokio::test]
    async fn test_transport_failures_are_deferred() {
        let engine = TestEngine::start().await;
        engine.authority.script(Scripted::Timeout);
        engine.create("sale-1").await;
        let (scheduler, _handle) = engine.scheduler();

        let first = scheduler.run_once().await.unwrap();
        assert_eq!(first.deferred, 1);

        let second = scheduler.run_once().await.unwrap();
        assert_eq!(second.completed, 1);
        assert_eq!(engine.authority.voucher_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_condition_is_corrected_once() {
        let engine = TestEngine::start().await;
        engine.authority.script(missing_condition());
        create_without_condition(&engine, "sale-1").await;
        let (scheduler, _handle) = engine.scheduler();

        let first = scheduler.run_once().await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.rearmed, 1);

        let rearmed = engine.reload("sale-1").await;
        assert_eq!(rearmed.state, AttemptState::Pending);
        assert_eq!(rearmed.auto_rearms, 1);
        assert_eq!(
            rearmed.receiver.tax_condition,
            Some(ReceiverTaxCondition::FinalConsumer)
        );
        assert!(rearmed.log.contains("Condicion Frente al IVA del receptor"));

        let second = scheduler.run_once().await.unwrap();
        assert_eq!(second.completed, 1);
        assert_eq!(engine.reload("sale-1").await.state, AttemptState::Completed);
    }

    #[tokio::test]
    async fn test_correction_is_not_repeated() {
        let engine = TestEngine::start().await;
        engine.authority.script(missing_condition());
        engine.authority.script(missing_condition());
        create_without_condition(&engine, "sale-1").await;
        let (scheduler, _handle) = engine.scheduler();

        assert_eq!(scheduler.run_once().await.unwrap().rearmed, 1);
        let second = scheduler.run_once().await.unwrap();
        assert_eq!(second.failed, 1);
        assert_eq!(second.rearmed, 0);

        let attempt = engine.reload("sale-1").await;
        assert_eq!(attempt.state, AttemptState::Error);
        assert_eq!(
            attempt.rejection_class,
            Some(RejectionClass::MissingReceiverTaxCondition)
        );
        assert!(!attempt.is_auto_correctable(engine.config.scheduler.auto_rearm_limit));
    }

    #[tokio::test]
    async fn test_handle_triggers_and_stops() {
        let engine = TestEngine::start().await;
        engine.create("sale-1").await;
        let (scheduler, handle) = engine.scheduler();
        let task = tokio::spawn(scheduler.run());

        handle.run_once().await.unwrap();
        assert_eq!(engine.reload("sale-1").await.state, AttemptState::Completed);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            handle.run_once().await,
            Err(FiscalError::ChannelClosed(_))
        ));
    }
}
