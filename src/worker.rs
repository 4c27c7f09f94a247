//! The worker pool draining the shared work queue.
//!
//! A fixed set of long-lived tasks claim items from the store and feed
//! them to the recovery state machine. Idle workers park on a shared
//! [`Notify`] with a timeout, so a `wakeup()` from any scheduling API
//! gets work picked up immediately while the timeout keeps the pool
//! polling for items rescheduled into the future.
//!
//! The periodic cleanup task lives here as well: every
//! `time_between_cleanup` it purges terminal items older than the
//! retention window.

use crate::recovery::RecoveryEngine;
use crate::types::now_secs;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Handle over the worker tasks and the cleanup task.
pub(crate) struct WorkerPool {
    engine: Arc<RecoveryEngine>,
    notify: Arc<Notify>,
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(engine: Arc<RecoveryEngine>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            engine,
            notify: Arc::new(Notify::new()),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Wake every idle worker immediately.
    pub(crate) fn wakeup(&self) {
        debug!("Waking up HA workers");
        self.notify.notify_waiters();
    }

    /// Spawn the worker tasks and the cleanup task.
    pub(crate) async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            warn!("Worker pool already started");
            return;
        }

        for index in 0..self.engine.config.ha_workers {
            let engine = self.engine.clone();
            let notify = self.notify.clone();
            let shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(worker_loop(index, engine, notify, shutdown)));
        }

        let engine = self.engine.clone();
        let shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(cleanup_loop(engine, shutdown)));

        info!(
            workers = self.engine.config.ha_workers,
            instance = %self.engine.config.instance,
            "HA worker pool started"
        );
    }

    /// Signal shutdown and wait for every task to exit.
    pub(crate) async fn stop(&self) {
        let _ = self.shutdown.send(());
        self.notify.notify_waiters();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(error) = result {
                warn!(%error, "Worker task ended abnormally");
            }
        }
        info!("HA worker pool stopped");
    }
}

async fn worker_loop(
    index: usize,
    engine: Arc<RecoveryEngine>,
    notify: Arc<Notify>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(worker = index, "Starting work");
    loop {
        trace!(worker = index, "Checking the store for work");
        match engine.take_work().await {
            Ok(Some(mut work)) => {
                let span = info_span!("ha_work", work = work.id, worker = index);
                async {
                    info!(%work, "Processing work");
                    engine.process_work(&mut work).await;
                }
                .instrument(span)
                .await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(engine.config.time_to_sleep) => {}
                }
            }
            Err(err) => {
                error!(worker = index, error = %err, "Failed to claim work");
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(engine.config.time_to_sleep) => {}
                }
            }
        }

        if shutdown.try_recv().is_ok() {
            break;
        }
    }
    info!(worker = index, "Time to go home");
}

async fn cleanup_loop(engine: Arc<RecoveryEngine>, mut shutdown: broadcast::Receiver<()>) {
    let period = engine.config.time_between_cleanup;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                info!("HA cleanup task running");
                let cutoff = now_secs() - engine.config.time_between_failures.as_secs() as i64;
                if let Err(error) = engine.store.cleanup(cutoff).await {
                    warn!(%error, "Error while cleaning up terminal work items");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
