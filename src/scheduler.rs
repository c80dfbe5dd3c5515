// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::activity::ActivityTracker;
use crate::config::Config;
use crate::models::Source;
use crate::runner;
use crate::store::EventStore;

struct Worker {
    cancel: CancellationToken,
    trigger: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Owns one cooperative worker per enabled source. Each worker alternates
/// between sleeping until its next scheduled instant and invoking the
/// Source Runner; update/delete events restart or cancel the relevant
/// worker without disturbing the others.
pub struct Scheduler {
    config: Arc<Config>,
    store: EventStore,
    activity: Arc<ActivityTracker>,
    workers: RwLock<HashMap<Uuid, Worker>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(config: Arc<Config>, store: EventStore, activity: Arc<ActivityTracker>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            activity,
            workers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Reads all enabled sources and spawns a worker for each. Called once
    /// at startup; a source created afterward is added via `upsert_source`.
    pub async fn start(self: &Arc<Self>) -> Result<(), crate::error::CalBridgeError> {
        let sources = self.store.get_enabled_sources().await?;
        for source in sources {
            self.spawn_worker(source).await;
        }
        Ok(())
    }

    pub async fn upsert_source(self: &Arc<Self>, source: Source) {
        self.remove_source(source.id).await;
        if source.enabled {
            self.spawn_worker(source).await;
        }
    }

    pub async fn remove_source(&self, source_id: Uuid) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.remove(&source_id) {
            worker.cancel.cancel();
            worker.handle.abort();
        }
    }

    /// Wakes the source's worker immediately. If the worker is already
    /// running a sync, the notification is coalesced and consumed on the
    /// next sleep — at most one enqueued trigger per source.
    pub async fn trigger_source(&self, source_id: Uuid) -> bool {
        let workers = self.workers.read().await;
        if let Some(worker) = workers.get(&source_id) {
            worker.trigger.notify_one();
            true
        } else {
            false
        }
    }

    /// Cooperative global shutdown: every worker's sleep is interrupted
    /// immediately; an in-flight sync finishes its current HTTP request and
    /// then unwinds, writing a `partial`/`error` log noting cancellation.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut workers = self.workers.write().await;
        for (_, worker) in workers.drain() {
            worker.cancel.cancel();
            let _ = worker.handle.await;
        }
    }

    async fn spawn_worker(self: &Arc<Self>, source: Source) {
        let cancel = self.shutdown.child_token();
        let trigger = Arc::new(Notify::new());
        let scheduler = Arc::clone(self);
        let source_id = source.id;
        let worker_trigger = Arc::clone(&trigger);
        let worker_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            worker_loop(scheduler, source_id, worker_trigger, worker_cancel).await;
        });

        let mut workers = self.workers.write().await;
        workers.insert(
            source_id,
            Worker {
                cancel,
                trigger,
                handle,
            },
        );
    }
}

async fn worker_loop(
    scheduler: Arc<Scheduler>,
    source_id: Uuid,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let source = match reload_source(&scheduler, source_id).await {
            Some(s) if s.enabled => s,
            _ => return,
        };

        let interval = scheduler.config.clamp_interval(source.sync_interval_secs);
        let next_run = source
            .last_sync_at
            .map(|last| last + chrono::Duration::seconds(interval))
            .unwrap_or_else(Utc::now);
        let sleep_for = (next_run - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = trigger.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }

        if cancel.is_cancelled() {
            return;
        }

        let source = match reload_source(&scheduler, source_id).await {
            Some(s) if s.enabled => s,
            _ => return,
        };

        runner::run_source(
            &scheduler.config,
            &scheduler.store,
            &scheduler.activity,
            &source,
            cancel.clone(),
        )
        .await;
    }
}

async fn reload_source(scheduler: &Arc<Scheduler>, source_id: Uuid) -> Option<Source> {
    match scheduler.store.get_source_by_id(source_id).await {
        Ok(source) => Some(source),
        Err(e) => {
            if !e.is_not_found() {
                warn!(error = %e, %source_id, "failed to reload source for scheduling");
            }
            None
        }
    }
}
