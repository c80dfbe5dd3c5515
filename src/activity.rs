// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::SyncLog;

/// Snapshot of a currently-running sync, updated in place as the Source
/// Runner progresses through calendars.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSync {
    pub source_id: Uuid,
    pub source_name: String,
    pub calendars_total: usize,
    pub calendars_done: usize,
    pub current_calendar: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivitySnapshot {
    pub active: Vec<ActiveSync>,
    pub recent: Vec<SyncLog>,
}

/// Process-wide record of what the Scheduler's workers are doing right now,
/// plus a bounded history of completed runs. Readers (the control plane)
/// never block writers meaningfully: reads and writes both take the
/// reader-writer lock, but reads are held only long enough to clone.
pub struct ActivityTracker {
    active: RwLock<HashMap<Uuid, ActiveSync>>,
    history: RwLock<VecDeque<SyncLog>>,
    history_limit: usize,
}

impl ActivityTracker {
    pub fn new(history_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(history_limit)),
            history_limit,
        })
    }

    pub async fn start_sync(&self, source_id: Uuid, source_name: String, calendars_total: usize) {
        let mut active = self.active.write().await;
        active.insert(
            source_id,
            ActiveSync {
                source_id,
                source_name,
                calendars_total,
                calendars_done: 0,
                current_calendar: None,
                started_at: Utc::now(),
            },
        );
    }

    pub async fn update_calendar(&self, source_id: Uuid, calendar_href: &str) {
        let mut active = self.active.write().await;
        if let Some(entry) = active.get_mut(&source_id) {
            entry.current_calendar = Some(calendar_href.to_string());
        }
    }

    pub async fn increment_progress(&self, source_id: Uuid) {
        let mut active = self.active.write().await;
        if let Some(entry) = active.get_mut(&source_id) {
            entry.calendars_done += 1;
        }
    }

    pub async fn is_syncing(&self, source_id: Uuid) -> bool {
        self.active.read().await.contains_key(&source_id)
    }

    pub async fn finish_sync(&self, source_id: Uuid, log: SyncLog) {
        self.active.write().await.remove(&source_id);

        let mut history = self.history.write().await;
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(log);
    }

    pub async fn snapshot(&self) -> ActivitySnapshot {
        let active = self.active.read().await.values().cloned().collect();
        let recent = self.history.read().await.iter().cloned().collect();
        ActivitySnapshot { active, recent }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncCounters, SyncStatus};

    fn sample_log(source_id: Uuid) -> SyncLog {
        SyncLog {
            id: Uuid::new_v4(),
            source_id,
            status: SyncStatus::Success,
            message: "ok".into(),
            details: None,
            duration_ms: 5,
            counters: SyncCounters::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn tracks_start_progress_and_finish() {
        let tracker = ActivityTracker::new(10);
        let source_id = Uuid::new_v4();

        assert!(!tracker.is_syncing(source_id).await);
        tracker.start_sync(source_id, "Personal".into(), 2).await;
        assert!(tracker.is_syncing(source_id).await);

        tracker.update_calendar(source_id, "/cal/a/").await;
        tracker.increment_progress(source_id).await;

        let snap = tracker.snapshot().await;
        assert_eq!(snap.active.len(), 1);
        assert_eq!(snap.active[0].calendars_done, 1);
        assert_eq!(snap.active[0].current_calendar.as_deref(), Some("/cal/a/"));

        tracker.finish_sync(source_id, sample_log(source_id)).await;
        assert!(!tracker.is_syncing(source_id).await);

        let snap = tracker.snapshot().await;
        assert!(snap.active.is_empty());
        assert_eq!(snap.recent.len(), 1);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let tracker = ActivityTracker::new(2);
        let source_id = Uuid::new_v4();

        for _ in 0..5 {
            tracker.finish_sync(source_id, sample_log(source_id)).await;
        }

        let snap = tracker.snapshot().await;
        assert_eq!(snap.recent.len(), 2);
    }
}
