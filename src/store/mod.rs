// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

mod rows;

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{CalBridgeError, Result};
use crate::models::*;
use rows::{MalformedEventRow, SourceRow, SyncLogRow, SyncStateRow, SyncedEventRow};

/// Durable relational state: sources, sync cursors, event tombstones,
/// sync logs, malformed-event records. SQLite is the sole shared mutable
/// resource; every multi-step update within a pass is idempotent, so no
/// explicit transaction spans more than one statement except migration.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub async fn connect(database_path: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{database_path}"))
            .map_err(|e| CalBridgeError::Config(format!("invalid DATABASE_PATH: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            CalBridgeError::Config(format!("failed to run migrations: {e}"))
        })?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // --- sources -----------------------------------------------------

    pub async fn get_enabled_sources(&self) -> Result<Vec<Source>> {
        let rows = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Combines lookup and ownership check in one query to avoid a timing
    /// oracle that would let a caller distinguish "not found" from
    /// "not yours".
    pub async fn get_source_by_id_for_user(
        &self,
        source_id: Uuid,
        user_id: Uuid,
    ) -> Result<Source> {
        let row = sqlx::query_as::<_, SourceRow>(
            "SELECT * FROM sources WHERE id = ? AND owner_user_id = ?",
        )
        .bind(source_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CalBridgeError::NotFound(format!("source {source_id}")))?;
        Ok(row.into())
    }

    /// Unscoped lookup for internal callers (the Scheduler) that already
    /// operate outside any one user's request context.
    pub async fn get_source_by_id(&self, source_id: Uuid) -> Result<Source> {
        let row = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources WHERE id = ?")
            .bind(source_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CalBridgeError::NotFound(format!("source {source_id}")))?;
        Ok(row.into())
    }

    pub async fn list_sources_for_user(&self, user_id: Uuid) -> Result<Vec<Source>> {
        let rows = sqlx::query_as::<_, SourceRow>(
            "SELECT * FROM sources WHERE owner_user_id = ? ORDER BY display_name",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn update_source_sync_status(
        &self,
        source_id: Uuid,
        status: SyncStatus,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sources SET last_sync_at = ?, last_sync_status = ?, last_sync_message = ? WHERE id = ?",
        )
        .bind(at.to_rfc3339())
        .bind(status_to_str(status))
        .bind(message)
        .bind(source_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- sync state ----------------------------------------------------

    pub async fn get_sync_state(
        &self,
        source_id: Uuid,
        calendar_href: &str,
    ) -> Result<Option<SyncState>> {
        let row = sqlx::query_as::<_, SyncStateRow>(
            "SELECT * FROM sync_states WHERE source_id = ? AND calendar_href = ?",
        )
        .bind(source_id.to_string())
        .bind(calendar_href)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn upsert_sync_state(
        &self,
        source_id: Uuid,
        calendar_href: &str,
        sync_token: Option<&str>,
        ctag: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_states (source_id, calendar_href, sync_token, ctag, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(source_id, calendar_href) DO UPDATE SET
                sync_token = excluded.sync_token,
                ctag = excluded.ctag,
                updated_at = excluded.updated_at",
        )
        .bind(source_id.to_string())
        .bind(calendar_href)
        .bind(sync_token)
        .bind(ctag)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- synced events ---------------------------------------------------

    /// Returns the full known-UID set for a calendar, keyed by UID, used by
    /// the Reconciler to compute deletions by set difference.
    pub async fn get_synced_events(
        &self,
        source_id: Uuid,
        calendar_href: &str,
    ) -> Result<std::collections::HashMap<String, SyncedEvent>> {
        let rows = sqlx::query_as::<_, SyncedEventRow>(
            "SELECT * FROM synced_events WHERE source_id = ? AND calendar_href = ?",
        )
        .bind(source_id.to_string())
        .bind(calendar_href)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let event: SyncedEvent = r.into();
                (event.event_uid.clone(), event)
            })
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_synced_event(
        &self,
        source_id: Uuid,
        calendar_href: &str,
        event_uid: &str,
        source_href: Option<&str>,
        source_etag: Option<&str>,
        dest_etag: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO synced_events
                (source_id, calendar_href, event_uid, source_href, source_etag, dest_etag, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(source_id, calendar_href, event_uid) DO UPDATE SET
                source_href = excluded.source_href,
                source_etag = excluded.source_etag,
                dest_etag = excluded.dest_etag,
                updated_at = excluded.updated_at",
        )
        .bind(source_id.to_string())
        .bind(calendar_href)
        .bind(event_uid)
        .bind(source_href)
        .bind(source_etag)
        .bind(dest_etag)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_synced_event(
        &self,
        source_id: Uuid,
        calendar_href: &str,
        event_uid: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM synced_events WHERE source_id = ? AND calendar_href = ? AND event_uid = ?",
        )
        .bind(source_id.to_string())
        .bind(calendar_href)
        .bind(event_uid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_synced_events_for_calendar(
        &self,
        source_id: Uuid,
        calendar_href: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM synced_events WHERE source_id = ? AND calendar_href = ?")
            .bind(source_id.to_string())
            .bind(calendar_href)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- malformed events -----------------------------------------------

    pub async fn save_malformed_event(
        &self,
        source_id: Uuid,
        event_path: &str,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO malformed_events (source_id, event_path, error, first_seen_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(source_id, event_path) DO UPDATE SET error = excluded.error",
        )
        .bind(source_id.to_string())
        .bind(event_path)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_malformed_events(&self, source_id: Uuid) -> Result<Vec<MalformedEvent>> {
        let rows = sqlx::query_as::<_, MalformedEventRow>(
            "SELECT * FROM malformed_events WHERE source_id = ?",
        )
        .bind(source_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    // --- sync logs ---------------------------------------------------

    pub async fn create_sync_log(&self, log: &SyncLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_logs
                (id, source_id, status, message, details, duration_ms,
                 created_count, updated_count, deleted_count, skipped_count,
                 processed_count, calendars_synced, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(log.id.to_string())
        .bind(log.source_id.to_string())
        .bind(status_to_str(log.status))
        .bind(&log.message)
        .bind(&log.details)
        .bind(log.duration_ms)
        .bind(log.counters.created)
        .bind(log.counters.updated)
        .bind(log.counters.deleted)
        .bind(log.counters.skipped)
        .bind(log.counters.processed)
        .bind(log.counters.calendars_synced)
        .bind(log.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_logs(&self, source_id: Uuid, limit: i64) -> Result<Vec<SyncLog>> {
        let rows = sqlx::query_as::<_, SyncLogRow>(
            "SELECT * FROM sync_logs WHERE source_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(source_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn clean_old_sync_logs(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sync_logs WHERE created_at < ?")
            .bind(before.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[cfg(test)]
    pub async fn insert_test_source(&self, source: &Source) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO users (id, created_at) VALUES (?, ?)",
        )
        .bind(source.owner_user_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO sources
                (id, owner_user_id, display_name, source_url, source_username, source_password,
                 dest_url, dest_username, dest_password, sync_interval_secs, direction,
                 conflict_strategy, selected_calendars, enabled, last_sync_at,
                 last_sync_status, last_sync_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(source.id.to_string())
        .bind(source.owner_user_id.to_string())
        .bind(&source.display_name)
        .bind(&source.source.url)
        .bind(&source.source.username)
        .bind(&source.source.password)
        .bind(&source.destination.url)
        .bind(&source.destination.username)
        .bind(&source.destination.password)
        .bind(source.sync_interval_secs)
        .bind(direction_to_str(source.direction))
        .bind(strategy_to_str(source.conflict_strategy))
        .bind(source.selected_calendars.join(","))
        .bind(source.enabled as i64)
        .bind(source.last_sync_at.map(|t| t.to_rfc3339()))
        .bind(source.last_sync_status.map(status_to_str))
        .bind(&source.last_sync_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub(crate) fn status_to_str(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Success => "success",
        SyncStatus::Partial => "partial",
        SyncStatus::Error => "error",
    }
}

pub(crate) fn direction_to_str(direction: SyncDirection) -> &'static str {
    match direction {
        SyncDirection::OneWay => "one_way",
        SyncDirection::TwoWay => "two_way",
    }
}

pub(crate) fn strategy_to_str(strategy: ConflictStrategy) -> &'static str {
    match strategy {
        ConflictStrategy::SourceWins => "source_wins",
        ConflictStrategy::DestWins => "dest_wins",
        ConflictStrategy::LatestWins => "latest_wins",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_store() -> (EventStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("calbridge.db");
        let store = EventStore::connect(path.to_str().unwrap(), 5).await.unwrap();
        (store, dir)
    }

    fn sample_source(owner: Uuid) -> Source {
        Source {
            id: Uuid::new_v4(),
            owner_user_id: owner,
            display_name: "Test Source".into(),
            source: CaldavEndpoint {
                url: "https://src.example.com/cal/".into(),
                username: "u".into(),
                password: "p".into(),
            },
            destination: CaldavEndpoint {
                url: "https://dest.example.com/cal/".into(),
                username: "u".into(),
                password: "p".into(),
            },
            sync_interval_secs: 300,
            direction: SyncDirection::OneWay,
            conflict_strategy: ConflictStrategy::SourceWins,
            selected_calendars: vec![],
            enabled: true,
            last_sync_at: None,
            last_sync_status: None,
            last_sync_message: None,
        }
    }

    #[tokio::test]
    async fn round_trips_sync_state() {
        let (store, _dir) = test_store().await;
        let owner = Uuid::new_v4();
        let source = sample_source(owner);
        store.insert_test_source(&source).await.unwrap();

        assert!(store
            .get_sync_state(source.id, "/cal/")
            .await
            .unwrap()
            .is_none());

        store
            .upsert_sync_state(source.id, "/cal/", Some("token-1"), Some("ctag-1"))
            .await
            .unwrap();

        let state = store.get_sync_state(source.id, "/cal/").await.unwrap().unwrap();
        assert_eq!(state.sync_token.as_deref(), Some("token-1"));
        assert_eq!(state.ctag.as_deref(), Some("ctag-1"));

        store
            .upsert_sync_state(source.id, "/cal/", Some("token-2"), None)
            .await
            .unwrap();
        let state = store.get_sync_state(source.id, "/cal/").await.unwrap().unwrap();
        assert_eq!(state.sync_token.as_deref(), Some("token-2"));
        assert_eq!(state.ctag, None);
    }

    #[tokio::test]
    async fn synced_events_round_trip_and_delete() {
        let (store, _dir) = test_store().await;
        let owner = Uuid::new_v4();
        let source = sample_source(owner);
        store.insert_test_source(&source).await.unwrap();

        store
            .upsert_synced_event(source.id, "/cal/", "A@x", Some("/cal/a.ics"), Some("se1"), Some("de1"))
            .await
            .unwrap();
        store
            .upsert_synced_event(source.id, "/cal/", "B@x", Some("/cal/b.ics"), Some("se2"), Some("de2"))
            .await
            .unwrap();

        let events = store.get_synced_events(source.id, "/cal/").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events["A@x"].dest_etag.as_deref(), Some("de1"));

        store
            .delete_synced_event(source.id, "/cal/", "A@x")
            .await
            .unwrap();
        let events = store.get_synced_events(source.id, "/cal/").await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events.contains_key("A@x"));
    }

    #[tokio::test]
    async fn get_source_by_id_for_user_enforces_ownership() {
        let (store, _dir) = test_store().await;
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let source = sample_source(owner);
        store.insert_test_source(&source).await.unwrap();

        assert!(store.get_source_by_id_for_user(source.id, owner).await.is_ok());
        assert!(matches!(
            store.get_source_by_id_for_user(source.id, other).await,
            Err(CalBridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn source_deletion_cascades_dependent_rows() {
        let (store, _dir) = test_store().await;
        let owner = Uuid::new_v4();
        let source = sample_source(owner);
        store.insert_test_source(&source).await.unwrap();
        store
            .upsert_synced_event(source.id, "/cal/", "A@x", Some("/cal/a.ics"), Some("a"), Some("b"))
            .await
            .unwrap();

        sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source.id.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let events = store.get_synced_events(source.id, "/cal/").await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn clean_old_sync_logs_prunes_by_age() {
        let (store, _dir) = test_store().await;
        let owner = Uuid::new_v4();
        let source = sample_source(owner);
        store.insert_test_source(&source).await.unwrap();

        let old_log = SyncLog {
            id: Uuid::new_v4(),
            source_id: source.id,
            status: SyncStatus::Success,
            message: "ok".into(),
            details: None,
            duration_ms: 10,
            counters: SyncCounters::default(),
            created_at: Utc::now() - chrono::Duration::days(120),
        };
        let recent_log = SyncLog {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            ..old_log.clone()
        };
        store.create_sync_log(&old_log).await.unwrap();
        store.create_sync_log(&recent_log).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(90);
        let pruned = store.clean_old_sync_logs(cutoff).await.unwrap();
        assert_eq!(pruned, 1);

        let remaining = store.get_logs(source.id, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, recent_log.id);
    }
}
