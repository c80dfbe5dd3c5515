// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A CalDAV endpoint: base URL plus Basic auth credentials. The engine always
/// receives `password` already decrypted; credentials-at-rest encryption is a
/// collaborator's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaldavEndpoint {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    OneWay,
    TwoWay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    SourceWins,
    DestWins,
    LatestWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Partial,
    Error,
}

/// A user-configured mirror from one CalDAV server to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub display_name: String,
    pub source: CaldavEndpoint,
    pub destination: CaldavEndpoint,
    pub sync_interval_secs: i64,
    pub direction: SyncDirection,
    pub conflict_strategy: ConflictStrategy,
    /// Empty means "all calendars at the source".
    pub selected_calendars: Vec<String>,
    pub enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<SyncStatus>,
    pub last_sync_message: Option<String>,
}

/// Per-(source, calendar) incremental cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub source_id: Uuid,
    pub calendar_href: String,
    pub sync_token: Option<String>,
    pub ctag: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A tombstone: "we have previously mirrored this UID". Absence on the source
/// side, given presence here, means the source deleted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedEvent {
    pub source_id: Uuid,
    pub calendar_href: String,
    pub event_uid: String,
    pub source_href: Option<String>,
    pub source_etag: Option<String>,
    pub dest_etag: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Per-pass counters accumulated by the Reconciler and rolled up by the
/// Source Runner into a single append-only log row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncCounters {
    pub created: i64,
    pub updated: i64,
    pub deleted: i64,
    pub skipped: i64,
    pub processed: i64,
    pub calendars_synced: i64,
}

impl SyncCounters {
    pub fn merge(&mut self, other: SyncCounters) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.processed += other.processed;
        self.calendars_synced += other.calendars_synced;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: Uuid,
    pub source_id: Uuid,
    pub status: SyncStatus,
    pub message: String,
    pub details: Option<String>,
    pub duration_ms: i64,
    pub counters: SyncCounters,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MalformedEvent {
    pub source_id: Uuid,
    pub event_path: String,
    pub error: String,
    pub first_seen_at: DateTime<Utc>,
}
