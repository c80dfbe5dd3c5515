// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::*;

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_time_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn parse_direction(s: &str) -> SyncDirection {
    match s {
        "two_way" => SyncDirection::TwoWay,
        _ => SyncDirection::OneWay,
    }
}

fn parse_strategy(s: &str) -> ConflictStrategy {
    match s {
        "dest_wins" => ConflictStrategy::DestWins,
        "latest_wins" => ConflictStrategy::LatestWins,
        _ => ConflictStrategy::SourceWins,
    }
}

fn parse_status(s: &str) -> SyncStatus {
    match s {
        "partial" => SyncStatus::Partial,
        "error" => SyncStatus::Error,
        _ => SyncStatus::Success,
    }
}

#[derive(sqlx::FromRow)]
pub struct SourceRow {
    pub id: String,
    pub owner_user_id: String,
    pub display_name: String,
    pub source_url: String,
    pub source_username: String,
    pub source_password: String,
    pub dest_url: String,
    pub dest_username: String,
    pub dest_password: String,
    pub sync_interval_secs: i64,
    pub direction: String,
    pub conflict_strategy: String,
    pub selected_calendars: String,
    pub enabled: i64,
    pub last_sync_at: Option<String>,
    pub last_sync_status: Option<String>,
    pub last_sync_message: Option<String>,
}

impl From<SourceRow> for Source {
    fn from(r: SourceRow) -> Self {
        Source {
            id: parse_uuid(&r.id),
            owner_user_id: parse_uuid(&r.owner_user_id),
            display_name: r.display_name,
            source: CaldavEndpoint {
                url: r.source_url,
                username: r.source_username,
                password: r.source_password,
            },
            destination: CaldavEndpoint {
                url: r.dest_url,
                username: r.dest_username,
                password: r.dest_password,
            },
            sync_interval_secs: r.sync_interval_secs,
            direction: parse_direction(&r.direction),
            conflict_strategy: parse_strategy(&r.conflict_strategy),
            selected_calendars: if r.selected_calendars.is_empty() {
                Vec::new()
            } else {
                r.selected_calendars.split(',').map(String::from).collect()
            },
            enabled: r.enabled != 0,
            last_sync_at: parse_time_opt(r.last_sync_at),
            last_sync_status: r.last_sync_status.as_deref().map(parse_status),
            last_sync_message: r.last_sync_message,
        }
    }
}

#[derive(sqlx::FromRow)]
pub struct SyncStateRow {
    pub source_id: String,
    pub calendar_href: String,
    pub sync_token: Option<String>,
    pub ctag: Option<String>,
    pub updated_at: String,
}

impl From<SyncStateRow> for SyncState {
    fn from(r: SyncStateRow) -> Self {
        SyncState {
            source_id: parse_uuid(&r.source_id),
            calendar_href: r.calendar_href,
            sync_token: r.sync_token,
            ctag: r.ctag,
            updated_at: parse_time(&r.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
pub struct SyncedEventRow {
    pub source_id: String,
    pub calendar_href: String,
    pub event_uid: String,
    pub source_href: Option<String>,
    pub source_etag: Option<String>,
    pub dest_etag: Option<String>,
    pub updated_at: String,
}

impl From<SyncedEventRow> for SyncedEvent {
    fn from(r: SyncedEventRow) -> Self {
        SyncedEvent {
            source_id: parse_uuid(&r.source_id),
            calendar_href: r.calendar_href,
            event_uid: r.event_uid,
            source_href: r.source_href,
            source_etag: r.source_etag,
            dest_etag: r.dest_etag,
            updated_at: parse_time(&r.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
pub struct SyncLogRow {
    pub id: String,
    pub source_id: String,
    pub status: String,
    pub message: String,
    pub details: Option<String>,
    pub duration_ms: i64,
    pub created_count: i64,
    pub updated_count: i64,
    pub deleted_count: i64,
    pub skipped_count: i64,
    pub processed_count: i64,
    pub calendars_synced: i64,
    pub created_at: String,
}

impl From<SyncLogRow> for SyncLog {
    fn from(r: SyncLogRow) -> Self {
        SyncLog {
            id: parse_uuid(&r.id),
            source_id: parse_uuid(&r.source_id),
            status: parse_status(&r.status),
            message: r.message,
            details: r.details,
            duration_ms: r.duration_ms,
            counters: SyncCounters {
                created: r.created_count,
                updated: r.updated_count,
                deleted: r.deleted_count,
                skipped: r.skipped_count,
                processed: r.processed_count,
                calendars_synced: r.calendars_synced,
            },
            created_at: parse_time(&r.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
pub struct MalformedEventRow {
    pub source_id: String,
    pub event_path: String,
    pub error: String,
    pub first_seen_at: String,
}

impl From<MalformedEventRow> for MalformedEvent {
    fn from(r: MalformedEventRow) -> Self {
        MalformedEvent {
            source_id: parse_uuid(&r.source_id),
            event_path: r.event_path,
            error: r.error,
            first_seen_at: parse_time(&r.first_seen_at),
        }
    }
}
