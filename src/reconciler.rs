// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::caldav::{self, GuardedClient, PutMode};
use crate::error::CalBridgeError;
use crate::models::{ConflictStrategy, SyncCounters, SyncDirection, SyncedEvent};
use crate::slug;
use crate::store::EventStore;

pub struct ReconcileOutcome {
    pub counters: SyncCounters,
    /// Non-fatal per-event problems; contribute to the SyncLog's `details`
    /// without failing the pass.
    pub errors: Vec<String>,
}

/// One execution of enumerate → propagate S→D → propagate D→S → commit for
/// a single (source, calendar) pair. Pure protocol + diff logic; no timers,
/// no cross-source coordination.
pub async fn reconcile_calendar(
    store: &EventStore,
    source_client: &GuardedClient,
    dest_client: &GuardedClient,
    source_id: Uuid,
    calendar_href: &str,
    direction: SyncDirection,
    conflict_strategy: ConflictStrategy,
    cancel: &CancellationToken,
) -> Result<ReconcileOutcome, CalBridgeError> {
    if cancel.is_cancelled() {
        return Err(CalBridgeError::Canceled);
    }

    let mut counters = SyncCounters::default();
    let mut errors = Vec::new();

    let prior_state = store.get_sync_state(source_id, calendar_href).await?;
    let known = store.get_synced_events(source_id, calendar_href).await?;

    let enumeration = enumerate_source_changes(
        source_client,
        calendar_href,
        prior_state.as_ref().and_then(|s| s.sync_token.as_deref()),
        &known,
    )
    .await?;

    let mut had_propagation_error = false;

    for addition in &enumeration.additions {
        if cancel.is_cancelled() {
            return Err(CalBridgeError::Canceled);
        }
        counters.processed += 1;
        match propagate_addition(
            store,
            dest_client,
            source_id,
            calendar_href,
            addition,
            direction,
            conflict_strategy,
            &known,
        )
        .await
        {
            Ok(PropagateResult::Created) => counters.created += 1,
            Ok(PropagateResult::Updated) => counters.updated += 1,
            Ok(PropagateResult::Skipped) => counters.skipped += 1,
            Err(e) if e.is_not_found() => counters.skipped += 1,
            Err(e) => {
                warn!(error = %e, href = %addition.href, "failed to propagate event");
                errors.push(format!("{}: {e}", addition.href));
                counters.skipped += 1;
                had_propagation_error = true;
            }
        }
    }

    for deletion_uid in &enumeration.deletions {
        if cancel.is_cancelled() {
            return Err(CalBridgeError::Canceled);
        }
        let Some(existing) = known.get(deletion_uid) else {
            continue;
        };
        match propagate_deletion(
            store,
            dest_client,
            source_id,
            calendar_href,
            deletion_uid,
            existing,
            direction,
            conflict_strategy,
        )
        .await
        {
            Ok(true) => counters.deleted += 1,
            Ok(false) => counters.skipped += 1,
            Err(e) => {
                warn!(error = %e, uid = %deletion_uid, "failed to propagate deletion");
                errors.push(format!("{deletion_uid}: {e}"));
                had_propagation_error = true;
            }
        }
    }

    if direction == SyncDirection::TwoWay {
        match propagate_destination_to_source(
            store,
            source_client,
            dest_client,
            source_id,
            calendar_href,
            conflict_strategy,
        )
        .await
        {
            Ok(d2s) => counters.merge(d2s),
            Err(e) => {
                warn!(error = %e, "destination-to-source phase failed");
                errors.push(format!("phase3: {e}"));
                had_propagation_error = true;
            }
        }
    }

    counters.calendars_synced = 1;

    // Only advance the cursor if nothing failed; otherwise the next pass
    // must retry from the old token.
    if !had_propagation_error {
        store
            .upsert_sync_state(
                source_id,
                calendar_href,
                enumeration.new_sync_token.as_deref(),
                enumeration.new_ctag.as_deref(),
            )
            .await?;
    }

    Ok(ReconcileOutcome { counters, errors })
}

struct SourceAddition {
    href: String,
    etag: Option<String>,
    uid: String,
    ical_body: Option<String>,
}

struct EnumerationResult {
    additions: Vec<SourceAddition>,
    deletions: Vec<String>,
    new_sync_token: Option<String>,
    new_ctag: Option<String>,
}

/// `sync_collection` is the primary path even on the very first pass: per
/// RFC 6578, a request with no prior sync-token is an *initial* sync and
/// returns the full member set plus a fresh token, so this also bootstraps
/// the token the next pass will use for a true incremental diff. Only a
/// server telling us the token itself is bad sends us to full enumeration.
async fn enumerate_source_changes(
    client: &GuardedClient,
    calendar_href: &str,
    sync_token: Option<&str>,
    known: &std::collections::HashMap<String, SyncedEvent>,
) -> Result<EnumerationResult, CalBridgeError> {
    match client.sync_collection(calendar_href, sync_token).await {
        Ok(resp) => Ok(map_incremental_response(resp, known)),
        Err(e) if caldav::is_invalid_sync_token(&e) => {
            debug!(calendar_href, "sync token invalid, falling back to full enumeration");
            full_enumeration(client, calendar_href, known).await
        }
        Err(e) => Err(e),
    }
}

fn map_incremental_response(
    resp: fast_dav_rs::SyncResponse,
    known: &std::collections::HashMap<String, SyncedEvent>,
) -> EnumerationResult {
    let href_to_uid: std::collections::HashMap<&str, &str> = known
        .values()
        .filter_map(|e| e.source_href.as_deref().map(|h| (h, e.event_uid.as_str())))
        .collect();

    let mut additions = Vec::new();
    let mut deletions = Vec::new();

    for item in resp.items {
        if item.is_deleted {
            if let Some(uid) = href_to_uid.get(item.href.as_str()) {
                deletions.push((*uid).to_string());
            }
            continue;
        }

        let Some(body) = item.calendar_data.clone() else {
            continue;
        };
        let uid = match caldav::parse_event(&body) {
            Ok(parsed) => parsed.uid,
            Err(_) => continue,
        };
        additions.push(SourceAddition {
            href: item.href,
            etag: item.etag,
            uid,
            ical_body: Some(body),
        });
    }

    EnumerationResult {
        additions,
        deletions,
        new_sync_token: resp.sync_token,
        new_ctag: None,
    }
}

async fn full_enumeration(
    client: &GuardedClient,
    calendar_href: &str,
    known: &std::collections::HashMap<String, SyncedEvent>,
) -> Result<EnumerationResult, CalBridgeError> {
    let objects = client.full_enumeration(calendar_href).await?;

    let mut additions = Vec::new();
    let mut seen_uids = HashSet::new();

    for object in objects {
        let uid = match object
            .calendar_data
            .as_deref()
            .and_then(|body| caldav::parse_event(body).ok())
        {
            Some(parsed) => parsed.uid,
            None => continue,
        };
        seen_uids.insert(uid.clone());

        let unchanged = known
            .get(&uid)
            .map(|e| e.source_etag == object.etag)
            .unwrap_or(false);
        if unchanged {
            continue;
        }

        additions.push(SourceAddition {
            href: object.href,
            etag: object.etag,
            uid,
            ical_body: object.calendar_data,
        });
    }

    let deletions = known
        .keys()
        .filter(|uid| !seen_uids.contains(*uid))
        .cloned()
        .collect();

    Ok(EnumerationResult {
        additions,
        deletions,
        new_sync_token: None,
        new_ctag: None,
    })
}

enum PropagateResult {
    Created,
    Updated,
    Skipped,
}

#[allow(clippy::too_many_arguments)]
async fn propagate_addition(
    store: &EventStore,
    dest_client: &GuardedClient,
    source_id: Uuid,
    calendar_href: &str,
    addition: &SourceAddition,
    direction: SyncDirection,
    conflict_strategy: ConflictStrategy,
    known: &std::collections::HashMap<String, SyncedEvent>,
) -> Result<PropagateResult, CalBridgeError> {
    let ical_body = match &addition.ical_body {
        Some(b) => b.clone(),
        None => return Ok(PropagateResult::Skipped),
    };

    if caldav::parse_event(&ical_body).is_err() {
        store
            .save_malformed_event(source_id, &addition.href, "failed to parse iCalendar body")
            .await?;
        return Ok(PropagateResult::Skipped);
    }

    let dest_href = slug::destination_href(calendar_href, &addition.uid);
    let existing = known.get(&addition.uid);

    let (result, dest_etag) = match existing {
        None => {
            match dest_client
                .put_event(&dest_href, &ical_body, PutMode::Create)
                .await
            {
                Ok(outcome) => (PropagateResult::Created, outcome.etag),
                Err(CalBridgeError::Precondition(_)) => {
                    // A stale copy from a prior aborted pass; force it.
                    let outcome = dest_client
                        .put_event(&dest_href, &ical_body, PutMode::Unconditional)
                        .await?;
                    (PropagateResult::Created, outcome.etag)
                }
                Err(e) => return Err(e),
            }
        }
        Some(prior) => {
            let dest_etag_ref = prior.dest_etag.as_deref().unwrap_or("");
            match dest_client
                .put_event(&dest_href, &ical_body, PutMode::ConditionalUpdate(dest_etag_ref))
                .await
            {
                Ok(outcome) => (PropagateResult::Updated, outcome.etag),
                Err(CalBridgeError::Precondition(_)) => {
                    resolve_update_conflict(
                        dest_client,
                        &dest_href,
                        &ical_body,
                        direction,
                        conflict_strategy,
                        prior.dest_etag.as_deref(),
                    )
                    .await?
                }
                Err(e) => return Err(e),
            }
        }
    };

    store
        .upsert_synced_event(
            source_id,
            calendar_href,
            &addition.uid,
            Some(&addition.href),
            addition.etag.as_deref(),
            dest_etag.as_deref(),
        )
        .await?;

    Ok(result)
}

#[allow(clippy::too_many_arguments)]
async fn resolve_update_conflict(
    dest_client: &GuardedClient,
    dest_href: &str,
    source_ical_body: &str,
    direction: SyncDirection,
    conflict_strategy: ConflictStrategy,
    existing_dest_etag: Option<&str>,
) -> Result<(PropagateResult, Option<String>), CalBridgeError> {
    match (direction, conflict_strategy) {
        (SyncDirection::OneWay, _) | (_, ConflictStrategy::SourceWins) => {
            let outcome = dest_client
                .put_event(dest_href, source_ical_body, PutMode::Unconditional)
                .await?;
            Ok((PropagateResult::Updated, outcome.etag))
        }
        (SyncDirection::TwoWay, ConflictStrategy::DestWins) => {
            // Keep the destination's edit; its etag is unchanged by this
            // pass, so the tombstone must keep pointing at it rather than
            // being cleared to `None` (which would blank out the next
            // pass's `If-Match` and force a conditional-PUT conflict loop).
            Ok((PropagateResult::Skipped, existing_dest_etag.map(str::to_string)))
        }
        (SyncDirection::TwoWay, ConflictStrategy::LatestWins) => {
            let dest_current = dest_client.fetch_event(dest_href).await?;
            let source_parsed = caldav::parse_event(source_ical_body)
                .map_err(|_| CalBridgeError::Parse("source event unparseable".to_string()))?;
            let dest_parsed = caldav::parse_event(&dest_current.ical_body).ok();

            let source_wins = match dest_parsed.and_then(|p| p.comparison_timestamp()) {
                Some(dest_ts) => source_parsed
                    .comparison_timestamp()
                    .map(|source_ts| source_ts >= dest_ts)
                    .unwrap_or(true),
                None => true,
            };

            if source_wins {
                let outcome = dest_client
                    .put_event(dest_href, source_ical_body, PutMode::Unconditional)
                    .await?;
                Ok((PropagateResult::Updated, outcome.etag))
            } else {
                Ok((PropagateResult::Skipped, dest_current.etag))
            }
        }
    }
}

/// Returns whether the destination object was actually removed. `false`
/// means a two-way conflict strategy kept the destination's edit and the
/// tombstone survives for the next pass to re-evaluate.
async fn propagate_deletion(
    store: &EventStore,
    dest_client: &GuardedClient,
    source_id: Uuid,
    calendar_href: &str,
    uid: &str,
    existing: &SyncedEvent,
    direction: SyncDirection,
    conflict_strategy: ConflictStrategy,
) -> Result<bool, CalBridgeError> {
    let dest_href = slug::destination_href(calendar_href, uid);

    let deleted = match dest_client
        .delete_event(&dest_href, existing.dest_etag.as_deref())
        .await
    {
        Ok(()) => true,
        Err(CalBridgeError::Precondition(_)) if direction == SyncDirection::OneWay => {
            dest_client.delete_event(&dest_href, None).await?;
            true
        }
        Err(CalBridgeError::Precondition(_)) => {
            resolve_deletion_conflict(dest_client, &dest_href, existing, conflict_strategy).await?
        }
        Err(e) => return Err(e),
    };

    if deleted {
        store
            .delete_synced_event(source_id, calendar_href, uid)
            .await?;
    }
    Ok(deleted)
}

/// Two-way delete-vs-edit conflict: the destination changed since the last
/// known etag, so the source's delete can't land as a plain conditional
/// DELETE. Resolved with the same strategy as update conflicts; a deletion
/// carries no timestamp of its own, so `existing.updated_at` (this
/// tombstone's last confirmed-in-sync moment) stands in for the source side
/// of a `latest_wins` comparison.
async fn resolve_deletion_conflict(
    dest_client: &GuardedClient,
    dest_href: &str,
    existing: &SyncedEvent,
    conflict_strategy: ConflictStrategy,
) -> Result<bool, CalBridgeError> {
    match conflict_strategy {
        ConflictStrategy::SourceWins => {
            dest_client.delete_event(dest_href, None).await?;
            Ok(true)
        }
        ConflictStrategy::DestWins => Ok(false),
        ConflictStrategy::LatestWins => {
            let dest_current = dest_client.fetch_event(dest_href).await?;
            let dest_ts = caldav::parse_event(&dest_current.ical_body)
                .ok()
                .and_then(|p| p.comparison_timestamp());
            let source_wins = match dest_ts {
                Some(dest_ts) => existing.updated_at >= dest_ts,
                None => true,
            };
            if source_wins {
                dest_client.delete_event(dest_href, None).await?;
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }
}

/// Phase 3 (two-way only): anything present at destination but unknown to
/// the tombstone set was born at the destination and must flow back to the
/// source; anything known but now missing at destination is a
/// destination-side delete.
async fn propagate_destination_to_source(
    store: &EventStore,
    source_client: &GuardedClient,
    dest_client: &GuardedClient,
    source_id: Uuid,
    calendar_href: &str,
    conflict_strategy: ConflictStrategy,
) -> Result<SyncCounters, CalBridgeError> {
    let mut counters = SyncCounters::default();
    let known = store.get_synced_events(source_id, calendar_href).await?;

    let dest_objects = dest_client.full_enumeration(calendar_href).await?;
    let mut dest_uids = HashSet::new();

    for object in &dest_objects {
        let Some(body) = object.calendar_data.as_deref() else {
            continue;
        };
        let Ok(parsed) = caldav::parse_event(body) else {
            continue;
        };
        dest_uids.insert(parsed.uid.clone());

        if known.contains_key(&parsed.uid) {
            continue;
        }

        let dest_href = object.href.clone();
        let source_href = slug::destination_href(calendar_href, &parsed.uid);
        let outcome = match source_client
            .put_event(&source_href, body, PutMode::Create)
            .await
        {
            Ok(o) => o,
            Err(CalBridgeError::Precondition(_)) => {
                source_client
                    .put_event(&source_href, body, PutMode::Unconditional)
                    .await?
            }
            Err(e) => return Err(e),
        };

        store
            .upsert_synced_event(
                source_id,
                calendar_href,
                &parsed.uid,
                Some(&source_href),
                outcome.etag.as_deref(),
                object.etag.as_deref(),
            )
            .await?;
        counters.created += 1;
    }

    for (uid, existing) in known.iter() {
        if dest_uids.contains(uid) {
            continue;
        }
        if conflict_strategy == ConflictStrategy::DestWins {
            let Some(source_href) = existing.source_href.clone() else {
                continue;
            };
            source_client
                .delete_event(&source_href, existing.source_etag.as_deref())
                .await?;
            store
                .delete_synced_event(source_id, calendar_href, uid)
                .await?;
            counters.deleted += 1;
        }
    }

    Ok(counters)
}
