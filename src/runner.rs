// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::activity::ActivityTracker;
use crate::caldav::GuardedClient;
use crate::config::Config;
use crate::models::{Source, SyncCounters, SyncLog, SyncStatus};
use crate::reconciler;
use crate::store::EventStore;

/// Executes one full sync for one source: discovers its calendars,
/// reconciles each, and rolls the result into a single append-only log row.
/// Exactly one `SyncLog` row is produced per invocation regardless of
/// outcome.
pub async fn run_source(
    config: &Config,
    store: &EventStore,
    activity: &Arc<ActivityTracker>,
    source: &Source,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let calendars_hint = if source.selected_calendars.is_empty() {
        0
    } else {
        source.selected_calendars.len()
    };
    activity
        .start_sync(source.id, source.display_name.clone(), calendars_hint)
        .await;

    let outcome = run_source_inner(config, store, activity, source, &cancel).await;

    let duration_ms = started.elapsed().as_millis() as i64;
    let (status, message, counters, details) = match outcome {
        Ok((counters, errors)) if errors.is_empty() => (
            SyncStatus::Success,
            format!(
                "synced {} calendar(s): {} created, {} updated, {} deleted",
                counters.calendars_synced, counters.created, counters.updated, counters.deleted
            ),
            counters,
            None,
        ),
        Ok((counters, errors)) if counters.calendars_synced > 0 => (
            SyncStatus::Partial,
            format!(
                "{} of the requested calendars had errors",
                errors.len()
            ),
            counters,
            Some(errors.join("\n")),
        ),
        Ok((counters, errors)) => (
            SyncStatus::Error,
            "no calendar synced successfully".to_string(),
            counters,
            Some(errors.join("\n")),
        ),
        Err(e) => (
            SyncStatus::Error,
            user_facing_message(&e),
            SyncCounters::default(),
            None,
        ),
    };

    let log = SyncLog {
        id: Uuid::new_v4(),
        source_id: source.id,
        status,
        message: message.clone(),
        details,
        duration_ms,
        counters,
        created_at: chrono::Utc::now(),
    };

    if let Err(e) = store.create_sync_log(&log).await {
        error!(error = %e, source_id = %source.id, "failed to persist sync log");
    }
    if let Err(e) = store
        .update_source_sync_status(source.id, status, &message, chrono::Utc::now())
        .await
    {
        error!(error = %e, source_id = %source.id, "failed to update source sync status");
    }

    activity.finish_sync(source.id, log).await;
    info!(source_id = %source.id, status = ?status, "sync finished");
}

type RunResult = Result<(SyncCounters, Vec<String>), crate::error::CalBridgeError>;

async fn run_source_inner(
    config: &Config,
    store: &EventStore,
    activity: &Arc<ActivityTracker>,
    source: &Source,
    cancel: &CancellationToken,
) -> RunResult {
    let https_only = config.is_production();
    let source_client = GuardedClient::new(
        &source.source,
        https_only,
        config.allow_private_networks,
    )
    .await?;
    let dest_client = GuardedClient::new(
        &source.destination,
        https_only,
        config.allow_private_networks,
    )
    .await?;

    let calendars = discover_target_calendars(&source_client, source).await?;

    let mut total = SyncCounters::default();
    let mut errors = Vec::new();

    for calendar_href in calendars {
        if cancel.is_cancelled() {
            errors.push("canceled".to_string());
            break;
        }
        activity.update_calendar(source.id, &calendar_href).await;

        match reconciler::reconcile_calendar(
            store,
            &source_client,
            &dest_client,
            source.id,
            &calendar_href,
            source.direction,
            source.conflict_strategy,
            cancel,
        )
        .await
        {
            Ok(result) => {
                total.merge(result.counters);
                errors.extend(result.errors);
                activity.increment_progress(source.id).await;
            }
            Err(e) => {
                error!(error = %e, calendar_href, "calendar reconciliation aborted");
                errors.push(format!("{calendar_href}: {e}"));
            }
        }
    }

    Ok((total, errors))
}

async fn discover_target_calendars(
    client: &GuardedClient,
    source: &Source,
) -> Result<Vec<String>, crate::error::CalBridgeError> {
    if !source.selected_calendars.is_empty() {
        return Ok(source.selected_calendars.clone());
    }

    let principal = client.discover_current_user_principal().await?;
    let home_sets = match principal {
        Some(p) => client.discover_calendar_home_set(&p).await?,
        None => vec![String::new()],
    };

    let mut calendars = Vec::new();
    for home in home_sets {
        let found = client.list_calendars(&home).await?;
        calendars.extend(found.into_iter().map(|c| c.href));
    }
    Ok(calendars)
}

fn user_facing_message(e: &crate::error::CalBridgeError) -> String {
    use crate::error::CalBridgeError::*;
    match e {
        Auth(_) => "authentication failed".to_string(),
        Canceled => "sync canceled".to_string(),
        Network(_) => "network error contacting CalDAV server".to_string(),
        Protocol(_) => "unexpected CalDAV server response".to_string(),
        Config(msg) => format!("configuration error: {msg}"),
        other => other.to_string(),
    }
}
