use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value as Json};
use tracing::{error, info, warn};

use crate::auth::UserContext;
use crate::db::models::ScriptRow;
use crate::db::tables;
use crate::error::{EngineError, EngineResult};
use crate::logs::LogLevel;
use crate::sandbox::{InvocationKind, SandboxHandle};
use crate::scheduler::jobs::JobKind;
use crate::AppState;

/// Load every persisted script at startup, running each script's `init`.
pub async fn load_all(state: &Arc<AppState>) {
    let scripts = match state.scripts.list().await {
        Ok(list) => list,
        Err(e) => {
            error!(error = %e, "Failed to list scripts at startup");
            return;
        }
    };

    for summary in scripts {
        match state.scripts.get(&summary.uri).await {
            Ok(row) => load_script(state, &row).await,
            Err(e) => error!(uri = %summary.uri, error = %e, "Failed to read script"),
        }
    }
    info!("Scripts loaded");
}

/// Instantiate a fresh sandbox for a script and run its `init`. Init failure
/// leaves the script installed: a FATAL log entry and the in-memory error
/// mark it, and later invocations short-circuit.
pub async fn load_script(state: &Arc<AppState>, row: &ScriptRow) {
    let handle = SandboxHandle::spawn(
        state.clone(),
        &row.uri,
        row.source_text.clone(),
        row.privileged,
    );

    {
        let mut sandboxes = state.sandboxes.write().expect("sandbox table poisoned");
        if let Some(old) = sandboxes.insert(row.uri.clone(), handle.clone()) {
            old.shutdown();
        }
    }

    let outcome = handle
        .invoke(
            "init",
            InvocationKind::Init,
            Json::Null,
            UserContext::anonymous(),
            0,
        )
        .await;

    match outcome {
        Ok(_) => {
            handle.record_init(None);
            info!(uri = %row.uri, "Script initialized");
        }
        Err(e) => {
            let message = e.to_string();
            handle.record_init(Some(message.clone()));
            error!(uri = %row.uri, error = %message, "Script init failed");
            let _ = state
                .logs
                .append(&row.uri, LogLevel::Fatal, &format!("init failed: {message}"))
                .await;
        }
    }
}

/// Tear down a script instance: registry sweep first (so no new events reach
/// it), then the sandbox itself.
pub async fn unload_script(state: &Arc<AppState>, uri: &str) {
    state.routes.purge_script(uri);
    state.streams.purge_script(uri);
    state.listeners.purge_script(uri);
    state.graphql.purge_script(uri);
    state.scheduler.clear_script(uri);

    let handle = {
        let mut sandboxes = state.sandboxes.write().expect("sandbox table poisoned");
        sandboxes.remove(uri)
    };
    if let Some(handle) = handle {
        handle.shutdown();
    }
}

/// Create or update a script and (re)load it. The persisted row commits
/// before init runs; an init failure does not fail the upsert.
pub async fn upsert_script(
    state: &Arc<AppState>,
    uri: &str,
    source: &str,
    name: Option<&str>,
    privileged: Option<bool>,
    actor: &UserContext,
) -> EngineResult<()> {
    if !actor.is_authenticated {
        return Err(EngineError::CapabilityDenied(
            crate::capabilities::Capability::WriteScripts,
        ));
    }

    let existing = state.scripts.try_get(uri).await?;

    if !actor.is_admin {
        if privileged == Some(true) {
            return Err(EngineError::CapabilityDenied(
                crate::capabilities::Capability::WriteScripts,
            ));
        }
        if let Some(existing) = &existing {
            let owner = match &actor.user_id {
                Some(user) => state.scripts.is_owner(&existing.uri, user).await?,
                None => false,
            };
            if !owner {
                return Err(EngineError::CapabilityDenied(
                    crate::capabilities::Capability::WriteScripts,
                ));
            }
        }
    }

    let row = state.scripts.upsert(uri, source, name, privileged).await?;
    if existing.is_none() {
        if let Some(user) = &actor.user_id {
            state.scripts.add_owner(uri, user).await?;
        }
    }

    unload_script(state, uri).await;
    load_script(state, &row).await;
    Ok(())
}

/// Delete a script with full cascading cleanup: registrations, jobs, owned
/// physical tables, storage rows and assets.
pub async fn delete_script(state: &Arc<AppState>, uri: &str, actor: &UserContext) -> EngineResult<()> {
    let row = state.scripts.get(uri).await?;

    let authorized = if row.privileged {
        actor.is_admin
    } else {
        actor.is_admin
            || match &actor.user_id {
                Some(user) => state.scripts.is_owner(uri, user).await?,
                None => false,
            }
    };
    if !authorized {
        return Err(EngineError::CapabilityDenied(
            crate::capabilities::Capability::DeleteScripts,
        ));
    }

    unload_script(state, uri).await;

    let dropped = tables::purge_script(&state.db, uri).await?;
    state.storage.purge_script(uri).await?;
    state.assets.purge_script(uri).await?;
    state.scripts.delete(uri).await?;

    info!(uri, dropped_tables = dropped, "Script deleted");
    Ok(())
}

/// Route an invocation to a script's sandbox.
pub async fn invoke(
    state: &Arc<AppState>,
    uri: &str,
    handler: &str,
    kind: InvocationKind,
    payload: Json,
    auth: UserContext,
    depth: u8,
) -> EngineResult<Json> {
    let handle = {
        let sandboxes = state.sandboxes.read().expect("sandbox table poisoned");
        sandboxes.get(uri).cloned()
    };
    let handle = handle.ok_or_else(|| EngineError::not_found("script", uri))?;

    let status = handle.init_status();
    if kind != InvocationKind::Init {
        if let Some(e) = status.error {
            return Err(EngineError::Script(format!("init failed: {e}")));
        }
    }

    handle.invoke(handler, kind, payload, auth, depth).await
}

/// The scheduler dispatch loop: sleeps until the earliest deadline (or a
/// registration change), then fires everything due.
pub fn spawn_scheduler_loop(state: Arc<AppState>) {
    tokio::spawn(async move {
        let notify = state.scheduler.notified();
        loop {
            let sleep_for = match state.scheduler.next_wakeup() {
                Some(at) => (at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_millis(0)),
                None => Duration::from_secs(60),
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = notify.notified() => continue, // deadline moved; recompute
            }
            dispatch_due_jobs(&state).await;
        }
    });
}

/// Fire every due job. Scheduled handlers run under the owning script's
/// first owner with admin scope; failures are logged, never propagated.
pub async fn dispatch_due_jobs(state: &Arc<AppState>) {
    let due = state.scheduler.collect_due(Utc::now());
    for fired in due {
        let job = fired.job;
        if fired.skipped > 0 {
            warn!(
                uri = %job.script_uri,
                name = %job.name,
                skipped = fired.skipped,
                "Coalesced missed schedule fires"
            );
            let _ = state
                .logs
                .append(
                    &job.script_uri,
                    LogLevel::Warn,
                    &format!("schedule '{}' skipped {} missed fires", job.name, fired.skipped),
                )
                .await;
        }

        let owner = state
            .scripts
            .list_owners(&job.script_uri)
            .await
            .ok()
            .and_then(|owners| owners.into_iter().next());
        let auth = UserContext::script_owner(owner);

        let interval_seconds = job.interval.map(|i| i.num_seconds()).unwrap_or(0);
        let payload = json!({
            "meta": {
                "schedule": {
                    "jobId": job.job_id,
                    "name": job.name,
                    "type": match job.kind { JobKind::Once => "once", JobKind::Recurring => "recurring" },
                    "scheduledFor": fired.scheduled_for.to_rfc3339(),
                    "intervalSeconds": interval_seconds,
                }
            }
        });

        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = invoke(
                &state,
                &job.script_uri,
                &job.handler_name,
                InvocationKind::Scheduled,
                payload,
                auth,
                0,
            )
            .await
            {
                error!(uri = %job.script_uri, name = %job.name, error = %e, "Scheduled job failed");
                let _ = state
                    .logs
                    .append(
                        &job.script_uri,
                        LogLevel::Error,
                        &format!("scheduled job '{}' failed: {e}", job.name),
                    )
                    .await;
            }
        });
    }
}
