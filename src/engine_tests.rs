//! Whole-engine scenarios: script lifecycle, capability enforcement,
//! transactional handlers, stream fan-out, scheduling and messaging, driven
//! through real sandboxes against an in-memory database.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::auth::UserContext;
use crate::config::test_config;
use crate::db::{tables, Database};
use crate::engine;
use crate::error::EngineError;
use crate::registry::{HttpMethod, RouteTarget};
use crate::sandbox::marshal::response_from_value;
use crate::sandbox::InvocationKind;
use crate::AppState;

async fn test_state() -> Arc<AppState> {
    Arc::new(AppState::new(test_config(), Database::test_db().await))
}

/// State with a short CPU budget for the timeout scenarios.
async fn quick_timeout_state() -> Arc<AppState> {
    let mut config = test_config();
    config.sandbox_execution_timeout_ms = 300;
    Arc::new(AppState::new(config, Database::test_db().await))
}

fn admin() -> UserContext {
    UserContext {
        is_authenticated: true,
        is_admin: true,
        user_id: Some("admin".into()),
        email: Some("admin@example.com".into()),
        name: Some("Admin".into()),
        provider: Some("test".into()),
    }
}

fn user(id: &str) -> UserContext {
    UserContext {
        is_authenticated: true,
        is_admin: false,
        user_id: Some(id.into()),
        email: None,
        name: None,
        provider: Some("test".into()),
    }
}

async fn install(state: &Arc<AppState>, uri: &str, source: &str) {
    engine::upsert_script(state, uri, source, None, None, &admin())
        .await
        .expect("script install");
}

async fn install_privileged(state: &Arc<AppState>, uri: &str, source: &str) {
    engine::upsert_script(state, uri, source, None, Some(true), &admin())
        .await
        .expect("privileged script install");
}

async fn call(
    state: &Arc<AppState>,
    uri: &str,
    handler: &str,
    payload: Json,
) -> Result<Json, EngineError> {
    engine::invoke(
        state,
        uri,
        handler,
        InvocationKind::Http,
        payload,
        admin(),
        0,
    )
    .await
}

fn http_payload(path: &str) -> Json {
    json!({ "request": { "method": "GET", "path": path, "query": {}, "headers": {} } })
}

// -----------------------------------------------------------------------
// Script lifecycle (S1)
// -----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn route_registration_and_delete_roundtrip() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/hello",
        r#"
        function init(ctx) {
            routeRegistry.registerRoute("/hello", "h", "GET");
        }
        function h(ctx) {
            return { status: 200, body: "hi" };
        }
        "#,
    )
    .await;

    let target = state.routes.resolve("/hello", HttpMethod::Get).expect("route resolves");
    let RouteTarget::Handler { script_uri, handler_name } = target else {
        panic!("expected handler target");
    };
    assert_eq!(script_uri, "https://example.com/hello");

    let value = call(&state, &script_uri, &handler_name, http_payload("/hello"))
        .await
        .unwrap();
    let response = response_from_value(&value).unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"hi");

    engine::delete_script(&state, &script_uri, &admin()).await.unwrap();
    assert!(state.routes.resolve("/hello", HttpMethod::Get).is_none());
    assert!(state.scripts.try_get(&script_uri).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_receives_request_and_auth_context() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/echo",
        r#"
        function init(ctx) {
            routeRegistry.registerRoute("/echo", "echo", "POST");
        }
        function echo(ctx) {
            return {
                status: 200,
                contentType: "application/json",
                body: JSON.stringify({
                    path: ctx.request.path,
                    kind: ctx.kind,
                    user: ctx.auth.userId,
                    viaGlobal: auth.currentUser().userId,
                })
            };
        }
        "#,
    )
    .await;

    let value = call(
        &state,
        "https://example.com/echo",
        "echo",
        json!({ "request": { "method": "POST", "path": "/echo" } }),
    )
    .await
    .unwrap();
    let response = response_from_value(&value).unwrap();
    let body: Json = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["path"], "/echo");
    assert_eq!(body["kind"], "http");
    assert_eq!(body["user"], "admin");
    assert_eq!(body["viaGlobal"], "admin");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_handler_is_a_script_error() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/s",
        "function init(ctx) {}",
    )
    .await;

    let err = call(&state, "https://example.com/s", "ghost", http_payload("/x"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("handler not found: ghost"));
}

#[tokio::test(flavor = "multi_thread")]
async fn init_failure_short_circuits_invocations() {
    let state = test_state().await;
    // Syntax error: evaluation fails, script stays installed.
    engine::upsert_script(
        &state,
        "https://example.com/broken",
        "function init( { nope",
        None,
        None,
        &admin(),
    )
    .await
    .unwrap();

    let err = call(&state, "https://example.com/broken", "h", Json::Null)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("init failed"));

    // A FATAL entry was recorded for the failed init.
    let logs = state.logs.list_for_uri("https://example.com/broken").await.unwrap();
    assert!(logs.iter().any(|l| l.level == "FATAL"));

    // The store still has the row, so a corrected upsert can fix it.
    assert!(state
        .scripts
        .try_get("https://example.com/broken")
        .await
        .unwrap()
        .is_some());
}

// -----------------------------------------------------------------------
// Capability gate (P3, S3)
// -----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn non_privileged_script_cannot_delete_scripts() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/target",
        "function init(ctx) {}",
    )
    .await;
    install(
        &state,
        "https://example.com/attacker",
        r#"
        function init(ctx) {}
        function attack(ctx) {
            scriptStorage.deleteScript("https://example.com/target");
            return "done";
        }
        "#,
    )
    .await;

    let err = call(&state, "https://example.com/attacker", "attack", Json::Null)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "CapabilityDenied: DeleteScripts");
    assert!(state
        .scripts
        .try_get("https://example.com/target")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn privileged_script_can_delete_scripts() {
    let state = test_state().await;
    install(&state, "https://example.com/target", "function init(ctx) {}").await;
    install_privileged(
        &state,
        "https://example.com/admin-tool",
        r#"
        function init(ctx) {}
        function wipe(ctx) {
            scriptStorage.deleteScript("https://example.com/target");
            return JSON.parse(scriptStorage.listScripts()).length;
        }
        "#,
    )
    .await;

    let value = call(&state, "https://example.com/admin-tool", "wipe", Json::Null)
        .await
        .unwrap();
    // Only the admin tool itself remains.
    assert_eq!(value, json!(1));
    assert!(state
        .scripts
        .try_get("https://example.com/target")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn non_privileged_raw_sql_is_namespaced() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/sql",
        r#"
        function init(ctx) {}
        function peek(ctx) {
            return database.query("SELECT uri FROM scripts");
        }
        "#,
    )
    .await;

    let err = call(&state, "https://example.com/sql", "peek", Json::Null)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("outside this script's namespace"));
}

// -----------------------------------------------------------------------
// Transactions (P4, P5, S4)
// -----------------------------------------------------------------------

const TXN_SCRIPT: &str = r#"
    function init(ctx) {}
    function commitPath(ctx) {
        database.beginTransaction(30000);
        database.createTable("notes", { columns: { id: "INTEGER", label: "TEXT" } });
        var t = database.tableName("notes");
        database.query("INSERT INTO " + t + " (id, label) VALUES (1, 'a')");
        return "ok";
    }
    function rollbackPath(ctx) {
        database.beginTransaction(30000);
        database.createTable("temp", { columns: { id: "INTEGER" } });
        var t = database.tableName("temp");
        database.query("INSERT INTO " + t + " (id) VALUES (1)");
        throw new Error("boom");
    }
    function savepointPath(ctx) {
        database.beginTransaction(30000);
        database.createTable("sp", { columns: { id: "INTEGER" } });
        var t = database.tableName("sp");
        database.query("INSERT INTO " + t + " (id) VALUES (1)");
        database.createSavepoint("mark");
        database.query("INSERT INTO " + t + " (id) VALUES (2)");
        database.rollbackToSavepoint("mark");
        database.commitTransaction();
        return database.query("SELECT id FROM " + t + " ORDER BY id");
    }
"#;

#[tokio::test(flavor = "multi_thread")]
async fn transaction_auto_commits_on_normal_return() {
    let state = test_state().await;
    let uri = "https://example.com/txn";
    install(&state, uri, TXN_SCRIPT).await;

    call(&state, uri, "commitPath", Json::Null).await.unwrap();

    let physical = tables::lookup(&state.db, uri, "notes").await.unwrap().unwrap();
    let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {physical}"))
        .fetch_one(&state.db.pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn transaction_auto_rolls_back_on_throw() {
    let state = test_state().await;
    let uri = "https://example.com/txn2";
    install(&state, uri, TXN_SCRIPT).await;

    let err = call(&state, uri, "rollbackPath", Json::Null).await.unwrap_err();
    assert!(err.to_string().contains("boom"));

    // The CREATE TABLE rolled back with the transaction: no tracking row,
    // no physical table.
    assert!(tables::lookup(&state.db, uri, "temp").await.unwrap().is_none());
    let physical = tables::physical_name(uri, "temp");
    assert!(sqlx::query(&format!("SELECT * FROM {physical}"))
        .fetch_all(&state.db.pool)
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn savepoint_rewind_keeps_earlier_rows_only() {
    let state = test_state().await;
    let uri = "https://example.com/txn3";
    install(&state, uri, TXN_SCRIPT).await;

    let value = call(&state, uri, "savepointPath", Json::Null).await.unwrap();
    let rows: Json = serde_json::from_str(value.as_str().unwrap()).unwrap();
    assert_eq!(rows, json!([{"id": 1}]));
}

// -----------------------------------------------------------------------
// Streams (P7, S2)
// -----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn filtered_stream_fanout_honors_metadata_superset() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/rooms",
        r#"
        function init(ctx) {
            routeRegistry.registerStreamRoute("/s");
        }
        function notify(ctx) {
            return routeRegistry.sendStreamMessageFiltered("/s", "{\"m\":1}", "{\"room\":\"a\"}");
        }
        "#,
    )
    .await;

    let meta_a: HashMap<String, String> = [("room".to_string(), "a".to_string())].into();
    let meta_b: HashMap<String, String> = [("room".to_string(), "b".to_string())].into();
    let (_, mut rx_a) = state.streams.connect("/s", meta_a).unwrap();
    let (_, mut rx_b) = state.streams.connect("/s", meta_b).unwrap();

    let value = call(&state, "https://example.com/rooms", "notify", Json::Null)
        .await
        .unwrap();
    let summary: Json = serde_json::from_str(value.as_str().unwrap()).unwrap();
    assert_eq!(summary["successCount"], 1);
    assert_eq!(summary["failCount"], 0);

    assert_eq!(rx_a.try_recv().unwrap(), r#"{"m":1}"#);
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn sending_to_unregistered_stream_fails() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/nostream",
        r#"
        function init(ctx) {}
        function send(ctx) {
            return routeRegistry.sendStreamMessage("/nope", "x");
        }
        "#,
    )
    .await;

    let err = call(&state, "https://example.com/nostream", "send", Json::Null)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "StreamNotRegistered: /nope");
}

// -----------------------------------------------------------------------
// Timeout (P8)
// -----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn runaway_handler_is_terminated() {
    let state = quick_timeout_state().await;
    install(
        &state,
        "https://example.com/spin",
        r#"
        function init(ctx) {}
        function spin(ctx) {
            while (true) {}
        }
        "#,
    )
    .await;

    let err = call(&state, "https://example.com/spin", "spin", Json::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout), "got: {err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn runaway_init_is_terminated_and_recorded() {
    let state = quick_timeout_state().await;
    engine::upsert_script(
        &state,
        "https://example.com/spin-init",
        "function init(ctx) { while (true) {} }",
        None,
        None,
        &admin(),
    )
    .await
    .unwrap();

    let err = call(&state, "https://example.com/spin-init", "h", Json::Null)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("init failed"));
}

// -----------------------------------------------------------------------
// Scheduler (P9, S6)
// -----------------------------------------------------------------------

const SCHEDULE_SCRIPT: &str = r#"
    function init(ctx) {
        schedulerService.registerRecurring({
            handler: "tick",
            intervalMinutes: 1,
            name: "job1",
            startAt: "2020-01-01T00:00:00Z"
        });
    }
    function tick(ctx) {
        sharedStorage.setItem("lastRun", ctx.meta.schedule.name);
        return null;
    }
"#;

#[tokio::test(flavor = "multi_thread")]
async fn reload_does_not_accumulate_jobs() {
    let state = test_state().await;
    let uri = "https://example.com/cron";
    install(&state, uri, SCHEDULE_SCRIPT).await;
    assert_eq!(state.scheduler.jobs_for_script(uri).len(), 1);

    // Upsert again: jobs cleared before init re-registers, so still one.
    install(&state, uri, SCHEDULE_SCRIPT).await;
    assert_eq!(state.scheduler.jobs_for_script(uri).len(), 1);
    assert_eq!(state.scheduler.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn due_jobs_dispatch_with_schedule_meta() {
    let state = test_state().await;
    let uri = "https://example.com/cron2";
    install(&state, uri, SCHEDULE_SCRIPT).await;

    engine::dispatch_due_jobs(&state).await;
    // The dispatch spawns the invocation; give it a moment to land.
    for _ in 0..50 {
        if state
            .storage
            .shared_get(uri, "lastRun")
            .await
            .unwrap()
            .is_some()
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(
        state.storage.shared_get(uri, "lastRun").await.unwrap().as_deref(),
        Some("job1")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_schedule_times_are_rejected() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/badtime",
        r#"
        function init(ctx) {}
        function register(ctx) {
            schedulerService.registerOnce({ handler: "h", runAt: "2026-08-01T12:00:00+03:00" });
        }
        "#,
    )
    .await;

    let err = call(&state, "https://example.com/badtime", "register", Json::Null)
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("ScheduleBadTime"));
}

// -----------------------------------------------------------------------
// Dispatcher (C9)
// -----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn message_fanout_isolates_listener_failures() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/listener-bad",
        r#"
        function init(ctx) {
            dispatcher.registerListener("ping", "onPing");
        }
        function onPing(ctx) {
            throw new Error("listener exploded");
        }
        "#,
    )
    .await;
    install(
        &state,
        "https://example.com/listener-good",
        r#"
        function init(ctx) {
            dispatcher.registerListener("ping", "onPing");
        }
        function onPing(ctx) {
            sharedStorage.setItem("got", ctx.data);
        }
        "#,
    )
    .await;
    install(
        &state,
        "https://example.com/sender",
        r#"
        function init(ctx) {}
        function send(ctx) {
            return dispatcher.sendMessage("ping", "payload-1");
        }
        "#,
    )
    .await;

    let value = call(&state, "https://example.com/sender", "send", Json::Null)
        .await
        .unwrap();
    assert_eq!(value, json!("delivered 1/2 listeners"));

    assert_eq!(
        state
            .storage
            .shared_get("https://example.com/listener-good", "got")
            .await
            .unwrap()
            .as_deref(),
        Some("payload-1")
    );
}

// -----------------------------------------------------------------------
// GraphQL (C7)
// -----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn execute_graphql_reaches_own_resolver() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/gql",
        r#"
        function init(ctx) {
            graphQLRegistry.registerQuery(
                "greeting",
                "type Query { greeting: String! }",
                "resolveGreeting",
                "external"
            );
        }
        function resolveGreeting(ctx) {
            return "hello from resolver";
        }
        function callSelf(ctx) {
            return graphQLRegistry.executeGraphQL("{ greeting }");
        }
        "#,
    )
    .await;

    // Through the merged schema directly (the HTTP endpoint path).
    let result = crate::graphql::execute(
        &state,
        "{ greeting }",
        Json::Null,
        admin(),
        0,
        false,
    )
    .await
    .unwrap();
    let envelope: Json = serde_json::from_str(&result).unwrap();
    assert_eq!(envelope["data"]["greeting"], "hello from resolver");

    // From inside the same script via executeGraphQL (re-entrant path).
    let value = call(&state, "https://example.com/gql", "callSelf", Json::Null)
        .await
        .unwrap();
    let envelope: Json = serde_json::from_str(value.as_str().unwrap()).unwrap();
    assert_eq!(envelope["data"]["greeting"], "hello from resolver");
}

#[tokio::test(flavor = "multi_thread")]
async fn internal_operations_hidden_from_external_schema() {
    let state = test_state().await;
    install_privileged(
        &state,
        "https://example.com/gql-int",
        r#"
        function init(ctx) {
            graphQLRegistry.registerQuery(
                "secretCount",
                "type Query { secretCount: Int! }",
                "resolveCount",
                "internal"
            );
        }
        function resolveCount(ctx) {
            return 7;
        }
        function callInternal(ctx) {
            return graphQLRegistry.executeGraphQL("{ secretCount }");
        }
        "#,
    )
    .await;

    // External schema rejects the internal field.
    let external = crate::graphql::execute(
        &state,
        "{ secretCount }",
        Json::Null,
        admin(),
        0,
        false,
    )
    .await
    .unwrap();
    let envelope: Json = serde_json::from_str(&external).unwrap();
    assert!(envelope["data"].is_null());

    // executeGraphQL sees the full merge.
    let value = call(&state, "https://example.com/gql-int", "callInternal", Json::Null)
        .await
        .unwrap();
    let envelope: Json = serde_json::from_str(value.as_str().unwrap()).unwrap();
    assert_eq!(envelope["data"]["secretCount"], 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn graphql_field_conflicts_across_scripts_rejected() {
    let state = test_state().await;
    let register = r#"
        function init(ctx) {
            graphQLRegistry.registerQuery("shared", "type Query { shared: String }", "r", "external");
        }
        function r(ctx) { return "x"; }
    "#;
    install(&state, "https://example.com/gql-a", register).await;

    // Second script claiming the same field fails init; the error lands in
    // the init status.
    engine::upsert_script(
        &state,
        "https://example.com/gql-b",
        register,
        None,
        None,
        &admin(),
    )
    .await
    .unwrap();

    let err = call(&state, "https://example.com/gql-b", "r", Json::Null)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("init failed"));
}

// -----------------------------------------------------------------------
// Cascading unload (P2)
// -----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn delete_script_cascades_everywhere() {
    let state = test_state().await;
    let uri = "https://example.com/everything";
    install(
        &state,
        uri,
        r#"
        function init(ctx) {
            routeRegistry.registerRoute("/e", "h", "GET");
            routeRegistry.registerStreamRoute("/e-stream");
            dispatcher.registerListener("e.msg", "h");
            graphQLRegistry.registerQuery("eq", "type Query { eq: String }", "h", "external");
            schedulerService.registerRecurring({ handler: "h", intervalMinutes: 5, name: "e-job" });
        }
        function h(ctx) { return "ok"; }
        function setup(ctx) {
            database.createTable("data", { columns: { id: "INTEGER" } });
            sharedStorage.setItem("k", "v");
            return "ready";
        }
        "#,
    )
    .await;

    call(&state, uri, "setup", Json::Null).await.unwrap();
    let physical = tables::lookup(&state.db, uri, "data").await.unwrap().unwrap();

    engine::delete_script(&state, uri, &admin()).await.unwrap();

    assert!(state.routes.resolve("/e", HttpMethod::Get).is_none());
    assert!(!state.streams.is_registered("/e-stream"));
    assert!(state.listeners.listeners_for("e.msg").is_empty());
    assert!(state.scheduler.jobs_for_script(uri).is_empty());
    assert!(state.storage.shared_keys(uri).await.unwrap().is_empty());
    assert!(tables::lookup(&state.db, uri, "data").await.unwrap().is_none());
    assert!(sqlx::query(&format!("SELECT * FROM {physical}"))
        .fetch_all(&state.db.pool)
        .await
        .is_err());
    let err = call(&state, uri, "h", Json::Null).await.unwrap_err();
    assert!(err.to_string().starts_with("NotFound"));
}

// -----------------------------------------------------------------------
// Route shadowing (P1)
// -----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn route_shadowing_restores_prior_owner() {
    let state = test_state().await;
    let register = |body: &str| {
        format!(
            r#"
            function init(ctx) {{
                routeRegistry.registerRoute("/contested", "h", "GET");
            }}
            function h(ctx) {{ return "{body}"; }}
            "#
        )
    };
    install(&state, "https://example.com/first", &register("first")).await;
    install(&state, "https://example.com/second", &register("second")).await;

    let target = state.routes.resolve("/contested", HttpMethod::Get).unwrap();
    assert_eq!(target.script_uri(), "https://example.com/second");

    engine::delete_script(&state, "https://example.com/second", &admin())
        .await
        .unwrap();
    let target = state.routes.resolve("/contested", HttpMethod::Get).unwrap();
    assert_eq!(target.script_uri(), "https://example.com/first");
}

// -----------------------------------------------------------------------
// Secrets (P6 shape) and auth
// -----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn scripts_see_secret_identifiers_never_values() {
    let state = test_state().await;
    state.secrets.put("k", "abc-secret-value").await.unwrap();
    install(
        &state,
        "https://example.com/secrets",
        r#"
        function init(ctx) {}
        function probe(ctx) {
            return JSON.stringify({
                hasFetch: typeof fetch === "function",
                hasVault: typeof secretVault === "undefined",
            });
        }
        function leakAttempt(ctx) {
            // The token stays inert anywhere outside the outbound HTTP layer.
            return { status: 200, body: "value is {{secret:k}}" };
        }
        "#,
    )
    .await;

    let value = call(&state, "https://example.com/secrets", "leakAttempt", Json::Null)
        .await
        .unwrap();
    let response = response_from_value(&value).unwrap();
    let body = String::from_utf8(response.body).unwrap();
    assert_eq!(body, "value is {{secret:k}}");
    assert!(!body.contains("abc-secret-value"));
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_to_private_targets_is_blocked() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/fetcher",
        r#"
        function init(ctx) {}
        function hit(ctx) {
            return fetch("http://127.0.0.1:9999/internal");
        }
        "#,
    )
    .await;

    let err = call(&state, "https://example.com/fetcher", "hit", Json::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NetworkBlocked(_)), "got: {err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn personal_storage_is_per_user() {
    let state = test_state().await;
    let uri = "https://example.com/prefs";
    install(
        &state,
        uri,
        r#"
        function init(ctx) {}
        function save(ctx) {
            personalStorage.setItem("theme", ctx.request.theme);
            return personalStorage.getItem("theme");
        }
        "#,
    )
    .await;

    let for_user = |theme: &str, who: UserContext| {
        let state = state.clone();
        let payload = json!({ "request": { "theme": theme } });
        async move {
            engine::invoke(&state, uri, "save", InvocationKind::Http, payload, who, 0)
                .await
                .unwrap()
        }
    };

    assert_eq!(for_user("dark", user("alice")).await, json!("dark"));
    assert_eq!(for_user("light", user("bob")).await, json!("light"));

    assert_eq!(
        state.storage.personal_get(uri, "alice", "theme").await.unwrap().as_deref(),
        Some("dark")
    );
    assert_eq!(
        state.storage.personal_get(uri, "bob", "theme").await.unwrap().as_deref(),
        Some("light")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn require_auth_rejects_anonymous_invocations() {
    let state = test_state().await;
    let uri = "https://example.com/guarded";
    install(
        &state,
        uri,
        r#"
        function init(ctx) {}
        function guarded(ctx) {
            auth.requireAuth();
            return "in";
        }
        "#,
    )
    .await;

    let err = engine::invoke(
        &state,
        uri,
        "guarded",
        InvocationKind::Http,
        Json::Null,
        UserContext::anonymous(),
        0,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("authentication required"));

    let ok = engine::invoke(
        &state,
        uri,
        "guarded",
        InvocationKind::Http,
        Json::Null,
        user("alice"),
        0,
    )
    .await
    .unwrap();
    assert_eq!(ok, json!("in"));
}

// -----------------------------------------------------------------------
// Upsert authorization
// -----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn non_owner_cannot_update_script() {
    let state = test_state().await;
    let uri = "https://example.com/owned";
    engine::upsert_script(&state, uri, "function init(ctx) {}", None, None, &user("alice"))
        .await
        .unwrap();

    let err = engine::upsert_script(&state, uri, "function init(ctx) {}", None, None, &user("bob"))
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("CapabilityDenied"));

    // The creator stays an owner and can update.
    engine::upsert_script(&state, uri, "function init(ctx) {}", None, None, &user("alice"))
        .await
        .unwrap();

    // Only admins may set the privileged flag.
    let err = engine::upsert_script(
        &state,
        uri,
        "function init(ctx) {}",
        None,
        Some(true),
        &user("alice"),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().starts_with("CapabilityDenied"));
}

// -----------------------------------------------------------------------
// Convert host API
// -----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn convert_api_renders_markdown_and_templates() {
    let state = test_state().await;
    install(
        &state,
        "https://example.com/render",
        r##"
        function init(ctx) {}
        function page(ctx) {
            var html = convert.markdown_to_html("# Title");
            var greeting = convert.render_handlebars_template(
                "Hello {{who}}!",
                JSON.stringify({ who: "world" })
            );
            return JSON.stringify({ html: html, greeting: greeting });
        }
        "##,
    )
    .await;

    let value = call(&state, "https://example.com/render", "page", Json::Null)
        .await
        .unwrap();
    let body: Json = serde_json::from_str(value.as_str().unwrap()).unwrap();
    assert!(body["html"].as_str().unwrap().contains("<h1>Title</h1>"));
    assert_eq!(body["greeting"], "Hello world!");
}
