use std::collections::HashMap;
use std::rc::Rc;

use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Exception, Object, Value};
use serde_json::{json, Value as Json};
use tracing::{debug, error, warn};

use super::marshal::js_to_json;
use super::{process_invocation, InvocationKind, WorkerMsg, WorkerShared};
use crate::auth::UserContext;
use crate::capabilities::Capability;
use crate::db::tables;
use crate::error::{EngineError, EngineResult};
use crate::fetch::FetchOptions;
use crate::logs::LogLevel;
use crate::registry::routes::RouteTarget;
use crate::scheduler::jobs;
use crate::{convert, engine, graphql};

/// Depth cap for `executeGraphQL` recursion through resolvers.
const MAX_GRAPHQL_DEPTH: u8 = 8;

/// Translate an engine error into a JS exception.
fn unwrap_js<T>(ctx: &Ctx<'_>, result: EngineResult<T>) -> rquickjs::Result<T> {
    result.map_err(|e| Exception::throw_message(ctx, &e.to_string()))
}

fn to_json_string<T: serde::Serialize>(ctx: &Ctx<'_>, value: &T) -> rquickjs::Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Exception::throw_message(ctx, &EngineError::internal(e).to_string()))
}

/// Accept either a JSON string or a plain JS object for an options-style
/// argument.
fn value_to_json(arg: Option<Value<'_>>) -> EngineResult<Json> {
    match arg {
        None => Ok(Json::Null),
        Some(value) if value.is_undefined() || value.is_null() => Ok(Json::Null),
        Some(value) => match value.as_string() {
            Some(s) => {
                let text = s
                    .to_string()
                    .map_err(|e| EngineError::invalid("options", e.to_string()))?;
                serde_json::from_str(&text)
                    .map_err(|e| EngineError::invalid("options", format!("invalid JSON: {e}")))
            }
            None => Ok(js_to_json(&value)),
        },
    }
}

fn json_to_string_map(value: &Json) -> EngineResult<HashMap<String, String>> {
    let Json::Object(map) = value else {
        return Err(EngineError::invalid("filter", "expected a JSON object"));
    };
    let mut out = HashMap::with_capacity(map.len());
    for (k, v) in map {
        let v = match v {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.insert(k.clone(), v);
    }
    Ok(out)
}

/// Run a future while re-entrantly processing invocations mailed to this
/// sandbox. Used by the host calls that can transitively invoke this same
/// script (`executeGraphQL`, `dispatcher.sendMessage`); everything else uses
/// a plain `block_on`.
pub(crate) fn block_on_processing<'js, F>(
    ctx: &Ctx<'js>,
    shared: &Rc<WorkerShared>,
    fut: F,
) -> F::Output
where
    F: std::future::Future,
{
    enum Step<T> {
        Done(T),
        Msg(Option<WorkerMsg>),
    }

    tokio::pin!(fut);
    loop {
        let step = shared.handle.block_on(async {
            let mut mailbox = shared.mailbox.borrow_mut();
            tokio::select! {
                biased;
                out = &mut fut => Step::Done(out),
                msg = mailbox.recv() => Step::Msg(msg),
            }
        });
        match step {
            Step::Done(out) => return out,
            Step::Msg(Some(WorkerMsg::Invoke(request))) => process_invocation(ctx, shared, request),
            Step::Msg(other) => {
                if matches!(other, Some(WorkerMsg::Shutdown)) {
                    shared.shutdown.set(true);
                }
                return shared.handle.block_on(fut);
            }
        }
    }
}

/// Install the per-invocation `auth` global: the immutable user-context data
/// plus `currentUser()` and `requireAuth()`.
pub(crate) fn set_auth_global(
    ctx: &Ctx<'_>,
    _shared: &Rc<WorkerShared>,
    auth: &UserContext,
) -> rquickjs::Result<()> {
    let data = serde_json::to_string(auth).unwrap_or_else(|_| "{}".into());
    let bootstrap = format!(
        r#"globalThis.auth = Object.assign({{}}, {data});
auth.currentUser = function() {{
    return {{ isAuthenticated: auth.isAuthenticated, isAdmin: auth.isAdmin,
              userId: auth.userId, email: auth.email, name: auth.name,
              provider: auth.provider }};
}};
auth.requireAuth = function() {{
    if (!auth.isAuthenticated) throw new Error("authentication required");
    return auth.currentUser();
}};"#
    );
    ctx.eval::<(), _>(bootstrap.into_bytes())
}

pub(crate) fn install(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>) -> rquickjs::Result<()> {
    install_route_registry(ctx, shared)?;
    install_graphql_registry(ctx, shared)?;
    install_script_storage(ctx, shared)?;
    install_asset_storage(ctx, shared)?;
    install_kv_storage(ctx, shared)?;
    install_database(ctx, shared)?;
    install_dispatcher(ctx, shared)?;
    install_scheduler(ctx, shared)?;
    install_fetch(ctx, shared)?;
    install_convert(ctx)?;
    install_console(ctx, shared)?;
    set_auth_global(ctx, shared, &UserContext::anonymous())
}

// ---- routeRegistry ----

fn install_route_registry(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>) -> rquickjs::Result<()> {
    let obj = Object::new(ctx.clone())?;

    let s = shared.clone();
    obj.set(
        "registerRoute",
        Func::from(move |ctx: Ctx<'_>, path: String, handler: String, method: String| {
            let result = (|| {
                s.caps.require(Capability::RegisterRoute)?;
                let method = method.parse()?;
                s.state.routes.register(
                    &path,
                    method,
                    RouteTarget::Handler {
                        script_uri: s.script_uri.clone(),
                        handler_name: handler,
                    },
                )
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "registerStreamRoute",
        Func::from(move |ctx: Ctx<'_>, path: String| {
            let result = (|| {
                s.caps.require(Capability::RegisterStream)?;
                s.state.streams.register(&path, &s.script_uri)
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "registerAssetRoute",
        Func::from(move |ctx: Ctx<'_>, public_path: String, asset_uri: String| {
            let result = (|| {
                s.caps.require(Capability::RegisterRoute)?;
                let asset = s.block_on(s.state.assets.get_by_uri(&asset_uri))?;
                if asset.script_uri != s.script_uri {
                    s.caps.require_privileged(Capability::ReadAssets)?;
                }
                s.state.routes.register(
                    &public_path,
                    crate::registry::HttpMethod::Get,
                    RouteTarget::Asset {
                        script_uri: s.script_uri.clone(),
                        asset_uri,
                    },
                )
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "sendStreamMessage",
        Func::from(move |ctx: Ctx<'_>, path: String, data: String| {
            let result = (|| {
                s.caps.require(Capability::RegisterStream)?;
                let summary = s.state.streams.send(&path, &data, None)?;
                serde_json::to_string(&summary).map_err(EngineError::internal)
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "sendStreamMessageFiltered",
        Func::from(
            move |ctx: Ctx<'_>, path: String, data: String, filter: Value<'_>| {
                let result = (|| {
                    s.caps.require(Capability::RegisterStream)?;
                    let filter = json_to_string_map(&value_to_json(Some(filter))?)?;
                    let summary = s.state.streams.send(&path, &data, Some(&filter))?;
                    serde_json::to_string(&summary).map_err(EngineError::internal)
                })();
                unwrap_js(&ctx, result)
            },
        ),
    )?;

    let s = shared.clone();
    obj.set(
        "listRoutes",
        Func::from(move |ctx: Ctx<'_>| to_json_string(&ctx, &s.state.routes.list())),
    )?;

    let s = shared.clone();
    obj.set(
        "listStreams",
        Func::from(move |ctx: Ctx<'_>| to_json_string(&ctx, &s.state.streams.list())),
    )?;

    let s = shared.clone();
    obj.set(
        "listAssets",
        Func::from(move |ctx: Ctx<'_>| {
            let result = list_assets(&s);
            let value = unwrap_js(&ctx, result)?;
            to_json_string(&ctx, &value)
        }),
    )?;

    ctx.globals().set("routeRegistry", obj)
}

fn list_assets(s: &Rc<WorkerShared>) -> EngineResult<Vec<crate::db::models::AssetSummary>> {
    s.caps.require(Capability::ReadAssets)?;
    if s.caps.privileged() {
        s.block_on(s.state.assets.list_all())
    } else {
        s.block_on(s.state.assets.list_for_script(&s.script_uri))
    }
}

// ---- graphQLRegistry ----

fn install_graphql_registry(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>) -> rquickjs::Result<()> {
    let obj = Object::new(ctx.clone())?;

    for (method, kind) in [
        ("registerQuery", graphql::OperationKind::Query),
        ("registerMutation", graphql::OperationKind::Mutation),
        ("registerSubscription", graphql::OperationKind::Subscription),
    ] {
        let s = shared.clone();
        obj.set(
            method,
            Func::from(
                move |ctx: Ctx<'_>,
                      name: String,
                      sdl: String,
                      resolver: String,
                      visibility: Opt<String>| {
                    let result = (|| {
                        s.caps.require(Capability::RegisterGraphql)?;
                        let visibility = graphql::Visibility::parse(visibility.0.as_deref())?;
                        if visibility == graphql::Visibility::Internal {
                            s.caps.require_privileged(Capability::RegisterGraphql)?;
                        }
                        graphql::register_operation(
                            &s.state,
                            graphql::GraphQlOperation {
                                name,
                                kind,
                                sdl,
                                script_uri: s.script_uri.clone(),
                                resolver_name: resolver,
                                visibility,
                            },
                        )
                    })();
                    unwrap_js(&ctx, result)
                },
            ),
        )?;
    }

    let s = shared.clone();
    obj.set(
        "sendSubscriptionMessage",
        Func::from(move |ctx: Ctx<'_>, name: String, data: String| {
            let result = (|| {
                s.caps.require(Capability::RegisterGraphql)?;
                let summary = s
                    .state
                    .streams
                    .send(&graphql::subscription_stream_path(&name), &data, None)?;
                serde_json::to_string(&summary).map_err(EngineError::internal)
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "sendSubscriptionMessageFiltered",
        Func::from(
            move |ctx: Ctx<'_>, name: String, data: String, filter: Value<'_>| {
                let result = (|| {
                    s.caps.require(Capability::RegisterGraphql)?;
                    let filter = json_to_string_map(&value_to_json(Some(filter))?)?;
                    let summary = s.state.streams.send(
                        &graphql::subscription_stream_path(&name),
                        &data,
                        Some(&filter),
                    )?;
                    serde_json::to_string(&summary).map_err(EngineError::internal)
                })();
                unwrap_js(&ctx, result)
            },
        ),
    )?;

    let s = shared.clone();
    obj.set(
        "executeGraphQL",
        Func::from(
            move |ctx: Ctx<'_>, query: String, variables: Opt<Value<'_>>| {
                let depth = s.current_depth();
                let result = if depth >= MAX_GRAPHQL_DEPTH {
                    Err(EngineError::invalid(
                        "query",
                        format!("executeGraphQL recursion exceeds depth {MAX_GRAPHQL_DEPTH}"),
                    ))
                } else {
                    value_to_json(variables.0).and_then(|vars| {
                        let auth = s.current_auth();
                        block_on_processing(
                            &ctx,
                            &s,
                            graphql::execute(&s.state, &query, vars, auth, depth + 1, true),
                        )
                    })
                };
                unwrap_js(&ctx, result)
            },
        ),
    )?;

    ctx.globals().set("graphQLRegistry", obj)
}

// ---- scriptStorage ----

fn install_script_storage(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>) -> rquickjs::Result<()> {
    let obj = Object::new(ctx.clone())?;

    let s = shared.clone();
    obj.set(
        "getScript",
        Func::from(move |ctx: Ctx<'_>, uri: String| {
            let result = (|| {
                if uri != s.script_uri {
                    s.caps.require(Capability::ReadScripts)?;
                }
                let row = s.block_on(s.state.scripts.get(&uri))?;
                serde_json::to_string(&json!({
                    "uri": row.uri,
                    "name": row.name,
                    "sourceText": row.source_text,
                    "privileged": row.privileged,
                }))
                .map_err(EngineError::internal)
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "listScripts",
        Func::from(move |ctx: Ctx<'_>| {
            let result = (|| {
                s.caps.require(Capability::ReadScripts)?;
                let rows = s.block_on(s.state.scripts.list())?;
                serde_json::to_string(&rows).map_err(EngineError::internal)
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "upsertScript",
        Func::from(move |ctx: Ctx<'_>, uri: String, source: String| {
            let result = (|| {
                s.caps.require(Capability::WriteScripts)?;
                let auth = s.store_actor();
                block_on_processing(
                    &ctx,
                    &s,
                    engine::upsert_script(&s.state, &uri, &source, None, None, &auth),
                )
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "deleteScript",
        Func::from(move |ctx: Ctx<'_>, uri: String| {
            let result = (|| {
                s.caps.require(Capability::DeleteScripts)?;
                let auth = s.store_actor();
                block_on_processing(&ctx, &s, engine::delete_script(&s.state, &uri, &auth))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    ctx.globals().set("scriptStorage", obj)
}

// ---- assetStorage ----

fn install_asset_storage(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>) -> rquickjs::Result<()> {
    use base64::Engine as _;
    let obj = Object::new(ctx.clone())?;

    let s = shared.clone();
    obj.set(
        "listAssets",
        Func::from(move |ctx: Ctx<'_>| {
            let result = list_assets(&s);
            let value = unwrap_js(&ctx, result)?;
            to_json_string(&ctx, &value)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "fetchAsset",
        Func::from(move |ctx: Ctx<'_>, name: String| {
            let result = (|| {
                s.caps.require(Capability::ReadAssets)?;
                let asset = s.block_on(s.state.assets.get_by_name(&s.script_uri, &name))?;
                Ok(base64::engine::general_purpose::STANDARD.encode(asset.content))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "upsertAsset",
        Func::from(
            move |ctx: Ctx<'_>, name: String, content_b64: String, mimetype: String| {
                let result = (|| {
                    s.caps.require(Capability::WriteAssets)?;
                    let content = base64::engine::general_purpose::STANDARD
                        .decode(&content_b64)
                        .map_err(|e| EngineError::invalid("content", e.to_string()))?;
                    s.block_on(
                        s.state
                            .assets
                            .upsert(&s.script_uri, &name, &mimetype, &content),
                    )
                })();
                unwrap_js(&ctx, result)
            },
        ),
    )?;

    let s = shared.clone();
    obj.set(
        "deleteAsset",
        Func::from(move |ctx: Ctx<'_>, name: String| {
            let result = (|| {
                s.caps.require(Capability::DeleteAssets)?;
                s.block_on(s.state.assets.delete(&s.script_uri, &name))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    ctx.globals().set("assetStorage", obj)
}

// ---- sharedStorage / personalStorage ----

fn install_kv_storage(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>) -> rquickjs::Result<()> {
    let shared_obj = Object::new(ctx.clone())?;

    let s = shared.clone();
    shared_obj.set(
        "getItem",
        Func::from(move |ctx: Ctx<'_>, key: String| {
            let result = (|| {
                s.caps.require(Capability::DbRead)?;
                s.block_on(s.state.storage.shared_get(&s.script_uri, &key))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    shared_obj.set(
        "setItem",
        Func::from(move |ctx: Ctx<'_>, key: String, value: String| {
            let result = (|| {
                s.caps.require(Capability::DbWrite)?;
                s.block_on(s.state.storage.shared_set(&s.script_uri, &key, &value))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    shared_obj.set(
        "removeItem",
        Func::from(move |ctx: Ctx<'_>, key: String| {
            let result = (|| {
                s.caps.require(Capability::DbWrite)?;
                s.block_on(s.state.storage.shared_remove(&s.script_uri, &key))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    shared_obj.set(
        "keys",
        Func::from(move |ctx: Ctx<'_>| {
            let result = (|| {
                s.caps.require(Capability::DbRead)?;
                s.block_on(s.state.storage.shared_keys(&s.script_uri))
            })();
            let keys = unwrap_js(&ctx, result)?;
            to_json_string(&ctx, &keys)
        }),
    )?;

    ctx.globals().set("sharedStorage", shared_obj)?;

    let personal_obj = Object::new(ctx.clone())?;

    fn personal_user(s: &Rc<WorkerShared>) -> EngineResult<String> {
        s.current_auth()
            .user_id
            .ok_or_else(|| EngineError::invalid("user", "personal storage requires an authenticated user"))
    }

    let s = shared.clone();
    personal_obj.set(
        "getItem",
        Func::from(move |ctx: Ctx<'_>, key: String| {
            let result = (|| {
                s.caps.require(Capability::DbRead)?;
                let user = personal_user(&s)?;
                s.block_on(s.state.storage.personal_get(&s.script_uri, &user, &key))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    personal_obj.set(
        "setItem",
        Func::from(move |ctx: Ctx<'_>, key: String, value: String| {
            let result = (|| {
                s.caps.require(Capability::DbWrite)?;
                let user = personal_user(&s)?;
                s.block_on(
                    s.state
                        .storage
                        .personal_set(&s.script_uri, &user, &key, &value),
                )
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    personal_obj.set(
        "removeItem",
        Func::from(move |ctx: Ctx<'_>, key: String| {
            let result = (|| {
                s.caps.require(Capability::DbWrite)?;
                let user = personal_user(&s)?;
                s.block_on(s.state.storage.personal_remove(&s.script_uri, &user, &key))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    personal_obj.set(
        "keys",
        Func::from(move |ctx: Ctx<'_>| {
            let result = (|| {
                s.caps.require(Capability::DbRead)?;
                let user = personal_user(&s)?;
                s.block_on(s.state.storage.personal_keys(&s.script_uri, &user))
            })();
            let keys = unwrap_js(&ctx, result)?;
            to_json_string(&ctx, &keys)
        }),
    )?;

    ctx.globals().set("personalStorage", personal_obj)
}

// ---- database ----

fn install_database(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>) -> rquickjs::Result<()> {
    let obj = Object::new(ctx.clone())?;

    fn run_sql(s: &Rc<WorkerShared>, sql: &str, params: &[Json]) -> EngineResult<String> {
        let is_read = sql.trim_start().to_ascii_lowercase().starts_with("select");
        s.caps.require(if is_read {
            Capability::DbRead
        } else {
            Capability::DbWrite
        })?;
        if !s.caps.privileged() {
            tables::authorize_statement(sql, &tables::table_prefix(&s.script_uri))?;
        }

        let mut stack = s.stack.borrow_mut();
        let state = stack
            .last_mut()
            .ok_or_else(|| EngineError::internal("no active invocation"))?;
        let rows = s
            .handle
            .block_on(state.slot.query(&s.state.db, sql, params))?;
        serde_json::to_string(&rows).map_err(EngineError::internal)
    }

    let s = shared.clone();
    obj.set(
        "query",
        Func::from(move |ctx: Ctx<'_>, sql: String| {
            let result = run_sql(&s, &sql, &[]);
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "queryParams",
        Func::from(move |ctx: Ctx<'_>, sql: String, params: Value<'_>| {
            let result = (|| {
                let params = match value_to_json(Some(params))? {
                    Json::Array(items) => items,
                    Json::Null => Vec::new(),
                    _ => {
                        return Err(EngineError::invalid("params", "expected a JSON array"));
                    }
                };
                run_sql(&s, &sql, &params)
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "beginTransaction",
        Func::from(move |ctx: Ctx<'_>, timeout_ms: Opt<f64>| {
            let result = (|| {
                s.caps.require(Capability::DbWrite)?;
                let timeout = timeout_ms
                    .0
                    .filter(|t| t.is_finite() && *t > 0.0)
                    .map(|t| t as u64)
                    .unwrap_or(s.state.config.db_transaction_default_timeout_ms);
                let mut stack = s.stack.borrow_mut();
                let state = stack
                    .last_mut()
                    .ok_or_else(|| EngineError::internal("no active invocation"))?;
                s.handle.block_on(state.slot.begin(&s.state.db, timeout))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "commitTransaction",
        Func::from(move |ctx: Ctx<'_>| {
            let result = with_slot(&s, |s, slot| s.handle.block_on(slot.commit()));
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "rollbackTransaction",
        Func::from(move |ctx: Ctx<'_>| {
            let result = with_slot(&s, |s, slot| s.handle.block_on(slot.rollback()));
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "createSavepoint",
        Func::from(move |ctx: Ctx<'_>, name: Opt<String>| {
            let result = with_slot(&s, |s, slot| {
                s.handle.block_on(slot.create_savepoint(name.0.clone()))
            });
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "releaseSavepoint",
        Func::from(move |ctx: Ctx<'_>, name: String| {
            let result = with_slot(&s, |s, slot| s.handle.block_on(slot.release_savepoint(&name)));
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "rollbackToSavepoint",
        Func::from(move |ctx: Ctx<'_>, name: String| {
            let result = with_slot(&s, |s, slot| {
                s.handle.block_on(slot.rollback_to_savepoint(&name))
            });
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "createTable",
        Func::from(move |ctx: Ctx<'_>, logical: String, schema: Value<'_>| {
            let result = (|| {
                s.caps.require(Capability::DbAdmin)?;
                let schema = match value_to_json(Some(schema))? {
                    Json::Null => return Err(EngineError::invalid("schema", "required")),
                    other => other.to_string(),
                };
                // Joins an open transaction so the DDL rolls back with it.
                let mut stack = s.stack.borrow_mut();
                let state = stack
                    .last_mut()
                    .ok_or_else(|| EngineError::internal("no active invocation"))?;
                s.handle.block_on(state.slot.create_table(
                    &s.state.db,
                    &s.script_uri,
                    &logical,
                    &schema,
                ))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "dropTable",
        Func::from(move |ctx: Ctx<'_>, logical: String| {
            let result = (|| {
                s.caps.require(Capability::DbAdmin)?;
                let mut stack = s.stack.borrow_mut();
                let state = stack
                    .last_mut()
                    .ok_or_else(|| EngineError::internal("no active invocation"))?;
                s.handle
                    .block_on(state.slot.drop_table(&s.state.db, &s.script_uri, &logical))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "tableName",
        Func::from(move |ctx: Ctx<'_>, logical: String| {
            let result = (|| {
                s.caps.require(Capability::DbRead)?;
                // Physical names derive deterministically from the script
                // URI, so no lookup is needed (and none would see rows
                // pending inside an open transaction).
                Ok(tables::physical_name(&s.script_uri, &logical))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    ctx.globals().set("database", obj)
}

fn with_slot<T>(
    s: &Rc<WorkerShared>,
    f: impl FnOnce(&Rc<WorkerShared>, &mut crate::db::bridge::TransactionSlot) -> EngineResult<T>,
) -> EngineResult<T> {
    s.caps.require(Capability::DbWrite)?;
    let mut stack = s.stack.borrow_mut();
    let state = stack
        .last_mut()
        .ok_or_else(|| EngineError::internal("no active invocation"))?;
    f(s, &mut state.slot)
}

// ---- dispatcher ----

fn install_dispatcher(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>) -> rquickjs::Result<()> {
    let obj = Object::new(ctx.clone())?;

    let s = shared.clone();
    obj.set(
        "registerListener",
        Func::from(move |ctx: Ctx<'_>, message_type: String, handler: String| {
            let result = (|| {
                s.caps.require(Capability::PublishMessage)?;
                s.state
                    .listeners
                    .register(&message_type, &s.script_uri, &handler)
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "sendMessage",
        Func::from(move |ctx: Ctx<'_>, message_type: String, data: Opt<String>| {
            let result = (|| {
                s.caps.require(Capability::PublishMessage)?;
                let listeners = s.state.listeners.listeners_for(&message_type);
                let total = listeners.len();
                let payload = json!({
                    "messageType": message_type,
                    "data": data.0,
                    "sender": s.script_uri,
                });
                let auth = s.current_auth();
                let depth = s.current_depth().saturating_add(1);

                let mut delivered = 0usize;
                for listener in listeners {
                    let outcome = block_on_processing(
                        &ctx,
                        &s,
                        engine::invoke(
                            &s.state,
                            &listener.script_uri,
                            &listener.handler_name,
                            InvocationKind::Message,
                            payload.clone(),
                            auth.clone(),
                            depth,
                        ),
                    );
                    match outcome {
                        Ok(_) => delivered += 1,
                        Err(e) => {
                            warn!(
                                message_type = %message_type,
                                listener = %listener.script_uri,
                                error = %e,
                                "Message listener failed"
                            );
                            let _ = s.block_on(s.state.logs.append(
                                &listener.script_uri,
                                LogLevel::Error,
                                &format!(
                                    "listener {} failed for '{}': {e}",
                                    listener.handler_name, message_type
                                ),
                            ));
                        }
                    }
                }
                Ok(format!("delivered {delivered}/{total} listeners"))
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    ctx.globals().set("dispatcher", obj)
}

// ---- schedulerService ----

fn install_scheduler(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>) -> rquickjs::Result<()> {
    let obj = Object::new(ctx.clone())?;

    let s = shared.clone();
    obj.set(
        "registerOnce",
        Func::from(move |ctx: Ctx<'_>, options: Value<'_>| {
            let result = (|| {
                s.caps.require(Capability::RegisterSchedule)?;
                let options = value_to_json(Some(options))?;
                let handler = options
                    .get("handler")
                    .and_then(|h| h.as_str())
                    .ok_or_else(|| EngineError::invalid("handler", "required"))?;
                let run_at = options
                    .get("runAt")
                    .and_then(|r| r.as_str())
                    .ok_or_else(|| EngineError::ScheduleBadTime("runAt is required".into()))?;
                let run_at = jobs::parse_utc(run_at)?;
                let name = options
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(str::to_string);
                s.state
                    .scheduler
                    .register_once(&s.script_uri, handler, run_at, name)
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "registerRecurring",
        Func::from(move |ctx: Ctx<'_>, options: Value<'_>| {
            let result = (|| {
                s.caps.require(Capability::RegisterSchedule)?;
                let options = value_to_json(Some(options))?;
                let handler = options
                    .get("handler")
                    .and_then(|h| h.as_str())
                    .ok_or_else(|| EngineError::invalid("handler", "required"))?;
                let minutes = options
                    .get("intervalMinutes")
                    .and_then(|m| m.as_f64())
                    .ok_or_else(|| {
                        EngineError::ScheduleBadTime("intervalMinutes is required".into())
                    })?;
                let interval = jobs::interval_from_minutes(minutes)?;
                let start_at = options
                    .get("startAt")
                    .and_then(|r| r.as_str())
                    .map(jobs::parse_utc)
                    .transpose()?;
                let name = options
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(str::to_string);
                s.state.scheduler.register_recurring(
                    &s.script_uri,
                    handler,
                    interval,
                    start_at,
                    name,
                )
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "clearAll",
        Func::from(move |ctx: Ctx<'_>| {
            let result = (|| {
                s.caps.require(Capability::RegisterSchedule)?;
                s.state.scheduler.clear_script(&s.script_uri);
                Ok(())
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    ctx.globals().set("schedulerService", obj)
}

// ---- fetch ----

fn install_fetch(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>) -> rquickjs::Result<()> {
    let s = shared.clone();
    ctx.globals().set(
        "fetch",
        Func::from(move |ctx: Ctx<'_>, url: String, options: Opt<Value<'_>>| {
            let result = (|| {
                s.caps.require(Capability::NetFetch)?;
                let options: FetchOptions = match value_to_json(options.0)? {
                    Json::Null => FetchOptions::default(),
                    other => serde_json::from_value(other)
                        .map_err(|e| EngineError::invalid("options", e.to_string()))?,
                };
                s.block_on(s.state.fetch.fetch(&url, options))
            })();
            unwrap_js(&ctx, result)
        }),
    )
}

// ---- convert ----

fn install_convert(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let obj = Object::new(ctx.clone())?;

    obj.set(
        "markdown_to_html",
        Func::from(|markdown: String| convert::markdown_to_html(&markdown)),
    )?;

    obj.set(
        "render_handlebars_template",
        Func::from(move |ctx: Ctx<'_>, template: String, data: String| {
            unwrap_js(&ctx, convert::render_handlebars_template(&template, &data))
        }),
    )?;

    ctx.globals().set("convert", obj)
}

// ---- console ----

fn install_console(ctx: &Ctx<'_>, shared: &Rc<WorkerShared>) -> rquickjs::Result<()> {
    let obj = Object::new(ctx.clone())?;

    for (method, level) in [
        ("debug", LogLevel::Debug),
        ("info", LogLevel::Info),
        ("log", LogLevel::Log),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
    ] {
        let s = shared.clone();
        obj.set(
            method,
            Func::from(move |ctx: Ctx<'_>, message: Value<'_>| {
                let text = match js_to_json(&message) {
                    Json::String(text) => text,
                    other => other.to_string(),
                };
                match level {
                    LogLevel::Error | LogLevel::Fatal => {
                        error!(uri = %s.script_uri, "{text}")
                    }
                    LogLevel::Warn => warn!(uri = %s.script_uri, "{text}"),
                    _ => debug!(uri = %s.script_uri, "{text}"),
                }
                let result = s.block_on(s.state.logs.append(&s.script_uri, level, &text));
                unwrap_js(&ctx, result)
            }),
        )?;
    }

    let s = shared.clone();
    obj.set(
        "listLogs",
        Func::from(move |ctx: Ctx<'_>| {
            let result = (|| {
                s.caps.require(Capability::ReadLogs)?;
                let rows = s.block_on(s.state.logs.list_for_uri(&s.script_uri))?;
                serde_json::to_string(&rows).map_err(EngineError::internal)
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    let s = shared.clone();
    obj.set(
        "listLogsForUri",
        Func::from(move |ctx: Ctx<'_>, uri: String| {
            let result = (|| {
                if uri != s.script_uri {
                    s.caps.require_privileged(Capability::ReadLogs)?;
                }
                let rows = s.block_on(s.state.logs.list_for_uri(&uri))?;
                serde_json::to_string(&rows).map_err(EngineError::internal)
            })();
            unwrap_js(&ctx, result)
        }),
    )?;

    ctx.globals().set("console", obj)
}
