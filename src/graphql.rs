use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use async_graphql::dynamic::{
    Field, FieldFuture, FieldValue, InputValue, Object, Schema, SchemaBuilder, Subscription,
    SubscriptionField, SubscriptionFieldFuture, TypeRef,
};
use async_graphql::{Name, Variables};
use regex::Regex;
use serde_json::{json, Value as Json};
use std::sync::OnceLock;
use tracing::{debug, error};

use crate::auth::UserContext;
use crate::engine;
use crate::error::{EngineError, EngineResult};
use crate::sandbox::InvocationKind;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Internal,
    External,
}

impl Visibility {
    /// Parse the script-supplied visibility argument; external by default.
    pub fn parse(input: Option<&str>) -> EngineResult<Self> {
        match input {
            None | Some("external") => Ok(Self::External),
            Some("internal") => Ok(Self::Internal),
            Some(other) => Err(EngineError::invalid(
                "visibility",
                format!("expected 'internal' or 'external', got '{other}'"),
            )),
        }
    }
}

/// One GraphQL operation registered from a script.
#[derive(Debug, Clone)]
pub struct GraphQlOperation {
    pub name: String,
    pub kind: OperationKind,
    pub sdl: String,
    pub script_uri: String,
    pub resolver_name: String,
    pub visibility: Visibility,
}

/// Depth marker threaded through executions so `executeGraphQL` recursion
/// through resolvers stays bounded.
#[derive(Debug, Clone, Copy)]
pub struct GraphQlDepth(pub u8);

/// Registry of script-registered operations plus the cached merged schemas.
/// Any registration change invalidates the cache; the next execution rebuilds.
#[derive(Default)]
pub struct GraphQlRegistry {
    ops: RwLock<HashMap<(OperationKind, String), GraphQlOperation>>,
    schemas: RwLock<Option<CachedSchemas>>,
}

#[derive(Clone)]
struct CachedSchemas {
    external: Schema,
    full: Schema,
}

impl GraphQlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, op: GraphQlOperation) -> EngineResult<()> {
        let mut ops = self.ops.write().expect("graphql registry poisoned");
        let key = (op.kind, op.name.clone());
        if let Some(existing) = ops.get(&key) {
            if existing.script_uri != op.script_uri {
                return Err(EngineError::Conflict(format!(
                    "GraphQL field '{}' is already registered by {}",
                    op.name, existing.script_uri
                )));
            }
        }
        ops.insert(key, op);
        Ok(())
    }

    fn operations(&self) -> Vec<GraphQlOperation> {
        let ops = self.ops.read().expect("graphql registry poisoned");
        let mut list: Vec<GraphQlOperation> = ops.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn purge_script(&self, script_uri: &str) {
        let mut ops = self.ops.write().expect("graphql registry poisoned");
        ops.retain(|_, op| op.script_uri != script_uri);
        drop(ops);
        self.invalidate();
    }

    pub fn invalidate(&self) {
        *self.schemas.write().expect("graphql schema cache poisoned") = None;
    }
}

/// Hub stream path mirroring one GraphQL subscription, kept so that
/// `sendSubscriptionMessage` fans out exactly like a stream broadcast.
pub fn subscription_stream_path(name: &str) -> String {
    format!("/graphql/subscription/{name}")
}

/// Register an operation and invalidate the cached schemas. Subscriptions
/// additionally claim their mirror stream path.
pub fn register_operation(state: &Arc<AppState>, op: GraphQlOperation) -> EngineResult<()> {
    debug!(name = %op.name, kind = ?op.kind, uri = %op.script_uri, "Registering GraphQL operation");
    if op.name.is_empty() || op.resolver_name.is_empty() {
        return Err(EngineError::invalid("name", "name and resolver are required"));
    }
    if op.kind == OperationKind::Subscription {
        state
            .streams
            .register(&subscription_stream_path(&op.name), &op.script_uri)?;
    }
    state.graphql.insert(op)?;
    state.graphql.invalidate();
    Ok(())
}

/// Get the merged schema, rebuilding if a registration changed. `internal`
/// selects the full merge (internal + external); the HTTP endpoint serves
/// only the external one.
pub fn schema(state: &Arc<AppState>, internal: bool) -> EngineResult<Schema> {
    {
        let cached = state
            .graphql
            .schemas
            .read()
            .expect("graphql schema cache poisoned");
        if let Some(pair) = cached.as_ref() {
            return Ok(if internal {
                pair.full.clone()
            } else {
                pair.external.clone()
            });
        }
    }

    let external = build_schema(state, false)?;
    let full = build_schema(state, true)?;
    let mut cached = state
        .graphql
        .schemas
        .write()
        .expect("graphql schema cache poisoned");
    *cached = Some(CachedSchemas {
        external: external.clone(),
        full: full.clone(),
    });
    Ok(if internal { full } else { external })
}

/// Execute a query against the merged schema. Used by the HTTP endpoint
/// (`internal = false`) and by `executeGraphQL` from inside scripts
/// (`internal = true`, bypassing HTTP but keeping capability checks in the
/// touched resolvers' own sandboxes).
pub async fn execute(
    state: &Arc<AppState>,
    query: &str,
    variables: Json,
    auth: UserContext,
    depth: u8,
    internal: bool,
) -> EngineResult<String> {
    let schema = schema(state, internal)?;

    let mut request = async_graphql::Request::new(query);
    if !variables.is_null() {
        request = request.variables(Variables::from_json(variables));
    }
    let request = request.data(auth).data(GraphQlDepth(depth));

    let response = schema.execute(request).await;
    serde_json::to_string(&response).map_err(EngineError::internal)
}

// ---- SDL fragment parsing ----

fn type_def_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"type\s+(\w+)\s*\{([^}]+)\}").unwrap())
}

fn field_def_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)\s*:\s*(\[?\w+!?\]?!?)").unwrap())
}

fn scalar_name(base: &str) -> String {
    match base {
        "String" => TypeRef::STRING.to_string(),
        "Int" => TypeRef::INT.to_string(),
        "Float" => TypeRef::FLOAT.to_string(),
        "Boolean" => TypeRef::BOOLEAN.to_string(),
        "ID" => TypeRef::ID.to_string(),
        custom => custom.to_string(),
    }
}

/// Turn an SDL type expression (`String!`, `[Item!]!`, `Thing`) into a
/// dynamic TypeRef.
fn type_ref_for(expr: &str) -> TypeRef {
    let expr = expr.trim();
    if expr.starts_with('[') {
        let inner = expr.trim_matches(|c| c == '[' || c == ']' || c == '!');
        return TypeRef::named_nn_list_nn(scalar_name(inner));
    }
    let non_null = expr.ends_with('!');
    let name = scalar_name(expr.trim_end_matches('!'));
    if non_null {
        TypeRef::named_nn(name)
    } else {
        TypeRef::named(name)
    }
}

/// Return type declared for a root field in an SDL fragment; String when the
/// fragment doesn't declare one.
fn parse_return_type(sdl: &str, field_name: &str) -> TypeRef {
    let pattern = format!(
        r"{}\s*(?:\([^)]*\))?\s*:\s*(\[?\w+!?\]?!?)",
        regex::escape(field_name)
    );
    match Regex::new(&pattern).ok().and_then(|re| {
        re.captures(sdl)
            .map(|captures| captures[1].to_string())
    }) {
        Some(expr) => type_ref_for(&expr),
        None => TypeRef::named(TypeRef::STRING),
    }
}

/// Arguments declared for a root field: `field(a: Int!, b: String): ...`.
fn parse_arguments(sdl: &str, field_name: &str) -> Vec<(String, TypeRef)> {
    let pattern = format!(r"{}\s*\(([^)]*)\)", regex::escape(field_name));
    let Some(args_str) = Regex::new(&pattern)
        .ok()
        .and_then(|re| re.captures(sdl).map(|c| c[1].to_string()))
    else {
        return Vec::new();
    };

    args_str
        .split(',')
        .filter_map(|part| {
            let (name, expr) = part.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), type_ref_for(expr.trim())))
        })
        .collect()
}

/// Custom object types declared inside SDL fragments. Their fields resolve by
/// reading the matching key out of the parent JSON object.
fn parse_object_types(sdl: &str) -> Vec<(String, Object)> {
    let mut types = Vec::new();
    for captures in type_def_re().captures_iter(sdl) {
        let type_name = captures[1].to_string();
        if matches!(type_name.as_str(), "Query" | "Mutation" | "Subscription") {
            continue;
        }
        let mut object = Object::new(&type_name);
        for field in field_def_re().captures_iter(&captures[2]) {
            let field_name = field[1].to_string();
            let type_ref = type_ref_for(&field[2]);
            let key = field_name.clone();
            object = object.field(Field::new(field_name, type_ref, move |ctx| {
                let key = key.clone();
                FieldFuture::new(async move {
                    if let Some(async_graphql::Value::Object(parent)) =
                        ctx.parent_value.as_value()
                    {
                        if let Some(value) = parent.get(&Name::new(&key)) {
                            return Ok(Some(value.clone()));
                        }
                    }
                    Ok(Some(async_graphql::Value::Null))
                })
            }));
        }
        types.push((type_name, object));
    }
    types
}

// ---- schema assembly ----

fn resolver_field(state: &Arc<AppState>, op: &GraphQlOperation) -> Field {
    let weak: Weak<AppState> = Arc::downgrade(state);
    let uri = op.script_uri.clone();
    let resolver = op.resolver_name.clone();
    let arguments = parse_arguments(&op.sdl, &op.name);
    let return_type = parse_return_type(&op.sdl, &op.name);
    let arg_names: Vec<String> = arguments.iter().map(|(n, _)| n.clone()).collect();

    let mut field = Field::new(op.name.clone(), return_type, move |ctx| {
        let weak = weak.clone();
        let uri = uri.clone();
        let resolver = resolver.clone();
        let arg_names = arg_names.clone();
        FieldFuture::new(async move {
            let state = weak
                .upgrade()
                .ok_or_else(|| async_graphql::Error::new("engine is shutting down"))?;

            let auth = ctx
                .data::<UserContext>()
                .ok()
                .cloned()
                .unwrap_or_else(UserContext::anonymous);
            let depth = ctx.data::<GraphQlDepth>().map(|d| d.0).unwrap_or(0);

            let mut args = serde_json::Map::new();
            for name in &arg_names {
                if let Some(accessor) = ctx.args.get(name.as_str()) {
                    if let Ok(value) = accessor.deserialize::<Json>() {
                        args.insert(name.clone(), value);
                    }
                }
            }

            let result = engine::invoke(
                &state,
                &uri,
                &resolver,
                InvocationKind::Graphql,
                json!({ "args": Json::Object(args) }),
                auth,
                depth,
            )
            .await
            .map_err(|e| {
                error!(uri = %uri, resolver = %resolver, error = %e, "GraphQL resolver failed");
                async_graphql::Error::new(e.to_string())
            })?;

            let value = async_graphql::Value::from_json(result)
                .unwrap_or(async_graphql::Value::Null);
            Ok(Some(FieldValue::value(value)))
        })
    });

    for (name, type_ref) in arguments {
        field = field.argument(InputValue::new(name, type_ref));
    }
    field
}

fn subscription_field(state: &Arc<AppState>, op: &GraphQlOperation) -> SubscriptionField {
    let weak: Weak<AppState> = Arc::downgrade(state);
    let name = op.name.clone();
    let return_type = parse_return_type(&op.sdl, &op.name);

    SubscriptionField::new(op.name.clone(), return_type, move |_ctx| {
        let weak = weak.clone();
        let name = name.clone();
        SubscriptionFieldFuture::new(async move {
            let state = weak
                .upgrade()
                .ok_or_else(|| async_graphql::Error::new("engine is shutting down"))?;

            let path = subscription_stream_path(&name);
            let (connection_id, mut rx) = state
                .streams
                .connect(&path, HashMap::new())
                .map_err(|e| async_graphql::Error::new(e.to_string()))?;

            // Dropping the guard (stream consumer went away) detaches the
            // hub connection.
            struct Disconnect {
                state: Arc<AppState>,
                path: String,
                id: String,
            }
            impl Drop for Disconnect {
                fn drop(&mut self) {
                    self.state.streams.disconnect(&self.path, &self.id);
                }
            }
            let guard = Disconnect {
                state: state.clone(),
                path,
                id: connection_id,
            };

            let stream = async_stream::stream! {
                let _guard = guard;
                loop {
                    match rx.recv().await {
                        Ok(frame) => {
                            let value = serde_json::from_str::<Json>(&frame)
                                .ok()
                                .and_then(|j| async_graphql::Value::from_json(j).ok())
                                .unwrap_or(async_graphql::Value::String(frame));
                            yield Ok(value);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(stream)
        })
    })
}

fn build_schema(state: &Arc<AppState>, include_internal: bool) -> EngineResult<Schema> {
    let ops: Vec<GraphQlOperation> = state
        .graphql
        .operations()
        .into_iter()
        .filter(|op| include_internal || op.visibility == Visibility::External)
        .collect();

    let queries: Vec<&GraphQlOperation> =
        ops.iter().filter(|o| o.kind == OperationKind::Query).collect();
    let mutations: Vec<&GraphQlOperation> = ops
        .iter()
        .filter(|o| o.kind == OperationKind::Mutation)
        .collect();
    let subscriptions: Vec<&GraphQlOperation> = ops
        .iter()
        .filter(|o| o.kind == OperationKind::Subscription)
        .collect();

    debug!(
        queries = queries.len(),
        mutations = mutations.len(),
        subscriptions = subscriptions.len(),
        internal = include_internal,
        "Building GraphQL schema"
    );

    let mut builder: SchemaBuilder = Schema::build(
        "Query",
        if mutations.is_empty() { None } else { Some("Mutation") },
        if subscriptions.is_empty() { None } else { Some("Subscription") },
    );

    // Custom types from every fragment, first registration wins.
    let mut registered_types = std::collections::HashSet::new();
    for op in &ops {
        for (type_name, object) in parse_object_types(&op.sdl) {
            if registered_types.insert(type_name) {
                builder = builder.register(object);
            }
        }
    }

    let mut query_root = Object::new("Query");
    for op in &queries {
        query_root = query_root.field(resolver_field(state, op));
    }
    if queries.is_empty() {
        // A schema must carry at least one query field.
        query_root = query_root.field(Field::new(
            "_engine",
            TypeRef::named_nn(TypeRef::STRING),
            |_| {
                FieldFuture::new(async {
                    Ok(Some(async_graphql::Value::String(
                        concat!("aiwebengine ", env!("CARGO_PKG_VERSION")).to_string(),
                    )))
                })
            },
        ));
    }
    builder = builder.register(query_root);

    if !mutations.is_empty() {
        let mut mutation_root = Object::new("Mutation");
        for op in &mutations {
            mutation_root = mutation_root.field(resolver_field(state, op));
        }
        builder = builder.register(mutation_root);
    }

    if !subscriptions.is_empty() {
        let mut subscription_root = Subscription::new("Subscription");
        for op in &subscriptions {
            subscription_root = subscription_root.field(subscription_field(state, op));
        }
        builder = builder.register(subscription_root);
    }

    builder
        .finish()
        .map_err(|e| EngineError::internal(format!("schema build failed: {e}")))
}
