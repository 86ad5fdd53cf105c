use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, FromRequest, Multipart, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine as _;
use serde_json::{json, Value as Jv};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::auth::{resolve_user_context, UserContext};
use crate::engine;
use crate::error::EngineError;
use crate::logs::LogLevel;
use crate::registry::streams::MAX_CONSECUTIVE_LAGS;
use crate::registry::{HttpMethod, RouteTarget};
use crate::sandbox::marshal::response_from_value;
use crate::sandbox::InvocationKind;
use crate::AppState;

/// Fallback handler: everything that is not the control API or the GraphQL
/// endpoint dispatches through the script route registry.
pub async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let method_raw = request.method().as_str().to_string();
    let path = request.uri().path().to_string();

    let Ok(method) = method_raw.parse::<HttpMethod>() else {
        return plain_error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    };

    let query = parse_query(request.uri().query().unwrap_or(""));
    let auth = resolve_user_context(&state, request.headers()).await;

    // Live streams attach before route dispatch; metadata comes from the
    // query string.
    if method == HttpMethod::Get && state.streams.is_registered(&path) {
        return attach_stream(&state, &path, query);
    }

    let Some(target) = state.routes.resolve(&path, method) else {
        return plain_error(StatusCode::NOT_FOUND, "no route registered for this path");
    };

    match target {
        RouteTarget::Asset { asset_uri, .. } => serve_asset(&state, &asset_uri).await,
        RouteTarget::Handler {
            script_uri,
            handler_name,
        } => {
            invoke_handler(
                &state,
                &script_uri,
                &handler_name,
                &method_raw,
                &path,
                query,
                auth,
                request,
            )
            .await
        }
    }
}

fn parse_query(raw: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn headers_to_json(headers: &HeaderMap) -> Jv {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.to_string(), Jv::String(value.to_string()));
        }
    }
    Jv::Object(map)
}

/// Asset routes stream the stored bytes and never touch a sandbox.
async fn serve_asset(state: &Arc<AppState>, asset_uri: &str) -> Response {
    match state.assets.get_by_uri(asset_uri).await {
        Ok(asset) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, asset.mimetype)],
            asset.content,
        )
            .into_response(),
        Err(e) => {
            warn!(asset = %asset_uri, error = %e, "Asset route points at missing asset");
            plain_error(StatusCode::NOT_FOUND, "asset not found")
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn invoke_handler(
    state: &Arc<AppState>,
    script_uri: &str,
    handler_name: &str,
    method: &str,
    path: &str,
    query: HashMap<String, String>,
    auth: UserContext,
    request: Request,
) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string());
    let headers = headers_to_json(request.headers());

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut form = serde_json::Map::new();
    let mut files = serde_json::Map::new();
    let mut body = String::new();
    let mut body_raw = Jv::Null;

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &()).await;
        match multipart {
            Ok(mut multipart) => {
                while let Ok(Some(field)) = multipart.next_field().await {
                    let name = field.name().unwrap_or_default().to_string();
                    match field.file_name().map(str::to_string) {
                        Some(filename) => {
                            let mimetype = field
                                .content_type()
                                .unwrap_or("application/octet-stream")
                                .to_string();
                            match field.bytes().await {
                                Ok(bytes) => {
                                    files.insert(
                                        name,
                                        json!({
                                            "filename": filename,
                                            "contentType": mimetype,
                                            "contentBase64": base64::engine::general_purpose::STANDARD.encode(&bytes),
                                        }),
                                    );
                                }
                                Err(e) => {
                                    return plain_error(
                                        StatusCode::BAD_REQUEST,
                                        &format!("multipart read failed: {e}"),
                                    )
                                }
                            }
                        }
                        None => {
                            if let Ok(text) = field.text().await {
                                form.insert(name, Jv::String(text));
                            }
                        }
                    }
                }
            }
            Err(e) => {
                return plain_error(StatusCode::BAD_REQUEST, &format!("invalid multipart body: {e}"))
            }
        }
    } else {
        let limit = state.config.http_max_body_bytes;
        let bytes = match to_bytes(request.into_body(), limit).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return plain_error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
            }
        };
        if content_type.starts_with("application/x-www-form-urlencoded") {
            for (k, v) in url::form_urlencoded::parse(&bytes) {
                form.insert(k.into_owned(), Jv::String(v.into_owned()));
            }
        }
        body = String::from_utf8_lossy(&bytes).into_owned();
        if !bytes.is_empty() {
            body_raw = Jv::String(base64::engine::general_purpose::STANDARD.encode(&bytes));
        }
    }

    let payload = json!({
        "request": {
            "method": method,
            "path": path,
            "query": query,
            "form": Jv::Object(form),
            "files": Jv::Object(files),
            "headers": headers,
            "body": body,
            "bodyRaw": body_raw,
            "remoteAddr": remote_addr,
        }
    });

    let outcome = engine::invoke(
        state,
        script_uri,
        handler_name,
        InvocationKind::Http,
        payload,
        auth,
        0,
    )
    .await;

    match outcome {
        Ok(value) => match response_from_value(&value) {
            Ok(response) => {
                let mut builder = Response::builder()
                    .status(response.status)
                    .header(header::CONTENT_TYPE, response.content_type);
                for (name, value) in response.headers {
                    builder = builder.header(name, value);
                }
                builder
                    .body(axum::body::Body::from(response.body))
                    .unwrap_or_else(|e| {
                        error!(error = %e, "Failed to build handler response");
                        plain_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
                    })
            }
            Err(e) => script_error_response(state, script_uri, e).await,
        },
        Err(e) => script_error_response(state, script_uri, e).await,
    }
}

/// Map an engine error onto the documented HTTP status. The raw message is
/// logged server-side and into the script's log, never sent to the client.
async fn script_error_response(state: &Arc<AppState>, script_uri: &str, e: EngineError) -> Response {
    let status = e.status();
    error!(uri = %script_uri, error = %e, "Handler invocation failed");
    let _ = state
        .logs
        .append(script_uri, LogLevel::Error, &e.to_string())
        .await;

    let message = match status {
        StatusCode::GATEWAY_TIMEOUT => "handler timed out",
        StatusCode::FORBIDDEN => "forbidden",
        StatusCode::NOT_FOUND => "not found",
        StatusCode::CONFLICT => "conflict",
        StatusCode::BAD_REQUEST => "invalid request",
        StatusCode::BAD_GATEWAY => "upstream request blocked",
        _ => "internal error",
    };
    plain_error(status, message)
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Attach an SSE client to a registered stream. Frames are JSON payloads; a
/// reader that stays behind the per-connection buffer for too long is closed.
fn attach_stream(state: &Arc<AppState>, path: &str, metadata: HashMap<String, String>) -> Response {
    let (connection_id, mut rx) = match state.streams.connect(path, metadata) {
        Ok(attached) => attached,
        Err(e) => {
            return plain_error(StatusCode::NOT_FOUND, &e.to_string());
        }
    };
    debug!(path, connection = %connection_id, "SSE client attached");

    struct Detach {
        state: Arc<AppState>,
        path: String,
        id: String,
    }
    impl Drop for Detach {
        fn drop(&mut self) {
            self.state.streams.disconnect(&self.path, &self.id);
        }
    }
    let guard = Detach {
        state: state.clone(),
        path: path.to_string(),
        id: connection_id,
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        let mut consecutive_lags = 0u32;
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    consecutive_lags = 0;
                    yield Ok::<Event, Infallible>(Event::default().data(frame));
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    consecutive_lags += 1;
                    warn!(dropped, consecutive_lags, "SSE connection lagging; dropped oldest frames");
                    if consecutive_lags >= MAX_CONSECUTIVE_LAGS {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_decodes_pairs() {
        let q = parse_query("room=a&name=hello%20world");
        assert_eq!(q["room"], "a");
        assert_eq!(q["name"], "hello world");
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn header_map_conversion() {
        let mut headers = HeaderMap::new();
        headers.insert("x-token", "abc".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        let json = headers_to_json(&headers);
        assert_eq!(json["x-token"], "abc");
        assert_eq!(json["content-type"], "text/plain");
    }
}
