use base64::Engine as _;
use rquickjs::{Array, Ctx, IntoJs, Object, Type, Value};
use serde_json::{json, Value as Json};

use crate::error::{EngineError, EngineResult};

/// Convert a JSON document into a JS value inside the given context.
pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &Json) -> rquickjs::Result<Value<'js>> {
    match value {
        Json::Null => Ok(Value::new_null(ctx.clone())),
        Json::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    return Ok(Value::new_int(ctx.clone(), small));
                }
                Ok(Value::new_float(ctx.clone(), i as f64))
            } else {
                Ok(Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        Json::String(s) => s.as_str().into_js(ctx),
        Json::Array(items) => {
            let arr = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                arr.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(arr.into_value())
        }
        Json::Object(map) => {
            let obj = Object::new(ctx.clone())?;
            for (key, item) in map {
                obj.set(key.as_str(), json_to_js(ctx, item)?)?;
            }
            Ok(obj.into_value())
        }
    }
}

/// Convert a JS value into JSON. Functions, symbols and other non-data
/// values become null.
pub fn js_to_json(value: &Value<'_>) -> Json {
    match value.type_of() {
        Type::Bool => value.as_bool().map(Json::Bool).unwrap_or(Json::Null),
        Type::Int => value.as_int().map(|i| json!(i)).unwrap_or(Json::Null),
        Type::Float => value
            .as_float()
            .and_then(|f| serde_json::Number::from_f64(f).map(Json::Number))
            .unwrap_or(Json::Null),
        Type::String => value
            .as_string()
            .and_then(|s| s.to_string().ok())
            .map(Json::String)
            .unwrap_or(Json::Null),
        Type::Array => {
            let Some(arr) = value.as_array() else {
                return Json::Null;
            };
            let items = arr
                .iter::<Value>()
                .map(|item| item.map(|v| js_to_json(&v)).unwrap_or(Json::Null))
                .collect();
            Json::Array(items)
        }
        Type::Object | Type::Exception => {
            let Some(obj) = value.as_object() else {
                return Json::Null;
            };
            let mut map = serde_json::Map::new();
            for prop in obj.props::<String, Value>() {
                if let Ok((key, item)) = prop {
                    map.insert(key, js_to_json(&item));
                }
            }
            Json::Object(map)
        }
        _ => Json::Null,
    }
}

/// A normalized HTTP response produced from a handler's return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
}

const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

/// Normalize whatever a handler returned into an HTTP response.
///
/// Recognized properties: `status` (default 200), `body` / `bodyBase64`
/// (default empty; base64 wins when both are present), `contentType`
/// (default text/plain) and `headers`. A bare string becomes the body; any
/// other shape is serialized as JSON.
pub fn response_from_value(value: &Json) -> EngineResult<ScriptResponse> {
    let mut response = ScriptResponse {
        status: 200,
        body: Vec::new(),
        content_type: DEFAULT_CONTENT_TYPE.to_string(),
        headers: Vec::new(),
    };

    let obj = match value {
        Json::Null => return Ok(response),
        Json::String(s) => {
            response.body = s.clone().into_bytes();
            return Ok(response);
        }
        Json::Object(obj) => obj,
        other => {
            response.body = other.to_string().into_bytes();
            response.content_type = "application/json".to_string();
            return Ok(response);
        }
    };

    if let Some(status) = obj.get("status") {
        let status = status
            .as_u64()
            .and_then(|s| u16::try_from(s).ok())
            .filter(|s| (100..=599).contains(s))
            .ok_or_else(|| EngineError::invalid("status", "must be an HTTP status code"))?;
        response.status = status;
    }

    if let Some(b64) = obj.get("bodyBase64").and_then(|b| b.as_str()) {
        response.body = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| EngineError::invalid("bodyBase64", e.to_string()))?;
        response.content_type = "application/octet-stream".to_string();
    } else if let Some(body) = obj.get("body") {
        response.body = match body {
            Json::String(s) => s.clone().into_bytes(),
            Json::Null => Vec::new(),
            other => other.to_string().into_bytes(),
        };
    }

    if let Some(ct) = obj.get("contentType").and_then(|c| c.as_str()) {
        response.content_type = ct.to_string();
    }

    if let Some(headers) = obj.get("headers").and_then(|h| h.as_object()) {
        for (name, value) in headers {
            let value = match value {
                Json::String(s) => s.clone(),
                other => other.to_string(),
            };
            response.headers.push((name.clone(), value));
        }
    }

    Ok(response)
}
