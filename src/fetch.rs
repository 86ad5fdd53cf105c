use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::{Host, Url};

use crate::config::AppConfig;
use crate::error::{EngineError, EngineResult};
use crate::secrets::SecretVault;

/// Options a script may pass to `fetch(url, optionsJson)`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

/// Reject URLs that could reach engine-internal or private infrastructure:
/// non-http(s) schemes, loopback and RFC1918 targets, `localhost` and
/// `.local` hostnames.
pub fn validate_url(raw: &str) -> EngineResult<Url> {
    let url = Url::parse(raw)
        .map_err(|e| EngineError::invalid("url", format!("'{raw}': {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(EngineError::NetworkBlocked(format!(
                "scheme '{other}' is not allowed"
            )))
        }
    }

    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") || domain.ends_with(".local")
            {
                return Err(EngineError::NetworkBlocked(format!(
                    "host '{domain}' is not allowed"
                )));
            }
        }
        Some(Host::Ipv4(ip)) => {
            if ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified() {
                return Err(EngineError::NetworkBlocked(format!(
                    "address '{ip}' is not allowed"
                )));
            }
        }
        Some(Host::Ipv6(ip)) => {
            if ip.is_loopback() || ip.is_unspecified() {
                return Err(EngineError::NetworkBlocked(format!(
                    "address '{ip}' is not allowed"
                )));
            }
            // Reject IPv4-mapped forms of blocked ranges too.
            if let Some(v4) = ip.to_ipv4_mapped() {
                if let Err(e) = validate_ip(IpAddr::V4(v4)) {
                    return Err(e);
                }
            }
        }
        None => return Err(EngineError::invalid("url", "missing host")),
    }

    Ok(url)
}

fn validate_ip(ip: IpAddr) -> EngineResult<()> {
    let blocked = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    };
    if blocked {
        Err(EngineError::NetworkBlocked(format!(
            "address '{ip}' is not allowed"
        )))
    } else {
        Ok(())
    }
}

/// Find every `{{secret:id}}` token in a string. `prefix` is configurable
/// (`secret.prefix_token`); the closing delimiter is always `}}`.
pub fn scan_secret_tokens(text: &str, prefix: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(prefix) {
        let after = &rest[start + prefix.len()..];
        match after.find("}}") {
            Some(end) => {
                let id = &after[..end];
                if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
                    ids.push(id.to_string());
                }
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    ids
}

/// Substitute resolved secret values into a string. Every token must have a
/// resolution; `scan_secret_tokens` + the vault guarantee that upstream.
pub fn substitute_secrets(text: &str, prefix: &str, resolved: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (id, value) in resolved {
        out = out.replace(&format!("{prefix}{id}}}}}"), value);
    }
    out
}

/// Outbound HTTP for scripts. Secret tokens in headers and body are resolved
/// here — after the request record has left the sandbox — so scripts never
/// observe the substituted values.
pub struct FetchService {
    client: reqwest::Client,
    vault: SecretVault,
    config: AppConfig,
}

impl FetchService {
    pub fn new(config: &AppConfig, vault: SecretVault) -> Self {
        Self {
            client: reqwest::Client::new(),
            vault,
            config: config.clone(),
        }
    }

    /// Resolve every secret token appearing in the request's headers/body.
    async fn resolve_tokens(&self, options: &FetchOptions) -> EngineResult<HashMap<String, String>> {
        let prefix = &self.config.secret_prefix_token;
        let mut ids: Vec<String> = Vec::new();
        for value in options.headers.values() {
            for id in scan_secret_tokens(value, prefix) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        if let Some(body) = &options.body {
            for id in scan_secret_tokens(body, prefix) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }

        let mut resolved = HashMap::with_capacity(ids.len());
        for id in ids {
            let value = self.vault.resolve(&id).await?;
            resolved.insert(id, value);
        }
        Ok(resolved)
    }

    /// Perform the call; returns the `{status, ok, headers, body}` record
    /// handed back to JS as a JSON string.
    pub async fn fetch(&self, raw_url: &str, options: FetchOptions) -> EngineResult<String> {
        let url = validate_url(raw_url)?;

        let method: reqwest::Method = options
            .method
            .as_deref()
            .unwrap_or("GET")
            .to_ascii_uppercase()
            .parse()
            .map_err(|_| EngineError::invalid("method", "invalid HTTP method"))?;

        let timeout_ms = self.config.clamp_fetch_timeout_ms(options.timeout_ms);

        let resolved = self.resolve_tokens(&options).await?;

        let mut request = self
            .client
            .request(method, url)
            .timeout(Duration::from_millis(timeout_ms));

        for (name, value) in &options.headers {
            let value = substitute_secrets(value, &self.config.secret_prefix_token, &resolved);
            request = request.header(name, value);
        }
        if let Some(body) = &options.body {
            request = request.body(substitute_secrets(
                body,
                &self.config.secret_prefix_token,
                &resolved,
            ));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EngineError::Timeout
            } else {
                EngineError::NetworkBlocked(format!("request failed: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let ok = response.status().is_success();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| EngineError::NetworkBlocked(format!("read failed: {e}")))?;
            let limit = self.config.fetch_max_response_bytes();
            if body.len() + chunk.len() > limit {
                return Err(EngineError::NetworkBlocked(format!(
                    "response exceeds {limit} byte limit"
                )));
            }
            body.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&body).into_owned();
        debug!(status, bytes = body.len(), "Outbound fetch completed");

        Ok(json!({
            "status": status,
            "ok": ok,
            "headers": headers,
            "body": body,
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- URL validation ----

    #[test]
    fn public_http_and_https_allowed() {
        assert!(validate_url("https://api.example.com/v1").is_ok());
        assert!(validate_url("http://example.org").is_ok());
    }

    #[test]
    fn non_http_schemes_blocked() {
        for url in ["ftp://example.com", "file:///etc/passwd", "gopher://x"] {
            let err = validate_url(url).unwrap_err();
            assert!(err.to_string().starts_with("NetworkBlocked"), "{url}");
        }
    }

    #[test]
    fn loopback_and_private_addresses_blocked() {
        for url in [
            "http://127.0.0.1/",
            "http://127.8.9.1:8080/",
            "https://10.0.0.5/",
            "http://172.16.3.4/",
            "http://192.168.1.1/admin",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/",
            "http://[::1]/",
        ] {
            let err = validate_url(url).unwrap_err();
            assert!(err.to_string().starts_with("NetworkBlocked"), "{url}");
        }
    }

    #[test]
    fn local_hostnames_blocked() {
        for url in [
            "http://localhost:3000/",
            "http://dev.localhost/",
            "http://printer.local/",
            "http://LOCALHOST/",
        ] {
            let err = validate_url(url).unwrap_err();
            assert!(err.to_string().starts_with("NetworkBlocked"), "{url}");
        }
    }

    #[test]
    fn public_ip_allowed() {
        assert!(validate_url("http://93.184.216.34/").is_ok());
    }

    #[test]
    fn garbage_is_invalid_input() {
        assert!(validate_url("not a url").unwrap_err().to_string().starts_with("InvalidInput"));
    }

    // ---- secret token scanning & substitution ----

    #[test]
    fn scan_finds_tokens() {
        let ids = scan_secret_tokens("Bearer {{secret:api-key}}", "{{secret:");
        assert_eq!(ids, vec!["api-key"]);
    }

    #[test]
    fn scan_finds_multiple_and_dedupes() {
        let ids = scan_secret_tokens(
            "{{secret:a}} {{secret:b}} {{secret:a}}",
            "{{secret:",
        );
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn scan_ignores_unterminated_and_empty_tokens() {
        assert!(scan_secret_tokens("{{secret:open", "{{secret:").is_empty());
        assert!(scan_secret_tokens("{{secret:}}", "{{secret:").is_empty());
        assert!(scan_secret_tokens("no tokens here", "{{secret:").is_empty());
    }

    #[test]
    fn substitute_replaces_all_occurrences() {
        let mut resolved = HashMap::new();
        resolved.insert("k".to_string(), "abc".to_string());
        let out = substitute_secrets("x={{secret:k}}&y={{secret:k}}", "{{secret:", &resolved);
        assert_eq!(out, "x=abc&y=abc");
    }

    #[test]
    fn substitute_leaves_unknown_tokens() {
        let resolved = HashMap::new();
        let out = substitute_secrets("{{secret:unknown}}", "{{secret:", &resolved);
        assert_eq!(out, "{{secret:unknown}}");
    }

    #[test]
    fn custom_prefix_token() {
        // The opening token is configurable; the closing delimiter stays `}}`.
        let ids = scan_secret_tokens("value=[[vault:key}}", "[[vault:");
        assert_eq!(ids, vec!["key"]);
    }
}
