use anyhow::Result;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bind address (e.g. "0.0.0.0:3000")
    pub listen_addr: String,

    /// SQLite database URL
    pub database_url: String,

    /// CPU budget per sandbox invocation, milliseconds (env: SANDBOX_EXECUTION_TIMEOUT_MS)
    pub sandbox_execution_timeout_ms: u64,

    /// Memory ceiling per sandbox, MiB (env: SANDBOX_MEMORY_LIMIT_MB)
    pub sandbox_memory_limit_mb: u64,

    /// Max inbound request body size, bytes (env: HTTP_MAX_BODY_BYTES)
    pub http_max_body_bytes: usize,

    /// Default timeout for script fetch() calls, milliseconds (env: FETCH_DEFAULT_TIMEOUT_MS)
    pub fetch_default_timeout_ms: u64,

    /// Hard upper bound a script may request for fetch(), milliseconds (env: FETCH_MAX_TIMEOUT_MS)
    pub fetch_max_timeout_ms: u64,

    /// Max fetch() response size, MiB (env: FETCH_MAX_RESPONSE_MB)
    pub fetch_max_response_mb: u64,

    /// Per-SSE-connection outbound buffer, messages (env: SSE_PER_CONNECTION_BUFFER)
    pub sse_per_connection_buffer: usize,

    /// Default script transaction timeout, milliseconds (env: DB_TRANSACTION_DEFAULT_TIMEOUT_MS)
    pub db_transaction_default_timeout_ms: u64,

    /// Opening token for secret substitution in outbound requests (env: SECRET_PREFIX_TOKEN)
    pub secret_prefix_token: String,

    /// Encryption key for secret values at rest (env: SECRETS_ENCRYPTION_KEY).
    /// When set, values are AES-256-GCM encrypted. When absent, stored plaintext.
    pub secrets_encryption_key: Option<String>,

    /// Previous encryption key for key rotation (env: SECRETS_ENCRYPTION_KEY_OLD).
    /// Set alongside a new SECRETS_ENCRYPTION_KEY; remove after one startup cycle.
    pub secrets_encryption_key_old: Option<String>,

    /// Directory of seed scripts loaded at startup if the store is empty
    /// (env: BOOTSTRAP_SCRIPT_DIR)
    pub bootstrap_script_dir: Option<String>,

    /// Set Secure flag on session cookies (env: SECURE_COOKIES, default: true)
    pub secure_cookies: bool,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://aiwebengine.db".into()),
            sandbox_execution_timeout_ms: env_parse("SANDBOX_EXECUTION_TIMEOUT_MS", 5_000),
            sandbox_memory_limit_mb: env_parse("SANDBOX_MEMORY_LIMIT_MB", 256),
            http_max_body_bytes: env_parse("HTTP_MAX_BODY_BYTES", 10 * 1024 * 1024),
            fetch_default_timeout_ms: env_parse("FETCH_DEFAULT_TIMEOUT_MS", 30_000),
            fetch_max_timeout_ms: env_parse("FETCH_MAX_TIMEOUT_MS", 120_000),
            fetch_max_response_mb: env_parse("FETCH_MAX_RESPONSE_MB", 10),
            sse_per_connection_buffer: env_parse("SSE_PER_CONNECTION_BUFFER", 64),
            db_transaction_default_timeout_ms: env_parse(
                "DB_TRANSACTION_DEFAULT_TIMEOUT_MS",
                30_000,
            ),
            secret_prefix_token: std::env::var("SECRET_PREFIX_TOKEN")
                .unwrap_or_else(|_| "{{secret:".into()),
            secrets_encryption_key: std::env::var("SECRETS_ENCRYPTION_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            secrets_encryption_key_old: std::env::var("SECRETS_ENCRYPTION_KEY_OLD")
                .ok()
                .filter(|s| !s.is_empty()),
            bootstrap_script_dir: std::env::var("BOOTSTRAP_SCRIPT_DIR").ok(),
            secure_cookies: std::env::var("SECURE_COOKIES")
                .map(|v| !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        })
    }

    pub fn fetch_max_response_bytes(&self) -> usize {
        (self.fetch_max_response_mb as usize) * 1024 * 1024
    }

    pub fn sandbox_memory_limit_bytes(&self) -> usize {
        (self.sandbox_memory_limit_mb as usize) * 1024 * 1024
    }

    /// Clamp a per-call fetch timeout request to the engine maximum.
    pub fn clamp_fetch_timeout_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.fetch_default_timeout_ms)
            .min(self.fetch_max_timeout_ms)
    }
}

/// Config with every knob at its documented default, for tests.
#[cfg(test)]
pub fn test_config() -> AppConfig {
    AppConfig {
        listen_addr: "127.0.0.1:0".into(),
        database_url: "sqlite::memory:".into(),
        sandbox_execution_timeout_ms: 5_000,
        sandbox_memory_limit_mb: 256,
        http_max_body_bytes: 10 * 1024 * 1024,
        fetch_default_timeout_ms: 30_000,
        fetch_max_timeout_ms: 120_000,
        fetch_max_response_mb: 10,
        sse_per_connection_buffer: 64,
        db_transaction_default_timeout_ms: 30_000,
        secret_prefix_token: "{{secret:".into(),
        secrets_encryption_key: None,
        secrets_encryption_key_old: None,
        bootstrap_script_dir: None,
        secure_cookies: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = test_config();
        assert_eq!(cfg.sandbox_execution_timeout_ms, 5_000);
        assert_eq!(cfg.sandbox_memory_limit_mb, 256);
        assert_eq!(cfg.http_max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.fetch_default_timeout_ms, 30_000);
        assert_eq!(cfg.fetch_max_response_mb, 10);
        assert_eq!(cfg.sse_per_connection_buffer, 64);
        assert_eq!(cfg.db_transaction_default_timeout_ms, 30_000);
        assert_eq!(cfg.secret_prefix_token, "{{secret:");
    }

    #[test]
    fn clamp_fetch_timeout_uses_default_when_unset() {
        let cfg = test_config();
        assert_eq!(cfg.clamp_fetch_timeout_ms(None), 30_000);
    }

    #[test]
    fn clamp_fetch_timeout_caps_at_engine_max() {
        let cfg = test_config();
        assert_eq!(cfg.clamp_fetch_timeout_ms(Some(10_000)), 10_000);
        assert_eq!(cfg.clamp_fetch_timeout_ms(Some(600_000)), 120_000);
    }

    #[test]
    fn derived_byte_sizes() {
        let cfg = test_config();
        assert_eq!(cfg.fetch_max_response_bytes(), 10 * 1024 * 1024);
        assert_eq!(cfg.sandbox_memory_limit_bytes(), 256 * 1024 * 1024);
    }
}
