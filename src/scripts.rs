use crate::db::models::{ScriptRow, ScriptSummary};
use crate::db::Database;
use crate::error::{EngineError, EngineResult};

/// Persistence for script rows and their owner sets. Load/unload
/// orchestration lives in `engine`; this layer is plain storage.
#[derive(Debug, Clone)]
pub struct ScriptStore {
    db: Database,
}

/// Display name fallback: the last path segment of the URI.
fn default_name(uri: &str) -> String {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(uri)
        .to_string()
}

impl ScriptStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> EngineResult<Vec<ScriptSummary>> {
        let rows = sqlx::query_as::<_, ScriptSummary>(
            "SELECT uri, name, privileged, updated_at FROM scripts ORDER BY uri",
        )
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get(&self, uri: &str) -> EngineResult<ScriptRow> {
        self.try_get(uri)
            .await?
            .ok_or_else(|| EngineError::not_found("script", uri))
    }

    pub async fn try_get(&self, uri: &str) -> EngineResult<Option<ScriptRow>> {
        let row = sqlx::query_as::<_, ScriptRow>(
            "SELECT uri, name, source_text, privileged, created_at, updated_at
             FROM scripts WHERE uri = ?",
        )
        .bind(uri)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(row)
    }

    /// Insert or update a script row, idempotent on URI. `name` and
    /// `privileged` keep their current values when omitted on update.
    pub async fn upsert(
        &self,
        uri: &str,
        source: &str,
        name: Option<&str>,
        privileged: Option<bool>,
    ) -> EngineResult<ScriptRow> {
        if uri.is_empty() || !uri.contains("://") {
            return Err(EngineError::invalid("uri", "script URI must be absolute"));
        }

        sqlx::query(
            "INSERT INTO scripts (uri, name, source_text, privileged) VALUES (?, ?, ?, ?)
             ON CONFLICT(uri) DO UPDATE SET
                 source_text = excluded.source_text,
                 name = COALESCE(?, scripts.name),
                 privileged = COALESCE(?, scripts.privileged),
                 updated_at = datetime('now')",
        )
        .bind(uri)
        .bind(name.map(str::to_string).unwrap_or_else(|| default_name(uri)))
        .bind(source)
        .bind(privileged.unwrap_or(false))
        .bind(name)
        .bind(privileged)
        .execute(&self.db.pool)
        .await?;

        self.get(uri).await
    }

    pub async fn delete(&self, uri: &str) -> EngineResult<()> {
        let result = sqlx::query("DELETE FROM scripts WHERE uri = ?")
            .bind(uri)
            .execute(&self.db.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("script", uri));
        }
        Ok(())
    }

    // ---- owners ----

    pub async fn add_owner(&self, uri: &str, user_id: &str) -> EngineResult<()> {
        // FK to scripts(uri) rejects owners for unknown scripts.
        sqlx::query(
            "INSERT INTO script_owners (script_uri, user_id) VALUES (?, ?)
             ON CONFLICT(script_uri, user_id) DO NOTHING",
        )
        .bind(uri)
        .bind(user_id)
        .execute(&self.db.pool)
        .await
        .map_err(|_| EngineError::not_found("script", uri))?;
        Ok(())
    }

    pub async fn remove_owner(&self, uri: &str, user_id: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM script_owners WHERE script_uri = ? AND user_id = ?")
            .bind(uri)
            .bind(user_id)
            .execute(&self.db.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_owners(&self, uri: &str) -> EngineResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM script_owners WHERE script_uri = ? ORDER BY created_at, user_id",
        )
        .bind(uri)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows.into_iter().map(|(u,)| u).collect())
    }

    pub async fn is_owner(&self, uri: &str, user_id: &str) -> EngineResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM script_owners WHERE script_uri = ? AND user_id = ?")
                .bind(uri)
                .bind(user_id)
                .fetch_optional(&self.db.pool)
                .await?;
        Ok(row.is_some())
    }
}
