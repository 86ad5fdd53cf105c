use crate::db::Database;
use crate::error::EngineResult;

/// Key/value stores exposed to scripts: one shared per script, one personal
/// per (script, user). Rows are serialized by DB-level uniqueness; atomic
/// read-modify-write needs an explicit script transaction.
#[derive(Debug, Clone)]
pub struct StorageBridge {
    db: Database,
}

impl StorageBridge {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ---- shared storage (per script) ----

    pub async fn shared_get(&self, script_uri: &str, key: &str) -> EngineResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM shared_storage WHERE script_uri = ? AND key = ?")
                .bind(script_uri)
                .bind(key)
                .fetch_optional(&self.db.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn shared_set(&self, script_uri: &str, key: &str, value: &str) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO shared_storage (script_uri, key, value) VALUES (?, ?, ?)
             ON CONFLICT(script_uri, key) DO UPDATE SET
                 value = excluded.value, updated_at = datetime('now')",
        )
        .bind(script_uri)
        .bind(key)
        .bind(value)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn shared_remove(&self, script_uri: &str, key: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM shared_storage WHERE script_uri = ? AND key = ?")
            .bind(script_uri)
            .bind(key)
            .execute(&self.db.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn shared_keys(&self, script_uri: &str) -> EngineResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM shared_storage WHERE script_uri = ? ORDER BY key")
                .bind(script_uri)
                .fetch_all(&self.db.pool)
                .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    // ---- personal storage (per script, per user) ----

    pub async fn personal_get(
        &self,
        script_uri: &str,
        user_id: &str,
        key: &str,
    ) -> EngineResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM personal_storage WHERE script_uri = ? AND user_id = ? AND key = ?",
        )
        .bind(script_uri)
        .bind(user_id)
        .bind(key)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn personal_set(
        &self,
        script_uri: &str,
        user_id: &str,
        key: &str,
        value: &str,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO personal_storage (script_uri, user_id, key, value) VALUES (?, ?, ?, ?)
             ON CONFLICT(script_uri, user_id, key) DO UPDATE SET
                 value = excluded.value, updated_at = datetime('now')",
        )
        .bind(script_uri)
        .bind(user_id)
        .bind(key)
        .bind(value)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn personal_remove(
        &self,
        script_uri: &str,
        user_id: &str,
        key: &str,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            "DELETE FROM personal_storage WHERE script_uri = ? AND user_id = ? AND key = ?",
        )
        .bind(script_uri)
        .bind(user_id)
        .bind(key)
        .execute(&self.db.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn personal_keys(
        &self,
        script_uri: &str,
        user_id: &str,
    ) -> EngineResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM personal_storage WHERE script_uri = ? AND user_id = ? ORDER BY key",
        )
        .bind(script_uri)
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    /// Remove both stores for a script (cascading script delete).
    pub async fn purge_script(&self, script_uri: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM shared_storage WHERE script_uri = ?")
            .bind(script_uri)
            .execute(&self.db.pool)
            .await?;
        sqlx::query("DELETE FROM personal_storage WHERE script_uri = ?")
            .bind(script_uri)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }
}
