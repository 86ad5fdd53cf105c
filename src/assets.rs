use crate::db::models::{AssetRow, AssetSummary};
use crate::db::Database;
use crate::error::{EngineError, EngineResult};

/// Binary blobs addressed by URI. Public HTTP exposure is a route-registry
/// entry referencing the asset URI, not a property of the asset itself.
#[derive(Debug, Clone)]
pub struct AssetStore {
    db: Database,
}

/// Derive the canonical asset URI for a script-owned asset name.
pub fn asset_uri(script_uri: &str, name: &str) -> String {
    format!("{script_uri}#assets/{name}")
}

impl AssetStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn list_all(&self) -> EngineResult<Vec<AssetSummary>> {
        let rows = sqlx::query_as::<_, AssetSummary>(
            "SELECT uri, name, mimetype, length(content) AS size_bytes, script_uri, updated_at
             FROM assets ORDER BY uri",
        )
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_for_script(&self, script_uri: &str) -> EngineResult<Vec<AssetSummary>> {
        let rows = sqlx::query_as::<_, AssetSummary>(
            "SELECT uri, name, mimetype, length(content) AS size_bytes, script_uri, updated_at
             FROM assets WHERE script_uri = ? ORDER BY name",
        )
        .bind(script_uri)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_by_uri(&self, uri: &str) -> EngineResult<AssetRow> {
        let row = sqlx::query_as::<_, AssetRow>(
            "SELECT uri, name, mimetype, content, script_uri, created_at, updated_at
             FROM assets WHERE uri = ?",
        )
        .bind(uri)
        .fetch_optional(&self.db.pool)
        .await?;
        row.ok_or_else(|| EngineError::not_found("asset", uri))
    }

    pub async fn get_by_name(&self, script_uri: &str, name: &str) -> EngineResult<AssetRow> {
        self.get_by_uri(&asset_uri(script_uri, name)).await
    }

    /// Create or replace a script-owned asset. Idempotent on URI.
    pub async fn upsert(
        &self,
        script_uri: &str,
        name: &str,
        mimetype: &str,
        content: &[u8],
    ) -> EngineResult<String> {
        if name.is_empty() || name.contains("..") || name.contains('\\') {
            return Err(EngineError::invalid("name", "invalid asset name"));
        }
        let uri = asset_uri(script_uri, name);
        sqlx::query(
            "INSERT INTO assets (uri, name, mimetype, content, script_uri) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(uri) DO UPDATE SET
                 mimetype = excluded.mimetype,
                 content = excluded.content,
                 updated_at = datetime('now')",
        )
        .bind(&uri)
        .bind(name)
        .bind(mimetype)
        .bind(content)
        .bind(script_uri)
        .execute(&self.db.pool)
        .await?;
        Ok(uri)
    }

    pub async fn delete(&self, script_uri: &str, name: &str) -> EngineResult<()> {
        let result = sqlx::query("DELETE FROM assets WHERE uri = ?")
            .bind(asset_uri(script_uri, name))
            .execute(&self.db.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("asset", name));
        }
        Ok(())
    }

    /// Remove every asset owned by a script (cascading script delete).
    pub async fn purge_script(&self, script_uri: &str) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM assets WHERE script_uri = ?")
            .bind(script_uri)
            .execute(&self.db.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "https://example.com/site";

    #[tokio::test]
    async fn upsert_and_fetch_roundtrip() {
        let store = AssetStore::new(Database::test_db().await);
        let uri = store
            .upsert(SCRIPT, "logo.png", "image/png", b"\x89PNG")
            .await
            .unwrap();
        assert_eq!(uri, "https://example.com/site#assets/logo.png");

        let asset = store.get_by_name(SCRIPT, "logo.png").await.unwrap();
        assert_eq!(asset.mimetype, "image/png");
        assert_eq!(asset.content, b"\x89PNG");
        assert_eq!(asset.script_uri, SCRIPT);
    }

    #[tokio::test]
    async fn upsert_replaces_content() {
        let store = AssetStore::new(Database::test_db().await);
        store.upsert(SCRIPT, "a.txt", "text/plain", b"one").await.unwrap();
        store.upsert(SCRIPT, "a.txt", "text/plain", b"two").await.unwrap();

        let asset = store.get_by_name(SCRIPT, "a.txt").await.unwrap();
        assert_eq!(asset.content, b"two");
        assert_eq!(store.list_for_script(SCRIPT).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn listing_reports_size_without_content() {
        let store = AssetStore::new(Database::test_db().await);
        store
            .upsert(SCRIPT, "data.bin", "application/octet-stream", &[0u8; 1024])
            .await
            .unwrap();

        let list = store.list_for_script(SCRIPT).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].size_bytes, 1024);
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = AssetStore::new(Database::test_db().await);
        let err = store.delete(SCRIPT, "ghost.txt").await.unwrap_err();
        assert!(err.to_string().starts_with("NotFound"));
    }

    #[tokio::test]
    async fn traversal_names_rejected() {
        let store = AssetStore::new(Database::test_db().await);
        assert!(store
            .upsert(SCRIPT, "../escape", "text/plain", b"x")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn purge_is_scoped_to_owner() {
        let store = AssetStore::new(Database::test_db().await);
        store.upsert(SCRIPT, "a.txt", "text/plain", b"a").await.unwrap();
        store
            .upsert("https://example.com/other", "b.txt", "text/plain", b"b")
            .await
            .unwrap();

        assert_eq!(store.purge_script(SCRIPT).await.unwrap(), 1);
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }
}
