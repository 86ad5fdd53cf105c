use tracing::warn;

use crate::db::{crypto, Database};
use crate::error::{EngineError, EngineResult};

/// The secret vault. Values never cross into script-visible space: scripts
/// may list identifiers and test existence, and the outbound HTTP client asks
/// the vault to resolve `{{secret:id}}` tokens just before dispatch.
#[derive(Debug, Clone)]
pub struct SecretVault {
    db: Database,
    encryption_key: Option<String>,
}

impl SecretVault {
    pub fn new(db: Database, encryption_key: Option<String>) -> Self {
        if encryption_key.is_none() {
            warn!("SECRETS_ENCRYPTION_KEY not set — secret values stored in plaintext");
        }
        Self { db, encryption_key }
    }

    /// Identifiers only — never values.
    pub async fn list_identifiers(&self) -> EngineResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT identifier FROM secrets ORDER BY identifier")
                .fetch_all(&self.db.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn exists(&self, identifier: &str) -> EngineResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM secrets WHERE identifier = ?")
            .bind(identifier)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Store or replace a secret (admin control surface only).
    pub async fn put(&self, identifier: &str, value: &str) -> EngineResult<()> {
        let stored = match &self.encryption_key {
            Some(key) => crypto::encrypt(value, key).map_err(EngineError::internal)?,
            None => value.to_string(),
        };
        sqlx::query(
            "INSERT INTO secrets (identifier, value_enc) VALUES (?, ?)
             ON CONFLICT(identifier) DO UPDATE SET value_enc = excluded.value_enc",
        )
        .bind(identifier)
        .bind(&stored)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, identifier: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM secrets WHERE identifier = ?")
            .bind(identifier)
            .execute(&self.db.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Resolve a secret value for the trusted outbound-HTTP layer. Not
    /// reachable from any script-facing host API.
    pub(crate) async fn resolve(&self, identifier: &str) -> EngineResult<String> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value_enc FROM secrets WHERE identifier = ?")
                .bind(identifier)
                .fetch_optional(&self.db.pool)
                .await?;

        let stored = match row {
            Some((v,)) => v,
            None => return Err(EngineError::SecretNotFound(identifier.to_string())),
        };

        match &self.encryption_key {
            Some(key) => crypto::decrypt(&stored, key).map_err(EngineError::internal),
            None => Ok(stored),
        }
    }
}
