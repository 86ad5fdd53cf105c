use std::fmt;
use std::str::FromStr;

use crate::db::models::LogRow;
use crate::db::Database;
use crate::error::{EngineError, EngineResult};

/// Severity levels for script log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Log,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Log => "LOG",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "LOG" => Ok(Self::Log),
            "WARN" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            "FATAL" => Ok(Self::Fatal),
            other => Err(EngineError::invalid("level", format!("unknown level '{other}'"))),
        }
    }
}

/// How many entries a single listing returns at most.
const LIST_LIMIT: i64 = 500;

/// Append-only log store attributed to script URIs. Entries are persisted so
/// script authors can inspect them after the fact; the engine also mirrors
/// them to its own tracing output.
#[derive(Debug, Clone)]
pub struct LogStore {
    db: Database,
}

impl LogStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(&self, script_uri: &str, level: LogLevel, message: &str) -> EngineResult<()> {
        sqlx::query("INSERT INTO script_logs (script_uri, level, message) VALUES (?, ?, ?)")
            .bind(script_uri)
            .bind(level.to_string())
            .bind(message)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    /// Most recent entries for one script, newest first.
    pub async fn list_for_uri(&self, script_uri: &str) -> EngineResult<Vec<LogRow>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, script_uri, level, message, created_at FROM script_logs
             WHERE script_uri = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(script_uri)
        .bind(LIST_LIMIT)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    /// Most recent entries across all scripts, newest first.
    pub async fn list_all(&self) -> EngineResult<Vec<LogRow>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, script_uri, level, message, created_at FROM script_logs
             ORDER BY id DESC LIMIT ?",
        )
        .bind(LIST_LIMIT)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows)
    }

    /// Remove all entries for a script (cascading script delete).
    pub async fn purge_script(&self, script_uri: &str) -> EngineResult<u64> {
        let result = sqlx::query("DELETE FROM script_logs WHERE script_uri = ?")
            .bind(script_uri)
            .execute(&self.db.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_list_newest_first() {
        let store = LogStore::new(Database::test_db().await);
        store
            .append("https://example.com/a", LogLevel::Info, "first")
            .await
            .unwrap();
        store
            .append("https://example.com/a", LogLevel::Error, "second")
            .await
            .unwrap();

        let rows = store.list_for_uri("https://example.com/a").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message, "second");
        assert_eq!(rows[0].level, "ERROR");
        assert_eq!(rows[1].message, "first");
    }

    #[tokio::test]
    async fn listing_is_scoped_per_uri() {
        let store = LogStore::new(Database::test_db().await);
        store
            .append("https://example.com/a", LogLevel::Log, "a-entry")
            .await
            .unwrap();
        store
            .append("https://example.com/b", LogLevel::Log, "b-entry")
            .await
            .unwrap();

        let rows = store.list_for_uri("https://example.com/a").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message, "a-entry");

        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn purge_removes_only_target_script() {
        let store = LogStore::new(Database::test_db().await);
        store
            .append("https://example.com/a", LogLevel::Warn, "x")
            .await
            .unwrap();
        store
            .append("https://example.com/b", LogLevel::Warn, "y")
            .await
            .unwrap();

        let purged = store.purge_script("https://example.com/a").await.unwrap();
        assert_eq!(purged, 1);
        assert!(store
            .list_for_uri("https://example.com/a")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.list_for_uri("https://example.com/b").await.unwrap().len(), 1);
    }

    #[test]
    fn level_parsing_accepts_any_case() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("FATAL".parse::<LogLevel>().unwrap(), LogLevel::Fatal);
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
