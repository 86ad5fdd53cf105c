use std::time::{Duration, Instant};

use base64::Engine as _;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Executor, Row, Sqlite, Transaction, TypeInfo, ValueRef};

use crate::db::Database;
use crate::error::{EngineError, EngineResult};

/// Convert one SQLite row into a JSON object keyed by column name.
fn row_to_json(row: &SqliteRow) -> Value {
    let mut obj = serde_json::Map::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let value = match row.try_get_raw(i) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(raw) => match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => row
                    .try_get::<i64, _>(i)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                "REAL" => row.try_get::<f64, _>(i).map(Value::from).unwrap_or(Value::Null),
                "BLOB" => row
                    .try_get::<Vec<u8>, _>(i)
                    .map(|b| Value::String(base64::engine::general_purpose::STANDARD.encode(b)))
                    .unwrap_or(Value::Null),
                _ => row
                    .try_get::<String, _>(i)
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            },
            Err(_) => Value::Null,
        };
        obj.insert(col.name().to_string(), value);
    }
    Value::Object(obj)
}

/// Execute a statement with JSON parameters on any executor, returning rows
/// as JSON objects.
async fn run_query<'e, E>(executor: E, sql: &str, params: &[Value]) -> EngineResult<Value>
where
    E: Executor<'e, Database = Sqlite>,
{
    let mut query = sqlx::query(sql);
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    query.bind(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }

    let rows = query
        .fetch_all(executor)
        .await
        .map_err(|e| EngineError::invalid("sql", e.to_string()))?;
    Ok(Value::Array(rows.iter().map(row_to_json).collect()))
}

/// The per-invocation transaction slot. Starts empty; `begin` pins a pooled
/// connection until commit, rollback, timeout or invocation end. The sandbox
/// threads every DB host call through the invocation's slot, so queries made
/// inside an open transaction land on its connection.
pub struct TransactionSlot {
    tx: Option<Transaction<'static, Sqlite>>,
    deadline: Option<Instant>,
    savepoints: Vec<String>,
    savepoint_seq: u32,
    timed_out: bool,
}

impl Default for TransactionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionSlot {
    pub fn new() -> Self {
        Self {
            tx: None,
            deadline: None,
            savepoints: Vec::new(),
            savepoint_seq: 0,
            timed_out: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Roll back and fail when the transaction deadline has passed. Checked
    /// on every slot operation; the timer itself needs no separate task.
    async fn check_deadline(&mut self) -> EngineResult<()> {
        if self.timed_out {
            return Err(EngineError::TransactionTimeout);
        }
        if let (Some(deadline), true) = (self.deadline, self.tx.is_some()) {
            if Instant::now() >= deadline {
                if let Some(tx) = self.tx.take() {
                    let _ = tx.rollback().await;
                }
                self.deadline = None;
                self.savepoints.clear();
                self.timed_out = true;
                return Err(EngineError::TransactionTimeout);
            }
        }
        Ok(())
    }

    pub async fn begin(&mut self, db: &Database, timeout_ms: u64) -> EngineResult<()> {
        if self.tx.is_some() {
            return Err(EngineError::Conflict("transaction already active".into()));
        }
        let tx = db.pool.begin().await?;
        self.tx = Some(tx);
        self.deadline = Some(Instant::now() + Duration::from_millis(timeout_ms));
        self.savepoints.clear();
        self.savepoint_seq = 0;
        self.timed_out = false;
        Ok(())
    }

    pub async fn commit(&mut self) -> EngineResult<()> {
        self.check_deadline().await?;
        let tx = self
            .tx
            .take()
            .ok_or_else(|| EngineError::Conflict("no active transaction".into()))?;
        self.deadline = None;
        self.savepoints.clear();
        tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(&mut self) -> EngineResult<()> {
        self.check_deadline().await?;
        let tx = self
            .tx
            .take()
            .ok_or_else(|| EngineError::Conflict("no active transaction".into()))?;
        self.deadline = None;
        self.savepoints.clear();
        tx.rollback().await?;
        Ok(())
    }

    /// Run a statement: on the pinned transaction connection when one is
    /// active, directly on the pool otherwise.
    pub async fn query(&mut self, db: &Database, sql: &str, params: &[Value]) -> EngineResult<Value> {
        self.check_deadline().await?;
        match self.tx.as_mut() {
            Some(tx) => run_query(&mut **tx, sql, params).await,
            None => run_query(&db.pool, sql, params).await,
        }
    }

    /// Push a savepoint. A generated name is used when the script omits one.
    pub async fn create_savepoint(&mut self, name: Option<String>) -> EngineResult<String> {
        self.check_deadline().await?;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| EngineError::Conflict("no active transaction".into()))?;

        let name = match name {
            Some(n) => {
                validate_savepoint_name(&n)?;
                n
            }
            None => {
                self.savepoint_seq += 1;
                format!("sp_{}", self.savepoint_seq)
            }
        };
        if self.savepoints.contains(&name) {
            return Err(EngineError::Conflict(format!("savepoint '{name}' already exists")));
        }

        sqlx::query(&format!("SAVEPOINT {name}")).execute(&mut **tx).await?;
        self.savepoints.push(name.clone());
        Ok(name)
    }

    /// Pop a savepoint without rolling back.
    pub async fn release_savepoint(&mut self, name: &str) -> EngineResult<()> {
        self.check_deadline().await?;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| EngineError::Conflict("no active transaction".into()))?;

        let idx = self
            .savepoints
            .iter()
            .position(|s| s == name)
            .ok_or_else(|| EngineError::not_found("savepoint", name))?;

        sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
            .execute(&mut **tx)
            .await?;
        // Releasing also discards anything nested deeper.
        self.savepoints.truncate(idx);
        Ok(())
    }

    /// Rewind to and including a savepoint; the transaction stays open.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> EngineResult<()> {
        self.check_deadline().await?;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| EngineError::Conflict("no active transaction".into()))?;

        let idx = self
            .savepoints
            .iter()
            .position(|s| s == name)
            .ok_or_else(|| EngineError::not_found("savepoint", name))?;

        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {name}"))
            .execute(&mut **tx)
            .await?;
        sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
            .execute(&mut **tx)
            .await?;
        self.savepoints.truncate(idx);
        Ok(())
    }

    /// Create a script-owned table. Joins the open transaction when one is
    /// active, so the DDL rolls back with the handler's transaction.
    pub async fn create_table(
        &mut self,
        db: &Database,
        script_uri: &str,
        logical_name: &str,
        schema_json: &str,
    ) -> EngineResult<String> {
        self.check_deadline().await?;
        match self.tx.as_mut() {
            Some(tx) => {
                crate::db::tables::create_table_on(&mut **tx, script_uri, logical_name, schema_json)
                    .await
            }
            None => crate::db::tables::create_table(db, script_uri, logical_name, schema_json).await,
        }
    }

    /// Drop a script-owned table, joining the open transaction when active.
    pub async fn drop_table(
        &mut self,
        db: &Database,
        script_uri: &str,
        logical_name: &str,
    ) -> EngineResult<()> {
        self.check_deadline().await?;
        match self.tx.as_mut() {
            Some(tx) => crate::db::tables::drop_table_on(&mut **tx, script_uri, logical_name).await,
            None => crate::db::tables::drop_table(db, script_uri, logical_name).await,
        }
    }

    /// Close out the slot at the end of an invocation: auto-commit on normal
    /// return, auto-rollback when the handler failed.
    pub async fn finish(&mut self, handler_failed: bool) -> EngineResult<()> {
        self.timed_out = false;
        self.deadline = None;
        self.savepoints.clear();
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        if handler_failed {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }
        Ok(())
    }
}

fn validate_savepoint_name(name: &str) -> EngineResult<()> {
    let mut chars = name.chars();
    let ok = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::invalid(
            "savepoint",
            format!("invalid name '{name}'"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> (Database, TransactionSlot) {
        let db = Database::test_db().await;
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY, label TEXT)")
            .execute(&db.pool)
            .await
            .unwrap();
        (db, TransactionSlot::new())
    }

    async fn count(db: &Database) -> i64 {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM t")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn query_without_transaction_runs_on_pool() {
        let (db, mut slot) = setup().await;
        slot.query(&db, "INSERT INTO t (id, label) VALUES (?, ?)", &[json!(1), json!("a")])
            .await
            .unwrap();

        let rows = slot.query(&db, "SELECT * FROM t", &[]).await.unwrap();
        assert_eq!(rows, json!([{"id": 1, "label": "a"}]));
    }

    #[tokio::test]
    async fn begin_twice_is_a_conflict() {
        let (db, mut slot) = setup().await;
        slot.begin(&db, 30_000).await.unwrap();
        let err = slot.begin(&db, 30_000).await.unwrap_err();
        assert!(err.to_string().starts_with("Conflict"));
        slot.finish(false).await.unwrap();
    }

    #[tokio::test]
    async fn commit_persists_writes() {
        let (db, mut slot) = setup().await;
        slot.begin(&db, 30_000).await.unwrap();
        slot.query(&db, "INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
        slot.commit().await.unwrap();

        assert_eq!(count(&db).await, 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let (db, mut slot) = setup().await;
        slot.begin(&db, 30_000).await.unwrap();
        slot.query(&db, "INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
        slot.rollback().await.unwrap();

        assert_eq!(count(&db).await, 0);
    }

    #[tokio::test]
    async fn finish_auto_commits_on_success() {
        let (db, mut slot) = setup().await;
        slot.begin(&db, 30_000).await.unwrap();
        slot.query(&db, "INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
        slot.finish(false).await.unwrap();

        assert_eq!(count(&db).await, 1);
    }

    #[tokio::test]
    async fn finish_auto_rolls_back_on_failure() {
        let (db, mut slot) = setup().await;
        slot.begin(&db, 30_000).await.unwrap();
        slot.query(&db, "INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
        slot.finish(true).await.unwrap();

        assert_eq!(count(&db).await, 0);
    }

    #[tokio::test]
    async fn savepoint_rollback_keeps_earlier_writes() {
        let (db, mut slot) = setup().await;
        slot.begin(&db, 30_000).await.unwrap();
        slot.query(&db, "INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
        let sp = slot.create_savepoint(Some("sp1".into())).await.unwrap();
        slot.query(&db, "INSERT INTO t (id) VALUES (2)", &[]).await.unwrap();
        slot.rollback_to_savepoint(&sp).await.unwrap();
        slot.commit().await.unwrap();

        let rows = slot.query(&db, "SELECT id FROM t ORDER BY id", &[]).await.unwrap();
        assert_eq!(rows, json!([{"id": 1}]));
    }

    #[tokio::test]
    async fn rollback_to_savepoint_keeps_transaction_open() {
        let (db, mut slot) = setup().await;
        slot.begin(&db, 30_000).await.unwrap();
        let sp = slot.create_savepoint(None).await.unwrap();
        assert_eq!(sp, "sp_1");
        slot.rollback_to_savepoint(&sp).await.unwrap();

        assert!(slot.is_active());
        slot.query(&db, "INSERT INTO t (id) VALUES (3)", &[]).await.unwrap();
        slot.commit().await.unwrap();
        assert_eq!(count(&db).await, 1);
    }

    #[tokio::test]
    async fn release_savepoint_pops_without_rollback() {
        let (db, mut slot) = setup().await;
        slot.begin(&db, 30_000).await.unwrap();
        let sp = slot.create_savepoint(Some("sp1".into())).await.unwrap();
        slot.query(&db, "INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
        slot.release_savepoint(&sp).await.unwrap();

        // The savepoint is gone but the write survives.
        assert!(slot.rollback_to_savepoint(&sp).await.is_err());
        slot.commit().await.unwrap();
        assert_eq!(count(&db).await, 1);
    }

    #[tokio::test]
    async fn nested_savepoints_unwind_in_order() {
        let (db, mut slot) = setup().await;
        slot.begin(&db, 30_000).await.unwrap();
        slot.query(&db, "INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();
        slot.create_savepoint(Some("outer".into())).await.unwrap();
        slot.query(&db, "INSERT INTO t (id) VALUES (2)", &[]).await.unwrap();
        slot.create_savepoint(Some("inner".into())).await.unwrap();
        slot.query(&db, "INSERT INTO t (id) VALUES (3)", &[]).await.unwrap();

        slot.rollback_to_savepoint("outer").await.unwrap();
        // Rolling back to the outer savepoint also unwound the inner one.
        assert!(slot.release_savepoint("inner").await.is_err());
        slot.commit().await.unwrap();

        let rows = slot.query(&db, "SELECT id FROM t ORDER BY id", &[]).await.unwrap();
        assert_eq!(rows, json!([{"id": 1}]));
    }

    #[tokio::test]
    async fn expired_deadline_rolls_back_and_poisons_slot() {
        let (db, mut slot) = setup().await;
        slot.begin(&db, 0).await.unwrap();
        slot_sleep().await;

        let err = slot
            .query(&db, "INSERT INTO t (id) VALUES (1)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TransactionTimeout));

        // Still failing until a new begin.
        let err = slot.query(&db, "SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::TransactionTimeout));

        slot.begin(&db, 30_000).await.unwrap();
        slot.query(&db, "SELECT 1", &[]).await.unwrap();
        slot.finish(false).await.unwrap();
        assert_eq!(count(&db).await, 0);
    }

    async fn slot_sleep() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn savepoint_requires_active_transaction() {
        let (_db, mut slot) = setup().await;
        assert!(slot.create_savepoint(None).await.is_err());
        assert!(slot.release_savepoint("x").await.is_err());
        assert!(slot.rollback_to_savepoint("x").await.is_err());
    }

    #[tokio::test]
    async fn parameter_binding_types() {
        let (db, mut slot) = setup().await;
        sqlx::query("CREATE TABLE p (s TEXT, i INTEGER, f REAL, b INTEGER, n TEXT)")
            .execute(&db.pool)
            .await
            .unwrap();

        slot.query(
            &db,
            "INSERT INTO p (s, i, f, b, n) VALUES (?, ?, ?, ?, ?)",
            &[json!("str"), json!(7), json!(1.5), json!(true), Value::Null],
        )
        .await
        .unwrap();

        let rows = slot.query(&db, "SELECT * FROM p", &[]).await.unwrap();
        assert_eq!(
            rows,
            json!([{"s": "str", "i": 7, "f": 1.5, "b": 1, "n": null}])
        );
    }

    #[tokio::test]
    async fn bad_sql_is_invalid_input() {
        let (db, mut slot) = setup().await;
        let err = slot.query(&db, "SELEC nonsense", &[]).await.unwrap_err();
        assert!(err.to_string().starts_with("InvalidInput"));
    }
}
