use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::db::models::ScriptTableRow;
use crate::db::Database;
use crate::error::{EngineError, EngineResult};

/// Per-script table namespace. Every physical table a script creates carries
/// a prefix derived from its URI; the query path refuses raw SQL from
/// non-privileged scripts that names tables outside that prefix.

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap())
}

/// Stable physical-name prefix for one script.
pub fn table_prefix(script_uri: &str) -> String {
    let digest = Sha256::digest(script_uri.as_bytes());
    format!("scr_{}_", hex::encode(&digest[..6]))
}

/// Physical name for a script's logical table.
pub fn physical_name(script_uri: &str, logical_name: &str) -> String {
    format!("{}{}", table_prefix(script_uri), logical_name)
}

fn validate_identifier(field: &'static str, value: &str) -> EngineResult<()> {
    if ident_re().is_match(value) {
        Ok(())
    } else {
        Err(EngineError::invalid(field, format!("invalid identifier '{value}'")))
    }
}

/// Column types scripts may declare.
fn column_type_sql(declared: &str) -> EngineResult<&'static str> {
    match declared.to_ascii_uppercase().as_str() {
        "TEXT" | "STRING" => Ok("TEXT"),
        "INTEGER" | "INT" => Ok("INTEGER"),
        "REAL" | "FLOAT" | "NUMBER" => Ok("REAL"),
        "BLOB" => Ok("BLOB"),
        "BOOLEAN" | "BOOL" => Ok("INTEGER"),
        other => Err(EngineError::invalid(
            "schema",
            format!("unsupported column type '{other}'"),
        )),
    }
}

#[derive(Debug, PartialEq)]
enum SqlToken {
    /// Bare word: identifier or keyword.
    Ident(String),
    /// Identifier quoted with `"…"`, `` `…` `` or `[…]`.
    Quoted(String),
    /// A `'…'` string. SQLite also accepts these as identifiers in table
    /// position, so the scanner must see them.
    Literal,
    Punct(char),
}

/// Lexical scan of a statement: strips whitespace, comments and numbers,
/// keeps identifiers (in all SQLite quoting forms), string literals and
/// punctuation. Unterminated quotes or comments are an error.
fn tokenize(sql: &str) -> EngineResult<Vec<SqlToken>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            if i >= chars.len() {
                return Err(EngineError::invalid("sql", "unterminated comment"));
            }
            i += 2;
        } else if c == '\'' {
            i += 1;
            loop {
                if i >= chars.len() {
                    return Err(EngineError::invalid("sql", "unterminated string literal"));
                }
                if chars[i] == '\'' {
                    // '' escapes a quote inside the literal.
                    if chars.get(i + 1) == Some(&'\'') {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(SqlToken::Literal);
        } else if c == '"' || c == '`' || c == '[' {
            let close = if c == '[' { ']' } else { c };
            i += 1;
            let start = i;
            while i < chars.len() && chars[i] != close {
                i += 1;
            }
            if i >= chars.len() {
                return Err(EngineError::invalid("sql", "unterminated quoted identifier"));
            }
            tokens.push(SqlToken::Quoted(chars[start..i].iter().collect()));
            i += 1;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(SqlToken::Ident(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
        } else {
            tokens.push(SqlToken::Punct(c));
            i += 1;
        }
    }
    Ok(tokens)
}

/// Words that terminate a FROM-list; a bare word after a table name that is
/// not one of these is treated as an alias. Statement keywords are included
/// so an alias never swallows the start of a clause the walk must still see.
fn is_clause_keyword(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "where"
            | "set"
            | "on"
            | "join"
            | "left"
            | "right"
            | "inner"
            | "outer"
            | "cross"
            | "natural"
            | "group"
            | "order"
            | "limit"
            | "having"
            | "union"
            | "intersect"
            | "except"
            | "values"
            | "returning"
            | "using"
            | "indexed"
            | "when"
            | "then"
            | "else"
            | "end"
            | "and"
            | "or"
            | "not"
            | "window"
            | "select"
            | "from"
            | "insert"
            | "delete"
            | "update"
            | "replace"
            | "create"
            | "drop"
            | "alter"
            | "into"
            | "table"
    )
}

/// Verify that every table referenced by a raw statement carries the
/// script's prefix. Engine-owned tables and other scripts' tables are out of
/// reach for non-privileged scripts.
///
/// The scan walks every identifier in table position — the whole
/// comma-separated list after `FROM`/`UPDATE`, each `JOIN`/`INTO`/`TABLE`
/// target — across all SQLite quoting forms. A table position the scanner
/// cannot positively resolve to a name is rejected outright (fail closed).
pub fn authorize_statement(sql: &str, prefix: &str) -> EngineResult<()> {
    let tokens = tokenize(sql)?;

    let outside = |name: &str| {
        EngineError::invalid(
            "sql",
            format!("table '{name}' is outside this script's namespace"),
        )
    };

    let mut i = 0;
    while i < tokens.len() {
        let word = match &tokens[i] {
            SqlToken::Ident(w) => w.to_ascii_lowercase(),
            _ => {
                i += 1;
                continue;
            }
        };
        // FROM starts a comma-separated source list; the others take one
        // table reference each.
        let list_context = match word.as_str() {
            "from" => true,
            "join" | "into" | "table" => false,
            "update" => {
                // `… ON CONFLICT DO UPDATE SET …` is an upsert clause on the
                // already-checked INTO target, not a table reference.
                let after_do = i
                    .checked_sub(1)
                    .and_then(|p| tokens.get(p))
                    .is_some_and(|t| matches!(t, SqlToken::Ident(w) if w.eq_ignore_ascii_case("do")));
                if after_do {
                    i += 1;
                    continue;
                }
                false
            }
            _ => {
                i += 1;
                continue;
            }
        };

        let mut j = i + 1;
        // Skip `IF [NOT] EXISTS` after TABLE and conflict-resolution words
        // after UPDATE.
        let skippable: &[&str] = match word.as_str() {
            "table" => &["if", "not", "exists"],
            "update" => &["or", "abort", "fail", "ignore", "replace", "rollback"],
            _ => &[],
        };
        while matches!(tokens.get(j), Some(SqlToken::Ident(w))
            if skippable.iter().any(|s| w.eq_ignore_ascii_case(s)))
        {
            j += 1;
        }

        loop {
            match tokens.get(j) {
                // A parenthesized source (subquery); its own FROM clauses
                // are checked as the outer walk continues.
                Some(SqlToken::Punct('(')) => break,
                Some(SqlToken::Ident(name)) | Some(SqlToken::Quoted(name)) => {
                    if !name.starts_with(prefix) {
                        return Err(outside(name));
                    }
                }
                // Trailing keyword with no reference; the database will
                // reject the statement itself.
                None => break,
                // Anything else in table position cannot be resolved to a
                // prefixed name.
                Some(_) => {
                    return Err(EngineError::invalid("sql", "unresolvable table reference"));
                }
            }
            j += 1;
            // Optional alias: [AS] word, a quoted name or even a string.
            if matches!(tokens.get(j), Some(SqlToken::Ident(w)) if w.eq_ignore_ascii_case("as")) {
                j += 1;
            }
            match tokens.get(j) {
                Some(SqlToken::Ident(w)) if !is_clause_keyword(w) => j += 1,
                Some(SqlToken::Quoted(_)) | Some(SqlToken::Literal) => j += 1,
                _ => {}
            }
            if list_context && matches!(tokens.get(j), Some(SqlToken::Punct(','))) {
                j += 1;
                continue;
            }
            break;
        }
        i = j.max(i + 1);
    }
    Ok(())
}

/// Build the CREATE TABLE statement from a schema document:
/// `{"columns": {"name": "TEXT", ...}, "primaryKey": ["name", ...]}`.
fn build_create_sql(physical: &str, schema: &serde_json::Value) -> EngineResult<String> {
    let columns = schema
        .get("columns")
        .and_then(|c| c.as_object())
        .ok_or_else(|| EngineError::invalid("schema", "missing 'columns' object"))?;
    if columns.is_empty() {
        return Err(EngineError::invalid("schema", "at least one column required"));
    }

    let mut defs = Vec::with_capacity(columns.len());
    for (name, ty) in columns {
        validate_identifier("schema", name)?;
        let declared = ty
            .as_str()
            .ok_or_else(|| EngineError::invalid("schema", "column types must be strings"))?;
        defs.push(format!("{name} {}", column_type_sql(declared)?));
    }

    if let Some(pk) = schema.get("primaryKey").and_then(|p| p.as_array()) {
        let mut keys = Vec::with_capacity(pk.len());
        for key in pk {
            let key = key
                .as_str()
                .ok_or_else(|| EngineError::invalid("schema", "primaryKey entries must be strings"))?;
            validate_identifier("schema", key)?;
            if !columns.contains_key(key) {
                return Err(EngineError::invalid(
                    "schema",
                    format!("primaryKey column '{key}' not declared"),
                ));
            }
            keys.push(key.to_string());
        }
        if !keys.is_empty() {
            defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }
    }

    Ok(format!("CREATE TABLE {physical} ({})", defs.join(", ")))
}

/// Create a script-owned table (tracking row + physical table) on an
/// existing connection. The caller owns the surrounding transaction: inside
/// a handler's open transaction slot, both sides roll back together with it.
pub async fn create_table_on(
    conn: &mut sqlx::SqliteConnection,
    script_uri: &str,
    logical_name: &str,
    schema_json: &str,
) -> EngineResult<String> {
    validate_identifier("logicalName", logical_name)?;
    let schema: serde_json::Value = serde_json::from_str(schema_json)
        .map_err(|e| EngineError::invalid("schema", format!("invalid JSON: {e}")))?;

    let physical = physical_name(script_uri, logical_name);
    let create_sql = build_create_sql(&physical, &schema)?;

    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT physical_name FROM script_tables WHERE script_uri = ? AND logical_name = ?",
    )
    .bind(script_uri)
    .bind(logical_name)
    .fetch_optional(&mut *conn)
    .await?;
    if existing.is_some() {
        return Err(EngineError::Conflict(format!(
            "table '{logical_name}' already exists"
        )));
    }

    sqlx::query(
        "INSERT INTO script_tables (script_uri, logical_name, physical_name, schema_json)
         VALUES (?, ?, ?, ?)",
    )
    .bind(script_uri)
    .bind(logical_name)
    .bind(&physical)
    .bind(schema_json)
    .execute(&mut *conn)
    .await?;

    sqlx::query(&create_sql).execute(&mut *conn).await?;
    Ok(physical)
}

/// Create a script-owned table in its own transaction.
pub async fn create_table(
    db: &Database,
    script_uri: &str,
    logical_name: &str,
    schema_json: &str,
) -> EngineResult<String> {
    let mut tx = db.pool.begin().await?;
    let physical = create_table_on(&mut tx, script_uri, logical_name, schema_json).await?;
    tx.commit().await?;
    Ok(physical)
}

/// Drop a script-owned table and its tracking row on an existing connection.
pub async fn drop_table_on(
    conn: &mut sqlx::SqliteConnection,
    script_uri: &str,
    logical_name: &str,
) -> EngineResult<()> {
    validate_identifier("logicalName", logical_name)?;

    let row: Option<(String,)> = sqlx::query_as(
        "SELECT physical_name FROM script_tables WHERE script_uri = ? AND logical_name = ?",
    )
    .bind(script_uri)
    .bind(logical_name)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((physical,)) = row else {
        return Err(EngineError::not_found("table", logical_name));
    };

    sqlx::query("DELETE FROM script_tables WHERE script_uri = ? AND logical_name = ?")
        .bind(script_uri)
        .bind(logical_name)
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {physical}"))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Drop a script-owned table in its own transaction.
pub async fn drop_table(db: &Database, script_uri: &str, logical_name: &str) -> EngineResult<()> {
    let mut tx = db.pool.begin().await?;
    drop_table_on(&mut tx, script_uri, logical_name).await?;
    tx.commit().await?;
    Ok(())
}

/// Resolve a logical name to its physical table, if created.
pub async fn lookup(
    db: &Database,
    script_uri: &str,
    logical_name: &str,
) -> EngineResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT physical_name FROM script_tables WHERE script_uri = ? AND logical_name = ?",
    )
    .bind(script_uri)
    .bind(logical_name)
    .fetch_optional(&db.pool)
    .await?;
    Ok(row.map(|(p,)| p))
}

pub async fn list_for_script(db: &Database, script_uri: &str) -> EngineResult<Vec<ScriptTableRow>> {
    let rows = sqlx::query_as::<_, ScriptTableRow>(
        "SELECT script_uri, logical_name, physical_name, schema_json
         FROM script_tables WHERE script_uri = ? ORDER BY logical_name",
    )
    .bind(script_uri)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

/// Drop every table owned by a script in a single transaction (cascading
/// script delete).
pub async fn purge_script(db: &Database, script_uri: &str) -> EngineResult<u64> {
    let mut tx = db.pool.begin().await?;
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT physical_name FROM script_tables WHERE script_uri = ?")
            .bind(script_uri)
            .fetch_all(&mut *tx)
            .await?;

    for (physical,) in &rows {
        sqlx::query(&format!("DROP TABLE IF EXISTS {physical}"))
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DELETE FROM script_tables WHERE script_uri = ?")
        .bind(script_uri)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(rows.len() as u64)
}
