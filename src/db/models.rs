use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScriptRow {
    pub uri: String,
    pub name: String,
    pub source_text: String,
    pub privileged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing view of a script — source omitted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScriptSummary {
    pub uri: String,
    pub name: String,
    pub privileged: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetRow {
    pub uri: String,
    pub name: String,
    pub mimetype: String,
    pub content: Vec<u8>,
    pub script_uri: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing view of an asset — content omitted, size reported instead.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AssetSummary {
    pub uri: String,
    pub name: String,
    pub mimetype: String,
    pub size_bytes: i64,
    pub script_uri: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LogRow {
    pub id: i64,
    pub script_uri: String,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScriptTableRow {
    pub script_uri: String,
    pub logical_name: String,
    pub physical_name: String,
    pub schema_json: String,
}
