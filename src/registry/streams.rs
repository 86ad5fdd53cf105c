use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// How many consecutive lag events an SSE reader tolerates before the engine
/// closes the connection as persistently overflowing.
pub const MAX_CONSECUTIVE_LAGS: u32 = 3;

/// Fan-out result returned to the sending script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SendSummary {
    #[serde(rename = "successCount")]
    pub success_count: usize,
    #[serde(rename = "failCount")]
    pub fail_count: usize,
}

struct StreamConnection {
    id: String,
    metadata: HashMap<String, String>,
    tx: broadcast::Sender<String>,
}

#[derive(Default)]
struct PathState {
    script_uri: String,
    connections: Vec<StreamConnection>,
}

/// Listing view of one registered stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub path: String,
    pub script_uri: String,
    pub connection_count: usize,
}

/// The SSE hub: registered stream paths and their live connections. Writers
/// are scripts calling the broadcast host APIs; readers are long-lived HTTP
/// connections draining per-connection broadcast channels.
pub struct StreamHub {
    paths: RwLock<HashMap<String, PathState>>,
    /// Per-connection buffer capacity; a lagged reader loses oldest frames.
    buffer: usize,
}

/// Superset test: every key/value pair of `filter` must appear in `metadata`.
/// An empty filter matches everything.
pub fn metadata_matches(metadata: &HashMap<String, String>, filter: &HashMap<String, String>) -> bool {
    filter
        .iter()
        .all(|(k, v)| metadata.get(k).is_some_and(|m| m == v))
}

impl StreamHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            paths: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    pub fn register(&self, path: &str, script_uri: &str) -> EngineResult<()> {
        if !path.starts_with('/') {
            return Err(EngineError::invalid("path", "must start with '/'"));
        }
        let mut paths = self.paths.write().expect("stream hub poisoned");
        let state = paths.entry(path.to_string()).or_default();
        // Re-registration keeps existing connections; ownership follows the
        // most recent registrant.
        state.script_uri = script_uri.to_string();
        Ok(())
    }

    pub fn is_registered(&self, path: &str) -> bool {
        self.paths.read().expect("stream hub poisoned").contains_key(path)
    }

    /// Attach a client connection. Fails with `StreamNotRegistered` when no
    /// script has claimed the path.
    pub fn connect(
        &self,
        path: &str,
        metadata: HashMap<String, String>,
    ) -> EngineResult<(String, broadcast::Receiver<String>)> {
        let mut paths = self.paths.write().expect("stream hub poisoned");
        let state = paths
            .get_mut(path)
            .ok_or_else(|| EngineError::StreamNotRegistered(path.to_string()))?;

        let (tx, rx) = broadcast::channel(self.buffer);
        let id = Uuid::new_v4().to_string();
        state.connections.push(StreamConnection {
            id: id.clone(),
            metadata,
            tx,
        });
        debug!(path, connection = %id, "Stream connection attached");
        Ok((id, rx))
    }

    pub fn disconnect(&self, path: &str, connection_id: &str) {
        let mut paths = self.paths.write().expect("stream hub poisoned");
        if let Some(state) = paths.get_mut(path) {
            state.connections.retain(|c| c.id != connection_id);
        }
    }

    /// Broadcast to every connection on a path whose metadata is a superset
    /// of `filter`. Failed writes close and drop the connection; the summary
    /// reports both counts.
    pub fn send(
        &self,
        path: &str,
        data: &str,
        filter: Option<&HashMap<String, String>>,
    ) -> EngineResult<SendSummary> {
        let mut paths = self.paths.write().expect("stream hub poisoned");
        let state = paths
            .get_mut(path)
            .ok_or_else(|| EngineError::StreamNotRegistered(path.to_string()))?;

        let empty = HashMap::new();
        let filter = filter.unwrap_or(&empty);

        let mut success = 0usize;
        let mut failed = 0usize;
        state.connections.retain(|conn| {
            if !metadata_matches(&conn.metadata, filter) {
                return true;
            }
            match conn.tx.send(data.to_string()) {
                Ok(_) => {
                    success += 1;
                    true
                }
                Err(_) => {
                    // Receiver gone: the client disconnected.
                    failed += 1;
                    false
                }
            }
        });

        Ok(SendSummary {
            success_count: success,
            fail_count: failed,
        })
    }

    /// Drop every path registered by a script, closing its connections.
    pub fn purge_script(&self, script_uri: &str) {
        let mut paths = self.paths.write().expect("stream hub poisoned");
        paths.retain(|_, state| state.script_uri != script_uri);
    }

    pub fn list(&self) -> Vec<StreamInfo> {
        let paths = self.paths.read().expect("stream hub poisoned");
        let mut out: Vec<StreamInfo> = paths
            .iter()
            .map(|(path, state)| StreamInfo {
                path: path.clone(),
                script_uri: state.script_uri.clone(),
                connection_count: state.connections.len(),
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }
}
