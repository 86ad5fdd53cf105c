use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;

use crate::error::{EngineError, EngineResult};

/// One registered message listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub message_type: String,
    pub script_uri: String,
    pub handler_name: String,
}

/// Many-to-many pub/sub table between scripts, keyed by message-type string.
/// Listeners for one type are kept in registration order; the dispatcher
/// invokes them in that order.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        message_type: &str,
        script_uri: &str,
        handler_name: &str,
    ) -> EngineResult<()> {
        if message_type.is_empty() {
            return Err(EngineError::invalid("messageType", "must not be empty"));
        }
        if handler_name.is_empty() {
            return Err(EngineError::invalid("handler", "handler name required"));
        }

        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        let list = listeners.entry(message_type.to_string()).or_default();
        let entry = Listener {
            message_type: message_type.to_string(),
            script_uri: script_uri.to_string(),
            handler_name: handler_name.to_string(),
        };
        // The same (script, handler) pair registers once; repeats keep the
        // original position.
        if !list.contains(&entry) {
            list.push(entry);
        }
        Ok(())
    }

    /// Listeners for a type, in registration order.
    pub fn listeners_for(&self, message_type: &str) -> Vec<Listener> {
        self.listeners
            .read()
            .expect("listener registry poisoned")
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn purge_script(&self, script_uri: &str) {
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        listeners.retain(|_, list| {
            list.retain(|l| l.script_uri != script_uri);
            !list.is_empty()
        });
    }
}
