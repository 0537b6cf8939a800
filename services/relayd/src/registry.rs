//! Agent registry: durable name -> metadata mapping with an in-memory cache.
//!
//! The router asks the registry which names are "known but offline" (route
//! step 8); those messages are queued instead of dropped.

use crate::connection::ConnectionMeta;
use crate::storage::Storage;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// In-memory view over the `agents` table.
///
/// Storage failures are logged and do not block routing; the cache is the
/// source of truth for the hot path (spec: storage errors are contained).
pub struct AgentRegistry {
    storage: Arc<Mutex<Storage>>,
    known: Mutex<HashSet<String>>,
}

impl AgentRegistry {
    /// Build the registry, warming the cache from the table.
    pub async fn load(storage: Arc<Mutex<Storage>>) -> Self {
        let known = {
            let store = storage.lock().await;
            match store.load_agent_names() {
                Ok(names) => names.into_iter().collect(),
                Err(e) => {
                    warn!(error = %e, "failed to warm agent registry cache");
                    HashSet::new()
                }
            }
        };
        AgentRegistry {
            storage,
            known: Mutex::new(known),
        }
    }

    /// True when the name has ever completed a HELLO.
    pub async fn is_known(&self, name: &str) -> bool {
        self.known.lock().await.contains(name)
    }

    /// Record a successful HELLO: refresh metadata and the cache.
    pub async fn record_connect(&self, name: &str, meta: &ConnectionMeta) {
        self.known.lock().await.insert(name.to_owned());
        let mut store = self.storage.lock().await;
        if let Err(e) = store.upsert_agent(
            name,
            meta.cli.as_deref(),
            meta.program.as_deref(),
            meta.model.as_deref(),
            meta.task.as_deref(),
            meta.cwd.as_deref(),
        ) {
            warn!(agent = %name, error = %e, "registry upsert failed");
        }
    }

    /// Bump sent/received counters for an agent.
    pub async fn bump_counters(&self, name: &str, sent: u64, received: u64) {
        let mut store = self.storage.lock().await;
        if let Err(e) = store.bump_agent_counters(name, sent, received) {
            warn!(agent = %name, error = %e, "registry counter bump failed");
        }
    }
}
