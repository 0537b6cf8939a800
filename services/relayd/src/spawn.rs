//! Spawn manager: owns the pool of daemon-launched agent processes.
//!
//! Handles SPAWN and RELEASE envelopes.  Before a child's HELLO arrives the
//! router's spawning set queues inbound traffic for the child's name instead
//! of dropping it; the router clears the flag when the HELLO registers (or
//! this manager clears it when the launch fails).

use crate::connection::ConnectionHandle;
use crate::router::Router;
use relay_protocol::{
    Body, Envelope, ReleasePayload, ReleaseResultPayload, SpawnPayload, SpawnResultPayload,
    SYSTEM_SENDER,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Child processes keyed by agent name.
pub struct SpawnManager {
    router: Arc<Router>,
    children: Mutex<HashMap<String, Child>>,
}

impl SpawnManager {
    pub fn new(router: Arc<Router>) -> Arc<Self> {
        Arc::new(SpawnManager {
            router,
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Launch a child for a SPAWN request and reply with SPAWN_RESULT.
    pub async fn handle_spawn(&self, caller: &Arc<ConnectionHandle>, payload: &SpawnPayload) {
        let name = payload.name.clone();
        {
            let children = self.children.lock().await;
            if children.contains_key(&name) {
                self.reply_spawn(
                    caller,
                    SpawnResultPayload {
                        success: false,
                        pid: None,
                        error: Some(format!("agent '{name}' is already running")),
                    },
                )
                .await;
                return;
            }
        }

        // Queue traffic addressed to the child until its HELLO lands.
        self.router.mark_spawning(&name);

        let mut command = Command::new(&payload.cli);
        command
            .env("RELAY_AGENT_NAME", &name)
            .kill_on_drop(true);
        if let Some(task) = &payload.task {
            command.env("RELAY_AGENT_TASK", task);
        }
        if let Some(model) = &payload.model {
            command.env("RELAY_AGENT_MODEL", model);
        }
        if let Some(cwd) = &payload.cwd {
            command.current_dir(cwd);
        }

        match command.spawn() {
            Ok(child) => {
                let pid = child.id();
                info!(name = %name, pid = ?pid, "spawned agent process");
                self.children.lock().await.insert(name.clone(), child);
                self.reply_spawn(
                    caller,
                    SpawnResultPayload {
                        success: true,
                        pid,
                        error: None,
                    },
                )
                .await;
            }
            Err(e) => {
                warn!(name = %name, error = %e, "spawn failed");
                self.router.clear_spawning(&name);
                self.reply_spawn(
                    caller,
                    SpawnResultPayload {
                        success: false,
                        pid: None,
                        error: Some(e.to_string()),
                    },
                )
                .await;
            }
        }
    }

    /// Kill and reap a child for a RELEASE request, replying with
    /// RELEASE_RESULT.
    pub async fn handle_release(&self, caller: &Arc<ConnectionHandle>, payload: &ReleasePayload) {
        let name = payload.name.clone();
        let child = self.children.lock().await.remove(&name);
        let result = match child {
            Some(mut child) => {
                if let Err(e) = child.start_kill() {
                    warn!(name = %name, error = %e, "kill failed");
                }
                match child.wait().await {
                    Ok(status) => {
                        info!(name = %name, status = %status, "released agent process");
                        ReleaseResultPayload {
                            success: true,
                            error: None,
                        }
                    }
                    Err(e) => ReleaseResultPayload {
                        success: false,
                        error: Some(e.to_string()),
                    },
                }
            }
            None => ReleaseResultPayload {
                success: false,
                error: Some(format!("no spawned agent named '{name}'")),
            },
        };
        self.router.clear_spawning(&name);

        let envelope = Envelope::new(Body::ReleaseResult { payload: result })
            .with_from(SYSTEM_SENDER)
            .with_to(caller.name.clone());
        if let Err(e) = caller.send(envelope).await {
            warn!(caller = %caller.name, error = %e, "release result send failed");
        }
    }

    /// Kill every remaining child on daemon shutdown.
    pub async fn shutdown(&self) {
        let mut children = self.children.lock().await;
        for (name, child) in children.iter_mut() {
            if let Err(e) = child.start_kill() {
                warn!(name = %name, error = %e, "shutdown kill failed");
            }
        }
        for (_, mut child) in children.drain() {
            let _ = child.wait().await;
        }
    }

    pub async fn running_count(&self) -> usize {
        self.children.lock().await.len()
    }

    async fn reply_spawn(&self, caller: &Arc<ConnectionHandle>, result: SpawnResultPayload) {
        let envelope = Envelope::new(Body::SpawnResult { payload: result })
            .with_from(SYSTEM_SENDER)
            .with_to(caller.name.clone());
        if let Err(e) = caller.send(envelope).await {
            warn!(caller = %caller.name, error = %e, "spawn result send failed");
        }
    }
}
