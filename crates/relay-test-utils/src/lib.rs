// relay-test-utils: Shared test utilities for the broker suite.
//
// Provides a mock framed-socket agent client and scratch-directory helpers
// for integration testing of the daemon.

pub mod mock_agent;

pub use mock_agent::MockAgent;

use std::path::PathBuf;
use std::time::Duration;

/// Poll `cond` every 10 ms until it holds or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// A scratch relay root (outbox/archive/meta dirs) that cleans up on drop.
pub struct ScratchRoot {
    dir: tempfile::TempDir,
}

impl ScratchRoot {
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        for sub in ["outbox", "archive", "meta", "attachments"] {
            std::fs::create_dir_all(dir.path().join(sub))?;
        }
        Ok(ScratchRoot { dir })
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.path().join("relay.sock")
    }

    pub fn outbox(&self) -> PathBuf {
        self.dir.path().join("outbox")
    }

    /// Write an outbox file for `agent` with the given type and content.
    pub fn write_outbox_file(
        &self,
        agent: &str,
        message_type: &str,
        content: &str,
    ) -> std::io::Result<PathBuf> {
        let dir = self.outbox().join(agent);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(message_type);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}
