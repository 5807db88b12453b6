//! Process-scoped registry of named sessions.
//!
//! The registry is an explicit object with explicit shutdown, handed by
//! reference to whatever dispatch layer sits above it. It is never
//! ambient global state.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use log::{info, warn};
use tokio::sync::RwLock;

use super::executor::CommandOutcome;
use super::{Session, SessionConfig, SessionInfo};
use crate::error::{Result, SessionError};
use crate::history::MonitorStream;

/// Named sessions, in creation order.
///
/// All methods take `&self`; the registry is cheap to share behind an
/// `Arc` with a dispatch layer.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<IndexMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and register it under `name`.
    ///
    /// The session is inserted only once it reaches `Ready`, so a name
    /// listed by [`list`](Self::list) is always usable.
    pub async fn connect(&self, name: impl Into<String>, config: SessionConfig) -> Result<SessionInfo> {
        let name = name.into();

        if self.sessions.read().await.contains_key(&name) {
            return Err(SessionError::NameInUse { name }.into());
        }

        let session = Session::connect(name.clone(), config).await?;

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&name) {
            // Lost a connect race for the same name.
            drop(sessions);
            session.close().await.ok();
            return Err(SessionError::NameInUse { name }.into());
        }
        let session_info = session.info();
        sessions.insert(name.clone(), session);
        info!("registered session '{}'", name);
        Ok(session_info)
    }

    /// Execute a command on a named session.
    pub async fn exec(
        &self,
        name: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutcome> {
        let session = self.get(name).await.ok_or_else(|| SessionError::NotFound {
            name: name.to_string(),
        })?;
        session.exec(command, timeout).await
    }

    /// Look up a session by name.
    pub async fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Snapshot of all sessions, in creation order.
    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().map(|s| s.info()).collect()
    }

    /// Attach an observer to a named session: full replay, then live.
    pub async fn attach_monitor(&self, name: &str) -> Result<MonitorStream> {
        let session = self.get(name).await.ok_or_else(|| SessionError::NotFound {
            name: name.to_string(),
        })?;
        Ok(session.attach())
    }

    /// Close a named session and remove it from the registry.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .shift_remove(name)
            .ok_or_else(|| SessionError::NotFound {
                name: name.to_string(),
            })?;
        session.close().await?;
        info!("disconnected session '{}'", name);
        Ok(())
    }

    /// Close every session and empty the registry.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, Arc<Session>)> =
            self.sessions.write().await.drain(..).collect();
        for (name, session) in sessions {
            if let Err(e) = session.close().await {
                warn!("error closing session '{}': {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_empty_registry_lists_nothing() {
        let registry = SessionRegistry::new();
        assert!(registry.list().await.is_empty());
        assert!(registry.get("web-1").await.is_none());
    }

    #[tokio::test]
    async fn test_exec_on_unknown_session_is_not_found() {
        let registry = SessionRegistry::new();
        match registry.exec("web-1", "pwd", None).await {
            Err(Error::Session(SessionError::NotFound { name })) => assert_eq!(name, "web-1"),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnect_unknown_session_is_not_found() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.disconnect("web-1").await,
            Err(Error::Session(SessionError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_attach_monitor_unknown_session_is_not_found() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.attach_monitor("web-1").await,
            Err(Error::Session(SessionError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_on_empty_registry_is_a_no_op() {
        let registry = SessionRegistry::new();
        registry.shutdown().await;
        assert!(registry.list().await.is_empty());
    }
}
