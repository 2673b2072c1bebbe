//! Registry of live terminal sessions.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tracing::info;
use workspace_engine_core::{AgentId, ContainerRuntime, EngineConfig, SessionResolver, runtime_from_config};
use workspace_engine_pty::{TerminalError, TerminalId, TerminalOptions, TerminalSession, TerminalState};

/// Terminal manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("Terminal not found: {0}")]
    NotFound(TerminalId),
}

/// Creates terminal sessions for agents and tracks them until terminated.
pub struct TerminalManager {
    runtime: Arc<dyn ContainerRuntime>,
    resolver: SessionResolver,
    defaults: TerminalOptions,
    sessions: RwLock<HashMap<TerminalId, Arc<TerminalSession>>>,
}

impl TerminalManager {
    /// Create a new terminal manager.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, resolver: SessionResolver, defaults: TerminalOptions) -> Self {
        Self {
            runtime,
            resolver,
            defaults,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            runtime_from_config(config),
            config.resolver(),
            TerminalOptions::from_config(&config.terminal),
        )
    }

    /// Start a terminal in `agent`'s container.
    ///
    /// A zero `cols` or `rows` keeps the default size.
    ///
    /// # Errors
    /// Returns error if the container is unavailable or the session cannot start.
    pub async fn create(
        &self,
        agent: &AgentId,
        cols: u16,
        rows: u16,
        initial_command: Option<String>,
    ) -> Result<Arc<TerminalSession>, ManagerError> {
        let container = self.resolver.resolve(agent);
        let mut options = self.defaults.clone().with_initial_command(initial_command);
        if cols > 0 && rows > 0 {
            options = options.with_size(cols, rows);
        }

        let session = Arc::new(
            TerminalSession::spawn(Arc::clone(&self.runtime), agent.clone(), container, options).await?,
        );
        self.sessions
            .write()
            .await
            .insert(session.id(), Arc::clone(&session));
        Ok(session)
    }

    /// Get a session by ID.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn get(&self, id: TerminalId) -> Result<Arc<TerminalSession>, ManagerError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ManagerError::NotFound(id))
    }

    /// Sessions belonging to `agent`, exited ones included until pruned.
    pub async fn list_for_agent(&self, agent: &AgentId) -> Vec<Arc<TerminalSession>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.agent() == agent)
            .cloned()
            .collect()
    }

    /// Terminate a session and forget it.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn terminate(&self, id: TerminalId) -> Result<(), ManagerError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or(ManagerError::NotFound(id))?;
        session.terminate();
        Ok(())
    }

    /// Terminate every session. Returns how many there were.
    pub async fn terminate_all(&self) -> usize {
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.terminate();
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Terminated all terminal sessions");
        }
        sessions.len()
    }

    /// Forget sessions that have exited. Returns how many were removed.
    pub async fn prune_exited(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.state() != TerminalState::Exited);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
