use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;

use crate::config::Config;
use crate::error::DebugError;
use crate::error::Result;
use crate::session::DebugSession;
use crate::session::SessionInfo;
use crate::session::SessionState;
use crate::session::events::SessionEvent;
use crate::session::target::DebugTarget;

const SESSION_EVENT_CAPACITY: usize = 256;

/// How callers name a debug target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Pid(u32),
    /// A symbolic name such as a bundle identifier, resolved to a pid
    /// through the alias table.
    Symbolic(String),
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Pid(pid) => write!(f, "pid {pid}"),
            SessionKey::Symbolic(name) => write!(f, "bundle {name}"),
        }
    }
}

impl From<u32> for SessionKey {
    fn from(pid: u32) -> Self {
        SessionKey::Pid(pid)
    }
}

impl FromStr for SessionKey {
    type Err = DebugError;

    /// Numbers are pids; anything else is a symbolic name.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DebugError::invalid_command("session key is empty"));
        }
        Ok(match s.parse::<u32>() {
            Ok(pid) => SessionKey::Pid(pid),
            Err(_) => SessionKey::Symbolic(s.to_string()),
        })
    }
}

/// Per-pid cell. Holding its lock serializes creation for that pid while
/// unrelated pids proceed in parallel. Cells are emptied, never removed, so
/// every caller for a pid contends on the same lock.
type SessionSlot = Arc<Mutex<Option<Arc<DebugSession>>>>;

/// Owns every live [`DebugSession`], at most one per target pid.
#[derive(Debug)]
pub struct SessionRegistry {
    config: Config,
    sessions: Mutex<HashMap<u32, SessionSlot>>,
    aliases: Mutex<HashMap<String, u32>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(config: Config) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            aliases: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Returns the usable session for `key`, attaching a new debugger when
    /// there is none or the previous one was poisoned or has terminated.
    pub async fn get_or_create(&self, key: &SessionKey) -> Result<Arc<DebugSession>> {
        let pid = self.resolve_key(key).await?;
        let slot = self.slot(pid).await;
        let mut current = slot.lock().await;

        if let Some(existing) = current.as_ref() {
            if existing.is_usable() {
                return Ok(Arc::clone(existing));
            }
            info!(
                pid,
                session_id = %existing.id(),
                state = %existing.state(),
                "replacing unusable debug session"
            );
            existing.kill();
            *current = None;
        }

        let alias = match key {
            SessionKey::Symbolic(name) => Some(name.clone()),
            SessionKey::Pid(_) => None,
        };
        let session = DebugSession::attach(&self.config, pid, alias, self.events.clone()).await?;
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// The current session for `key`, if one has been created. The session
    /// may be unusable.
    pub async fn get(&self, key: &SessionKey) -> Result<Option<Arc<DebugSession>>> {
        let pid = self.resolve_key(key).await?;
        let slot = self.sessions.lock().await.get(&pid).cloned();
        let Some(slot) = slot else {
            return Ok(None);
        };
        Ok(slot.lock().await.clone())
    }

    /// Creates a session for `target` and registers it by pid, recording the
    /// target's symbolic name when it has one.
    pub async fn open(&self, target: &DebugTarget) -> Result<Arc<DebugSession>> {
        let session = match target {
            DebugTarget::Attach { pid, bundle_id } => {
                let pid = *pid;
                let slot = self.slot(pid).await;
                let mut current = slot.lock().await;
                if let Some(existing) = current.as_ref() {
                    if existing.is_usable() {
                        return Err(DebugError::attach(
                            pid,
                            format!("already attached by session {}", existing.id()),
                        ));
                    }
                    existing.kill();
                    *current = None;
                }
                let session =
                    DebugSession::attach(&self.config, pid, bundle_id.clone(), self.events.clone())
                        .await?;
                *current = Some(Arc::clone(&session));
                session
            }
            DebugTarget::Launch(request) => {
                let session =
                    DebugSession::launch(&self.config, request, self.events.clone()).await?;
                let Some(pid) = session.pid() else {
                    session.kill();
                    return Err(DebugError::launch(
                        request.executable.display().to_string(),
                        "launched process has no pid",
                    ));
                };
                let slot = self.slot(pid).await;
                let mut current = slot.lock().await;
                if let Some(existing) = current.as_ref() {
                    if existing.is_usable() {
                        session.kill();
                        return Err(DebugError::launch(
                            request.executable.display().to_string(),
                            format!("pid {pid} is already owned by session {}", existing.id()),
                        ));
                    }
                    existing.kill();
                }
                *current = Some(Arc::clone(&session));
                session
            }
        };

        if let (Some(bundle_id), Some(pid)) = (target.bundle_id(), session.pid()) {
            self.register_alias(bundle_id, pid).await;
        }
        Ok(session)
    }

    pub async fn register_alias(&self, symbolic_id: &str, pid: u32) {
        let previous = self
            .aliases
            .lock()
            .await
            .insert(symbolic_id.to_string(), pid);
        if previous != Some(pid) {
            debug!(symbolic_id, pid, ?previous, "registered alias");
        }
    }

    pub async fn resolve(&self, symbolic_id: &str) -> Result<u32> {
        self.aliases
            .lock()
            .await
            .get(symbolic_id)
            .copied()
            .ok_or_else(|| DebugError::UnknownIdentifier {
                identifier: symbolic_id.to_string(),
            })
    }

    /// Tears down the session for `key`. Returns whether there was one.
    pub async fn detach(&self, key: &SessionKey) -> Result<bool> {
        let pid = match self.resolve_key(key).await {
            Ok(pid) => pid,
            Err(DebugError::UnknownIdentifier { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };
        let slot = self.sessions.lock().await.get(&pid).cloned();
        let Some(slot) = slot else {
            return Ok(false);
        };
        // No new session for this pid until the old debugger has let go.
        let mut current = slot.lock().await;
        let Some(session) = current.take() else {
            return Ok(false);
        };
        session.detach().await;
        info!(pid, session_id = %session.id(), "detached debug session");
        Ok(true)
    }

    /// Snapshots every session, dropping the ones that have terminated.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let slots: Vec<SessionSlot> = self.sessions.lock().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut current = slot.lock().await;
            let Some(session) = current.as_ref() else {
                continue;
            };
            if session.state() == SessionState::Terminated {
                debug!(session_id = %session.id(), "reaping terminated session");
                session.kill();
                *current = None;
                continue;
            }
            infos.push(session.info().await);
        }
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Detaches every session.
    pub async fn shutdown_all(&self) {
        let slots: Vec<SessionSlot> = self.sessions.lock().await.values().cloned().collect();
        for slot in slots {
            let mut current = slot.lock().await;
            if let Some(session) = current.take() {
                session.detach().await;
            }
        }
    }

    async fn resolve_key(&self, key: &SessionKey) -> Result<u32> {
        match key {
            SessionKey::Pid(pid) => Ok(*pid),
            SessionKey::Symbolic(name) => self.resolve(name).await,
        }
    }

    async fn slot(&self, pid: u32) -> SessionSlot {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(sessions.entry(pid).or_default())
    }
}
