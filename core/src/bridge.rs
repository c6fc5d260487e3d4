use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;
use tracing::warn;

use crate::config::Config;
use crate::defaults::DefaultsStore;
use crate::defaults::TargetDefaults;
use crate::error::Result;
use crate::ops::DebugOperation;
use crate::ops::Dispatch;
use crate::ops::OperationResult;
use crate::registry::SessionKey;
use crate::registry::SessionRegistry;
use crate::session::DebugSession;
use crate::session::SessionInfo;
use crate::session::events::SessionEvent;
use crate::session::target::DebugTarget;

/// Entry point for callers: opens targets, runs operations against them and
/// tears them down.
#[derive(Debug)]
pub struct DebugBridge {
    registry: SessionRegistry,
    defaults: Option<StdMutex<DefaultsStore>>,
}

impl DebugBridge {
    pub fn new(config: Config) -> Self {
        let defaults = config
            .resolved_defaults_path()
            .map(|path| StdMutex::new(DefaultsStore::new(path)));
        Self {
            registry: SessionRegistry::new(config),
            defaults,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Attaches to or launches `target` and remembers it as the default.
    pub async fn open(&self, target: &DebugTarget) -> Result<SessionInfo> {
        let session = self.registry.open(target).await?;
        if let Some(pid) = session.pid() {
            self.record_default(pid, target.bundle_id());
        }
        Ok(session.info().await)
    }

    /// The usable session for `key`, attaching when necessary.
    pub async fn session(&self, key: &SessionKey) -> Result<Arc<DebugSession>> {
        self.registry.get_or_create(key).await
    }

    /// Runs `operation` against the session for `key`. `timeout` overrides
    /// the configured command deadline.
    pub async fn execute(
        &self,
        key: &SessionKey,
        operation: &DebugOperation,
        timeout: Option<Duration>,
    ) -> Result<OperationResult> {
        let command = operation.to_command()?;
        let session = self.registry.get_or_create(key).await?;
        debug!(key = %key, command = %command, "executing operation");
        match operation.dispatch() {
            Dispatch::FireAndForget => {
                session.send_no_wait(&command).await?;
                Ok(OperationResult::dispatched())
            }
            Dispatch::Wait => {
                let output = match timeout {
                    Some(timeout) => session.send_with_timeout(&command, timeout).await?,
                    None => session.send(&command).await?,
                };
                Ok(OperationResult::from_output(output))
            }
        }
    }

    /// Always succeeds; returns whether a session was torn down.
    pub async fn detach(&self, key: &SessionKey) -> Result<bool> {
        self.registry.detach(key).await
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.list().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.registry.subscribe_events()
    }

    pub fn defaults(&self) -> Option<TargetDefaults> {
        let store = self.defaults.as_ref()?;
        let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
        Some(store.current().clone())
    }

    /// Key for the most recently opened target, preferring its symbolic
    /// name when that name still resolves.
    pub async fn default_key(&self) -> Option<SessionKey> {
        let defaults = self.defaults()?;
        if let Some(bundle_id) = defaults.last_bundle_id
            && self.registry.resolve(&bundle_id).await.is_ok()
        {
            return Some(SessionKey::Symbolic(bundle_id));
        }
        defaults.last_pid.map(SessionKey::Pid)
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }

    fn record_default(&self, pid: u32, bundle_id: Option<&str>) {
        let Some(store) = self.defaults.as_ref() else {
            return;
        };
        let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = store.record(pid, bundle_id) {
            warn!("failed to record target defaults: {err}");
        }
    }
}
