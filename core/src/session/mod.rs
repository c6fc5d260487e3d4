//! One debugger subprocess and the protocol state around it.

mod channel;
pub mod events;
mod guard;
mod prompt;
mod state;
pub mod target;
pub(crate) mod transcript;

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::io::ErrorKind;
#[cfg(unix)]
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::DebugError;
use crate::error::Result;

use channel::ChannelError;
use channel::CommandChannel;
use channel::InputWriter;
use channel::OUTPUT_CHANNEL_CAPACITY;
use channel::spawn_pump;
use events::EventPublisher;
use events::SessionEvent;
use events::SessionEventKind;
use prompt::PromptMarker;
use state::StateCell;
use target::LaunchRequest;
use target::ensure_process_exists;
use transcript::first_error_line;
use transcript::parse_exit;
use transcript::parse_process_pid;

pub use guard::GuardOutcome;
pub use guard::TimeoutGuard;
pub use state::SessionState;

const STARTUP_COMMAND_LABEL: &str = "<startup>";

/// Snapshot of a session for listings and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub pid: Option<u32>,
    pub alias: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// A live debugger subprocess bound to one target process.
///
/// Commands are strictly serialized: a second command while one is in
/// flight fails with [`DebugError::SessionBusy`] instead of queueing. A
/// command that misses its deadline leaves the session
/// [`SessionState::Poisoned`] and every later command fails fast; the
/// registry replaces poisoned sessions on the next lookup.
pub struct DebugSession {
    session_id: Uuid,
    pid: OnceLock<u32>,
    alias: Option<String>,
    state: Arc<StateCell>,
    channel: CommandChannel,
    command_timeout: Duration,
    startup_timeout: Duration,
    detach_timeout: Duration,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    publisher: EventPublisher,
    kill: Arc<KillSwitch>,
}

/// Asks the supervisor task to kill the debugger. Only the first trip
/// counts.
#[derive(Debug)]
struct KillSwitch(StdMutex<Option<oneshot::Sender<()>>>);

impl KillSwitch {
    fn new(sender: oneshot::Sender<()>) -> Self {
        Self(StdMutex::new(Some(sender)))
    }

    fn trip(&self) {
        let sender = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("session_id", &self.session_id)
            .field("pid", &self.pid.get())
            .field("alias", &self.alias)
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

impl DebugSession {
    /// Attaches a fresh debugger to the running process `pid`.
    pub async fn attach(
        config: &Config,
        pid: u32,
        alias: Option<String>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Result<Arc<Self>> {
        ensure_process_exists(pid)?;
        let session = Arc::new(
            Self::spawn(config, alias, events).map_err(|reason| DebugError::attach(pid, reason))?,
        );
        let timeout = session.startup_timeout;

        session
            .exchange(None, timeout)
            .await
            .map_err(|err| DebugError::attach(pid, startup_reason(&err)))?;
        let output = session
            .exchange(Some(&format!("process attach --pid {pid}")), timeout)
            .await
            .map_err(|err| DebugError::attach(pid, startup_reason(&err)))?;
        if let Some(line) = first_error_line(&output) {
            session.kill();
            return Err(DebugError::attach(pid, line));
        }

        let _ = session.pid.set(pid);
        info!(session_id = %session.session_id, pid, "attached debugger");
        Ok(session)
    }

    /// Starts `request.executable` under a fresh debugger. The target is
    /// always halted at entry first so its pid is known; it is resumed
    /// afterwards unless the request asks to stay stopped.
    pub async fn launch(
        config: &Config,
        request: &LaunchRequest,
        events: broadcast::Sender<SessionEvent>,
    ) -> Result<Arc<Self>> {
        let executable = request.executable.display().to_string();
        let fail = |reason: String| DebugError::launch(executable.clone(), reason);
        if executable.is_empty() {
            return Err(fail("executable path is empty".to_string()));
        }

        let create = format!("target create {}", quote(&executable).map_err(&fail)?);
        let env_vars = request
            .env
            .iter()
            .map(|(key, value)| quote(&format!("{key}={value}")))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(&fail)?;
        let args = request
            .args
            .iter()
            .map(|arg| quote(arg))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(&fail)?;

        let session = Arc::new(Self::spawn(config, request.bundle_id.clone(), events).map_err(&fail)?);
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(session.startup_timeout);
        let step = |command: Option<String>| {
            let session = Arc::clone(&session);
            async move {
                let output = session
                    .exchange(command.as_deref(), timeout)
                    .await
                    .map_err(|err| startup_reason(&err))?;
                match first_error_line(&output) {
                    Some(line) => Err(line.to_string()),
                    None => Ok(output),
                }
            }
        };

        step(None).await.map_err(&fail)?;
        step(Some(create)).await.map_err(&fail)?;
        if !env_vars.is_empty() {
            step(Some(format!("settings set target.env-vars {}", env_vars.join(" "))))
                .await
                .map_err(&fail)?;
        }
        let mut launch = "process launch --stop-at-entry".to_string();
        if !args.is_empty() {
            launch.push_str(" -- ");
            launch.push_str(&args.join(" "));
        }
        let output = step(Some(launch)).await.map_err(&fail)?;
        let Some(pid) = parse_process_pid(&output) else {
            return Err(fail(
                "debugger did not report the pid of the launched process".to_string(),
            ));
        };
        let _ = session.pid.set(pid);

        if !request.stop_at_entry {
            session
                .send_no_wait("process continue")
                .await
                .map_err(|err| fail(err.to_string()))?;
        }
        info!(
            session_id = %session.session_id,
            pid,
            executable = %executable,
            stop_at_entry = request.stop_at_entry,
            "launched target under debugger"
        );
        Ok(session)
    }

    fn spawn(
        config: &Config,
        alias: Option<String>,
        events: broadcast::Sender<SessionEvent>,
    ) -> std::result::Result<Self, String> {
        let debugger = config.debugger_path.display().to_string();
        let (stdout, stderr, output) = merged_output()
            .map_err(|err| format!("failed to create output pipe for {debugger}: {err}"))?;
        let mut child = Command::new(&config.debugger_path)
            .args(&config.debugger_args)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| format!("failed to start debugger {debugger}: {err}"))?;
        let Some(stdin) = child.stdin.take() else {
            return Err(format!("debugger {debugger} started without piped stdin"));
        };

        let session_id = Uuid::new_v4();
        let publisher = EventPublisher::new(session_id, events);
        let state = Arc::new(StateCell::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let kill = Arc::new(KillSwitch::new(kill_tx));
        let (chunks_tx, chunks_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let exit_observer = {
            let state = Arc::clone(&state);
            let publisher = publisher.clone();
            let kill = Arc::clone(&kill);
            let prompt = config.prompt.clone();
            move |line: &str| {
                let mut line = line;
                while let Some(rest) = line.strip_prefix(prompt.as_str()) {
                    line = rest;
                }
                if let Some((pid, status)) = parse_exit(line) {
                    info!(%session_id, pid, status, "target process exited");
                    publisher.emit(SessionEventKind::TargetExited { pid, status });
                    mark_terminated(
                        &state,
                        &publisher,
                        format!("target exited with status {status}"),
                    );
                    kill.trip();
                }
            }
        };
        spawn_pump(output, "output", chunks_tx, exit_observer);

        {
            let state = Arc::clone(&state);
            let publisher = publisher.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = kill_rx => None,
                };
                let reason = match status {
                    Some(Ok(status)) => format!("debugger exited with {status}"),
                    Some(Err(err)) => format!("failed to wait for debugger: {err}"),
                    None => {
                        if let Err(err) = child.kill().await {
                            warn!(%session_id, "failed to kill debugger: {err}");
                        }
                        "debugger killed".to_string()
                    }
                };
                mark_terminated(&state, &publisher, reason);
            });
        }

        debug!(%session_id, debugger = %debugger, "spawned debugger");
        Ok(Self::assemble(
            config,
            alias,
            Box::new(stdin),
            chunks_rx,
            state,
            publisher,
            kill,
        ))
    }

    fn assemble(
        config: &Config,
        alias: Option<String>,
        input: InputWriter,
        output: mpsc::Receiver<Vec<u8>>,
        state: Arc<StateCell>,
        publisher: EventPublisher,
        kill: Arc<KillSwitch>,
    ) -> Self {
        let channel = CommandChannel::new(
            input,
            output,
            PromptMarker::new(&config.prompt),
            publisher.clone(),
        );
        let now = Utc::now();
        Self {
            session_id: publisher.session_id(),
            pid: OnceLock::new(),
            alias,
            state,
            channel,
            command_timeout: config.command_timeout(),
            startup_timeout: config.startup_timeout(),
            detach_timeout: config.detach_timeout(),
            created_at: now,
            last_activity: Mutex::new(now),
            publisher,
            kill,
        }
    }

    /// Sends `command` and returns its output, bounded by the configured
    /// command deadline.
    pub async fn send(&self, command: &str) -> Result<String> {
        self.send_with_timeout(command, self.command_timeout).await
    }

    pub async fn send_with_timeout(&self, command: &str, timeout: Duration) -> Result<String> {
        self.exchange(Some(command), timeout).await
    }

    /// Writes `command` without waiting for its output. Whatever it prints
    /// is published as unsolicited output.
    pub async fn send_no_wait(&self, command: &str) -> Result<()> {
        validate_command(command)?;
        self.begin()?;
        let pending = PendingCommand::new(self, command);
        let result = self.channel.send_no_wait(command).await;
        pending.disarm();
        self.settle(command, self.command_timeout, result).await
    }

    /// Releases the target and ends the debugger. Never fails.
    pub async fn detach(&self) {
        if self.state.load() == SessionState::Idle {
            match self.exchange(Some("process detach"), self.detach_timeout).await {
                Ok(output) => debug!(session_id = %self.session_id, output = %output.trim_end(), "detached from target"),
                Err(err) => debug!(session_id = %self.session_id, "process detach failed: {err}"),
            }
        }
        if self.state.load() == SessionState::Idle
            && let Err(err) = self.send_no_wait("quit").await
        {
            debug!(session_id = %self.session_id, "quit failed: {err}");
        }
        self.channel.close_input().await;
        self.stop("detached".to_string());
    }

    /// Ends the debugger immediately.
    pub fn kill(&self) {
        self.stop("killed".to_string());
    }

    pub fn id(&self) -> Uuid {
        self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    pub fn is_usable(&self) -> bool {
        self.state().is_usable()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().await
    }

    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id,
            pid: self.pid(),
            alias: self.alias.clone(),
            state: self.state(),
            created_at: self.created_at,
            last_activity: self.last_activity().await,
        }
    }

    /// Human-readable name of the target for error messages.
    pub fn target(&self) -> String {
        match (self.pid(), self.alias.as_deref()) {
            (Some(pid), Some(alias)) => format!("{alias} (pid {pid})"),
            (Some(pid), None) => format!("pid {pid}"),
            (None, _) => format!("session {}", self.session_id),
        }
    }

    /// One synchronous exchange. `None` waits for a prompt without writing,
    /// which is how the startup banner is consumed.
    async fn exchange(&self, command: Option<&str>, timeout: Duration) -> Result<String> {
        if let Some(command) = command {
            validate_command(command)?;
        }
        self.begin()?;

        let label = command.unwrap_or(STARTUP_COMMAND_LABEL);
        let pending = PendingCommand::new(self, label);
        let on_expire = {
            let state = Arc::clone(&self.state);
            let publisher = self.publisher.clone();
            let command = label.to_string();
            move || mark_poisoned(&state, &publisher, &command, "command timed out")
        };
        let guard = TimeoutGuard::new(timeout);
        let result = match command {
            Some(command) => self.channel.send(command, guard, on_expire).await,
            None => self.channel.await_prompt(guard, on_expire).await,
        };
        pending.disarm();
        self.settle(label, timeout, result).await
    }

    fn begin(&self) -> Result<()> {
        self.state.try_begin().map_err(|state| match state {
            SessionState::Idle | SessionState::Busy => DebugError::SessionBusy {
                target: self.target(),
            },
            SessionState::Poisoned => DebugError::SessionPoisoned {
                target: self.target(),
            },
            SessionState::Terminated => DebugError::ProcessExited {
                target: self.target(),
                partial_output: String::new(),
            },
        })
    }

    /// Maps a channel result onto the state machine and the public error
    /// kinds. Every state transition happens before the first await.
    async fn settle<T>(
        &self,
        command: &str,
        timeout: Duration,
        result: std::result::Result<T, ChannelError>,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                self.state.finish();
                *self.last_activity.lock().await = Utc::now();
                Ok(value)
            }
            Err(ChannelError::TimedOut { partial }) => Err(DebugError::CommandTimeout {
                target: self.target(),
                command: command.to_string(),
                timeout,
                partial_output: partial,
            }),
            Err(ChannelError::Closed { partial }) => {
                mark_terminated(
                    &self.state,
                    &self.publisher,
                    "debugger output closed".to_string(),
                );
                Err(DebugError::ProcessExited {
                    target: self.target(),
                    partial_output: partial,
                })
            }
            Err(ChannelError::Write(err))
                if err.kind() == ErrorKind::BrokenPipe
                    || self.state.load() == SessionState::Terminated =>
            {
                mark_terminated(
                    &self.state,
                    &self.publisher,
                    "debugger input closed".to_string(),
                );
                Err(DebugError::ProcessExited {
                    target: self.target(),
                    partial_output: String::new(),
                })
            }
            Err(ChannelError::Write(source)) => {
                // Part of the line may have reached the debugger.
                mark_poisoned(
                    &self.state,
                    &self.publisher,
                    command,
                    "failed to write command",
                );
                Err(DebugError::Io {
                    target: self.target(),
                    source,
                })
            }
        }
    }

    fn stop(&self, reason: String) {
        mark_terminated(&self.state, &self.publisher, reason);
        self.kill.trip();
    }
}

/// Poisons the session when the caller drops a command before it settles,
/// for example when an outer timeout cancels the future. The debugger may
/// still answer the abandoned command.
struct PendingCommand<'a> {
    session: &'a DebugSession,
    command: &'a str,
    armed: bool,
}

impl<'a> PendingCommand<'a> {
    fn new(session: &'a DebugSession, command: &'a str) -> Self {
        Self {
            session,
            command,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCommand<'_> {
    fn drop(&mut self) {
        if self.armed {
            mark_poisoned(
                &self.session.state,
                &self.session.publisher,
                self.command,
                "command abandoned by its caller",
            );
        }
    }
}

fn mark_poisoned(state: &StateCell, publisher: &EventPublisher, command: &str, reason: &str) {
    if state.poison() {
        warn!(
            session_id = %publisher.session_id(),
            command,
            "{reason}; session poisoned"
        );
        publisher.emit(SessionEventKind::Poisoned {
            command: command.to_string(),
        });
    }
}

fn mark_terminated(state: &StateCell, publisher: &EventPublisher, reason: String) {
    if state.terminate() {
        info!(session_id = %publisher.session_id(), reason = %reason, "debug session terminated");
        publisher.emit(SessionEventKind::Terminated { reason });
    }
}

/// One pipe behind both stdout and stderr, so `error:` lines keep their
/// place relative to the prompt that follows them.
#[cfg(unix)]
fn merged_output() -> io::Result<(Stdio, Stdio, tokio::net::unix::pipe::Receiver)> {
    let (reader, writer) = os_pipe::pipe()?;
    let stderr = writer.try_clone()?;
    let reader = tokio::net::unix::pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
    Ok((Stdio::from(writer), Stdio::from(stderr), reader))
}

#[cfg(not(unix))]
fn merged_output() -> io::Result<(Stdio, Stdio, tokio::io::Empty)> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "merged debugger output needs unix pipes",
    ))
}

/// Rejects commands that would desynchronize the prompt framing.
pub(crate) fn validate_command(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(DebugError::invalid_command("command is empty"));
    }
    if command.contains(['\n', '\r']) {
        return Err(DebugError::invalid_command(
            "command must be a single line",
        ));
    }
    Ok(())
}

fn quote(value: &str) -> std::result::Result<String, String> {
    shlex::try_quote(value)
        .map(Cow::into_owned)
        .map_err(|err| format!("cannot quote `{value}`: {err}"))
}

fn startup_reason(err: &DebugError) -> String {
    match err {
        DebugError::CommandTimeout { timeout, .. } => format!(
            "debugger did not respond within {}ms",
            timeout.as_millis()
        ),
        DebugError::ProcessExited { partial_output, .. } if !partial_output.trim().is_empty() => {
            format!("debugger exited: {}", partial_output.trim())
        }
        DebugError::ProcessExited { .. } => "debugger exited".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::pin::Pin;
    use std::task::Context;
    use std::task::Poll;
    use tokio::io::AsyncWrite;
    use tokio::time::sleep;
    use tokio::time::timeout;

    /// A session wired to in-memory streams instead of a debugger process.
    fn in_memory_session(
        input: InputWriter,
    ) -> (
        DebugSession,
        mpsc::Sender<Vec<u8>>,
        broadcast::Receiver<SessionEvent>,
    ) {
        let (events_tx, events) = broadcast::channel(16);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (kill_tx, _kill_rx) = oneshot::channel();
        let session = DebugSession::assemble(
            &Config::default(),
            None,
            input,
            output_rx,
            Arc::new(StateCell::new()),
            EventPublisher::new(Uuid::new_v4(), events_tx),
            Arc::new(KillSwitch::new(kill_tx)),
        );
        (session, output_tx, events)
    }

    struct RefusingWriter;

    impl AsyncWrite for RefusingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other("device is full")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_write_poisons_instead_of_going_idle() {
        let (session, _output, mut events) = in_memory_session(Box::new(RefusingWriter));

        assert_matches!(
            session.send("thread list").await,
            Err(DebugError::Io { .. })
        );
        assert_eq!(session.state(), SessionState::Poisoned);
        assert_matches!(
            session.send("thread list").await,
            Err(DebugError::SessionPoisoned { .. })
        );
        assert_eq!(
            events.recv().await.expect("event").kind,
            SessionEventKind::Poisoned {
                command: "thread list".to_string()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_command_future_poisons_the_session() {
        let (input, _debugger_stdin) = tokio::io::duplex(1024);
        let (session, output, mut events) = in_memory_session(Box::new(input));

        let abandoned = timeout(
            Duration::from_millis(50),
            session.send_with_timeout("thread list", Duration::from_secs(30)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(session.state(), SessionState::Poisoned);
        assert!(!session.is_usable());

        // The answer to the abandoned command arrives late and changes nothing.
        output
            .send(b"* thread #1\n(lldb) ".to_vec())
            .await
            .expect("late output");
        sleep(Duration::from_millis(50)).await;
        assert_eq!(session.state(), SessionState::Poisoned);
        assert_eq!(
            events.recv().await.expect("event").kind,
            SessionEventKind::Poisoned {
                command: "thread list".to_string()
            }
        );
    }

    #[test]
    fn multi_line_commands_are_rejected() {
        assert_matches!(
            validate_command("breakpoint set -n main\nprocess kill"),
            Err(DebugError::InvalidCommand { .. })
        );
        assert_matches!(validate_command("   "), Err(DebugError::InvalidCommand { .. }));
        assert!(validate_command("thread list").is_ok());
    }

    #[test]
    fn quoting_keeps_spaces_together() {
        assert_eq!(quote("/tmp/my app").expect("quote"), "'/tmp/my app'");
        assert_eq!(quote("plain").expect("quote"), "plain");
        assert!(quote("nul\0byte").is_err());
    }

    #[test]
    fn startup_timeout_reason_names_deadline() {
        let err = DebugError::CommandTimeout {
            target: "pid 1".to_string(),
            command: STARTUP_COMMAND_LABEL.to_string(),
            timeout: Duration::from_millis(250),
            partial_output: String::new(),
        };
        assert_eq!(startup_reason(&err), "debugger did not respond within 250ms");
    }
}
