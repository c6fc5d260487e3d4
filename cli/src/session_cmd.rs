use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use dbg_bridge_core::Config;
use dbg_bridge_core::DebugBridge;
use dbg_bridge_core::DebugError;
use dbg_bridge_core::DebugSession;
use dbg_bridge_core::DebugTarget;
use dbg_bridge_core::LaunchRequest;
use dbg_bridge_core::SessionEvent;
use dbg_bridge_core::SessionEventKind;
use dbg_bridge_core::SessionKey;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Parser)]
pub struct AttachCli {
    /// Pid of the running process to attach to.
    #[arg(long = "pid")]
    pid: u32,

    /// Symbolic name to remember for this pid.
    #[arg(long = "bundle-id", value_name = "ID")]
    bundle_id: Option<String>,
}

#[derive(Debug, Parser)]
pub struct LaunchCli {
    /// Executable to launch.
    #[arg(value_name = "PATH")]
    executable: PathBuf,

    /// Keep the target halted at its entry point.
    #[arg(long = "stop-at-entry", default_value_t = false)]
    stop_at_entry: bool,

    /// Symbolic name to remember for the launched pid.
    #[arg(long = "bundle-id", value_name = "ID")]
    bundle_id: Option<String>,

    /// Environment overrides for the target.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Arguments passed to the target, after `--`.
    #[arg(last = true)]
    args: Vec<String>,
}

/// One line typed at the interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Send and print the response.
    Command(String),
    /// Send without waiting; output shows up as an event.
    NoWait(String),
    /// Print the session snapshot.
    Info,
    /// Detach and leave the loop.
    Detach,
    Empty,
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    match line {
        "" => Input::Empty,
        ":detach" | ":quit" => Input::Detach,
        ":info" => Input::Info,
        _ => match line.strip_prefix('!') {
            Some(rest) if !rest.trim().is_empty() => Input::NoWait(rest.trim().to_string()),
            Some(_) => Input::Empty,
            None => Input::Command(line.to_string()),
        },
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

pub async fn run_attach(cli: AttachCli, config: Config) -> Result<()> {
    let target = DebugTarget::Attach {
        pid: cli.pid,
        bundle_id: cli.bundle_id,
    };
    run_target(target, config).await
}

pub async fn run_launch(cli: LaunchCli, config: Config) -> Result<()> {
    let request = LaunchRequest {
        executable: cli.executable,
        args: cli.args,
        env: cli.env.into_iter().collect::<BTreeMap<_, _>>(),
        stop_at_entry: cli.stop_at_entry,
        bundle_id: cli.bundle_id,
        timeout_ms: None,
    };
    run_target(DebugTarget::Launch(request), config).await
}

async fn run_target(target: DebugTarget, config: Config) -> Result<()> {
    let bridge = DebugBridge::new(config);
    let events = bridge.subscribe();
    let printer = tokio::spawn(print_events(events));

    let info = bridge
        .open(&target)
        .await
        .context("failed to open debug target")?;
    let pid = info
        .pid
        .context("debugger did not report the target pid")?;
    eprintln!("attached to pid {pid} (session {})", info.session_id);
    let key = SessionKey::Pid(pid);

    let result = command_loop(&bridge, &key).await;
    bridge.shutdown().await;
    printer.abort();
    result
}

async fn command_loop(bridge: &DebugBridge, key: &SessionKey) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; detaching");
                None
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        let input = parse_input(&line);
        match input {
            Input::Empty => continue,
            Input::Detach => return Ok(()),
            Input::Info | Input::NoWait(_) | Input::Command(_) => {}
        }
        let session = current_session(bridge, key).await?;
        match input {
            Input::Info => {
                let info = session.info().await;
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            Input::NoWait(command) => report(session.send_no_wait(&command).await.map(|()| None)),
            Input::Command(command) => report(session.send(&command).await.map(Some)),
            Input::Empty | Input::Detach => {}
        }
    }
}

/// The session for `key`, replaced when an earlier command poisoned it.
async fn current_session(bridge: &DebugBridge, key: &SessionKey) -> Result<Arc<DebugSession>> {
    bridge
        .session(key)
        .await
        .with_context(|| format!("no usable session for {key}"))
}

fn report(result: std::result::Result<Option<String>, DebugError>) {
    match result {
        Ok(Some(output)) => print!("{output}"),
        Ok(None) => {}
        Err(err) => {
            eprintln!("error: {err}");
            if let Some(partial) = err.partial_output()
                && !partial.is_empty()
            {
                eprintln!("partial output:\n{partial}");
            }
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match event.kind {
                SessionEventKind::UnsolicitedOutput { text } => eprint!("{text}"),
                SessionEventKind::TargetExited { pid, status } => {
                    eprintln!("[process {pid} exited with status {status}]");
                }
                SessionEventKind::Poisoned { command } => {
                    eprintln!("[`{command}` never completed; the session will be replaced]");
                }
                SessionEventKind::Terminated { reason } => {
                    eprintln!("[session ended: {reason}]");
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                eprintln!("[{skipped} events dropped]");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        launch: LaunchCli,
    }

    #[test]
    fn bang_prefix_is_fire_and_forget() {
        assert_eq!(
            parse_input("!process continue"),
            Input::NoWait("process continue".to_string())
        );
        assert_eq!(parse_input("!  "), Input::Empty);
        assert_eq!(
            parse_input("  thread list \n"),
            Input::Command("thread list".to_string())
        );
        assert_eq!(parse_input(":detach"), Input::Detach);
        assert_eq!(parse_input(":info"), Input::Info);
        assert_eq!(parse_input(""), Input::Empty);
    }

    #[test]
    fn env_pairs_need_a_key() {
        assert_eq!(
            parse_env_pair("DYLD_PRINT_LIBRARIES=1"),
            Ok(("DYLD_PRINT_LIBRARIES".to_string(), "1".to_string()))
        );
        assert_eq!(
            parse_env_pair("EMPTY="),
            Ok(("EMPTY".to_string(), String::new()))
        );
        assert!(parse_env_pair("=1").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn launch_arguments_follow_double_dash() {
        Harness::command().debug_assert();
        let parsed = Harness::try_parse_from([
            "dbg-bridge",
            "/tmp/app",
            "--stop-at-entry",
            "--env",
            "A=1",
            "--",
            "--verbose",
            "input.txt",
        ])
        .expect("parse");
        assert_eq!(parsed.launch.executable, PathBuf::from("/tmp/app"));
        assert!(parsed.launch.stop_at_entry);
        assert_eq!(parsed.launch.env, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(
            parsed.launch.args,
            vec!["--verbose".to_string(), "input.txt".to_string()]
        );
    }
}
