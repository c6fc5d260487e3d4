//! Helpers shared by the integration tests: a scripted stand-in for the
//! debugger that honours the prompt protocol, and a matching `Config`.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use dbg_bridge_core::Config;
use dbg_bridge_core::DebugSession;
use dbg_bridge_core::SessionState;
use tempfile::TempDir;

/// Pid the fake debugger reports for every launched target.
pub const FAKE_TARGET_PID: u32 = 4321;

/// Each spawn appends its shell pid to the log named by `$1`, so tests can
/// count how many debugger processes were started. Errors go to stderr and
/// prompts to stdout, the way lldb writes them.
const FAKE_DEBUGGER: &str = r#"log="$1"
if [ -n "$log" ]; then echo "$$" >> "$log"; fi
prompt() { printf '(lldb) '; }
prompt
while IFS= read -r line; do
  case "$line" in
    "process attach --pid 1")
      echo "error: attach failed: lost connection" >&2
      ;;
    "process attach --pid "*)
      echo "Process ${line#process attach --pid } stopped"
      echo "* thread #1, stop reason = signal SIGSTOP"
      ;;
    "target create "*missing*)
      echo "error: unable to find executable for '${line#target create }'" >&2
      ;;
    "target create "*)
      echo "Current executable set to ${line#target create } (x86_64)."
      ;;
    "settings set "*)
      ;;
    "process launch"*)
      echo "Process 4321 stopped"
      echo "* thread #1, stop reason = signal SIGSTOP"
      ;;
    "breakpoint set "*)
      echo "Breakpoint 1: where = target\`main, address = 0x0000000100003f50"
      ;;
    "process continue")
      echo "Process 4321 resuming"
      prompt
      sleep 0.3
      echo "Process 4321 exited with status = 0"
      continue
      ;;
    "process status")
      echo "Process 4321 stopped"
      ;;
    "process detach")
      sleep 0.2
      echo "Process 4321 detached"
      ;;
    "thread list")
      echo "Process 4321 stopped"
      echo "* thread #1: tid = 0x1, name = 'main'"
      ;;
    "slow "*)
      sleep "${line#slow }"
      echo "slow done"
      ;;
    hang)
      sleep 5
      ;;
    split)
      printf 'split output\n(ll'
      sleep 0.1
      printf 'db) '
      continue
      ;;
    inline)
      echo 'value = "(lldb) "'
      ;;
    async)
      echo "ok"
      prompt
      sleep 0.1
      echo "Process 4321 stopped"
      echo "* thread #1, stop reason = breakpoint 1.1"
      continue
      ;;
    crash)
      echo "fatal: crashing"
      exit 3
      ;;
    quit)
      exit 0
      ;;
    *bogus*)
      echo "error: '$line' is not a valid command." >&2
      ;;
    *)
      echo "$line"
      ;;
  esac
  prompt
done
"#;

pub struct FakeDebugger {
    dir: TempDir,
    script: PathBuf,
    log: PathBuf,
}

impl FakeDebugger {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir().context("create fake debugger dir")?;
        let script = dir.path().join("fake-lldb.sh");
        std::fs::write(&script, FAKE_DEBUGGER).context("write fake debugger")?;
        let log = dir.path().join("spawns.log");
        Ok(Self { dir, script, log })
    }

    /// Config that runs the script through `/bin/sh` with short deadlines.
    /// Going through the shell avoids exec'ing a file this process just
    /// wrote, which races with concurrent forks (`ETXTBSY`).
    pub fn config(&self) -> Config {
        Config {
            debugger_path: PathBuf::from("/bin/sh"),
            debugger_args: vec![
                self.script.display().to_string(),
                self.log.display().to_string(),
            ],
            command_timeout_ms: 2_000,
            startup_timeout_ms: 2_000,
            detach_timeout_ms: 500,
            defaults_path: Some(self.dir.path().join("defaults.json")),
            ..Config::default()
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Number of debugger processes started so far.
    pub fn spawn_count(&self) -> usize {
        self.spawned_pids().len()
    }

    /// Pids of the debugger processes started so far, oldest first.
    pub fn spawned_pids(&self) -> Vec<u32> {
        std::fs::read_to_string(&self.log)
            .map(|log| log.lines().filter_map(|line| line.trim().parse().ok()).collect())
            .unwrap_or_default()
    }
}

/// Whether `pid` still names a live process, asked through the shell's
/// `kill -0`.
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(format!("kill -0 {pid} 2>/dev/null"))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Polls until `pid` is gone; returns whether it went in time.
pub async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    !process_alive(pid)
}

/// Polls until `session` reaches `state`; returns whether it did in time.
pub async fn wait_for_state(session: &DebugSession, state: SessionState, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if session.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    session.state() == state
}
