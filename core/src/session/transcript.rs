//! Recognizers for the handful of debugger output lines the bridge acts on.

use std::sync::LazyLock;

use regex_lite::Regex;

#[allow(clippy::expect_used)]
static PROCESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Process (\d+) (?:stopped|launched|resuming|exited)")
        .expect("valid process line regex")
});

#[allow(clippy::expect_used)]
static EXIT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Process (\d+) exited with status = (-?\d+)").expect("valid exit line regex")
});

/// Pid named by the first `Process <pid> ...` report in `output`.
pub(crate) fn parse_process_pid(output: &str) -> Option<u32> {
    PROCESS_LINE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|pid| pid.as_str().parse().ok())
}

/// `(pid, status)` when `line` reports that the target exited.
pub(crate) fn parse_exit(line: &str) -> Option<(u32, i32)> {
    let caps = EXIT_LINE.captures(line.trim_start())?;
    let pid = caps.get(1)?.as_str().parse().ok()?;
    let status = caps.get(2)?.as_str().parse().ok()?;
    Some((pid, status))
}

pub(crate) fn first_error_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim_start)
        .find(|line| line.starts_with("error:"))
}

pub(crate) fn has_error_line(output: &str) -> bool {
    first_error_line(output).is_some()
}
