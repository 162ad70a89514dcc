//! Subprocess plumbing shared by all stages.
//!
//! [`spawn`] starts a tool with both output streams piped and forwards
//! their lines, merged in arrival order, over a channel. The streams are
//! drained by dedicated tasks so a chatty tool never blocks on a full pipe.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::command::StageCommand;
use crate::error::StageError;

/// Longest line forwarded. The rest of an overlong line is discarded.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Lines buffered between the stream readers and the executor.
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// A launched tool and the receiving end of its output lines.
#[derive(Debug)]
pub struct RunningTool {
    pub child: Child,
    /// Closed once both stdout and stderr reach EOF.
    pub lines: mpsc::Receiver<String>,
}

/// Spawn `command`, running in `default_dir` unless it names its own
/// working directory.
pub fn spawn(command: &StageCommand, default_dir: &Path) -> Result<RunningTool, StageError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(command.working_dir.as_deref().unwrap_or(default_dir))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| StageError::Launch {
        program: command.program_name(),
        source,
    })?;

    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, tx));
    }

    Ok(RunningTool { child, lines: rx })
}

/// Read `reader` line by line until EOF. Invalid UTF-8 is replaced rather
/// than ending the stream; lines are cut at [`MAX_LINE_BYTES`].
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES).await {
            Ok(false) => break,
            Ok(true) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if tx.send(line.to_string()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read tool output");
                break;
            }
        }
    }
}

/// Like `read_until(b'\n')`, but keeps at most `cap` bytes of the line and
/// consumes the remainder. Returns `false` at EOF with nothing read.
async fn read_line_capped<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> std::io::Result<bool> {
    let mut read_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any);
        }
        read_any = true;
        let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };
        let room = cap.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        let used = chunk.len();
        reader.consume(used);
        if complete {
            return Ok(true);
        }
    }
}

/// Stop a running tool: a polite termination signal first, then a hard
/// kill once `grace` has elapsed.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    if !grace.is_zero() && request_termination(child) {
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            return Some(status);
        }
        tracing::warn!(grace_secs = grace.as_secs(), "Tool ignored termination request, killing");
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill tool");
        return None;
    }
    child.try_wait().ok().flatten()
}

#[cfg(unix)]
fn request_termination(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `pid` is our own un-reaped child, so it cannot have been recycled.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn request_termination(_child: &Child) -> bool {
    false
}

/// Number of regular files in `dir` whose extension is `extension`
/// (case-insensitive). A missing directory counts as zero.
pub async fn count_files(dir: &Path, extension: &str) -> std::io::Result<u32> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut count = 0u32;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if matches && entry.file_type().await?.is_file() {
            count = count.saturating_add(1);
        }
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
