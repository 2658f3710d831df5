//! Bounded subprocess execution for agent tasks.
//!
//! The prompt goes in on stdin, the whole of stdout comes back. A hard
//! wall-clock timeout kills the child. Stderr only decorates failures.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::error::ExecError;

/// Maximum stdout kept from an agent process (1 MiB). The rest is drained.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Maximum stderr quoted in a failure message.
const MAX_STDERR_IN_ERROR: usize = 2 * 1024;

/// A program plus its arguments, run without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. `None` when blank.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// From a `[program, args...]` vector. `None` when empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Run `command`, feeding `prompt` on stdin, and return trimmed stdout.
///
/// Fails with `Timeout` if the child outlives `timeout` (it is killed),
/// and with `Subprocess` on a non-zero exit or empty output.
pub async fn run_agent_command(
    command: &CommandSpec,
    prompt: &str,
    timeout: Duration,
) -> Result<String, ExecError> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::Spawn(format!("{}: {e}", command.program)))?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let result = tokio::time::timeout(timeout, async {
        let write = async {
            if let Some(mut stdin) = stdin {
                // A child that never reads stdin closes the pipe early.
                match stdin.write_all(prompt.as_bytes()).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(e),
                }
                drop(stdin);
            }
            Ok::<_, std::io::Error>(())
        };
        let (written, out, err) = tokio::join!(
            write,
            read_capped(stdout, MAX_OUTPUT_BYTES),
            read_capped(stderr, MAX_STDERR_IN_ERROR),
        );
        written?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, out?, err?))
    })
    .await;

    let (status, stdout, stderr) = match result {
        Ok(Ok(done)) => done,
        Ok(Err(e)) => return Err(ExecError::Io(e)),
        Err(_) => {
            let _ = child.kill().await;
            debug!(command = %command, ?timeout, "Agent process killed after timeout");
            return Err(ExecError::Timeout { timeout });
        }
    };

    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let stderr = stderr.trim();
        return Err(ExecError::Subprocess(if stderr.is_empty() {
            format!("exit status {code}")
        } else {
            format!("exit status {code}: {stderr}")
        }));
    }

    let output = stdout.trim();
    if output.is_empty() {
        return Err(ExecError::Subprocess("empty output".into()));
    }
    Ok(output.to_string())
}

/// Read up to `cap` bytes as lossy UTF-8, then drain the rest so the child never blocks.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> std::io::Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    (&mut reader).take(cap as u64 + 1).read_to_end(&mut buf).await?;
    let truncated = buf.len() > cap;
    buf.truncate(cap);
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;

    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        // The cap may have split a multi-byte char; lossy decoding marks it.
        text.push_str("\n[output truncated]");
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".into(), script.into()])
    }

    #[test]
    fn parse_command_line() {
        let spec = CommandSpec::parse("  claude   -p ").unwrap();
        assert_eq!(spec.program, "claude");
        assert_eq!(spec.args, vec!["-p"]);
        assert_eq!(spec.to_string(), "claude -p");
        assert!(CommandSpec::parse("   ").is_none());
        assert!(CommandSpec::from_argv(&[]).is_none());
    }

    #[tokio::test]
    async fn prompt_round_trips_through_cat() {
        let out = run_agent_command(&CommandSpec::new("cat", vec![]), "hello agent\n", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "hello agent");
    }

    #[tokio::test]
    async fn never_exiting_child_times_out() {
        let start = std::time::Instant::now();
        let err = run_agent_command(&sh("sleep 30"), "", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = run_agent_command(&sh("echo broken >&2; exit 3"), "", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ExecError::Subprocess(msg) => {
                assert!(msg.contains('3'));
                assert!(msg.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_output_is_a_failure() {
        let err = run_agent_command(&sh("true"), "ignored", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Subprocess(ref m) if m.contains("empty")));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let err = run_agent_command(
            &CommandSpec::new("definitely-not-a-real-binary-xyz", vec![]),
            "",
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Spawn(_)));
    }

    #[tokio::test]
    async fn output_at_cap_is_not_marked_truncated() {
        let exact = read_capped(Some(&b"abcd"[..]), 4).await.unwrap();
        assert_eq!(exact, "abcd");

        let over = read_capped(Some(&b"abcde"[..]), 4).await.unwrap();
        assert_eq!(over, "abcd\n[output truncated]");

        assert_eq!(read_capped(None::<&[u8]>, 4).await.unwrap(), "");
    }
}
