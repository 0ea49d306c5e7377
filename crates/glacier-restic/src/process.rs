//! Child process plumbing.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Program and arguments of `cmd`, without its environment.
pub(crate) fn describe(cmd: &Command) -> String {
    let cmd = cmd.as_std();
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn prepare(cmd: &mut Command) {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
}

/// Run a command to completion and capture everything it prints.
pub async fn run_captured(mut cmd: Command) -> std::io::Result<CommandOutput> {
    prepare(&mut cmd);
    debug!(command = %describe(&cmd), "running command");

    let output = cmd.spawn()?.wait_with_output().await?;
    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command, handing each stdout line to `on_line` as it arrives.
///
/// stderr is collected in the background and returned in full; stdout is not
/// retained. Dropping the returned future kills the child.
pub async fn run_streaming<F>(mut cmd: Command, mut on_line: F) -> std::io::Result<CommandOutput>
where
    F: FnMut(&str),
{
    prepare(&mut cmd);
    debug!(command = %describe(&cmd), "running streaming command");

    let mut child = cmd.spawn()?;

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            on_line(&line);
        }
    }

    let status = child.wait().await?;
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    Ok(CommandOutput {
        exit_code: status.code(),
        stdout: String::new(),
        stderr,
    })
}
