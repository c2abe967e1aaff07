use std::{
    io::{ErrorKind, Read, Write},
    process::{Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace};
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("`{program}` timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// exit code, -1 when terminated by a signal
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        // a broken pipe simply ends the output
        let _ = pipe.read_to_end(&mut buffer);

        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn join_reader(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Run a command to completion, killing it once `timeout` passes
///
/// Output pipes are drained on their own threads so a chatty child can't
/// stall on a full pipe while we wait for it.
pub fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
    input: Option<Vec<u8>>,
) -> Result<CommandOutput, ProcessError> {
    let program = command.get_program().to_string_lossy().into_owned();

    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    trace!(command = ?command, "Spawning");

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    let writer = match (input, child.stdin.take()) {
        (Some(input), Some(mut stdin)) => Some(thread::spawn(move || {
            if let Err(error) = stdin.write_all(&input) {
                // children are free to ignore their input
                if error.kind() != ErrorKind::BrokenPipe {
                    debug!(error = ?error, "Failed to write child input");
                }
            }
            // dropping stdin closes the pipe so the child sees the end of input
        })),
        _ => None,
    };
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            debug!(program = %program, "Killing child after timeout");
            let _ = child.kill();
            let _ = child.wait();

            return Err(ProcessError::Timeout { program, timeout });
        }
        Err(source) => {
            let _ = child.kill();

            return Err(ProcessError::Wait { program, source });
        }
    };

    if let Some(writer) = writer {
        let _ = writer.join();
    }

    Ok(CommandOutput {
        status,
        stdout: join_reader(stdout),
        stderr: join_reader(stderr),
        elapsed: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn captures_output_and_status() {
        let output = run_with_timeout(
            shell("echo out; echo err >&2; exit 3"),
            Duration::from_secs(10),
            None,
        )
        .unwrap();

        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.code(), 3);
        assert!(!output.success());
    }

    #[test]
    fn feeds_input_to_the_child() {
        let output = run_with_timeout(
            Command::new("cat"),
            Duration::from_secs(10),
            Some(b"id: 3\n".to_vec()),
        )
        .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, "id: 3\n");
    }

    #[test]
    fn kills_children_after_timeout() {
        let start = Instant::now();
        let error = run_with_timeout(shell("exec sleep 5"), Duration::from_millis(100), None)
            .unwrap_err();

        assert!(matches!(error, ProcessError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_programs_fail_to_spawn() {
        let error = run_with_timeout(
            Command::new("/nonexistent/fanout-simulator"),
            Duration::from_secs(1),
            None,
        )
        .unwrap_err();

        assert!(matches!(error, ProcessError::Spawn { .. }));
    }
}
