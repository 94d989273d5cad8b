// Shell Runner
// Executes stage commands through the platform shell, streaming output as events

use super::{StageInvocation, StageOutcome, StageRunner};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Shell types supported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// sh on Unix, cmd on Windows
    Default,
    Bash,
    /// PowerShell Core
    Pwsh,
}

impl Shell {
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-c"]),
            Shell::Pwsh => ("pwsh", &["-NoLogo", "-NoProfile", "-Command"]),
        }
    }
}

/// Default stage runner: `sh -c <command>` in the stage directory
pub struct ShellRunner {
    shell: Shell,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: Shell::Default,
        }
    }

    pub fn with_shell(shell: Shell) -> Self {
        Self { shell }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StageRunner for ShellRunner {
    async fn run(&self, invocation: &StageInvocation) -> StageOutcome {
        let (shell_cmd, shell_args) = self.shell.get_command();

        if let Err(e) = tokio::fs::create_dir_all(&invocation.working_dir).await {
            return StageOutcome::failed_to_run(format!(
                "failed to create working directory {}: {}",
                invocation.working_dir.display(),
                e
            ));
        }

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(&invocation.command);
        cmd.current_dir(&invocation.working_dir);
        cmd.envs(&invocation.env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Cancellation and timeouts drop this future; the process must die with it
        cmd.kill_on_drop(true);
        // Own group, so children the shell forks can be killed with it
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(
            run = %invocation.run,
            stage = %invocation.stage_name,
            command = %invocation.command,
            "spawning stage process"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return StageOutcome::failed_to_run(format!(
                    "failed to spawn shell process '{}': {}",
                    shell_cmd, e
                ));
            }
        };

        let mut group = ProcessGroup::of(&child);
        let stdout_handle = spawn_reader(child.stdout.take(), invocation, false);
        let stderr_handle = spawn_reader(child.stderr.take(), invocation, true);

        let status = child.wait().await;
        // Background jobs do not outlive their stage, and would hold the pipes open
        group.kill();
        let stdout = stdout_handle.await.unwrap_or_default();
        let mut stderr = stderr_handle.await.unwrap_or_default();

        match status {
            Ok(status) => StageOutcome {
                exit_code: status.code(),
                stdout,
                stderr,
            },
            Err(e) => {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(&format!("failed to wait for process: {}", e));
                StageOutcome {
                    exit_code: None,
                    stdout,
                    stderr,
                }
            }
        }
    }
}

/// A stage's process group, killed when dropped
struct ProcessGroup {
    #[cfg(unix)]
    pgid: Option<nix::unistd::Pid>,
}

impl ProcessGroup {
    #[cfg(unix)]
    fn of(child: &Child) -> Self {
        Self {
            pgid: child
                .id()
                .and_then(|id| i32::try_from(id).ok())
                .map(nix::unistd::Pid::from_raw),
        }
    }

    #[cfg(not(unix))]
    fn of(_child: &Child) -> Self {
        Self {}
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            // ESRCH only means every member already exited
            if let Err(e) = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    tracing::warn!(pgid = %pgid, error = %e, "failed to kill stage process group");
                }
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Collect a stream line by line, forwarding each line as a StageOutput event
fn spawn_reader<R>(
    stream: Option<R>,
    invocation: &StageInvocation,
    is_error: bool,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let progress: Option<ProgressSender> = invocation.progress.clone();
    let run = invocation.run.clone();
    let stage_name = invocation.stage_name.clone();

    tokio::spawn(async move {
        let mut output = String::new();
        let Some(stream) = stream else {
            return output;
        };

        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            progress.send_event(ExecutionEvent::stage_output(
                run.as_str(),
                stage_name.as_str(),
                line.as_str(),
                is_error,
            ));
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&line);
        }
        output
    })
}
