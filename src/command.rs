//! Abstraction over external command execution.
//!
//! Every domain in this crate is driven through a CLI tool (nmcli,
//! bluetoothctl, pactl, brightnessctl, upower, cpupower). [`CommandRunner`]
//! is the single seam through which they are spawned, so that parsers,
//! scanners and the action dispatcher can be exercised with a mock instead of
//! the real binaries.
//!
//! A runner never fails because a tool reported an error: the exit code and
//! stderr are handed back in a [`CommandResult`]. Only a process that could not
//! be spawned at all yields a [`CommandError`].

use crate::secret::Secret;
use std::fmt;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Timeout applied when neither the command nor the runner sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit code reported for a command killed after its timeout (same as `timeout(1)`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How often a running child is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One argument of an [`ExternalCommand`].
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    /// Regular argument, shown as is in logs.
    Plain(String),
    /// Argument carrying a secret, passed verbatim to the process but shown as `***`.
    Secret(Secret),
}

impl Arg {
    fn expose(&self) -> &str {
        match self {
            Arg::Plain(s) => s,
            Arg::Secret(s) => s.expose(),
        }
    }

    fn redacted(&self) -> &str {
        match self {
            Arg::Plain(s) => s,
            Arg::Secret(_) => "***",
        }
    }
}

/// An external program invocation.
///
/// Arguments are always kept as a vector and handed to the OS one by one:
/// nothing ever goes through a shell.
#[derive(Clone, Debug, PartialEq)]
pub struct ExternalCommand {
    program: String,
    args: Vec<Arg>,
    stdin: Option<Secret>,
    timeout: Option<Duration>,
}

impl ExternalCommand {
    /// Start building an invocation of `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Plain(arg.into()));
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|a| Arg::Plain(a.into())));
        self
    }

    /// Append an argument whose value must not show up in logs.
    pub fn secret_arg(mut self, secret: Secret) -> Self {
        self.args.push(Arg::Secret(secret));
        self
    }

    /// Feed `secret` followed by a newline on the child's stdin.
    pub fn stdin_secret(mut self, secret: Secret) -> Self {
        self.stdin = Some(secret);
        self
    }

    /// Override the runner's default timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program name or path.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments exactly as they are passed to the process.
    pub fn argv(&self) -> Vec<&str> {
        self.args.iter().map(Arg::expose).collect()
    }

    /// Secret written on stdin, if any.
    pub fn stdin(&self) -> Option<&Secret> {
        self.stdin.as_ref()
    }

    /// Timeout requested for this invocation.
    pub fn requested_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// `true` when the arguments are exactly `expected`.
    ///
    /// Mostly useful to match invocations in tests.
    pub fn has_args(&self, expected: &[&str]) -> bool {
        self.argv() == expected
    }
}

/// Render the command line with secrets redacted, quoted like a shell would.
impl fmt::Display for ExternalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(Arg::redacted));
        write!(f, "{}", shell_words::join(words))
    }
}

/// Outcome of a process that ran to completion (or was killed on timeout).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CommandResult {
    /// Process exit code. `-1` when killed by a signal, [`TIMEOUT_EXIT_CODE`] on timeout.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandResult {
    /// Successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed result with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// `true` when the tool exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Text that best explains a failure.
    ///
    /// Some tools (bluetoothctl notably) print their errors on stdout, so we
    /// fall back to the last non-empty stdout line when stderr is empty.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_owned();
        }
        match self.stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
            Some(line) => line.to_owned(),
            None => format!("Error code: {}", self.exit_code),
        }
    }
}

#[derive(Debug, Error)]
/// Failure to run a process at all.
pub enum CommandError {
    /// The executable is not installed (checked before spawning).
    #[error("{0} is missing, please install it")]
    Unavailable(String),
    /// The OS refused to spawn the executable.
    #[error("Unable to launch {program}")]
    Launch {
        #[allow(missing_docs)]
        program: String,
        #[allow(missing_docs)]
        #[source]
        source: std::io::Error,
    },
}

/// Trait for running external commands and capturing their output.
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Run `command` to completion.
    ///
    /// A non-zero exit is not an error, it is reported in [`CommandResult::exit_code`].
    fn run(&self, command: &ExternalCommand) -> Result<CommandResult, CommandError>;

    /// Start `command` without waiting for it, for long running helpers.
    ///
    /// Returns the process id.
    fn spawn_detached(&self, command: &ExternalCommand) -> Result<u32, CommandError>;

    /// `true` when `program` can be found and spawned.
    fn is_available(&self, program: &str) -> bool;
}

/// Run `command` on a background thread.
///
/// The returned handle yields the same value [`CommandRunner::run`] would.
pub fn run_async(
    runner: Arc<dyn CommandRunner>,
    command: ExternalCommand,
) -> JoinHandle<Result<CommandResult, CommandError>> {
    thread::spawn(move || runner.run(&command))
}

/// Default implementation that delegates to [`std::process::Command`].
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    default_timeout: Duration,
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl SystemCommandRunner {
    /// Create a runner killing commands that outlive `default_timeout`
    /// (unless the command sets its own).
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf) {
                trace!("Reading child pipe: {}", e);
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Kill `child` and reap it so that no zombie is left behind.
fn terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        trace!("Killing {}: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        warn!("Unable to reap {}: {}", child.id(), e);
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, command: &ExternalCommand) -> Result<CommandResult, CommandError> {
        let timeout = command.requested_timeout().unwrap_or(self.default_timeout);
        debug!("Running {}", command);
        let launch_error = |source| CommandError::Launch {
            program: command.program().to_owned(),
            source,
        };
        let mut child = Command::new(command.program())
            .args(command.argv())
            .stdin(if command.stdin().is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(launch_error)?;

        if let (Some(secret), Some(mut pipe)) = (command.stdin(), child.stdin.take()) {
            // The pipe is closed when `pipe` is dropped at the end of this block.
            if let Err(e) = writeln!(pipe, "{}", secret.expose()) {
                warn!("Unable to write to stdin of {}: {}", command.program(), e);
            }
        }
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() >= deadline => {
                    warn!("{} timed out after {:?}, killing it", command.program(), timeout);
                    terminate(&mut child);
                    break None;
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    warn!("Lost track of {}: {}", command.program(), e);
                    terminate(&mut child);
                    return Err(launch_error(e));
                }
            }
        };
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        let result = match status {
            Some(status) => CommandResult {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            },
            None => CommandResult {
                exit_code: TIMEOUT_EXIT_CODE,
                stdout,
                stderr: format!("{} timed out after {}s", command.program(), timeout.as_secs()),
            },
        };
        trace!("{} exited with {}", command.program(), result.exit_code);
        Ok(result)
    }

    fn spawn_detached(&self, command: &ExternalCommand) -> Result<u32, CommandError> {
        debug!("Starting {} in background", command);
        let mut child = Command::new(command.program())
            .args(command.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| CommandError::Launch {
                program: command.program().to_owned(),
                source,
            })?;
        let pid = child.id();
        // Reap it whenever it ends.
        thread::spawn(move || child.wait());
        Ok(pid)
    }

    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Hand-written runner for tests needing call recording across threads.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    type Responder = dyn Fn(&ExternalCommand) -> Result<CommandResult, CommandError> + Send + Sync;

    /// Runner answering with a closure and recording every command line.
    pub(crate) struct ScriptedRunner {
        responder: Box<Responder>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new<F>(responder: F) -> Self
        where
            F: Fn(&ExternalCommand) -> Result<CommandResult, CommandError> + Send + Sync + 'static,
        {
            Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Command lines seen so far, in order.
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, command: &ExternalCommand) -> Result<CommandResult, CommandError> {
            self.calls.lock().unwrap().push(command.to_string());
            (self.responder)(command)
        }

        fn spawn_detached(&self, command: &ExternalCommand) -> Result<u32, CommandError> {
            self.calls.lock().unwrap().push(format!("{} &", command));
            (self.responder)(command).map(|_| 4242)
        }

        fn is_available(&self, _program: &str) -> bool {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod should {
        use super::*;
        use test_log::test;

        #[test]
        fn redact_secret_arguments_when_displayed() {
            let cmd = ExternalCommand::new("nmcli")
                .args(["con", "add", "con-name", "My Net", "wifi-sec.psk"])
                .secret_arg(Secret::new("hunter2".into()));
            assert_eq!(
                cmd.to_string(),
                "nmcli con add con-name 'My Net' wifi-sec.psk '***'"
            );
            assert_eq!(cmd.argv().last(), Some(&"hunter2"));
        }

        #[test]
        fn explain_failure_with_stderr_first() {
            let res = CommandResult {
                exit_code: 4,
                stdout: "noise\n".into(),
                stderr: "Error: Connection activation failed.\n".into(),
            };
            assert_eq!(res.failure_detail(), "Error: Connection activation failed.");
        }

        #[test]
        fn explain_failure_with_stdout_when_stderr_is_empty() {
            let res = CommandResult {
                exit_code: 1,
                stdout: "Attempting to pair with AA\nFailed to pair: org.bluez.Error.AuthenticationFailed\n\n".into(),
                stderr: String::new(),
            };
            assert_eq!(
                res.failure_detail(),
                "Failed to pair: org.bluez.Error.AuthenticationFailed"
            );
            assert_eq!(CommandResult::failed(3, "").failure_detail(), "Error code: 3");
        }

        #[test]
        fn report_launch_error_for_missing_program() {
            let runner = SystemCommandRunner::default();
            let cmd = ExternalCommand::new("/nonexistent/definitely-not-a-tool");
            match runner.run(&cmd) {
                Err(CommandError::Launch { program, .. }) => {
                    assert_eq!(program, "/nonexistent/definitely-not-a-tool")
                }
                other => panic!("Expected a launch error, got {:?}", other),
            }
            assert!(!runner.is_available("/nonexistent/definitely-not-a-tool"));
        }

        #[cfg(unix)]
        #[test]
        fn capture_exit_code_and_both_streams() {
            let runner = SystemCommandRunner::default();
            let cmd = ExternalCommand::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
            let res = runner.run(&cmd).unwrap();
            assert_eq!(res.exit_code, 3);
            assert_eq!(res.stdout, "out\n");
            assert_eq!(res.stderr, "err\n");
        }

        #[cfg(unix)]
        #[test]
        fn pass_stdin_secret_to_the_child() {
            let runner = SystemCommandRunner::default();
            let cmd = ExternalCommand::new("cat").stdin_secret(Secret::new("s3cr3t".into()));
            let res = runner.run(&cmd).unwrap();
            assert!(res.success());
            assert_eq!(res.stdout, "s3cr3t\n");
        }

        #[cfg(unix)]
        #[test]
        fn kill_command_after_timeout() {
            let runner = SystemCommandRunner::default();
            let cmd = ExternalCommand::new("sleep")
                .arg("5")
                .timeout(Duration::from_millis(100));
            let start = Instant::now();
            let res = runner.run(&cmd).unwrap();
            assert!(start.elapsed() < Duration::from_secs(4));
            assert_eq!(res.exit_code, TIMEOUT_EXIT_CODE);
            assert_eq!(res.stderr, "sleep timed out after 0s");
        }

        #[cfg(unix)]
        #[test]
        fn reap_a_terminated_child() {
            let mut child = Command::new("sleep").arg("5").spawn().unwrap();
            let start = Instant::now();
            terminate(&mut child);
            assert!(start.elapsed() < Duration::from_secs(4));
            assert!(child.try_wait().unwrap().is_some());
            // Already gone: terminating again is harmless.
            terminate(&mut child);
        }

        #[cfg(unix)]
        #[test]
        fn run_in_background_thread() {
            let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::default());
            let handle = run_async(runner, ExternalCommand::new("echo").arg("hi"));
            let res = handle.join().unwrap().unwrap();
            assert_eq!(res.stdout.trim(), "hi");
        }

        #[cfg(unix)]
        #[test]
        fn start_detached_process_and_return_its_pid() {
            let runner = SystemCommandRunner::default();
            let pid = runner.spawn_detached(&ExternalCommand::new("true")).unwrap();
            assert!(pid > 0);
            assert!(matches!(
                runner.spawn_detached(&ExternalCommand::new("/nonexistent/tool")),
                Err(CommandError::Launch { .. })
            ));
        }
    }
}
