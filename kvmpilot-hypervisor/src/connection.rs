//! Command execution and file access on the (possibly remote) host.
//!
//! Everything the facade does on the host goes through the [`Connection`]
//! trait: run a command and collect its return code and output, start a
//! long-running background process, and read or write text files.
//!
//! Two transports are provided:
//! - [`LocalConnection`] runs commands on this machine
//! - [`SshConnection`] wraps every command in the system `ssh` client

use async_trait::async_trait;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, instrument, trace};

use crate::error::{HypervisorError, Result};

// =============================================================================
// OPTIONS AND OUTPUT
// =============================================================================

/// Per-call execution options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    /// Run through `sh -c` so redirections and pipes work.
    pub shell: bool,
    /// Return codes treated as success; `None` accepts any code.
    pub expected_return_codes: Option<Vec<i32>>,
    pub timeout: Option<Duration>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            shell: false,
            expected_return_codes: Some(vec![0]),
            timeout: None,
        }
    }
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shell(mut self) -> Self {
        self.shell = true;
        self
    }

    pub fn expect_codes(mut self, codes: &[i32]) -> Self {
        self.expected_return_codes = Some(codes.to_vec());
        self
    }

    /// Accept every return code; the caller inspects it.
    pub fn any_code(mut self) -> Self {
        self.expected_return_codes = None;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Completed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub command: String,
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(command: impl Into<String>, return_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            return_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    fn from_process(command: &str, output: std::process::Output) -> Self {
        Self {
            command: command.to_string(),
            // Killed by a signal
            return_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }

    /// Turn an unexpected return code into [`HypervisorError::Execution`].
    pub fn check(self, options: &ExecOptions) -> Result<Self> {
        match &options.expected_return_codes {
            Some(codes) if !codes.contains(&self.return_code) => Err(HypervisorError::Execution {
                command: self.command,
                code: self.return_code,
                stdout: self.stdout,
                stderr: self.stderr,
            }),
            _ => Ok(self),
        }
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// Handle to a background process started with [`Connection::start_process`].
pub trait RemoteProcess: Send + Sync {
    /// Whether the process is still running.
    fn running(&mut self) -> Result<bool>;
}

/// Command execution and file access on a host.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a command to completion.
    async fn execute_command(&self, command: &str, options: ExecOptions) -> Result<CommandOutput>;

    /// Start a command without waiting for it.
    async fn start_process(&self, command: &str, shell: bool) -> Result<Box<dyn RemoteProcess>>;

    async fn read_to_string(&self, path: &str) -> Result<String>;

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    async fn path_exists(&self, path: &str) -> Result<bool>;

    /// Join a path on the host's filesystem.
    fn join_path(&self, base: &str, name: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), name.trim_start_matches('/'))
    }
}

async fn with_timeout<F>(command: &str, timeout: Option<Duration>, fut: F) -> Result<std::process::Output>
where
    F: Future<Output = std::io::Result<std::process::Output>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| HypervisorError::Timeout {
                command: command.to_string(),
                timeout: limit,
            })?
            .map_err(HypervisorError::from),
        None => fut.await.map_err(HypervisorError::from),
    }
}

fn split_command(command: &str) -> Result<(String, Vec<String>)> {
    let mut argv = shlex::split(command)
        .ok_or_else(|| HypervisorError::Parse(format!("Cannot split command: {command}")))?
        .into_iter();
    let program = argv
        .next()
        .ok_or_else(|| HypervisorError::Parse("Empty command".to_string()))?;
    Ok((program, argv.collect()))
}

struct ChildProcess {
    child: Child,
}

impl RemoteProcess for ChildProcess {
    fn running(&mut self) -> Result<bool> {
        Ok(self.child.try_wait()?.is_none())
    }
}

// =============================================================================
// LOCAL
// =============================================================================

/// Runs commands on the local machine.
#[derive(Debug, Clone, Default)]
pub struct LocalConnection;

impl LocalConnection {
    pub fn new() -> Self {
        Self
    }

    fn build(command: &str, shell: bool) -> Result<Command> {
        if shell {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            Ok(cmd)
        } else {
            let (program, args) = split_command(command)?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            Ok(cmd)
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    #[instrument(skip(self, options), fields(shell = options.shell))]
    async fn execute_command(&self, command: &str, options: ExecOptions) -> Result<CommandOutput> {
        debug!("Executing command");

        let mut cmd = Self::build(command, options.shell)?;
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        let output = with_timeout(command, options.timeout, cmd.output()).await?;
        let output = CommandOutput::from_process(command, output);
        trace!(rc = output.return_code, stdout = %output.stdout, stderr = %output.stderr, "Command finished");

        output.check(&options)
    }

    async fn start_process(&self, command: &str, shell: bool) -> Result<Box<dyn RemoteProcess>> {
        debug!(command = %command, "Starting background process");
        let child = Self::build(command, shell)?
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }

    async fn read_to_string(&self, path: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        Ok(tokio::fs::write(path, content).await?)
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }
}

// =============================================================================
// SSH
// =============================================================================

/// Runs commands on a remote host through the system `ssh` client.
///
/// Authentication is left to the ssh client configuration (agent, keys in
/// `~/.ssh`); the connection runs in batch mode and never prompts.
#[derive(Debug, Clone)]
pub struct SshConnection {
    host: String,
    user: Option<String>,
    port: u16,
    options: Vec<String>,
}

impl SshConnection {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: 22,
            options: vec!["BatchMode=yes".to_string()],
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Add a `-o key=value` option.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    fn target(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    /// Build the local `ssh` invocation for a remote command line.
    pub fn ssh_command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        for option in &self.options {
            cmd.arg("-o").arg(option);
        }
        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg(self.target())
            .arg("--")
            .arg(remote);
        cmd
    }

    fn quote(path: &str) -> Result<String> {
        shlex::try_quote(path)
            .map(|q| q.into_owned())
            .map_err(|_| HypervisorError::Parse(format!("Cannot quote path: {path}")))
    }
}

#[async_trait]
impl Connection for SshConnection {
    #[instrument(skip(self, options), fields(host = %self.host, shell = options.shell))]
    async fn execute_command(&self, command: &str, options: ExecOptions) -> Result<CommandOutput> {
        debug!("Executing remote command");

        // sshd hands the command line to the remote login shell either way
        let mut cmd = self.ssh_command(command);
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        let output = with_timeout(command, options.timeout, cmd.output()).await?;
        let output = CommandOutput::from_process(command, output);
        trace!(rc = output.return_code, stdout = %output.stdout, stderr = %output.stderr, "Remote command finished");

        output.check(&options)
    }

    async fn start_process(&self, command: &str, _shell: bool) -> Result<Box<dyn RemoteProcess>> {
        debug!(host = %self.host, command = %command, "Starting remote background process");
        let child = self
            .ssh_command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }

    async fn read_to_string(&self, path: &str) -> Result<String> {
        let output = self
            .execute_command(&format!("cat {}", Self::quote(path)?), ExecOptions::new())
            .await?;
        Ok(output.stdout)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let remote = format!("cat > {}", Self::quote(path)?);
        let mut child = self
            .ssh_command(&remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes()).await?;
        }

        let output = CommandOutput::from_process(&remote, child.wait_with_output().await?);
        output.check(&ExecOptions::new()).map(|_| ())
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        let output = self
            .execute_command(
                &format!("test -e {}", Self::quote(path)?),
                ExecOptions::new().any_code(),
            )
            .await?;
        Ok(output.return_code == 0)
    }
}
