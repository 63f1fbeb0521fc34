//! Scripted connection for testing and dry runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::connection::{CommandOutput, Connection, ExecOptions, RemoteProcess};
use crate::error::{HypervisorError, Result};

/// A command issued against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub command: String,
    pub options: ExecOptions,
}

#[derive(Debug, Clone)]
struct Reply {
    code: i32,
    stdout: String,
    stderr: String,
}

#[derive(Debug)]
struct Rule {
    prefix: String,
    reply: Reply,
    once: bool,
}

#[derive(Debug, Default)]
struct MockState {
    rules: Vec<Rule>,
    calls: Vec<RecordedCall>,
    files: HashMap<String, String>,
    process_polls: Vec<usize>,
}

/// Mock connection that answers commands from scripted rules.
///
/// Commands are matched by prefix. Single-use rules registered with
/// [`MockConnection::once`] are consumed in registration order and take
/// precedence over sticky rules registered with [`MockConnection::on`].
/// Unmatched commands succeed with empty output. The expected return codes
/// of each call are honoured exactly as a real transport would.
#[derive(Clone, Default)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    /// Create a new mock connection.
    pub fn new() -> Self {
        info!("Creating mock connection");
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, prefix: &str, code: i32, stdout: &str, stderr: &str, once: bool) {
        self.lock().rules.push(Rule {
            prefix: prefix.to_string(),
            reply: Reply {
                code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
            once,
        });
    }

    /// Answer every command starting with `prefix`.
    pub fn on(&self, prefix: &str, code: i32, stdout: &str, stderr: &str) -> &Self {
        self.push(prefix, code, stdout, stderr, false);
        self
    }

    /// Answer the next command starting with `prefix`, once.
    pub fn once(&self, prefix: &str, code: i32, stdout: &str, stderr: &str) -> &Self {
        self.push(prefix, code, stdout, stderr, true);
        self
    }

    /// Seed a file on the mocked host.
    pub fn add_file(&self, path: &str, content: &str) -> &Self {
        self.lock().files.insert(path.to_string(), content.to_string());
        self
    }

    /// Content of a file on the mocked host.
    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    /// The next background process reports running for `polls` checks.
    pub fn add_process(&self, polls: usize) -> &Self {
        self.lock().process_polls.push(polls);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.command.clone()).collect()
    }

    /// Commands that start with `prefix`.
    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn reply_for(&self, command: &str) -> Reply {
        let mut state = self.lock();
        if let Some(pos) = state
            .rules
            .iter()
            .position(|r| r.once && command.starts_with(&r.prefix))
        {
            return state.rules.remove(pos).reply;
        }
        state
            .rules
            .iter()
            .find(|r| !r.once && command.starts_with(&r.prefix))
            .map(|r| r.reply.clone())
            .unwrap_or(Reply {
                code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
    }
}

struct MockProcess {
    remaining: usize,
}

impl RemoteProcess for MockProcess {
    fn running(&mut self) -> Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        self.remaining -= 1;
        Ok(true)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute_command(&self, command: &str, options: ExecOptions) -> Result<CommandOutput> {
        debug!(command = %command, "Mock executing command");
        self.lock().calls.push(RecordedCall {
            command: command.to_string(),
            options: options.clone(),
        });

        let reply = self.reply_for(command);
        CommandOutput::new(command, reply.code, reply.stdout, reply.stderr).check(&options)
    }

    async fn start_process(&self, command: &str, shell: bool) -> Result<Box<dyn RemoteProcess>> {
        debug!(command = %command, "Mock starting background process");
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            command: command.to_string(),
            options: ExecOptions {
                shell,
                ..ExecOptions::default()
            },
        });
        let remaining = if state.process_polls.is_empty() {
            0
        } else {
            state.process_polls.remove(0)
        };
        Ok(Box::new(MockProcess { remaining }))
    }

    async fn read_to_string(&self, path: &str) -> Result<String> {
        self.file(path)
            .ok_or_else(|| HypervisorError::FileNotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.add_file(path, content);
        Ok(())
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        Ok(self.lock().files.contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_and_recording() {
        let conn = MockConnection::new();
        conn.on("virsh list", 0, "table", "")
            .once("virsh start", 1, "", "boom");

        let out = conn.execute_command("virsh list --all", ExecOptions::new()).await.unwrap();
        assert_eq!(out.stdout, "table");

        let err = conn.execute_command("virsh start vm", ExecOptions::new()).await.unwrap_err();
        assert!(err.stderr_contains("boom"));

        // Single-use rule is gone
        let out = conn.execute_command("virsh start vm", ExecOptions::new()).await.unwrap();
        assert_eq!(out.return_code, 0);

        assert_eq!(
            conn.commands(),
            vec!["virsh list --all", "virsh start vm", "virsh start vm"]
        );
    }

    #[tokio::test]
    async fn test_once_rules_take_precedence() {
        let conn = MockConnection::new();
        conn.on("virsh dominfo", 0, "State: running", "")
            .once("virsh dominfo", 0, "State: shut off", "");

        let first = conn.execute_command("virsh dominfo vm", ExecOptions::new()).await.unwrap();
        let second = conn.execute_command("virsh dominfo vm", ExecOptions::new()).await.unwrap();
        assert_eq!(first.stdout, "State: shut off");
        assert_eq!(second.stdout, "State: running");
    }

    #[tokio::test]
    async fn test_files_and_processes() {
        let conn = MockConnection::new();
        conn.add_file("/home/disk.img", "").add_process(2);

        assert!(conn.path_exists("/home/disk.img").await.unwrap());
        conn.write_file("/tmp/vf.xml", "<hostdev/>").await.unwrap();
        assert_eq!(conn.read_to_string("/tmp/vf.xml").await.unwrap(), "<hostdev/>");
        assert!(conn.read_to_string("/nope").await.is_err());

        let mut process = conn.start_process("cp a b", false).await.unwrap();
        assert!(process.running().unwrap());
        assert!(process.running().unwrap());
        assert!(!process.running().unwrap());
    }
}
