//! SqlLocalDB utility wrapper
//!
//! Provides:
//! - An [`Invoker`] trait with a real `tokio::process` implementation and a mock
//! - Typed [`UtilityCommand`]s rendered to the utility's argument syntax
//! - Exit-code policy helpers on [`Output`], applied by the caller
//! - Parsing of `info` output

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{LocalDbError, Result};
use crate::naming::Identifier;

/// Default utility binary, resolved through PATH
pub const DEFAULT_PROGRAM: &str = "sqllocaldb";

/// Output from a utility execution
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Any non-zero exit is fatal
    pub fn ensure_success(self, command: &UtilityCommand) -> Result<Output> {
        if self.status == 0 {
            Ok(self)
        } else {
            Err(LocalDbError::exit_code(
                command.to_string(),
                self.status,
                self.diagnostic(),
            ))
        }
    }

    /// Like [`Output::ensure_success`], but a report that the instance does not
    /// exist counts as success.
    pub fn ensure_success_or_absent(self, command: &UtilityCommand) -> Result<Output> {
        if self.status != 0 && self.reports_missing_instance() {
            warn!(
                command = %command,
                code = self.status,
                "LocalDB instance already absent, continuing"
            );
            return Ok(self);
        }
        self.ensure_success(command)
    }

    fn reports_missing_instance(&self) -> bool {
        let text = format!("{}\n{}", self.stdout, self.stderr).to_lowercase();
        text.contains("instance does not exist") || text.contains("instance is not found")
    }

    fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Trait for utility execution (testable)
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, args: &[String]) -> Result<Output>;
}

/// Runs the utility as a child process and waits for it to exit
pub struct ProcessInvoker {
    program: String,
}

impl ProcessInvoker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

#[async_trait]
impl Invoker for ProcessInvoker {
    async fn invoke(&self, args: &[String]) -> Result<Output> {
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LocalDbError::spawn(&self.program, e))?
            .wait_with_output()
            .await
            .map_err(|e| LocalDbError::spawn(&self.program, e))?;

        Ok(Output {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Mock invoker for testing
#[derive(Default)]
pub struct MockInvoker {
    responses: Mutex<Vec<Output>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl MockInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a response to return on the next invocation
    pub fn add_response(&self, output: Output) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(output);
    }

    /// Every argument list received so far, oldest first
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Received calls joined into command lines
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(|args| args.join(" ")).collect()
    }
}

#[async_trait]
impl Invoker for MockInvoker {
    async fn invoke(&self, args: &[String]) -> Result<Output> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(args.to_vec());

        let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        if responses.is_empty() {
            Ok(Output::success())
        } else {
            Ok(responses.remove(0))
        }
    }
}

/// Operations of the utility used over a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtilityCommand {
    Create(Identifier),
    Start(Identifier),
    Stop(Identifier),
    Delete(Identifier),
    Info(Option<Identifier>),
}

impl UtilityCommand {
    pub fn args(&self) -> Vec<String> {
        let (verb, target) = match self {
            UtilityCommand::Create(id) => ("create", Some(id)),
            UtilityCommand::Start(id) => ("start", Some(id)),
            UtilityCommand::Stop(id) => ("stop", Some(id)),
            UtilityCommand::Delete(id) => ("delete", Some(id)),
            UtilityCommand::Info(id) => ("info", id.as_ref()),
        };

        std::iter::once(verb.to_string())
            .chain(target.map(|id| id.to_string()))
            .collect()
    }
}

impl std::fmt::Display for UtilityCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.args().join(" "))
    }
}

/// Details reported by `info <name>`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceInfo {
    pub name: String,
    pub version: Option<String>,
    pub shared_name: Option<String>,
    pub owner: Option<String>,
    pub auto_create: Option<String>,
    pub state: Option<String>,
    pub last_start_time: Option<String>,
    /// Pipe path without the `np:` prefix; absent while stopped
    pub pipe_name: Option<String>,
}

impl InstanceInfo {
    pub fn parse(stdout: &str) -> Self {
        let mut info = InstanceInfo::default();

        for line in stdout.lines() {
            let Some((label, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            let field = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };

            match label.trim().to_ascii_lowercase().as_str() {
                "name" => info.name = value.to_string(),
                "version" => info.version = field,
                "shared name" => info.shared_name = field,
                "owner" => info.owner = field,
                "auto-create" => info.auto_create = field,
                "state" => info.state = field,
                "last start time" => info.last_start_time = field,
                "instance pipe name" => {
                    info.pipe_name = field.map(|pipe| {
                        pipe.strip_prefix("np:").map(str::to_string).unwrap_or(pipe)
                    })
                }
                _ => {}
            }
        }

        info
    }

    pub fn is_running(&self) -> bool {
        self.state
            .as_deref()
            .is_some_and(|state| state.eq_ignore_ascii_case("running"))
    }
}

/// SqlLocalDB utility with an optional per-call timeout
pub struct SqlLocalDb {
    invoker: Arc<dyn Invoker>,
    timeout: Option<Duration>,
}

impl SqlLocalDb {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self {
            invoker,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Execute a command and return its raw outcome; policy is the caller's
    pub async fn run(&self, command: &UtilityCommand) -> Result<Output> {
        let args = command.args();
        debug!(command = %command, "Invoking SqlLocalDB");

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.invoker.invoke(&args))
                .await
                .map_err(|_| LocalDbError::Timeout {
                    command: command.to_string(),
                    seconds: limit.as_secs(),
                })??,
            None => self.invoker.invoke(&args).await?,
        };

        debug!(
            command = %command,
            status = output.status,
            stdout = %output.stdout.trim(),
            "SqlLocalDB finished"
        );
        Ok(output)
    }

    /// Create the instance; succeeds whether or not it already exists
    pub async fn create(&self, id: &Identifier) -> Result<Output> {
        let command = UtilityCommand::Create(id.clone());
        self.run(&command).await?.ensure_success(&command)
    }

    pub async fn start(&self, id: &Identifier) -> Result<Output> {
        let command = UtilityCommand::Start(id.clone());
        self.run(&command).await?.ensure_success(&command)
    }

    pub async fn stop(&self, id: &Identifier) -> Result<Output> {
        let command = UtilityCommand::Stop(id.clone());
        self.run(&command).await?.ensure_success_or_absent(&command)
    }

    pub async fn delete(&self, id: &Identifier) -> Result<Output> {
        let command = UtilityCommand::Delete(id.clone());
        self.run(&command).await?.ensure_success_or_absent(&command)
    }

    pub async fn info(&self, id: &Identifier) -> Result<InstanceInfo> {
        let command = UtilityCommand::Info(Some(id.clone()));
        let output = self.run(&command).await?.ensure_success(&command)?;
        Ok(InstanceInfo::parse(&output.stdout))
    }

    /// Names of every instance known to the utility
    pub async fn instances(&self) -> Result<Vec<String>> {
        let command = UtilityCommand::Info(None);
        let output = self.run(&command).await?.ensure_success(&command)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::sanitize;

    const INFO_RUNNING: &str = "Name:               demo\r\n\
Version:            15.0.4153.1\r\n\
Shared name:        \r\n\
Owner:              HOST\\dev\r\n\
Auto-create:        No\r\n\
State:              Running\r\n\
Last start time:    14/10/2026 09:12:44\r\n\
Instance pipe name: np:\\\\.\\pipe\\LOCALDB#7C1A7B9F\\tsql\\query\r\n";

    fn demo() -> Identifier {
        sanitize("demo").unwrap()
    }

    fn utility() -> (Arc<MockInvoker>, SqlLocalDb) {
        let mock = Arc::new(MockInvoker::new());
        let utility = SqlLocalDb::new(mock.clone());
        (mock, utility)
    }

    #[test]
    fn test_command_rendering() {
        assert_eq!(UtilityCommand::Create(demo()).to_string(), "create demo");
        assert_eq!(UtilityCommand::Delete(demo()).args(), vec!["delete", "demo"]);
        assert_eq!(UtilityCommand::Info(None).args(), vec!["info"]);
    }

    #[test]
    fn test_parse_running_info() {
        let info = InstanceInfo::parse(INFO_RUNNING);
        assert_eq!(info.name, "demo");
        assert_eq!(info.version.as_deref(), Some("15.0.4153.1"));
        assert_eq!(info.shared_name, None);
        assert_eq!(info.last_start_time.as_deref(), Some("14/10/2026 09:12:44"));
        assert_eq!(
            info.pipe_name.as_deref(),
            Some(r"\\.\pipe\LOCALDB#7C1A7B9F\tsql\query")
        );
        assert!(info.is_running());
    }

    #[test]
    fn test_parse_stopped_info_has_no_pipe() {
        let info = InstanceInfo::parse("Name: demo\nState: Stopped\nInstance pipe name: \n");
        assert!(!info.is_running());
        assert_eq!(info.pipe_name, None);
    }

    #[test]
    fn test_nonzero_exit_is_fatal() {
        let command = UtilityCommand::Create(demo());
        let err = Output::failure(1, "no such thing")
            .ensure_success(&command)
            .unwrap_err();
        assert!(matches!(err, LocalDbError::ExitCode { code: 1, .. }));
        assert!(err.to_string().contains("create demo"));
    }

    #[test]
    fn test_absent_instance_is_benign_for_teardown() {
        let command = UtilityCommand::Stop(demo());
        let output = Output::failure(
            -1983577846,
            "Stop of LocalDB instance \"demo\" failed because of the following error:\n\
             The specified LocalDB instance does not exist.",
        );
        assert!(output.clone().ensure_success_or_absent(&command).is_ok());
        assert!(output.ensure_success(&command).is_err());

        let genuine = Output::failure(1, "Access is denied.");
        assert!(genuine.ensure_success_or_absent(&command).is_err());
    }

    #[tokio::test]
    async fn test_create_twice_succeeds() {
        let (mock, utility) = utility();
        utility.create(&demo()).await.unwrap();
        utility.create(&demo()).await.unwrap();
        assert_eq!(mock.command_lines(), vec!["create demo", "create demo"]);
    }

    #[tokio::test]
    async fn test_stop_delete_on_absent_instance() {
        let (mock, utility) = utility();
        mock.add_response(Output::failure(1, "The specified LocalDB instance does not exist."));
        mock.add_response(Output::failure(1, "The specified LocalDB instance does not exist."));

        utility.stop(&demo()).await.unwrap();
        utility.delete(&demo()).await.unwrap();
        assert_eq!(mock.command_lines(), vec!["stop demo", "delete demo"]);
    }

    #[tokio::test]
    async fn test_instances_listing() {
        let (mock, utility) = utility();
        mock.add_response(Output {
            status: 0,
            stdout: "MSSQLLocalDB\r\ndemo\r\n\r\n".into(),
            stderr: String::new(),
        });

        assert_eq!(utility.instances().await.unwrap(), vec!["MSSQLLocalDB", "demo"]);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let utility = SqlLocalDb::new(Arc::new(ProcessInvoker::new(
            "definitely-not-a-real-sqllocaldb-binary",
        )));
        let err = utility.create(&demo()).await.unwrap_err();
        assert!(matches!(err, LocalDbError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_returns_error() {
        struct SlowInvoker;

        #[async_trait]
        impl Invoker for SlowInvoker {
            async fn invoke(&self, _: &[String]) -> Result<Output> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Output::success())
            }
        }

        let utility = SqlLocalDb::new(Arc::new(SlowInvoker))
            .with_timeout(Some(Duration::from_millis(10)));
        let err = utility.create(&demo()).await.unwrap_err();
        assert!(matches!(err, LocalDbError::Timeout { .. }));
    }
}
