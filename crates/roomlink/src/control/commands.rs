//! Command publisher for the `cmd` topic.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::publish_json;
use crate::error::{DeviceError, Result};
use crate::session::SessionProvider;

/// Topic commands are published to.
pub const COMMAND_TOPIC: &str = "cmd";

/// Initiator the device expects for commands from the local network.
pub const COMMAND_INITIATOR: &str = "localApp";

/// Commands a device accepts on the `cmd` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Find,
    Start,
    Stop,
    Pause,
    Resume,
    Dock,
    Evac,
    Reset,
    Train,
}

impl Command {
    /// Every command, in wire order.
    pub const ALL: [Command; 9] = [
        Command::Find,
        Command::Start,
        Command::Stop,
        Command::Pause,
        Command::Resume,
        Command::Dock,
        Command::Evac,
        Command::Reset,
        Command::Train,
    ];

    /// Wire name of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Find => "find",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Dock => "dock",
            Command::Evac => "evac",
            Command::Reset => "reset",
            Command::Train => "train",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = DeviceError;

    /// Parses a command name, ignoring case.
    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        Command::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| DeviceError::Validation(format!("invalid command: {}", s)))
    }
}

/// JSON body published on the `cmd` topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandPayload {
    pub command: &'static str,
    /// Unix time in seconds.
    pub time: i64,
    pub initiator: &'static str,
}

impl CommandPayload {
    pub fn new(command: Command, time: i64) -> Self {
        Self {
            command: command.as_str(),
            time,
            initiator: COMMAND_INITIATOR,
        }
    }
}

/// How a batch of commands is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchMode {
    /// Each command is awaited before the next starts.
    #[default]
    Sequential,
    /// All commands are dispatched at once and joined.
    Concurrent,
}

/// Outcome of one command in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    /// The command name as requested.
    pub command: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a whole batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub execution_id: Uuid,
    /// True only if every command succeeded.
    pub success: bool,
    pub results: Vec<CommandResult>,
    pub timestamp: DateTime<Utc>,
}

/// Publishes commands to one device.
#[derive(Clone)]
pub struct CommandPublisher {
    provider: Arc<dyn SessionProvider>,
}

impl CommandPublisher {
    pub fn new(provider: Arc<dyn SessionProvider>) -> Self {
        Self { provider }
    }

    /// Sends one command.
    pub async fn execute(&self, command: Command, cancel: &CancellationToken) -> Result<()> {
        let session = self.provider.get_session(cancel).await?;
        let payload = CommandPayload::new(command, Utc::now().timestamp());

        tracing::info!(command = %command, time = payload.time, "Publishing command");
        publish_json(session.as_ref(), COMMAND_TOPIC, &payload, cancel).await?;
        tracing::info!(command = %command, "Command sent");
        Ok(())
    }

    /// Parses and sends one command by name.
    ///
    /// Unknown names are rejected before connecting.
    pub async fn execute_named(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let command: Command = name.parse()?;
        self.execute(command, cancel).await
    }

    /// Sends several commands and records an outcome for each.
    ///
    /// A failing command never stops the others in either mode.
    pub async fn execute_batch<S: AsRef<str>>(
        &self,
        names: &[S],
        mode: BatchMode,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let execution_id = Uuid::new_v4();
        tracing::info!(
            execution_id = %execution_id,
            count = names.len(),
            mode = ?mode,
            "Executing command batch"
        );

        let results = match mode {
            BatchMode::Sequential => {
                let mut results = Vec::with_capacity(names.len());
                for name in names {
                    results.push(self.execute_one(name.as_ref(), cancel).await);
                }
                results
            }
            BatchMode::Concurrent => {
                join_all(names.iter().map(|name| self.execute_one(name.as_ref(), cancel))).await
            }
        };

        let success = results.iter().all(|r| r.success);
        BatchReport {
            execution_id,
            success,
            results,
            timestamp: Utc::now(),
        }
    }

    async fn execute_one(&self, name: &str, cancel: &CancellationToken) -> CommandResult {
        let command = match name.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                return CommandResult {
                    command: name.to_string(),
                    success: false,
                    message: format!("Invalid command: {}", name),
                    error: Some(e.to_string()),
                }
            }
        };

        match self.execute(command, cancel).await {
            Ok(()) => CommandResult {
                command: name.to_string(),
                success: true,
                message: format!("Command '{}' executed successfully", command),
                error: None,
            },
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::warn!(command = %command, error = %e, "Command failed");
                }
                CommandResult {
                    command: name.to_string(),
                    success: false,
                    message: format!("Failed to execute command '{}'", command),
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingProvider;

    #[test]
    fn test_parse_command_names() {
        assert_eq!("find".parse::<Command>().unwrap(), Command::Find);
        assert_eq!("DOCK".parse::<Command>().unwrap(), Command::Dock);
        assert_eq!(" evac ".parse::<Command>().unwrap(), Command::Evac);
        assert!(matches!(
            "explode".parse::<Command>(),
            Err(DeviceError::Validation(_))
        ));
    }

    #[test]
    fn test_all_in_wire_order() {
        let names: Vec<&str> = Command::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(
            names,
            ["find", "start", "stop", "pause", "resume", "dock", "evac", "reset", "train"]
        );
    }

    #[test]
    fn test_payload_shape() {
        let payload = CommandPayload::new(Command::Start, 1_700_000_000);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"command": "start", "time": 1_700_000_000, "initiator": "localApp"})
        );
    }

    #[tokio::test]
    async fn test_execute_publishes_to_cmd() {
        let provider = RecordingProvider::new();
        let publisher = CommandPublisher::new(provider.clone());
        let cancel = CancellationToken::new();

        publisher.execute(Command::Dock, &cancel).await.unwrap();

        let published = provider.session.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "cmd");
        let body: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body["command"], "dock");
        assert_eq!(body["initiator"], "localApp");
        assert!(body["time"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_invalid_name_does_not_connect() {
        let provider = RecordingProvider::new();
        let publisher = CommandPublisher::new(provider.clone());

        let result = publisher
            .execute_named("fly", &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DeviceError::Validation(_))));
        assert_eq!(provider.session_requests(), 0);
    }

    #[tokio::test]
    async fn test_sequential_batch_continues_after_failure() {
        let provider = RecordingProvider::new();
        let publisher = CommandPublisher::new(provider.clone());

        let report = publisher
            .execute_batch(
                &["start", "bogus", "dock"],
                BatchMode::Sequential,
                &CancellationToken::new(),
            )
            .await;

        assert!(!report.success);
        assert_eq!(report.results.len(), 3);
        assert!(report.results[0].success);
        assert!(!report.results[1].success);
        assert_eq!(report.results[1].message, "Invalid command: bogus");
        assert!(report.results[2].success);

        let topics: Vec<String> = provider
            .session
            .published()
            .into_iter()
            .map(|(_, body)| {
                let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
                v["command"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(topics, ["start", "dock"]);
    }

    #[tokio::test]
    async fn test_concurrent_batch_records_every_outcome() {
        let provider = RecordingProvider::new();
        provider.session.fail_publishes(true);
        let publisher = CommandPublisher::new(provider.clone());

        let report = publisher
            .execute_batch(
                &["find", "stop"],
                BatchMode::Concurrent,
                &CancellationToken::new(),
            )
            .await;

        assert!(!report.success);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].command, "find");
        assert_eq!(report.results[1].command, "stop");
        assert!(report.results.iter().all(|r| r.error.is_some()));
    }

    #[tokio::test]
    async fn test_batch_all_succeed() {
        let provider = RecordingProvider::new();
        let publisher = CommandPublisher::new(provider.clone());

        let report = publisher
            .execute_batch(&["pause", "resume"], BatchMode::Concurrent, &CancellationToken::new())
            .await;

        assert!(report.success);
        assert_eq!(provider.session.published().len(), 2);
    }
}
