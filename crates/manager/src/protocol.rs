//! Wire types: commands, responses and progress events.
//!
//! Everything here is serialized as plain JSON so controllers written in any
//! language can drive a manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CommandError, LaunchError};
use crate::launcher::JobOutcome;
use crate::topics::{is_command_topic, DEFAULT_PROGRESS_TOPIC};

/// The only method a manager understands.
pub const START_DATA_SOURCE: &str = "start_data_source";

/// Free-form handler parameters (a JSON object).
pub type HandlerParams = serde_json::Map<String, serde_json::Value>;

/// A request to start a data source on the manager that owns the command topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Correlation id, echoed in the response.
    pub request_id: Uuid,
    /// Operation name; must be [`START_DATA_SOURCE`].
    pub method: String,
    pub params: StartParams,
    /// Topic the caller listens on for the single response.
    pub response_channel: String,
    /// Topic the job publishes progress on. Absent means [`DEFAULT_PROGRESS_TOPIC`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartParams {
    /// Handler identifier, e.g. `"EchoHandler"`.
    pub datasource: String,
    /// Parameters handed to the handler's constructor.
    #[serde(default)]
    pub params: HandlerParams,
}

/// A validated command, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub request_id: Uuid,
    pub datasource: String,
    pub params: HandlerParams,
    pub response_channel: String,
    pub progress_channel: String,
}

impl Command {
    /// Build a `start_data_source` command with a fresh request id.
    pub fn start_data_source(
        datasource: impl Into<String>,
        params: HandlerParams,
        response_channel: impl Into<String>,
        progress_channel: Option<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            method: START_DATA_SOURCE.to_string(),
            params: StartParams {
                datasource: datasource.into(),
                params,
            },
            response_channel: response_channel.into(),
            progress_channel,
        }
    }

    /// Progress topic for this command, falling back to the shared default.
    pub fn progress_topic(&self) -> &str {
        self.progress_channel
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_PROGRESS_TOPIC)
    }

    /// Decode a command from a bus payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, CommandError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Whether a rejection can be sent back to the caller at all.
    pub fn has_reply_channel(&self) -> bool {
        !self.response_channel.is_empty() && !is_command_topic(&self.response_channel)
    }

    /// Check the command and turn it into a [`JobSpec`].
    pub fn validate(&self) -> Result<JobSpec, CommandError> {
        if self.response_channel.is_empty() {
            return Err(CommandError::EmptyField("response_channel"));
        }
        if is_command_topic(&self.response_channel) {
            return Err(CommandError::ReservedChannel(self.response_channel.clone()));
        }
        if self.method != START_DATA_SOURCE {
            return Err(CommandError::UnknownMethod(self.method.clone()));
        }
        if self.params.datasource.trim().is_empty() {
            return Err(CommandError::EmptyField("params.datasource"));
        }
        let progress_channel = self.progress_topic().to_string();
        if is_command_topic(&progress_channel) {
            return Err(CommandError::ReservedChannel(progress_channel));
        }

        Ok(JobSpec {
            request_id: self.request_id,
            datasource: self.params.datasource.clone(),
            params: self.params.params.clone(),
            response_channel: self.response_channel.clone(),
            progress_channel,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The job process exited with status 0.
    Success,
    /// The job could not be spawned, exited nonzero, or was killed.
    Failed,
    /// The command was understood but refused before anything ran.
    Rejected,
}

/// The single reply to a [`Command`], published on its response channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub request_id: Uuid,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<String>,
    /// Pid of the job process, when one was spawned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Exit code of the job process; absent when it was killed by a signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl CommandResponse {
    /// Response for a job whose process ran to exit.
    pub fn completed(spec: &JobSpec, outcome: &JobOutcome) -> Self {
        let (status, error) = if outcome.success() {
            (ResponseStatus::Success, None)
        } else {
            (ResponseStatus::Failed, Some(outcome.failure_summary()))
        };
        Self {
            request_id: spec.request_id,
            status,
            datasource: Some(spec.datasource.clone()),
            pid: outcome.pid,
            exit_code: outcome.exit_code,
            error,
            finished_at: Utc::now(),
        }
    }

    /// Response for a job whose process never started.
    pub fn launch_failed(spec: &JobSpec, err: &LaunchError) -> Self {
        Self {
            request_id: spec.request_id,
            status: ResponseStatus::Failed,
            datasource: Some(spec.datasource.clone()),
            pid: None,
            exit_code: None,
            error: Some(err.to_string()),
            finished_at: Utc::now(),
        }
    }

    /// Response for a command refused during validation.
    pub fn rejected(command: &Command, err: &CommandError) -> Self {
        Self {
            request_id: command.request_id,
            status: ResponseStatus::Rejected,
            datasource: Some(command.params.datasource.clone()).filter(|d| !d.is_empty()),
            pid: None,
            exit_code: None,
            error: Some(err.to_string()),
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// One progress tick from a running job.
///
/// Events are snapshots: the latest one is authoritative, nothing accumulates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Pid of the job process that emitted the event.
    pub pid: u32,
    /// Label chosen by the handler (e.g. the repository being fetched).
    pub name: String,
    pub total: u64,
    pub processed: u64,
    /// Whole percent in `0..=100`.
    #[serde(rename = "progress")]
    pub progress_percent: u8,
    /// Handler's estimate of the remaining time, in seconds.
    pub estimated_time: f64,
}

impl ProgressEvent {
    pub fn new(pid: u32, name: impl Into<String>, total: u64, processed: u64, estimated_time: f64) -> Self {
        Self {
            pid,
            name: name.into(),
            total,
            processed,
            progress_percent: progress_percent(total, processed),
            estimated_time,
        }
    }
}

/// `floor(processed * 100 / total)`, `0` when `total` is zero, capped at 100.
pub fn progress_percent(total: u64, processed: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = u128::from(processed) * 100 / u128::from(total);
    pct.min(100) as u8
}
