//! Lifecycle events emitted by the compute engine listener.
//!
//! Events reach the monitor either as kernel comm data
//! (`{"msgtype":"fromscala","msg":"<json>"}`), as bare listener objects
//! (`{"msgtype":"sparkJobStart", ...}`), or as `{"kind": ..., "payload": ...}`
//! envelopes. All three decode into [`SparkEvent`].

use crate::{
    CellId, EpochMillis, ExecutorId, JobId, JobStatus, StageId, StageStatus, TaskId, TaskStatus,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const KERNEL_FORWARD_MSGTYPE: &str = "fromscala";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ApplicationStart,
    ApplicationEnd,
    JobStart,
    JobEnd,
    StageSubmitted,
    StageActive,
    StageCompleted,
    TaskStart,
    TaskEnd,
    ExecutorAdded,
    ExecutorRemoved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ApplicationStart => "sparkApplicationStart",
            EventKind::ApplicationEnd => "sparkApplicationEnd",
            EventKind::JobStart => "sparkJobStart",
            EventKind::JobEnd => "sparkJobEnd",
            EventKind::StageSubmitted => "sparkStageSubmitted",
            EventKind::StageActive => "sparkStageActive",
            EventKind::StageCompleted => "sparkStageCompleted",
            EventKind::TaskStart => "sparkTaskStart",
            EventKind::TaskEnd => "sparkTaskEnd",
            EventKind::ExecutorAdded => "sparkExecutorAdded",
            EventKind::ExecutorRemoved => "sparkExecutorRemoved",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    /// Accepts `sparkJobStart`, `jobStart`, `job_start` and `job-start`.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut normalized: String = input
            .trim()
            .chars()
            .filter(|ch| *ch != '_' && *ch != '-')
            .collect::<String>()
            .to_lowercase();
        if let Some(stripped) = normalized.strip_prefix("spark") {
            normalized = stripped.to_string();
        }
        match normalized.as_str() {
            "applicationstart" => Ok(EventKind::ApplicationStart),
            "applicationend" => Ok(EventKind::ApplicationEnd),
            "jobstart" => Ok(EventKind::JobStart),
            "jobend" => Ok(EventKind::JobEnd),
            "stagesubmitted" => Ok(EventKind::StageSubmitted),
            "stageactive" => Ok(EventKind::StageActive),
            "stagecompleted" => Ok(EventKind::StageCompleted),
            "taskstart" => Ok(EventKind::TaskStart),
            "taskend" => Ok(EventKind::TaskEnd),
            "executoradded" => Ok(EventKind::ExecutorAdded),
            "executorremoved" => Ok(EventKind::ExecutorRemoved),
            _ => Err(format!("Unknown event kind: {}", input.trim())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    #[error("event carries no msgtype/kind field")]
    MissingKind,
    #[error("unknown event kind '{0}'")]
    UnknownKind(String),
    #[error("kernel message '{0}' is not an engine event")]
    NotEngineEvent(String),
    #[error("forwarded engine message is not valid json: {0}")]
    InvalidJson(String),
    #[error("malformed {kind} event: {reason}")]
    Malformed { kind: EventKind, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStart {
    pub start_time: EpochMillis,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub app_attempt_id: Option<String>,
    #[serde(default)]
    pub spark_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationEnd {
    pub end_time: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStart {
    pub job_id: JobId,
    pub submission_time: EpochMillis,
    #[serde(default)]
    pub stage_ids: Vec<StageId>,
    #[serde(default)]
    pub num_tasks: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub job_group: Option<String>,
    /// Set by transports that already know the originating cell.
    #[serde(default)]
    pub cell_id: Option<CellId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnd {
    pub job_id: JobId,
    pub completion_time: EpochMillis,
    #[serde(deserialize_with = "parse_status")]
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSubmitted {
    pub stage_id: StageId,
    #[serde(default)]
    pub stage_attempt_id: Option<u64>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub job_ids: Vec<JobId>,
    #[serde(default)]
    pub num_tasks: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub submission_time: Option<EpochMillis>,
    #[serde(default)]
    pub parent_ids: Vec<StageId>,
}

impl StageSubmitted {
    pub fn job_hint(&self) -> Option<JobId> {
        self.job_id.or_else(|| self.job_ids.first().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageActive {
    pub stage_id: StageId,
    #[serde(default)]
    pub stage_attempt_id: Option<u64>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub job_ids: Vec<JobId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub num_tasks: Option<u64>,
    #[serde(default)]
    pub num_active_tasks: Option<u64>,
    #[serde(default)]
    pub num_completed_tasks: Option<u64>,
    #[serde(default)]
    pub num_failed_tasks: Option<u64>,
}

impl StageActive {
    pub fn job_hint(&self) -> Option<JobId> {
        self.job_id.or_else(|| self.job_ids.first().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCompleted {
    pub stage_id: StageId,
    #[serde(deserialize_with = "parse_status")]
    pub status: StageStatus,
    #[serde(default)]
    pub stage_attempt_id: Option<u64>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub job_ids: Vec<JobId>,
    #[serde(default)]
    pub num_tasks: Option<u64>,
    #[serde(default)]
    pub submission_time: Option<EpochMillis>,
    #[serde(default)]
    pub completion_time: Option<EpochMillis>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl StageCompleted {
    pub fn job_hint(&self) -> Option<JobId> {
        self.job_id.or_else(|| self.job_ids.first().copied())
    }

    pub fn succeeded(&self) -> bool {
        self.status != StageStatus::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStart {
    pub task_id: TaskId,
    pub stage_id: StageId,
    pub launch_time: EpochMillis,
    #[serde(default)]
    pub stage_attempt_id: Option<u64>,
    #[serde(default)]
    pub executor_id: Option<ExecutorId>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub attempt_number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnd {
    pub task_id: TaskId,
    pub stage_id: StageId,
    pub finish_time: EpochMillis,
    #[serde(deserialize_with = "parse_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub launch_time: Option<EpochMillis>,
    #[serde(default)]
    pub stage_attempt_id: Option<u64>,
    #[serde(default)]
    pub executor_id: Option<ExecutorId>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorAdded {
    pub executor_id: ExecutorId,
    pub time: EpochMillis,
    #[serde(alias = "cores")]
    pub num_cores: u32,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorRemoved {
    pub executor_id: ExecutorId,
    pub time: EpochMillis,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SparkEvent {
    ApplicationStart(ApplicationStart),
    ApplicationEnd(ApplicationEnd),
    JobStart(JobStart),
    JobEnd(JobEnd),
    StageSubmitted(StageSubmitted),
    StageActive(StageActive),
    StageCompleted(StageCompleted),
    TaskStart(TaskStart),
    TaskEnd(TaskEnd),
    ExecutorAdded(ExecutorAdded),
    ExecutorRemoved(ExecutorRemoved),
}

impl SparkEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SparkEvent::ApplicationStart(_) => EventKind::ApplicationStart,
            SparkEvent::ApplicationEnd(_) => EventKind::ApplicationEnd,
            SparkEvent::JobStart(_) => EventKind::JobStart,
            SparkEvent::JobEnd(_) => EventKind::JobEnd,
            SparkEvent::StageSubmitted(_) => EventKind::StageSubmitted,
            SparkEvent::StageActive(_) => EventKind::StageActive,
            SparkEvent::StageCompleted(_) => EventKind::StageCompleted,
            SparkEvent::TaskStart(_) => EventKind::TaskStart,
            SparkEvent::TaskEnd(_) => EventKind::TaskEnd,
            SparkEvent::ExecutorAdded(_) => EventKind::ExecutorAdded,
            SparkEvent::ExecutorRemoved(_) => EventKind::ExecutorRemoved,
        }
    }

    /// Best-known wall clock time of the event, if the payload carries one.
    pub fn timestamp(&self) -> Option<EpochMillis> {
        match self {
            SparkEvent::ApplicationStart(event) => Some(event.start_time),
            SparkEvent::ApplicationEnd(event) => Some(event.end_time),
            SparkEvent::JobStart(event) => Some(event.submission_time),
            SparkEvent::JobEnd(event) => Some(event.completion_time),
            SparkEvent::StageSubmitted(event) => event.submission_time,
            SparkEvent::StageActive(_) => None,
            SparkEvent::StageCompleted(event) => event.completion_time,
            SparkEvent::TaskStart(event) => Some(event.launch_time),
            SparkEvent::TaskEnd(event) => Some(event.finish_time),
            SparkEvent::ExecutorAdded(event) => Some(event.time),
            SparkEvent::ExecutorRemoved(event) => Some(event.time),
        }
    }
}

/// Strips the kernel comm wrapper, returning the engine event object.
pub fn unwrap_kernel_message(data: &Value) -> Result<Value, EventDecodeError> {
    if data.get("kind").is_some() {
        return Ok(data.clone());
    }
    let msgtype = data
        .get("msgtype")
        .and_then(Value::as_str)
        .ok_or(EventDecodeError::MissingKind)?;
    if msgtype != KERNEL_FORWARD_MSGTYPE {
        if msgtype.starts_with("spark") {
            return Ok(data.clone());
        }
        return Err(EventDecodeError::NotEngineEvent(msgtype.to_string()));
    }
    match data.get("msg") {
        Some(Value::String(raw)) => serde_json::from_str(raw)
            .map_err(|err| EventDecodeError::InvalidJson(err.to_string())),
        Some(value @ Value::Object(_)) => Ok(value.clone()),
        _ => Err(EventDecodeError::InvalidJson(
            "forwarded message has no msg body".to_string(),
        )),
    }
}

/// Decodes a single engine event object. Kernel wrappers must be removed first
/// with [`unwrap_kernel_message`]; [`decode_kernel_message`] does both.
pub fn decode_event(value: &Value) -> Result<SparkEvent, EventDecodeError> {
    let (raw_kind, payload) = match (value.get("kind"), value.get("payload")) {
        (Some(Value::String(kind)), Some(payload)) => (kind.as_str(), payload),
        _ => {
            let kind = value
                .get("msgtype")
                .or_else(|| value.get("kind"))
                .and_then(Value::as_str)
                .ok_or(EventDecodeError::MissingKind)?;
            (kind, value)
        }
    };
    let kind = raw_kind
        .parse::<EventKind>()
        .map_err(|_| EventDecodeError::UnknownKind(raw_kind.to_string()))?;

    let event = match kind {
        EventKind::ApplicationStart => SparkEvent::ApplicationStart(payload_as(kind, payload)?),
        EventKind::ApplicationEnd => SparkEvent::ApplicationEnd(payload_as(kind, payload)?),
        EventKind::JobStart => SparkEvent::JobStart(payload_as(kind, payload)?),
        EventKind::JobEnd => SparkEvent::JobEnd(payload_as(kind, payload)?),
        EventKind::StageSubmitted => SparkEvent::StageSubmitted(payload_as(kind, payload)?),
        EventKind::StageActive => SparkEvent::StageActive(payload_as(kind, payload)?),
        EventKind::StageCompleted => SparkEvent::StageCompleted(payload_as(kind, payload)?),
        EventKind::TaskStart => SparkEvent::TaskStart(payload_as(kind, payload)?),
        EventKind::TaskEnd => SparkEvent::TaskEnd(payload_as(kind, payload)?),
        EventKind::ExecutorAdded => SparkEvent::ExecutorAdded(payload_as(kind, payload)?),
        EventKind::ExecutorRemoved => SparkEvent::ExecutorRemoved(payload_as(kind, payload)?),
    };
    Ok(event)
}

pub fn decode_kernel_message(data: &Value) -> Result<SparkEvent, EventDecodeError> {
    let unwrapped = unwrap_kernel_message(data)?;
    decode_event(&unwrapped)
}

fn payload_as<T: serde::de::DeserializeOwned>(
    kind: EventKind,
    payload: &Value,
) -> Result<T, EventDecodeError> {
    T::deserialize(payload).map_err(|err| EventDecodeError::Malformed {
        kind,
        reason: err.to_string(),
    })
}

fn parse_status<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr<Err = String>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse::<T>().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_parsing_accepts_listener_and_short_spellings() {
        assert_eq!("sparkJobStart".parse::<EventKind>(), Ok(EventKind::JobStart));
        assert_eq!("jobStart".parse::<EventKind>(), Ok(EventKind::JobStart));
        assert_eq!(
            "executor_removed".parse::<EventKind>(),
            Ok(EventKind::ExecutorRemoved)
        );
        assert_eq!(
            "stage-completed".parse::<EventKind>(),
            Ok(EventKind::StageCompleted)
        );
        assert!("sparkEnvironmentUpdate".parse::<EventKind>().is_err());
    }

    #[test]
    fn decodes_forwarded_kernel_message_with_string_body() {
        let inner = json!({
            "msgtype": "sparkJobStart",
            "jobId": 3,
            "submissionTime": 1_707_335_222_000i64,
            "stageIds": [4, 5],
            "numTasks": 12,
            "name": "count at <stdin>:1",
            "jobGroup": null
        });
        let wrapper = json!({"msgtype": "fromscala", "msg": inner.to_string()});

        let event = decode_kernel_message(&wrapper).expect("decode");
        match event {
            SparkEvent::JobStart(start) => {
                assert_eq!(start.job_id, JobId(3));
                assert_eq!(start.stage_ids, vec![StageId(4), StageId(5)]);
                assert_eq!(start.num_tasks, Some(12));
                assert_eq!(start.job_group, None);
                assert_eq!(start.cell_id, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decodes_kind_payload_envelope() {
        let envelope = json!({
            "kind": "taskEnd",
            "payload": {
                "taskId": "17",
                "stageId": 2,
                "finishTime": 50,
                "status": "SUCCESS",
                "executorId": "1"
            }
        });
        let event = decode_kernel_message(&envelope).expect("decode envelope");
        assert_eq!(event.kind(), EventKind::TaskEnd);
        assert_eq!(event.timestamp(), Some(50));
        match event {
            SparkEvent::TaskEnd(end) => {
                assert_eq!(end.task_id, TaskId(17));
                assert_eq!(end.status, TaskStatus::Succeeded);
                assert_eq!(end.executor_id, Some(ExecutorId::new("1")));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_and_missing_fields_are_distinguished() {
        let unknown = json!({"msgtype": "sparkEnvironmentUpdate"});
        assert_eq!(
            decode_kernel_message(&unknown),
            Err(EventDecodeError::UnknownKind(
                "sparkEnvironmentUpdate".to_string()
            ))
        );

        let missing_job = json!({"msgtype": "sparkJobEnd", "completionTime": 10, "status": "SUCCEEDED"});
        match decode_kernel_message(&missing_job) {
            Err(EventDecodeError::Malformed { kind, reason }) => {
                assert_eq!(kind, EventKind::JobEnd);
                assert!(reason.contains("jobId"), "reason: {reason}");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let bad_status = json!({"msgtype": "sparkJobEnd", "jobId": 1, "completionTime": 10, "status": "EXPLODED"});
        assert!(matches!(
            decode_kernel_message(&bad_status),
            Err(EventDecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn non_engine_comm_messages_are_rejected() {
        let comm_open = json!({"msgtype": "commopen"});
        assert_eq!(
            unwrap_kernel_message(&comm_open),
            Err(EventDecodeError::NotEngineEvent("commopen".to_string()))
        );
        assert_eq!(
            unwrap_kernel_message(&json!({"msg": "{}"})),
            Err(EventDecodeError::MissingKind)
        );
        assert!(matches!(
            unwrap_kernel_message(&json!({"msgtype": "fromscala", "msg": "{not json"})),
            Err(EventDecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn executor_added_accepts_cores_alias() {
        let event = decode_kernel_message(&json!({
            "msgtype": "sparkExecutorAdded",
            "executorId": "driver",
            "time": 5,
            "cores": 8,
            "host": "10.0.0.4"
        }))
        .expect("decode");
        match event {
            SparkEvent::ExecutorAdded(added) => {
                assert_eq!(added.num_cores, 8);
                assert_eq!(added.executor_id.as_str(), "driver");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn stage_job_hint_prefers_singular_field() {
        let submitted: StageSubmitted = serde_json::from_value(json!({
            "stageId": 1,
            "jobId": 9,
            "jobIds": [4]
        }))
        .expect("parse");
        assert_eq!(submitted.job_hint(), Some(JobId(9)));

        let submitted: StageSubmitted =
            serde_json::from_value(json!({"stageId": 1, "jobIds": [4, 5]})).expect("parse");
        assert_eq!(submitted.job_hint(), Some(JobId(4)));
    }
}
