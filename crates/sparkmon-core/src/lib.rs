pub mod events;
pub mod signals;
pub mod views;
pub mod wire;

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Epoch milliseconds, as reported by the compute engine listener.
pub type EpochMillis = i64;

/// Host-assigned notebook cell identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

macro_rules! numeric_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                deserialize_id_u64(deserializer).map($name)
            }
        }
    };
}

numeric_id!(JobId);
numeric_id!(StageId);
numeric_id!(TaskId);

/// Executor ids are strings on the engine side ("driver", "1", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ExecutorId(String);

impl ExecutorId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ExecutorId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize_id_string(deserializer).map(ExecutorId)
    }
}

/// How a job entered the store: reported by the engine, or materialized as a
/// placeholder for a stage whose job was never named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    Reported(JobId),
    InferredFromStage(StageId),
}

/// Engine ids restart with every application, so keys carry the application
/// epoch they were observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub epoch: u32,
    pub origin: JobOrigin,
}

impl JobKey {
    pub fn reported(epoch: u32, job_id: JobId) -> Self {
        Self {
            epoch,
            origin: JobOrigin::Reported(job_id),
        }
    }

    pub fn inferred(epoch: u32, stage_id: StageId) -> Self {
        Self {
            epoch,
            origin: JobOrigin::InferredFromStage(stage_id),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.origin, JobOrigin::InferredFromStage(_))
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self.origin {
            JobOrigin::Reported(job_id) => Some(job_id),
            JobOrigin::InferredFromStage(_) => None,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            JobOrigin::Reported(job_id) => write!(f, "{}:{job_id}", self.epoch),
            JobOrigin::InferredFromStage(stage_id) => {
                write!(f, "{}:inferred-from-stage-{stage_id}", self.epoch)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageKey {
    pub epoch: u32,
    pub stage_id: StageId,
}

impl StageKey {
    pub fn new(epoch: u32, stage_id: StageId) -> Self {
        Self { epoch, stage_id }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.stage_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn terminal(succeeded: bool) -> Self {
        if succeeded {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "running" => Ok(JobStatus::Running),
            "succeeded" | "success" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("Unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Submitted,
    Active,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Submitted => "submitted",
            StageStatus::Active => "active",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed)
    }

    /// Statuses only move forward; terminal statuses share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            StageStatus::Submitted => 0,
            StageStatus::Active => 1,
            StageStatus::Completed | StageStatus::Failed => 2,
        }
    }

    pub fn terminal(succeeded: bool) -> Self {
        if succeeded {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "submitted" | "pending" => Ok(StageStatus::Submitted),
            "active" | "running" => Ok(StageStatus::Active),
            "completed" | "complete" | "skipped" | "succeeded" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            other => Err(format!("Unknown stage status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }

    pub fn terminal(succeeded: bool) -> Self {
        if succeeded {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "running" => Ok(TaskStatus::Running),
            "success" | "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" | "killed" => Ok(TaskStatus::Failed),
            other => Err(format!("Unknown task status: {other}")),
        }
    }
}

/// Deserialize an id that can be either a string or a number into a u64
fn deserialize_id_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => s.trim().parse::<u64>().map_err(serde::de::Error::custom),
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("id must be a non-negative integer")),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

/// Deserialize an id that can be either a string or a number into a String
fn deserialize_id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_accept_strings_and_numbers() {
        let from_number: JobId = serde_json::from_str("7").expect("number id");
        let from_string: JobId = serde_json::from_str("\" 7 \"").expect("string id");
        assert_eq!(from_number, JobId(7));
        assert_eq!(from_string, JobId(7));
        assert!(serde_json::from_str::<StageId>("-1").is_err());
        assert!(serde_json::from_str::<TaskId>("true").is_err());
    }

    #[test]
    fn executor_ids_keep_engine_spelling() {
        let driver: ExecutorId = serde_json::from_str("\"driver\"").expect("string executor");
        let numeric: ExecutorId = serde_json::from_str("3").expect("numeric executor");
        assert_eq!(driver.as_str(), "driver");
        assert_eq!(numeric.as_str(), "3");
    }

    #[test]
    fn status_vocabulary_maps_engine_spellings() {
        assert_eq!("SUCCEEDED".parse::<JobStatus>(), Ok(JobStatus::Succeeded));
        assert_eq!("SKIPPED".parse::<StageStatus>(), Ok(StageStatus::Completed));
        assert_eq!("PENDING".parse::<StageStatus>(), Ok(StageStatus::Submitted));
        assert_eq!("KILLED".parse::<TaskStatus>(), Ok(TaskStatus::Failed));
        assert_eq!("SUCCESS".parse::<TaskStatus>(), Ok(TaskStatus::Succeeded));
        assert!("exploded".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn stage_rank_never_regresses_past_terminal() {
        assert!(StageStatus::Active.rank() > StageStatus::Submitted.rank());
        assert_eq!(StageStatus::Completed.rank(), StageStatus::Failed.rank());
    }

    #[test]
    fn job_keys_render_epoch_and_origin() {
        assert_eq!(JobKey::reported(2, JobId(5)).to_string(), "2:5");
        let placeholder = JobKey::inferred(0, StageId(9));
        assert!(placeholder.is_placeholder());
        assert_eq!(placeholder.job_id(), None);
        assert_eq!(placeholder.to_string(), "0:inferred-from-stage-9");
    }
}
