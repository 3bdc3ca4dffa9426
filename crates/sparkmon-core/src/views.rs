//! Read models handed to the presentation layer. Field names are camelCase on
//! the wire because the display widgets consume them directly.

use crate::signals::CellView;
use crate::{
    CellId, EpochMillis, ExecutorId, JobKey, JobStatus, StageId, StageStatus, TaskId, TaskStatus,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellPhase {
    #[default]
    Fresh,
    Executing,
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellSnapshot {
    pub cell_id: CellId,
    pub execution: u64,
    pub phase: CellPhase,
    pub view: CellView,
    pub collapsed: bool,
    pub display_hidden: bool,
    pub num_active_jobs: u64,
    pub num_completed_jobs: u64,
    pub num_failed_jobs: u64,
    pub time_series: TimeSeriesView,
    #[serde(default)]
    pub jobs: Vec<JobView>,
}

/// Chart data for one execution. `task*` are the raw concurrent task counts,
/// `running_y` caps them at capacity, `scheduled` holds the wedges above the
/// capacity line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesView {
    pub task_x: Vec<EpochMillis>,
    pub task_y: Vec<u64>,
    pub running_y: Vec<u64>,
    pub scheduled: Vec<ScheduledRegion>,
    pub executor_x: Vec<EpochMillis>,
    pub executor_y: Vec<u64>,
    pub job_marker_x: Vec<EpochMillis>,
    pub job_marker_y: Vec<u64>,
    pub job_marker_text: Vec<String>,
}

impl TimeSeriesView {
    pub fn is_empty(&self) -> bool {
        self.task_x.is_empty() && self.executor_x.is_empty() && self.job_marker_x.is_empty()
    }
}

/// One contiguous span where queued tasks exceed capacity. The first and last
/// points sit on the capacity line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRegion {
    pub x: Vec<EpochMillis>,
    pub y: Vec<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: u64,
    pub completed: u64,
    pub running: u64,
    pub failed: u64,
}

impl Progress {
    /// Completed share in percent, clamped to `[0, 100]`.
    pub fn completed_percent(&self) -> f64 {
        let total = self.total.max(1);
        let completed = self.completed.min(total);
        completed as f64 * 100.0 / total as f64
    }

    /// Running share in percent. Never exceeds what is left after completed
    /// work and drops to zero once everything completed.
    pub fn running_percent(&self) -> f64 {
        let total = self.total.max(1);
        let completed = self.completed.min(total);
        if completed == total || self.completed_percent() >= 99.99 {
            return 0.0;
        }
        let running = self.running.min(total - completed);
        running as f64 * 100.0 / total as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub key: JobKey,
    pub execution: u64,
    pub status: JobStatus,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub job_group: Option<String>,
    #[serde(default)]
    pub start_time: Option<EpochMillis>,
    #[serde(default)]
    pub end_time: Option<EpochMillis>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub stage_ids: Vec<StageId>,
    pub progress: Progress,
    pub stages: Vec<StageView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageView {
    pub stage_id: StageId,
    pub status: StageStatus,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub attempt: Option<u64>,
    #[serde(default)]
    pub submission_time: Option<EpochMillis>,
    #[serde(default)]
    pub completion_time: Option<EpochMillis>,
    pub progress: Progress,
    #[serde(default)]
    pub tasks: Vec<TaskView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub start_time: Option<EpochMillis>,
    #[serde(default)]
    pub end_time: Option<EpochMillis>,
    #[serde(default)]
    pub executor_id: Option<ExecutorId>,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationView {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub spark_user: Option<String>,
    pub start_time: EpochMillis,
    #[serde(default)]
    pub end_time: Option<EpochMillis>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotebookSnapshot {
    pub notebook_id: String,
    pub revision: u64,
    pub num_executors: u64,
    pub num_total_cores: u64,
    pub hide_all_displays: bool,
    #[serde(default)]
    pub active_cell: Option<CellId>,
    #[serde(default)]
    pub application: Option<ApplicationView>,
    #[serde(default)]
    pub cells: Vec<CellId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_clamps_running_to_remaining_work() {
        let progress = Progress {
            total: 10,
            completed: 6,
            running: 9,
            failed: 0,
        };
        assert_eq!(progress.completed_percent(), 60.0);
        assert_eq!(progress.running_percent(), 40.0);
    }

    #[test]
    fn progress_hides_running_once_complete() {
        let progress = Progress {
            total: 4,
            completed: 7,
            running: 2,
            failed: 0,
        };
        assert_eq!(progress.completed_percent(), 100.0);
        assert_eq!(progress.running_percent(), 0.0);

        let empty = Progress::default();
        assert_eq!(empty.completed_percent(), 0.0);
        assert_eq!(empty.running_percent(), 0.0);
    }

    #[test]
    fn cell_snapshot_serializes_camel_case_badges() {
        let snapshot = CellSnapshot {
            cell_id: CellId::new("c1"),
            execution: 2,
            num_active_jobs: 1,
            ..CellSnapshot::default()
        };
        let value = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(value["numActiveJobs"], 1);
        assert_eq!(value["timeSeries"]["taskX"], serde_json::json!([]));
        assert_eq!(value["phase"], "fresh");
    }
}
