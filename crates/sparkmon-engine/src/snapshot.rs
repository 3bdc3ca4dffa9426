//! Projection of committed store state into the view types.

use crate::capacity::CapacityTracker;
use crate::store::{CellRecord, JobRecord, StageRecord, StateStore, TaskRecord};
use crate::timeseries::{build_time_series, JobMarker};
use sparkmon_core::views::{CellPhase, CellSnapshot, JobView, Progress, StageView, TaskView};
use sparkmon_core::{StageStatus, TaskStatus};

pub(crate) fn cell_snapshot(
    store: &StateStore,
    capacity: &CapacityTracker,
    cell: &CellRecord,
    is_active: bool,
) -> CellSnapshot {
    let counts = cell.counts();
    let jobs = store.execution_jobs(&cell.cell_id, cell.current);

    let mut intervals = Vec::new();
    let mut markers = Vec::new();
    for job in &jobs {
        if let (true, Some(job_id), Some(at)) = (job.started, job.key.job_id(), job.start_time) {
            markers.push(JobMarker {
                at,
                text: format!("Job {job_id} started"),
            });
        }
        for stage in store.job_stages(job) {
            intervals.extend(
                store
                    .stage_tasks(stage)
                    .into_iter()
                    .filter_map(TaskRecord::interval),
            );
        }
    }

    CellSnapshot {
        cell_id: cell.cell_id.clone(),
        execution: cell.current,
        phase: cell_phase(cell, is_active),
        view: cell.view,
        collapsed: cell.collapsed,
        display_hidden: cell.display_hidden,
        num_active_jobs: counts.active,
        num_completed_jobs: counts.completed,
        num_failed_jobs: counts.failed,
        time_series: build_time_series(intervals, markers, capacity),
        jobs: jobs.into_iter().map(|job| job_view(store, job)).collect(),
    }
}

fn cell_phase(cell: &CellRecord, is_active: bool) -> CellPhase {
    let Some(execution) = cell.current_execution() else {
        return CellPhase::Fresh;
    };
    if execution.counts.active > 0 || (is_active && execution.signaled) {
        CellPhase::Executing
    } else if execution.counts.total() > 0 || execution.signaled {
        CellPhase::Completed
    } else {
        CellPhase::Fresh
    }
}

pub(crate) fn job_view(store: &StateStore, job: &JobRecord) -> JobView {
    let stages: Vec<StageView> = store
        .job_stages(job)
        .into_iter()
        .map(|stage| stage_view(store, stage))
        .collect();

    let mut progress = stages.iter().fold(Progress::default(), |acc, stage| Progress {
        total: acc.total + stage.progress.total,
        completed: acc.completed + stage.progress.completed,
        running: acc.running + stage.progress.running,
        failed: acc.failed + stage.progress.failed,
    });
    progress.total = progress.total.max(job.num_tasks.unwrap_or(0));

    let start_time = job.start_time.or_else(|| {
        stages
            .iter()
            .filter_map(|stage| stage.submission_time)
            .min()
    });
    let duration_ms = match (start_time, job.end_time) {
        (Some(start), Some(end)) => Some((end - start).max(0)),
        _ => None,
    };

    JobView {
        key: job.key,
        execution: job.owner.execution,
        status: job.status,
        name: job.name.clone(),
        job_group: job.job_group.clone(),
        start_time,
        end_time: job.end_time,
        duration_ms,
        stage_ids: job.stage_ids.clone(),
        progress,
        stages,
    }
}

fn stage_view(store: &StateStore, stage: &StageRecord) -> StageView {
    let tasks = store.stage_tasks(stage);
    StageView {
        stage_id: stage.key.stage_id,
        status: stage.status,
        name: stage.name.clone(),
        attempt: stage.attempt,
        submission_time: stage.submission_time,
        completion_time: stage.completion_time,
        progress: stage_progress(stage, &tasks),
        tasks: tasks
            .into_iter()
            .map(|task| TaskView {
                task_id: task.key.task_id,
                status: task.status,
                start_time: task.start_time,
                end_time: task.end_time,
                executor_id: task.executor_id.clone(),
                host: task.host.clone(),
            })
            .collect(),
    }
}

/// Observed task outcomes, raised to whatever the engine reported.
fn stage_progress(stage: &StageRecord, tasks: &[&TaskRecord]) -> Progress {
    let count = |status: TaskStatus| tasks.iter().filter(|task| task.status == status).count() as u64;
    let completed = count(TaskStatus::Succeeded).max(stage.reported.completed);
    let failed = count(TaskStatus::Failed).max(stage.reported.failed);
    let running = if stage.status.is_terminal() {
        0
    } else if stage.status == StageStatus::Active && tasks.is_empty() {
        stage.reported.active
    } else {
        count(TaskStatus::Running)
    };
    let total = stage
        .num_tasks
        .unwrap_or(0)
        .max(tasks.len() as u64)
        .max(completed + failed + running);
    Progress {
        total,
        completed,
        running,
        failed,
    }
}
