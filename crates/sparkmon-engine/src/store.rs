//! Job, stage and task state, attributed to cell executions.
//!
//! Records live in flat id-keyed maps. Stages point at their job and tasks at
//! their stage; a job's owner is the `(cell, execution)` it was attributed to.
//! Each execution keeps running job counters that every status change updates
//! in place.

use crate::config::DEFAULT_MAX_TOMBSTONES;
use crate::diagnostics::{ApplyReport, DiagnosticKind};
use crate::locator::{ExecutionLookup, Owner};
use sparkmon_core::events::{
    JobEnd, JobStart, StageActive, StageCompleted, StageSubmitted, TaskEnd, TaskStart,
};
use sparkmon_core::signals::CellView;
use sparkmon_core::{
    CellId, EpochMillis, ExecutorId, JobId, JobKey, JobStatus, StageId, StageKey, StageStatus,
    TaskId, TaskStatus,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub epoch: u32,
    pub task_id: TaskId,
}

impl TaskKey {
    pub fn new(epoch: u32, task_id: TaskId) -> Self {
        Self { epoch, task_id }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.task_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    fn bucket_mut(&mut self, status: JobStatus) -> &mut u64 {
        match status {
            JobStatus::Running => &mut self.active,
            JobStatus::Succeeded => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
        }
    }

    fn add(&mut self, status: JobStatus) {
        *self.bucket_mut(status) += 1;
    }

    fn remove(&mut self, status: JobStatus) {
        let bucket = self.bucket_mut(status);
        *bucket = bucket.saturating_sub(1);
    }

    pub fn total(&self) -> u64 {
        self.active + self.completed + self.failed
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionRecord {
    pub jobs: BTreeSet<JobKey>,
    pub counts: JobCounts,
    /// The host announced this execution explicitly.
    pub signaled: bool,
    pub marker: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CellRecord {
    pub cell_id: CellId,
    pub current: u64,
    /// No job has been attributed to the current execution yet.
    pub pristine: bool,
    pub executions: BTreeMap<u64, ExecutionRecord>,
    pub last_marker: Option<String>,
    pub view: CellView,
    pub collapsed: bool,
    pub display_hidden: bool,
}

impl CellRecord {
    fn new(cell_id: CellId) -> Self {
        Self {
            cell_id,
            current: 1,
            pristine: true,
            executions: BTreeMap::from([(1, ExecutionRecord::default())]),
            last_marker: None,
            view: CellView::default(),
            collapsed: false,
            display_hidden: false,
        }
    }

    pub fn current_execution(&self) -> Option<&ExecutionRecord> {
        self.executions.get(&self.current)
    }

    pub fn counts(&self) -> JobCounts {
        self.current_execution()
            .map(|execution| execution.counts)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub key: JobKey,
    pub owner: Owner,
    pub status: JobStatus,
    /// A job-start was applied. Jobs materialized by other events are
    /// re-homed when their start arrives.
    pub started: bool,
    pub start_time: Option<EpochMillis>,
    pub end_time: Option<EpochMillis>,
    pub stage_ids: Vec<StageId>,
    pub name: Option<String>,
    pub job_group: Option<String>,
    pub num_tasks: Option<u64>,
}

impl JobRecord {
    fn new(key: JobKey, owner: Owner, status: JobStatus) -> Self {
        Self {
            key,
            owner,
            status,
            started: false,
            start_time: None,
            end_time: None,
            stage_ids: Vec::new(),
            name: None,
            job_group: None,
            num_tasks: None,
        }
    }

    fn apply_start(&mut self, event: &JobStart) {
        self.started = true;
        self.start_time = Some(event.submission_time);
        if event.name.is_some() {
            self.name = event.name.clone();
        }
        if event.job_group.is_some() {
            self.job_group = event.job_group.clone();
        }
        self.num_tasks = self.num_tasks.max(event.num_tasks);
    }
}

/// Task counts as last reported by a stage-active event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportedTaskCounts {
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Why a stage is bound to a job, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ClaimSource {
    /// Materialized for a stage whose job was never named.
    Placeholder,
    /// Listed in a job-start's stage ids.
    Listed,
    /// Named by the stage's own events.
    Named,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StageClaim {
    job: JobKey,
    source: ClaimSource,
}

impl StageClaim {
    fn new(job: JobKey, source: ClaimSource) -> Self {
        Self { job, source }
    }

    /// Stronger sources win. Between equal sources the lowest job key wins, so
    /// the binding does not depend on arrival order.
    fn outranks(&self, other: &StageClaim) -> bool {
        self.source > other.source || (self.source == other.source && self.job < other.job)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusChange {
    Advanced,
    Unchanged,
    Conflict,
}

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub key: StageKey,
    pub job: JobKey,
    pub status: StageStatus,
    pub submitted: bool,
    pub num_tasks: Option<u64>,
    pub name: Option<String>,
    pub attempt: Option<u64>,
    pub submission_time: Option<EpochMillis>,
    pub completion_time: Option<EpochMillis>,
    pub failure_reason: Option<String>,
    pub reported: ReportedTaskCounts,
    pub tasks: BTreeSet<TaskId>,
}

impl StageRecord {
    fn new(key: StageKey, job: JobKey, status: StageStatus) -> Self {
        Self {
            key,
            job,
            status,
            submitted: false,
            num_tasks: None,
            name: None,
            attempt: None,
            submission_time: None,
            completion_time: None,
            failure_reason: None,
            reported: ReportedTaskCounts::default(),
            tasks: BTreeSet::new(),
        }
    }

    /// The event belongs to an attempt older than the one recorded.
    fn is_stale(&self, attempt: Option<u64>) -> bool {
        matches!((self.attempt, attempt), (Some(current), Some(seen)) if seen < current)
    }

    /// Moves to a strictly newer attempt. A stage settled by an earlier
    /// attempt is reopened; terminal statuses are final per attempt only.
    fn reopen_for(&mut self, attempt: Option<u64>) -> bool {
        let newer = matches!((self.attempt, attempt), (Some(current), Some(next)) if next > current);
        if !newer {
            return false;
        }
        self.attempt = attempt;
        self.reported = ReportedTaskCounts::default();
        if self.status.is_terminal() {
            self.status = StageStatus::Submitted;
            self.completion_time = None;
            self.failure_reason = None;
        }
        true
    }

    fn advance(&mut self, target: StageStatus) -> StatusChange {
        if self.status == target {
            StatusChange::Unchanged
        } else if self.status.is_terminal() {
            if target.is_terminal() {
                StatusChange::Conflict
            } else {
                StatusChange::Unchanged
            }
        } else if target.rank() > self.status.rank() {
            self.status = target;
            StatusChange::Advanced
        } else {
            StatusChange::Unchanged
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub key: TaskKey,
    pub stage: StageKey,
    pub status: TaskStatus,
    pub started: bool,
    pub start_time: Option<EpochMillis>,
    pub end_time: Option<EpochMillis>,
    pub executor_id: Option<ExecutorId>,
    pub host: Option<String>,
    pub error_message: Option<String>,
}

impl TaskRecord {
    /// Interval the task occupied a slot, if it has a start.
    pub fn interval(&self) -> Option<(EpochMillis, Option<EpochMillis>)> {
        self.start_time.map(|start| (start, self.end_time))
    }
}

#[derive(Debug)]
pub struct StateStore {
    pub(crate) cells: BTreeMap<CellId, CellRecord>,
    removed_cells: Tombstones<CellId>,
    jobs: HashMap<JobKey, JobRecord>,
    stages: HashMap<StageKey, StageRecord>,
    tasks: HashMap<TaskKey, TaskRecord>,
    stage_claims: HashMap<StageKey, StageClaim>,
    retired_jobs: Tombstones<JobKey>,
    retired_stages: Tombstones<StageKey>,
    unknown_cell: CellId,
    touched: BTreeSet<CellId>,
}

/// Ids that must not come back, up to a limit. Past it the oldest entry is
/// forgotten first.
#[derive(Debug)]
struct Tombstones<K> {
    limit: usize,
    members: HashSet<K>,
    order: VecDeque<K>,
}

impl<K: Clone + Eq + Hash> Tombstones<K> {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            members: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn contains(&self, key: &K) -> bool {
        self.members.contains(key)
    }

    fn insert(&mut self, key: K) {
        if !self.members.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.members.len() > self.limit {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.members.remove(&oldest);
        }
    }

    fn remove(&mut self, key: &K) -> bool {
        if !self.members.remove(key) {
            return false;
        }
        self.order.retain(|entry| entry != key);
        true
    }

    fn retain(&mut self, keep: impl Fn(&K) -> bool) {
        self.members.retain(|key| keep(key));
        self.order.retain(|key| keep(key));
    }
}

impl ExecutionLookup for StateStore {
    fn current_execution(&self, cell_id: &CellId) -> Option<u64> {
        self.cells.get(cell_id).map(|cell| cell.current)
    }
}

impl StateStore {
    pub fn new(unknown_cell: CellId) -> Self {
        Self {
            cells: BTreeMap::new(),
            removed_cells: Tombstones::new(DEFAULT_MAX_TOMBSTONES),
            jobs: HashMap::new(),
            stages: HashMap::new(),
            tasks: HashMap::new(),
            stage_claims: HashMap::new(),
            retired_jobs: Tombstones::new(DEFAULT_MAX_TOMBSTONES),
            retired_stages: Tombstones::new(DEFAULT_MAX_TOMBSTONES),
            unknown_cell,
            touched: BTreeSet::new(),
        }
    }

    pub fn with_tombstone_limit(mut self, limit: usize) -> Self {
        self.removed_cells = Tombstones::new(limit);
        self.retired_jobs = Tombstones::new(limit);
        self.retired_stages = Tombstones::new(limit);
        self
    }

    pub fn tombstone_count(&self) -> usize {
        self.removed_cells.len() + self.retired_jobs.len() + self.retired_stages.len()
    }

    pub fn cell(&self, cell_id: &CellId) -> Option<&CellRecord> {
        self.cells.get(cell_id)
    }

    pub fn cells(&self) -> impl Iterator<Item = &CellRecord> {
        self.cells.values()
    }

    pub fn job(&self, key: &JobKey) -> Option<&JobRecord> {
        self.jobs.get(key)
    }

    pub fn stage(&self, key: &StageKey) -> Option<&StageRecord> {
        self.stages.get(key)
    }

    pub fn task(&self, key: &TaskKey) -> Option<&TaskRecord> {
        self.tasks.get(key)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn unknown_cell(&self) -> &CellId {
        &self.unknown_cell
    }

    pub fn is_removed(&self, cell_id: &CellId) -> bool {
        self.removed_cells.contains(cell_id)
    }

    /// Creates the cell on first reference. Returns false for removed cells,
    /// which stay unreachable until the host registers them again.
    pub fn ensure_cell(&mut self, cell_id: &CellId) -> bool {
        if self.removed_cells.contains(cell_id) {
            return false;
        }
        if !self.cells.contains_key(cell_id) {
            self.cells
                .insert(cell_id.clone(), CellRecord::new(cell_id.clone()));
            self.touched.insert(cell_id.clone());
        }
        true
    }

    pub fn revive_cell(&mut self, cell_id: &CellId) -> bool {
        let revived = self.removed_cells.remove(cell_id);
        let existed = self.cells.contains_key(cell_id);
        self.ensure_cell(cell_id);
        revived || !existed
    }

    pub(crate) fn cell_mut(&mut self, cell_id: &CellId) -> Option<&mut CellRecord> {
        self.cells.get_mut(cell_id)
    }

    pub fn take_touched(&mut self) -> BTreeSet<CellId> {
        std::mem::take(&mut self.touched)
    }

    pub(crate) fn touch(&mut self, cell_id: &CellId) {
        self.touched.insert(cell_id.clone());
    }

    pub(crate) fn touch_many(&mut self, cells: impl IntoIterator<Item = CellId>) {
        self.touched.extend(cells);
    }

    /// Jobs of one execution, oldest start first.
    pub fn execution_jobs(&self, cell_id: &CellId, execution: u64) -> Vec<&JobRecord> {
        let Some(record) = self
            .cells
            .get(cell_id)
            .and_then(|cell| cell.executions.get(&execution))
        else {
            return Vec::new();
        };
        let mut jobs: Vec<&JobRecord> = record
            .jobs
            .iter()
            .filter_map(|key| self.jobs.get(key))
            .collect();
        jobs.sort_by_key(|job| (job.start_time.is_none(), job.start_time, job.key));
        jobs
    }

    /// Stages bound to `job`, by stage id.
    pub fn job_stages(&self, job: &JobRecord) -> Vec<&StageRecord> {
        job.stage_ids
            .iter()
            .filter_map(|stage_id| self.stages.get(&StageKey::new(job.key.epoch, *stage_id)))
            .filter(|stage| stage.job == job.key)
            .collect()
    }

    pub fn stage_tasks(&self, stage: &StageRecord) -> Vec<&TaskRecord> {
        stage
            .tasks
            .iter()
            .filter_map(|task_id| self.tasks.get(&TaskKey::new(stage.key.epoch, *task_id)))
            .filter(|task| task.stage == stage.key)
            .collect()
    }

    pub fn on_job_start(
        &mut self,
        epoch: u32,
        event: &JobStart,
        owner: Owner,
        report: &mut ApplyReport,
    ) {
        let key = JobKey::reported(epoch, event.job_id);
        if self.retired_jobs.contains(&key) {
            report.note(
                DiagnosticKind::RetiredEntity,
                format!("job {key} belongs to a purged execution"),
            );
            return;
        }

        match self.jobs.get_mut(&key) {
            Some(job) if job.started => {
                if job
                    .start_time
                    .map_or(true, |start| event.submission_time < start)
                {
                    job.start_time = Some(event.submission_time);
                    report.mark_changed();
                }
                report.note(
                    DiagnosticKind::DuplicateEvent,
                    format!("job {key} already started"),
                );
            }
            Some(job) => {
                job.apply_start(event);
                if job.end_time.is_some() {
                    report.note(
                        DiagnosticKind::OrderingInversion,
                        format!("job {key} ended before its start arrived"),
                    );
                }
                self.rehome_job(key, &owner);
                report.mark_changed();
            }
            None => {
                let mut job = JobRecord::new(key, owner.clone(), JobStatus::Running);
                job.apply_start(event);
                self.jobs.insert(key, job);
                self.attach_job(key, &owner, JobStatus::Running);
                report.mark_changed();
            }
        }

        for stage_id in &event.stage_ids {
            let claim = StageClaim::new(key, ClaimSource::Listed);
            if self.claim_stage(StageKey::new(epoch, *stage_id), claim) {
                report.mark_changed();
            }
        }
        self.touch_job(key);
    }

    pub fn on_job_end(&mut self, epoch: u32, event: &JobEnd, report: &mut ApplyReport) {
        let key = JobKey::reported(epoch, event.job_id);
        if self.retired_jobs.contains(&key) {
            report.note(
                DiagnosticKind::RetiredEntity,
                format!("job {key} belongs to a purged execution"),
            );
            return;
        }
        let status = event.status;

        if !self.jobs.contains_key(&key) {
            report.note(
                DiagnosticKind::OrderingInversion,
                format!("job {key} ended before its start arrived"),
            );
            let owner = self.unknown_owner();
            let mut job = JobRecord::new(key, owner.clone(), status);
            job.start_time = Some(event.completion_time);
            job.end_time = Some(event.completion_time);
            self.jobs.insert(key, job);
            self.attach_job(key, &owner, status);
            report.mark_changed();
            return;
        }
        let Some(job) = self.jobs.get_mut(&key) else {
            return;
        };

        if job.status.is_terminal() {
            if job.status == status {
                report.note(
                    DiagnosticKind::DuplicateEvent,
                    format!("job {key} already {status}"),
                );
            } else {
                report.note(
                    DiagnosticKind::ConflictingStatus,
                    format!("job {key} is {} but end reports {status}", job.status),
                );
            }
            return;
        }

        job.end_time = Some(event.completion_time);
        if job.start_time.is_none() {
            job.start_time = Some(event.completion_time);
        }
        self.set_job_status(key, status);
        report.mark_changed();
    }

    pub fn on_stage_submitted(
        &mut self,
        epoch: u32,
        event: &StageSubmitted,
        report: &mut ApplyReport,
    ) {
        let Some(job_key) = self.route_stage(epoch, event.stage_id, event.job_hint(), report)
        else {
            return;
        };
        let stage_key = StageKey::new(epoch, event.stage_id);
        self.ensure_stage(stage_key, job_key, StageStatus::Submitted);
        let Some(stage) = self.stages.get_mut(&stage_key) else {
            return;
        };

        if stage.is_stale(event.stage_attempt_id) {
            note_stale_attempt(report, stage, event.stage_attempt_id);
            return;
        }
        let reopened = stage.reopen_for(event.stage_attempt_id);
        if !reopened && stage.submitted && event.stage_attempt_id <= stage.attempt {
            report.note(
                DiagnosticKind::DuplicateEvent,
                format!("stage {stage_key} already submitted"),
            );
            return;
        }
        stage.submitted = true;
        stage.attempt = stage.attempt.max(event.stage_attempt_id);
        stage.num_tasks = stage.num_tasks.max(event.num_tasks);
        if event.name.is_some() {
            stage.name = event.name.clone();
        }
        stage.submission_time = if reopened {
            event.submission_time.or(stage.submission_time)
        } else {
            earliest(stage.submission_time, event.submission_time)
        };
        if reopened {
            self.refresh_placeholder(job_key);
        }
        self.touch_job(job_key);
        report.mark_changed();
    }

    pub fn on_stage_active(&mut self, epoch: u32, event: &StageActive, report: &mut ApplyReport) {
        let Some(job_key) = self.route_stage(epoch, event.stage_id, event.job_hint(), report)
        else {
            return;
        };
        let stage_key = StageKey::new(epoch, event.stage_id);
        self.ensure_stage(stage_key, job_key, StageStatus::Active);
        let Some(stage) = self.stages.get_mut(&stage_key) else {
            return;
        };

        if stage.is_stale(event.stage_attempt_id) {
            note_stale_attempt(report, stage, event.stage_attempt_id);
            return;
        }
        let reopened = stage.reopen_for(event.stage_attempt_id);
        stage.advance(StageStatus::Active);
        stage.attempt = stage.attempt.max(event.stage_attempt_id);
        stage.num_tasks = stage.num_tasks.max(event.num_tasks);
        if stage.name.is_none() {
            stage.name = event.name.clone();
        }
        if let Some(active) = event.num_active_tasks {
            stage.reported.active = active;
        }
        stage.reported.completed = stage
            .reported
            .completed
            .max(event.num_completed_tasks.unwrap_or(0));
        stage.reported.failed = stage
            .reported
            .failed
            .max(event.num_failed_tasks.unwrap_or(0));
        if reopened {
            self.refresh_placeholder(job_key);
        }
        self.touch_job(job_key);
        report.mark_changed();
    }

    pub fn on_stage_completed(
        &mut self,
        epoch: u32,
        event: &StageCompleted,
        report: &mut ApplyReport,
    ) {
        let Some(job_key) = self.route_stage(epoch, event.stage_id, event.job_hint(), report)
        else {
            return;
        };
        let stage_key = StageKey::new(epoch, event.stage_id);
        let target = StageStatus::terminal(event.succeeded());
        let created = self.ensure_stage(stage_key, job_key, target);
        let Some(stage) = self.stages.get_mut(&stage_key) else {
            return;
        };

        if stage.is_stale(event.stage_attempt_id) {
            note_stale_attempt(report, stage, event.stage_attempt_id);
            return;
        }
        stage.reopen_for(event.stage_attempt_id);
        if !created {
            match stage.advance(target) {
                StatusChange::Conflict => {
                    report.note(
                        DiagnosticKind::ConflictingStatus,
                        format!(
                            "stage {stage_key} is {} but completion reports {target}",
                            stage.status
                        ),
                    );
                    return;
                }
                StatusChange::Unchanged => {
                    report.note(
                        DiagnosticKind::DuplicateEvent,
                        format!("stage {stage_key} already {target}"),
                    );
                    return;
                }
                StatusChange::Advanced => {}
            }
        }

        stage.attempt = stage.attempt.max(event.stage_attempt_id);
        stage.num_tasks = stage.num_tasks.max(event.num_tasks);
        stage.submission_time = earliest(stage.submission_time, event.submission_time);
        stage.completion_time = event.completion_time.or(stage.completion_time);
        if event.failure_reason.is_some() {
            stage.failure_reason = event.failure_reason.clone();
        }
        self.refresh_placeholder(job_key);
        self.touch_job(job_key);
        report.mark_changed();
    }

    pub fn on_task_start(&mut self, epoch: u32, event: &TaskStart, report: &mut ApplyReport) {
        let Some(stage_key) = self.task_stage(epoch, event.stage_id, event.task_id, report)
        else {
            return;
        };
        let task_key = TaskKey::new(epoch, event.task_id);

        match self.tasks.get_mut(&task_key) {
            Some(task) if task.started => {
                report.note(
                    DiagnosticKind::DuplicateEvent,
                    format!("task {task_key} already started"),
                );
                return;
            }
            Some(task) => {
                task.started = true;
                task.start_time = Some(event.launch_time);
                if event.executor_id.is_some() {
                    task.executor_id = event.executor_id.clone();
                }
                if event.host.is_some() {
                    task.host = event.host.clone();
                }
            }
            None => {
                self.tasks.insert(
                    task_key,
                    TaskRecord {
                        key: task_key,
                        stage: stage_key,
                        status: TaskStatus::Running,
                        started: true,
                        start_time: Some(event.launch_time),
                        end_time: None,
                        executor_id: event.executor_id.clone(),
                        host: event.host.clone(),
                        error_message: None,
                    },
                );
            }
        }
        self.touch_stage(stage_key);
        report.mark_changed();
    }

    pub fn on_task_end(&mut self, epoch: u32, event: &TaskEnd, report: &mut ApplyReport) {
        let Some(stage_key) = self.task_stage(epoch, event.stage_id, event.task_id, report)
        else {
            return;
        };
        let task_key = TaskKey::new(epoch, event.task_id);
        let status = event.status;

        match self.tasks.get_mut(&task_key) {
            Some(task) if task.status.is_terminal() => {
                if task.status == status {
                    report.note(
                        DiagnosticKind::DuplicateEvent,
                        format!("task {task_key} already {status}"),
                    );
                } else {
                    report.note(
                        DiagnosticKind::ConflictingStatus,
                        format!("task {task_key} is {} but end reports {status}", task.status),
                    );
                }
                return;
            }
            Some(task) => {
                task.status = status;
                task.end_time = Some(event.finish_time);
                if task.start_time.is_none() {
                    task.start_time = event.launch_time;
                }
                if task.executor_id.is_none() {
                    task.executor_id = event.executor_id.clone();
                }
                if task.host.is_none() {
                    task.host = event.host.clone();
                }
                task.error_message = event.error_message.clone();
            }
            None => {
                report.note(
                    DiagnosticKind::OrderingInversion,
                    format!("task {task_key} ended before its start arrived"),
                );
                self.tasks.insert(
                    task_key,
                    TaskRecord {
                        key: task_key,
                        stage: stage_key,
                        status,
                        started: false,
                        start_time: event.launch_time,
                        end_time: Some(event.finish_time),
                        executor_id: event.executor_id.clone(),
                        host: event.host.clone(),
                        error_message: event.error_message.clone(),
                    },
                );
            }
        }
        self.touch_stage(stage_key);
        report.mark_changed();
    }

    /// Drops a job with its stages and tasks; later events naming any of them
    /// are ignored.
    pub(crate) fn purge_job(&mut self, key: JobKey) {
        let Some(job) = self.jobs.remove(&key) else {
            return;
        };
        for stage_id in &job.stage_ids {
            let stage_key = StageKey::new(key.epoch, *stage_id);
            if self.stage_claims.get(&stage_key).map(|claim| claim.job) == Some(key) {
                self.stage_claims.remove(&stage_key);
                self.retired_stages.insert(stage_key);
            }
            if self
                .stages
                .get(&stage_key)
                .is_some_and(|stage| stage.job == key)
            {
                if let Some(stage) = self.stages.remove(&stage_key) {
                    for task_id in stage.tasks {
                        self.tasks.remove(&TaskKey::new(key.epoch, task_id));
                    }
                }
            }
        }
        self.retired_jobs.insert(key);
    }

    /// Purges one execution of a cell. Returns how many jobs were freed.
    pub(crate) fn purge_execution(&mut self, cell_id: &CellId, execution: u64) -> usize {
        let Some(record) = self
            .cells
            .get_mut(cell_id)
            .and_then(|cell| cell.executions.remove(&execution))
        else {
            return 0;
        };
        for key in &record.jobs {
            self.purge_job(*key);
        }
        self.touched.insert(cell_id.clone());
        record.jobs.len()
    }

    /// Frees a cell and everything reachable from it. Returns false if the cell
    /// was not live.
    pub(crate) fn remove_cell(&mut self, cell_id: &CellId) -> bool {
        let Some(cell) = self.cells.get(cell_id) else {
            return false;
        };
        let executions: Vec<u64> = cell.executions.keys().copied().collect();
        for execution in executions {
            self.purge_execution(cell_id, execution);
        }
        self.cells.remove(cell_id);
        if *cell_id != self.unknown_cell {
            self.removed_cells.insert(cell_id.clone());
        }
        self.touched.insert(cell_id.clone());
        true
    }

    /// Forgets retired ids from earlier application epochs; ids of a new
    /// application can never collide with them.
    pub(crate) fn clear_retired_before(&mut self, epoch: u32) {
        self.retired_jobs.retain(|key| key.epoch >= epoch);
        self.retired_stages.retain(|key| key.epoch >= epoch);
    }

    fn unknown_owner(&mut self) -> Owner {
        let unknown = self.unknown_cell.clone();
        let cell = self
            .cells
            .entry(unknown.clone())
            .or_insert_with(|| CellRecord::new(unknown.clone()));
        Owner::new(unknown, cell.current)
    }

    fn attach_job(&mut self, key: JobKey, owner: &Owner, status: JobStatus) {
        let cell = self
            .cells
            .entry(owner.cell_id.clone())
            .or_insert_with(|| CellRecord::new(owner.cell_id.clone()));
        if owner.execution == cell.current {
            cell.pristine = false;
        }
        let execution = cell.executions.entry(owner.execution).or_default();
        if execution.jobs.insert(key) {
            execution.counts.add(status);
        }
        self.touched.insert(owner.cell_id.clone());
    }

    fn detach_job(&mut self, key: JobKey, owner: &Owner, status: JobStatus) {
        if let Some(execution) = self
            .cells
            .get_mut(&owner.cell_id)
            .and_then(|cell| cell.executions.get_mut(&owner.execution))
        {
            if execution.jobs.remove(&key) {
                execution.counts.remove(status);
            }
        }
        self.touched.insert(owner.cell_id.clone());
    }

    fn rehome_job(&mut self, key: JobKey, owner: &Owner) {
        let Some(job) = self.jobs.get_mut(&key) else {
            return;
        };
        if job.owner == *owner {
            return;
        }
        let previous = std::mem::replace(&mut job.owner, owner.clone());
        let status = job.status;
        tracing::debug!(event = "job_rehomed", job = %key, from = %previous, to = %owner);
        self.detach_job(key, &previous, status);
        self.attach_job(key, owner, status);
    }

    fn set_job_status(&mut self, key: JobKey, status: JobStatus) {
        let Some(job) = self.jobs.get_mut(&key) else {
            return;
        };
        if job.status == status {
            return;
        }
        let previous = std::mem::replace(&mut job.status, status);
        let owner = job.owner.clone();
        if let Some(execution) = self
            .cells
            .get_mut(&owner.cell_id)
            .and_then(|cell| cell.executions.get_mut(&owner.execution))
        {
            if execution.jobs.contains(&key) {
                execution.counts.remove(previous);
                execution.counts.add(status);
            }
        }
        self.touched.insert(owner.cell_id);
    }

    /// Binds a stage to a job when `claim` outranks the current binding. The
    /// job records the stage id either way; views only follow the binding.
    /// A replaced placeholder is merged away.
    fn claim_stage(&mut self, stage_key: StageKey, claim: StageClaim) -> bool {
        if let Some(job) = self.jobs.get_mut(&claim.job) {
            if let Err(idx) = job.stage_ids.binary_search(&stage_key.stage_id) {
                job.stage_ids.insert(idx, stage_key.stage_id);
            }
        }
        let previous = self.stage_claims.get(&stage_key).copied();
        if let Some(existing) = previous {
            if existing.job == claim.job {
                if claim.source > existing.source {
                    self.stage_claims.insert(stage_key, claim);
                }
                return false;
            }
            if !claim.outranks(&existing) {
                tracing::debug!(
                    event = "stage_claim_ignored",
                    stage = %stage_key,
                    job = %claim.job,
                    owner = %existing.job
                );
                return false;
            }
        }

        self.stage_claims.insert(stage_key, claim);
        if let Some(stage) = self.stages.get_mut(&stage_key) {
            stage.job = claim.job;
        }
        self.touch_job(claim.job);
        match previous {
            Some(existing) if existing.job.is_placeholder() => self.drop_placeholder(existing.job),
            Some(existing) => {
                tracing::debug!(
                    event = "stage_reclaimed",
                    stage = %stage_key,
                    from = %existing.job,
                    to = %claim.job
                );
                self.touch_job(existing.job);
            }
            None => {}
        }
        true
    }

    fn drop_placeholder(&mut self, key: JobKey) {
        if let Some(job) = self.jobs.remove(&key) {
            tracing::debug!(event = "placeholder_merged", job = %key);
            self.detach_job(key, &job.owner, job.status);
        }
    }

    /// Finds the job a stage event belongs to, creating what is missing.
    /// Returns `None` when the stage or job was retired.
    fn route_stage(
        &mut self,
        epoch: u32,
        stage_id: StageId,
        job_hint: Option<JobId>,
        report: &mut ApplyReport,
    ) -> Option<JobKey> {
        let stage_key = StageKey::new(epoch, stage_id);
        if self.retired_stages.contains(&stage_key) {
            report.note(
                DiagnosticKind::RetiredEntity,
                format!("stage {stage_key} belongs to a purged execution"),
            );
            return None;
        }
        if let Some(job_id) = job_hint {
            let job_key = JobKey::reported(epoch, job_id);
            if self.retired_jobs.contains(&job_key) {
                report.note(
                    DiagnosticKind::RetiredEntity,
                    format!("stage {stage_key} references purged job {job_key}"),
                );
                return None;
            }
            if !self.jobs.contains_key(&job_key) {
                report.note(
                    DiagnosticKind::ReferentialGap,
                    format!("stage {stage_key} references unseen job {job_key}"),
                );
                let owner = self.unknown_owner();
                self.jobs.insert(
                    job_key,
                    JobRecord::new(job_key, owner.clone(), JobStatus::Running),
                );
                self.attach_job(job_key, &owner, JobStatus::Running);
            }
            self.claim_stage(stage_key, StageClaim::new(job_key, ClaimSource::Named));
            return self.stage_claims.get(&stage_key).map(|claim| claim.job);
        }

        if let Some(claim) = self.stage_claims.get(&stage_key) {
            return Some(claim.job);
        }
        let placeholder = JobKey::inferred(epoch, stage_id);
        report.note(
            DiagnosticKind::ReferentialGap,
            format!("stage {stage_key} has no known job, filed under {placeholder}"),
        );
        let owner = self.unknown_owner();
        self.jobs.insert(
            placeholder,
            JobRecord::new(placeholder, owner.clone(), JobStatus::Running),
        );
        self.attach_job(placeholder, &owner, JobStatus::Running);
        self.claim_stage(stage_key, StageClaim::new(placeholder, ClaimSource::Placeholder));
        Some(placeholder)
    }

    fn ensure_stage(&mut self, stage_key: StageKey, job_key: JobKey, status: StageStatus) -> bool {
        if self.stages.contains_key(&stage_key) {
            return false;
        }
        self.stages
            .insert(stage_key, StageRecord::new(stage_key, job_key, status));
        true
    }

    /// Resolves the stage a task event belongs to, creating it lazily, and
    /// registers the task under it.
    fn task_stage(
        &mut self,
        epoch: u32,
        stage_id: StageId,
        task_id: TaskId,
        report: &mut ApplyReport,
    ) -> Option<StageKey> {
        let job_key = self.route_stage(epoch, stage_id, None, report)?;
        let stage_key = StageKey::new(epoch, stage_id);
        if self.ensure_stage(stage_key, job_key, StageStatus::Active) {
            report.note(
                DiagnosticKind::ReferentialGap,
                format!("task {epoch}:{task_id} arrived before stage {stage_key}"),
            );
        }
        let stage = self.stages.get_mut(&stage_key)?;
        stage.advance(StageStatus::Active);
        stage.tasks.insert(task_id);
        Some(stage_key)
    }

    /// Placeholder jobs have no job events of their own; their status follows
    /// their stages.
    /// Derives a placeholder job's status from its stages: terminal once every
    /// stage is, running again when a stage is reopened by a newer attempt.
    fn refresh_placeholder(&mut self, key: JobKey) {
        if !key.is_placeholder() {
            return;
        }
        let Some(job) = self.jobs.get(&key) else {
            return;
        };
        let stages = self.job_stages(job);
        if stages.is_empty() {
            return;
        }
        if !stages.iter().all(|stage| stage.status.is_terminal()) {
            if job.status.is_terminal() {
                self.set_job_status(key, JobStatus::Running);
                if let Some(job) = self.jobs.get_mut(&key) {
                    job.end_time = None;
                }
            }
            return;
        }
        let failed = stages
            .iter()
            .any(|stage| stage.status == StageStatus::Failed);
        let end_time = stages.iter().filter_map(|stage| stage.completion_time).max();
        self.set_job_status(key, JobStatus::terminal(!failed));
        if let Some(job) = self.jobs.get_mut(&key) {
            job.end_time = end_time;
        }
    }

    fn touch_job(&mut self, key: JobKey) {
        if let Some(job) = self.jobs.get(&key) {
            self.touched.insert(job.owner.cell_id.clone());
        }
    }

    fn touch_stage(&mut self, key: StageKey) {
        if let Some(job_key) = self.stages.get(&key).map(|stage| stage.job) {
            self.touch_job(job_key);
        }
    }
}

fn note_stale_attempt(report: &mut ApplyReport, stage: &StageRecord, attempt: Option<u64>) {
    report.note(
        DiagnosticKind::OrderingInversion,
        format!(
            "stage {} attempt {} arrived after attempt {}",
            stage.key,
            attempt.unwrap_or_default(),
            stage.attempt.unwrap_or_default()
        ),
    );
}

fn earliest(current: Option<EpochMillis>, candidate: Option<EpochMillis>) -> Option<EpochMillis> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
