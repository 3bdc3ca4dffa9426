//! Event aggregation and per-cell attribution for compute engine jobs.
//!
//! [`NotebookMonitor`] owns every piece of state for one notebook session.
//! Engine events and host signals go in through its mutation methods, which
//! never fail; anything that had to be repaired or dropped comes back as
//! [`Diagnostic`]s in the [`ApplyReport`]. Snapshots are computed on read from
//! committed state.

pub mod application;
pub mod capacity;
pub mod changes;
pub mod config;
pub mod diagnostics;
pub mod lifecycle;
pub mod locator;
mod snapshot;
pub mod store;
pub mod timeseries;

pub use changes::ChangeSet;
pub use config::{ExecutionRetention, MonitorConfig};
pub use diagnostics::{ApplyReport, Diagnostic, DiagnosticKind};
pub use lifecycle::ExecutionStart;
pub use locator::Owner;

use crate::application::{ApplicationChange, ApplicationTracker};
use crate::capacity::{CapacityOutcome, CapacityTracker, ExecutorKey};
use crate::changes::ChangeTracker;
use crate::lifecycle::LifecycleCoordinator;
use crate::locator::ExecutionLocator;
use crate::store::StateStore;
use serde_json::Value;
use sparkmon_core::events::{
    decode_kernel_message, ApplicationEnd, ApplicationStart, EventDecodeError, ExecutorAdded,
    ExecutorRemoved, SparkEvent,
};
use sparkmon_core::signals::{CellView, HostSignal};
use sparkmon_core::views::{CellSnapshot, NotebookSnapshot};
use sparkmon_core::{CellId, JobStatus, TaskStatus};

pub struct NotebookMonitor {
    notebook_id: String,
    config: MonitorConfig,
    store: StateStore,
    locator: ExecutionLocator,
    capacity: CapacityTracker,
    application: ApplicationTracker,
    lifecycle: LifecycleCoordinator,
    changes: ChangeTracker,
    hide_all_displays: bool,
}

impl NotebookMonitor {
    pub fn new(notebook_id: impl Into<String>, config: MonitorConfig) -> Self {
        let unknown = CellId::new(config.unknown_cell_id.clone());
        Self {
            notebook_id: notebook_id.into(),
            store: StateStore::new(unknown.clone()).with_tombstone_limit(config.max_tombstones),
            locator: ExecutionLocator::new(unknown),
            capacity: CapacityTracker::new(),
            application: ApplicationTracker::default(),
            lifecycle: LifecycleCoordinator::new(&config),
            changes: ChangeTracker::default(),
            hide_all_displays: false,
            config,
        }
    }

    pub fn notebook_id(&self) -> &str {
        &self.notebook_id
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn capacity(&self) -> &CapacityTracker {
        &self.capacity
    }

    pub fn epoch(&self) -> u32 {
        self.application.epoch()
    }

    pub fn active_cell(&self) -> Option<&CellId> {
        self.locator.active_cell()
    }

    /// Decodes kernel comm data and applies the event it carries.
    pub fn apply_raw(&mut self, data: &Value) -> ApplyReport {
        match decode_kernel_message(data) {
            Ok(event) => self.apply(event),
            Err(err) => {
                let mut report = ApplyReport::default();
                let kind = match err {
                    EventDecodeError::UnknownKind(_) | EventDecodeError::NotEngineEvent(_) => {
                        DiagnosticKind::UnknownEventKind
                    }
                    EventDecodeError::MissingKind
                    | EventDecodeError::InvalidJson(_)
                    | EventDecodeError::Malformed { .. } => DiagnosticKind::MalformedEvent,
                };
                report.note(kind, err.to_string());
                report
            }
        }
    }

    pub fn apply(&mut self, event: SparkEvent) -> ApplyReport {
        let mut report = ApplyReport::default();
        if let Some(ts) = event.timestamp() {
            self.application.observe(ts);
        }
        let epoch = self.application.epoch();
        let mut notebook_changed = false;

        match event {
            SparkEvent::ApplicationStart(start) => {
                notebook_changed = self.on_application_start(&start, &mut report);
            }
            SparkEvent::ApplicationEnd(end) => {
                notebook_changed = self.on_application_end(&end, &mut report);
            }
            SparkEvent::JobStart(start) => {
                if let Some(cell_id) = &start.cell_id {
                    self.store.ensure_cell(cell_id);
                }
                let owner = self
                    .locator
                    .resolve_owner(start.cell_id.as_ref(), &self.store);
                self.store.on_job_start(epoch, &start, owner, &mut report);
            }
            SparkEvent::JobEnd(end) => {
                if end.status == JobStatus::Running {
                    report.note(
                        DiagnosticKind::MalformedEvent,
                        format!("job {} end reports status running", end.job_id),
                    );
                } else {
                    self.store.on_job_end(epoch, &end, &mut report);
                }
            }
            SparkEvent::StageSubmitted(submitted) => {
                self.store
                    .on_stage_submitted(epoch, &submitted, &mut report);
            }
            SparkEvent::StageActive(active) => {
                self.store.on_stage_active(epoch, &active, &mut report);
            }
            SparkEvent::StageCompleted(completed) => {
                self.store
                    .on_stage_completed(epoch, &completed, &mut report);
            }
            SparkEvent::TaskStart(start) => {
                self.store.on_task_start(epoch, &start, &mut report);
            }
            SparkEvent::TaskEnd(end) => {
                if end.status == TaskStatus::Running {
                    report.note(
                        DiagnosticKind::MalformedEvent,
                        format!("task {} end reports status running", end.task_id),
                    );
                } else {
                    self.store.on_task_end(epoch, &end, &mut report);
                }
            }
            SparkEvent::ExecutorAdded(added) => {
                notebook_changed = self.on_executor_added(epoch, &added, &mut report);
            }
            SparkEvent::ExecutorRemoved(removed) => {
                notebook_changed = self.on_executor_removed(epoch, &removed, &mut report);
            }
        }

        self.commit(&mut report, notebook_changed);
        report
    }

    pub fn apply_signal(&mut self, signal: HostSignal) -> ApplyReport {
        match signal {
            HostSignal::ActiveCell { cell_id } => self.set_active_cell(cell_id),
            HostSignal::CellExecutedAgain { cell_id, marker } => {
                self.cell_executed_again(&cell_id, marker)
            }
            HostSignal::CellRemoved { cell_id } => self.cell_removed(&cell_id),
            HostSignal::CellRegistered { cell_id } => self.register_cell(&cell_id),
            HostSignal::KernelRestarted => self.kernel_restarted(),
            HostSignal::CellDisplay {
                cell_id,
                view,
                collapsed,
                hidden,
            } => {
                if view.is_none() && collapsed.is_none() && hidden.is_none() {
                    self.toggle_cell_display(&cell_id)
                } else {
                    self.set_cell_display(&cell_id, view, collapsed, hidden)
                }
            }
            HostSignal::ToggleAllDisplays => self.toggle_hide_all_displays(),
        }
    }

    /// Points attribution at `cell_id`. Removed cells are not accepted; the
    /// pointer is cleared instead.
    pub fn set_active_cell(&mut self, cell_id: Option<CellId>) -> ApplyReport {
        let mut report = ApplyReport::default();
        let next = match cell_id {
            Some(cell_id) if self.store.ensure_cell(&cell_id) => Some(cell_id),
            Some(cell_id) => {
                report.note(
                    DiagnosticKind::RetiredEntity,
                    format!("cell {cell_id} was removed"),
                );
                None
            }
            None => None,
        };
        if self.locator.active_cell() != next.as_ref() {
            let previous = self.locator.active_cell().cloned();
            self.locator.set_active_cell(next.clone());
            self.store.touch_many(previous.into_iter().chain(next));
            report.mark_changed();
        }
        self.commit(&mut report, true);
        report
    }

    pub fn cell_executed_again(&mut self, cell_id: &CellId, marker: Option<String>) -> ApplyReport {
        let mut report = ApplyReport::default();
        let outcome =
            self.lifecycle
                .cell_executed_again(&mut self.store, cell_id, marker, &mut report);
        let notebook_changed = outcome == ExecutionStart::Created;
        self.commit(&mut report, notebook_changed);
        report
    }

    pub fn cell_removed(&mut self, cell_id: &CellId) -> ApplyReport {
        let mut report = ApplyReport::default();
        self.locator.forget_cell(cell_id);
        self.lifecycle
            .cell_removed(&mut self.store, cell_id, &mut report);
        self.commit(&mut report, true);
        report
    }

    pub fn register_cell(&mut self, cell_id: &CellId) -> ApplyReport {
        let mut report = ApplyReport::default();
        if self.store.revive_cell(cell_id) {
            report.mark_changed();
        }
        self.commit(&mut report, true);
        report
    }

    /// The kernel went away: the active pointer is cleared, live executors
    /// are retired and the next application gets a fresh id epoch. Cell
    /// history is kept.
    pub fn kernel_restarted(&mut self) -> ApplyReport {
        let mut report = ApplyReport::default();
        if let Some(previous) = self.locator.active_cell().cloned() {
            self.store.touch(&previous);
        }
        self.locator.set_active_cell(None);
        if let Some(ts) = self.application.last_seen() {
            self.capacity.retire_all(ts);
        }
        let epoch = self.application.restart();
        self.store.clear_retired_before(epoch);
        self.touch_all_cells();
        report.mark_changed();
        tracing::info!(
            event = "kernel_restarted",
            notebook_id = %self.notebook_id,
            epoch
        );
        self.commit(&mut report, true);
        report
    }

    pub fn set_cell_display(
        &mut self,
        cell_id: &CellId,
        view: Option<CellView>,
        collapsed: Option<bool>,
        hidden: Option<bool>,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        if !self.store.ensure_cell(cell_id) {
            report.note(
                DiagnosticKind::RetiredEntity,
                format!("cell {cell_id} was removed"),
            );
            return report;
        }
        if let Some(cell) = self.store.cell_mut(cell_id) {
            let before = (cell.view, cell.collapsed, cell.display_hidden);
            cell.view = view.unwrap_or(cell.view);
            cell.collapsed = collapsed.unwrap_or(cell.collapsed);
            cell.display_hidden = hidden.unwrap_or(cell.display_hidden);
            if before != (cell.view, cell.collapsed, cell.display_hidden) {
                report.mark_changed();
            }
        }
        self.store.touch(cell_id);
        self.commit(&mut report, false);
        report
    }

    /// Flips the hidden flag of one cell's display.
    pub fn toggle_cell_display(&mut self, cell_id: &CellId) -> ApplyReport {
        let hidden = self
            .store
            .cell(cell_id)
            .map_or(true, |cell| !cell.display_hidden);
        self.set_cell_display(cell_id, None, None, Some(hidden))
    }

    pub fn toggle_hide_all_displays(&mut self) -> ApplyReport {
        let mut report = ApplyReport::default();
        self.hide_all_displays = !self.hide_all_displays;
        report.mark_changed();
        self.commit(&mut report, true);
        report
    }

    pub fn cell_snapshot(&self, cell_id: &CellId) -> Option<CellSnapshot> {
        let cell = self.store.cell(cell_id)?;
        let is_active = self.locator.active_cell() == Some(cell_id);
        Some(snapshot::cell_snapshot(
            &self.store,
            &self.capacity,
            cell,
            is_active,
        ))
    }

    pub fn notebook_snapshot(&self) -> NotebookSnapshot {
        NotebookSnapshot {
            notebook_id: self.notebook_id.clone(),
            revision: self.changes.revision(),
            num_executors: self.capacity.live_executors() as u64,
            num_total_cores: self.capacity.total_cores(),
            hide_all_displays: self.hide_all_displays,
            active_cell: self.locator.active_cell().cloned(),
            application: self.application.current().cloned(),
            cells: self.cell_ids(),
        }
    }

    pub fn cell_ids(&self) -> Vec<CellId> {
        self.store.cells().map(|cell| cell.cell_id.clone()).collect()
    }

    pub fn revision(&self) -> u64 {
        self.changes.revision()
    }

    /// Drains the cells and notebook state touched since the last call.
    pub fn take_changes(&mut self) -> ChangeSet {
        let store = &self.store;
        self.changes.drain(|cell_id| store.cell(cell_id).is_some())
    }

    fn on_application_start(&mut self, start: &ApplicationStart, report: &mut ApplyReport) -> bool {
        match self.application.on_start(start) {
            ApplicationChange::Adopted => {
                tracing::info!(
                    event = "application_started",
                    notebook_id = %self.notebook_id,
                    app_id = start.app_id.as_deref().unwrap_or("-"),
                    epoch = self.application.epoch()
                );
                report.mark_changed();
                true
            }
            ApplicationChange::NewEpoch { epoch, retire_at } => {
                let retired = self.capacity.retire_all(retire_at);
                self.store.clear_retired_before(epoch);
                self.touch_all_cells();
                tracing::info!(
                    event = "application_replaced",
                    notebook_id = %self.notebook_id,
                    app_id = start.app_id.as_deref().unwrap_or("-"),
                    epoch,
                    retired_executors = retired
                );
                report.mark_changed();
                true
            }
            ApplicationChange::Duplicate => {
                report.note(
                    DiagnosticKind::DuplicateEvent,
                    format!(
                        "application {} already started",
                        start.app_id.as_deref().unwrap_or("-")
                    ),
                );
                false
            }
        }
    }

    fn on_application_end(&mut self, end: &ApplicationEnd, report: &mut ApplyReport) -> bool {
        if !self.application.on_end(end) {
            report.note(DiagnosticKind::DuplicateEvent, "application already ended");
            return false;
        }
        let retired = self.capacity.retire_all(end.end_time);
        if retired > 0 {
            self.touch_all_cells();
        }
        tracing::info!(
            event = "application_ended",
            notebook_id = %self.notebook_id,
            retired_executors = retired
        );
        report.mark_changed();
        true
    }

    fn on_executor_added(
        &mut self,
        epoch: u32,
        added: &ExecutorAdded,
        report: &mut ApplyReport,
    ) -> bool {
        let key = ExecutorKey::new(epoch, added.executor_id.clone());
        match self.capacity.executor_added(key, added.num_cores, added.time) {
            CapacityOutcome::Duplicate => {
                report.note(
                    DiagnosticKind::DuplicateEvent,
                    format!("executor {} already added", added.executor_id),
                );
                return false;
            }
            CapacityOutcome::AddedAfterRemoval { removed_at, .. } => {
                report.note(
                    DiagnosticKind::OrderingInversion,
                    format!(
                        "executor {} was removed at {removed_at} before its add arrived",
                        added.executor_id
                    ),
                );
            }
            _ => {}
        }
        self.touch_all_cells();
        report.mark_changed();
        true
    }

    fn on_executor_removed(
        &mut self,
        epoch: u32,
        removed: &ExecutorRemoved,
        report: &mut ApplyReport,
    ) -> bool {
        let key = ExecutorKey::new(epoch, removed.executor_id.clone());
        match self.capacity.executor_removed(key, removed.time) {
            CapacityOutcome::Duplicate => {
                report.note(
                    DiagnosticKind::DuplicateEvent,
                    format!("executor {} already removed", removed.executor_id),
                );
                false
            }
            CapacityOutcome::RemovalPending => {
                report.note(
                    DiagnosticKind::OrderingInversion,
                    format!("executor {} removed before it was added", removed.executor_id),
                );
                false
            }
            CapacityOutcome::RemovedBeforeAdd { at, .. } => {
                report.note(
                    DiagnosticKind::CapacityUnderflow,
                    format!(
                        "executor {} removal at {} precedes its add; clamped to {at}",
                        removed.executor_id, removed.time
                    ),
                );
                self.touch_all_cells();
                report.mark_changed();
                true
            }
            _ => {
                self.touch_all_cells();
                report.mark_changed();
                true
            }
        }
    }

    fn touch_all_cells(&mut self) {
        let cells = self.cell_ids();
        self.store.touch_many(cells);
    }

    fn commit(&mut self, report: &mut ApplyReport, notebook_changed: bool) {
        let touched = self.store.take_touched();
        if report.changed {
            self.changes.commit(touched, notebook_changed);
        }
    }
}
