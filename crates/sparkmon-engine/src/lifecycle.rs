//! Cell re-execution and removal.

use crate::config::MonitorConfig;
use crate::diagnostics::{ApplyReport, DiagnosticKind};
use crate::store::{ExecutionRecord, StateStore};
use sparkmon_core::CellId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStart {
    /// First reference to the cell; execution 1 is current.
    Created,
    /// A new execution became current. `purged` counts jobs freed by the
    /// retention policy.
    Advanced { execution: u64, purged: usize },
    /// Nothing was attributed since the last bump; the current execution is
    /// reused.
    Reused { execution: u64 },
    /// The marker matches the run already recorded.
    RepeatedMarker,
    /// The cell was removed; the signal is ignored.
    Removed,
}

#[derive(Debug, Clone)]
pub struct LifecycleCoordinator {
    retained_executions: Option<usize>,
}

impl LifecycleCoordinator {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            retained_executions: config.retained_executions(),
        }
    }

    pub fn cell_executed_again(
        &self,
        store: &mut StateStore,
        cell_id: &CellId,
        marker: Option<String>,
        report: &mut ApplyReport,
    ) -> ExecutionStart {
        if store.is_removed(cell_id) {
            report.note(
                DiagnosticKind::RetiredEntity,
                format!("cell {cell_id} was removed"),
            );
            return ExecutionStart::Removed;
        }

        if store.cell(cell_id).is_none() {
            store.ensure_cell(cell_id);
            if let Some(cell) = store.cell_mut(cell_id) {
                cell.last_marker = marker.clone();
                if let Some(execution) = cell.executions.get_mut(&cell.current) {
                    execution.signaled = true;
                    execution.marker = marker;
                }
            }
            report.mark_changed();
            return ExecutionStart::Created;
        }
        let Some(cell) = store.cell_mut(cell_id) else {
            return ExecutionStart::Removed;
        };

        if marker.is_some() && cell.last_marker == marker {
            report.note(
                DiagnosticKind::DuplicateEvent,
                format!("cell {cell_id} already started run {}", marker.unwrap_or_default()),
            );
            return ExecutionStart::RepeatedMarker;
        }
        if marker.is_some() {
            cell.last_marker = marker.clone();
        }

        if cell.pristine {
            let execution = cell.current;
            if let Some(record) = cell.executions.get_mut(&execution) {
                if !record.signaled {
                    record.signaled = true;
                    report.mark_changed();
                }
                if marker.is_some() {
                    record.marker = marker;
                }
            }
            store.touch(cell_id);
            return ExecutionStart::Reused { execution };
        }

        cell.current += 1;
        cell.pristine = true;
        let execution = cell.current;
        cell.executions.insert(
            execution,
            ExecutionRecord {
                signaled: true,
                marker,
                ..ExecutionRecord::default()
            },
        );
        let superseded = self.superseded(cell.executions.keys().copied().collect());

        let mut purged = 0;
        for old in superseded {
            purged += store.purge_execution(cell_id, old);
        }
        store.touch(cell_id);
        report.mark_changed();
        tracing::debug!(
            event = "cell_execution_advanced",
            cell_id = %cell_id,
            execution,
            purged
        );
        ExecutionStart::Advanced { execution, purged }
    }

    pub fn cell_removed(
        &self,
        store: &mut StateStore,
        cell_id: &CellId,
        report: &mut ApplyReport,
    ) -> bool {
        if !store.remove_cell(cell_id) {
            report.note(
                DiagnosticKind::ReferentialGap,
                format!("cell {cell_id} is not live"),
            );
            return false;
        }
        report.mark_changed();
        tracing::debug!(event = "cell_removed", cell_id = %cell_id);
        true
    }

    /// Executions to free, oldest first, given all retained sequences in
    /// ascending order.
    fn superseded(&self, executions: Vec<u64>) -> Vec<u64> {
        match self.retained_executions {
            Some(keep) if executions.len() > keep => {
                let excess = executions.len() - keep.max(1);
                executions.into_iter().take(excess).collect()
            }
            _ => Vec::new(),
        }
    }
}
