use serde::Serialize;
use sparkmon_core::CellId;
use std::fmt;

/// Attribution target of a job: one execution of one cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Owner {
    pub cell_id: CellId,
    pub execution: u64,
}

impl Owner {
    pub fn new(cell_id: CellId, execution: u64) -> Self {
        Self { cell_id, execution }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.cell_id, self.execution)
    }
}

/// Read access to each live cell's current execution sequence.
pub trait ExecutionLookup {
    fn current_execution(&self, cell_id: &CellId) -> Option<u64>;
}

/// Holds the host's "currently running cell" pointer and resolves job-start
/// events to an [`Owner`].
#[derive(Debug, Clone)]
pub struct ExecutionLocator {
    active_cell: Option<CellId>,
    unknown_cell: CellId,
}

impl ExecutionLocator {
    pub fn new(unknown_cell: CellId) -> Self {
        Self {
            active_cell: None,
            unknown_cell,
        }
    }

    pub fn active_cell(&self) -> Option<&CellId> {
        self.active_cell.as_ref()
    }

    pub fn set_active_cell(&mut self, cell_id: Option<CellId>) {
        self.active_cell = cell_id;
    }

    /// Drops the pointer if it names `cell_id`.
    pub fn forget_cell(&mut self, cell_id: &CellId) {
        if self.active_cell.as_ref() == Some(cell_id) {
            self.active_cell = None;
        }
    }

    pub fn unknown_cell(&self) -> &CellId {
        &self.unknown_cell
    }

    pub fn is_unknown(&self, cell_id: &CellId) -> bool {
        *cell_id == self.unknown_cell
    }

    /// An explicit hint wins over the active pointer. Cells the lookup does not
    /// know (never seen, or removed) resolve to the unknown bucket.
    pub fn resolve_owner(&self, cell_hint: Option<&CellId>, cells: &impl ExecutionLookup) -> Owner {
        let candidate = cell_hint.or(self.active_cell.as_ref());
        if let Some(cell_id) = candidate {
            if let Some(execution) = cells.current_execution(cell_id) {
                return Owner::new(cell_id.clone(), execution);
            }
        }
        self.unknown_owner(cells)
    }

    pub fn unknown_owner(&self, cells: &impl ExecutionLookup) -> Owner {
        let execution = cells.current_execution(&self.unknown_cell).unwrap_or(1);
        Owner::new(self.unknown_cell.clone(), execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Cells(HashMap<CellId, u64>);

    impl ExecutionLookup for Cells {
        fn current_execution(&self, cell_id: &CellId) -> Option<u64> {
            self.0.get(cell_id).copied()
        }
    }

    fn cells() -> Cells {
        Cells(HashMap::from([(CellId::new("c1"), 3), (CellId::new("c2"), 1)]))
    }

    #[test]
    fn active_pointer_resolves_to_current_execution() {
        let mut locator = ExecutionLocator::new(CellId::new("unknown"));
        locator.set_active_cell(Some(CellId::new("c1")));
        assert_eq!(
            locator.resolve_owner(None, &cells()),
            Owner::new(CellId::new("c1"), 3)
        );
        assert_eq!(
            locator.resolve_owner(Some(&CellId::new("c2")), &cells()),
            Owner::new(CellId::new("c2"), 1)
        );
    }

    #[test]
    fn absent_or_unknown_cells_fall_back_to_bucket() {
        let mut locator = ExecutionLocator::new(CellId::new("unknown"));
        assert_eq!(
            locator.resolve_owner(None, &cells()),
            Owner::new(CellId::new("unknown"), 1)
        );
        locator.set_active_cell(Some(CellId::new("removed")));
        assert_eq!(
            locator.resolve_owner(None, &cells()).cell_id,
            CellId::new("unknown")
        );
        locator.forget_cell(&CellId::new("removed"));
        assert_eq!(locator.active_cell(), None);
    }
}
