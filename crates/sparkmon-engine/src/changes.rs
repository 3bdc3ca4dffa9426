use sparkmon_core::CellId;
use std::collections::BTreeSet;

/// What changed since the previous drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub revision: u64,
    /// Live cells whose snapshot changed.
    pub cells: BTreeSet<CellId>,
    pub removed_cells: BTreeSet<CellId>,
    /// Notebook-level state (executors, application, display toggles,
    /// active cell, cell list) changed.
    pub notebook: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.removed_cells.is_empty() && !self.notebook
    }
}

#[derive(Debug, Default)]
pub struct ChangeTracker {
    revision: u64,
    cells: BTreeSet<CellId>,
    notebook: bool,
}

impl ChangeTracker {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Records one committed mutation.
    pub fn commit<I>(&mut self, cells: I, notebook: bool)
    where
        I: IntoIterator<Item = CellId>,
    {
        self.revision += 1;
        self.cells.extend(cells);
        self.notebook |= notebook;
    }

    /// Drains pending changes. `is_live` splits touched cells into changed and
    /// removed ones.
    pub fn drain(&mut self, is_live: impl Fn(&CellId) -> bool) -> ChangeSet {
        let touched = std::mem::take(&mut self.cells);
        let (cells, removed_cells): (BTreeSet<CellId>, BTreeSet<CellId>) =
            touched.into_iter().partition(|cell_id| is_live(cell_id));
        let notebook = std::mem::take(&mut self.notebook) || !removed_cells.is_empty();
        ChangeSet {
            revision: self.revision,
            cells,
            removed_cells,
            notebook,
        }
    }
}
