use serde::{Deserialize, Serialize};

pub const DEFAULT_UNKNOWN_CELL_ID: &str = "__unattributed__";
pub const DEFAULT_MAX_TOMBSTONES: usize = 10_000;

/// What happens to an execution's records once the cell runs again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionRetention {
    /// Prior executions stay addressable until the cell is removed.
    #[default]
    KeepHistory,
    /// Prior executions are freed as soon as a new one starts.
    DiscardSuperseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Cell id of the bucket collecting work with no attributable cell.
    pub unknown_cell_id: String,
    pub retention: ExecutionRetention,
    /// Upper bound on executions kept per cell under `keep_history`, current
    /// one included. Zero keeps everything.
    pub max_retained_executions: usize,
    /// How many purged job and stage ids, and removed cell ids, are remembered
    /// so late events cannot resurrect them. The oldest are forgotten first.
    pub max_tombstones: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            unknown_cell_id: DEFAULT_UNKNOWN_CELL_ID.to_string(),
            retention: ExecutionRetention::KeepHistory,
            max_retained_executions: 0,
            max_tombstones: DEFAULT_MAX_TOMBSTONES,
        }
    }
}

impl MonitorConfig {
    /// Number of executions (current included) to keep after a re-run, or
    /// `None` when history is unbounded.
    pub fn retained_executions(&self) -> Option<usize> {
        match self.retention {
            ExecutionRetention::DiscardSuperseded => Some(1),
            ExecutionRetention::KeepHistory if self.max_retained_executions == 0 => None,
            ExecutionRetention::KeepHistory => Some(self.max_retained_executions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_table_falls_back_to_defaults() {
        let config: MonitorConfig = toml::from_str(
            r#"
retention = "discard_superseded"
"#,
        )
        .expect("parse monitor config");
        assert_eq!(config.retention, ExecutionRetention::DiscardSuperseded);
        assert_eq!(config.unknown_cell_id, DEFAULT_UNKNOWN_CELL_ID);
        assert_eq!(config.retained_executions(), Some(1));
        assert_eq!(config.max_tombstones, DEFAULT_MAX_TOMBSTONES);
    }

    #[test]
    fn keep_history_cap_of_zero_is_unbounded() {
        let mut config = MonitorConfig::default();
        assert_eq!(config.retained_executions(), None);
        config.max_retained_executions = 3;
        assert_eq!(config.retained_executions(), Some(3));
    }
}
