use crate::CellId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Facts supplied by the notebook host. The monitor accepts them as correct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum HostSignal {
    /// The cell the host believes is executing; `None` when it cannot tell.
    ActiveCell { cell_id: Option<CellId> },
    /// The cell started a new run. `marker` identifies the run (display id or
    /// execution count) so repeated notifications for one run collapse.
    CellExecutedAgain {
        cell_id: CellId,
        #[serde(default)]
        marker: Option<String>,
    },
    CellRemoved { cell_id: CellId },
    CellRegistered { cell_id: CellId },
    KernelRestarted,
    CellDisplay {
        cell_id: CellId,
        #[serde(default)]
        view: Option<CellView>,
        #[serde(default)]
        collapsed: Option<bool>,
        #[serde(default)]
        hidden: Option<bool>,
    },
    ToggleAllDisplays,
}

impl HostSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostSignal::ActiveCell { .. } => "active_cell",
            HostSignal::CellExecutedAgain { .. } => "cell_executed_again",
            HostSignal::CellRemoved { .. } => "cell_removed",
            HostSignal::CellRegistered { .. } => "cell_registered",
            HostSignal::KernelRestarted => "kernel_restarted",
            HostSignal::CellDisplay { .. } => "cell_display",
            HostSignal::ToggleAllDisplays => "toggle_all_displays",
        }
    }
}

/// Which tab of the per-cell display is selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellView {
    #[default]
    Jobs,
    TaskChart,
    Timeline,
}

impl CellView {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellView::Jobs => "jobs",
            CellView::TaskChart => "taskchart",
            CellView::Timeline => "timeline",
        }
    }
}

impl fmt::Display for CellView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CellView {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "jobs" => Ok(CellView::Jobs),
            "taskchart" | "task_chart" | "tasks" => Ok(CellView::TaskChart),
            "timeline" => Ok(CellView::Timeline),
            other => Err(format!("Unknown view: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signals_parse_from_tagged_json() {
        let signal: HostSignal = serde_json::from_value(json!({
            "signal": "cell_executed_again",
            "cell_id": "c1"
        }))
        .expect("parse");
        assert_eq!(
            signal,
            HostSignal::CellExecutedAgain {
                cell_id: CellId::new("c1"),
                marker: None
            }
        );

        let signal: HostSignal =
            serde_json::from_value(json!({"signal": "active_cell", "cell_id": null}))
                .expect("parse");
        assert_eq!(signal, HostSignal::ActiveCell { cell_id: None });
        assert_eq!(signal.as_str(), "active_cell");
    }

    #[test]
    fn view_names_match_display_tabs() {
        assert_eq!("taskchart".parse::<CellView>(), Ok(CellView::TaskChart));
        assert_eq!(
            serde_json::to_value(CellView::TaskChart).expect("serialize"),
            json!("taskchart")
        );
        assert_eq!(CellView::default(), CellView::Jobs);
    }
}
