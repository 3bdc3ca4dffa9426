use anyhow::Context;
use serde::Serialize;
use sparkmon_core::views::{CellSnapshot, NotebookSnapshot};
use sparkmon_core::wire::{parse_envelope_lines, WireMsg};
use sparkmon_engine::{MonitorConfig, NotebookMonitor};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayOutput {
    pub frames_applied: usize,
    pub frames_skipped: usize,
    pub notebooks: Vec<ReplayNotebook>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayNotebook {
    pub notebook: NotebookSnapshot,
    pub cells: Vec<CellSnapshot>,
}

/// Feeds recorded envelopes through one monitor per notebook, in file order.
pub fn replay_bytes(bytes: &[u8], config: &MonitorConfig, max_frame_bytes: usize) -> ReplayOutput {
    let recorded = parse_envelope_lines(bytes, max_frame_bytes);
    let mut output = ReplayOutput {
        frames_skipped: recorded.errors.len(),
        ..ReplayOutput::default()
    };
    for err in &recorded.errors {
        warn!(event = "replay_frame_invalid", line = err.line, code = err.error.code(), error = %err.error);
    }

    let mut monitors: BTreeMap<String, NotebookMonitor> = BTreeMap::new();
    for envelope in recorded.envelopes {
        if let Err(err) = envelope.validate() {
            warn!(event = "replay_envelope_invalid", code = err.code(), error = %err);
            output.frames_skipped += 1;
            continue;
        }
        let monitor = monitors
            .entry(envelope.notebook_id.clone())
            .or_insert_with(|| NotebookMonitor::new(envelope.notebook_id.clone(), config.clone()));
        match envelope.msg {
            WireMsg::SparkEvent(data) => {
                monitor.apply_raw(&data);
            }
            other => match other.into_host_signal() {
                Ok(signal) => {
                    monitor.apply_signal(signal);
                }
                Err(other) => {
                    warn!(event = "replay_frame_ignored", r#type = other.type_name());
                    output.frames_skipped += 1;
                    continue;
                }
            },
        }
        output.frames_applied += 1;
    }

    output.notebooks = monitors
        .values()
        .map(|monitor| ReplayNotebook {
            notebook: monitor.notebook_snapshot(),
            cells: monitor
                .cell_ids()
                .iter()
                .filter_map(|cell_id| monitor.cell_snapshot(cell_id))
                .collect(),
        })
        .collect();
    output
}

pub fn replay_file(path: &Path, config: &MonitorConfig, max_frame_bytes: usize) -> anyhow::Result<ReplayOutput> {
    let bytes = std::fs::read(path).with_context(|| format!("reading replay {}", path.display()))?;
    let output = replay_bytes(&bytes, config, max_frame_bytes);
    info!(
        event = "replay_done",
        path = %path.display(),
        applied = output.frames_applied,
        skipped = output.frames_skipped,
        notebooks = output.notebooks.len()
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkmon_core::wire::DEFAULT_MAX_FRAME_BYTES;

    #[test]
    fn notebooks_are_replayed_independently() {
        let input = concat!(
            r#"{"version":"1","type":"active_cell","notebook_id":"a","sender_id":"h","timestamp":"2026-02-07T21:00:00Z","payload":{"cell_id":"c1"}}"#,
            "\n",
            r#"{"version":"1","type":"spark_event","notebook_id":"a","sender_id":"k","timestamp":"2026-02-07T21:00:01Z","payload":{"msgtype":"sparkJobStart","jobId":1,"submissionTime":5}}"#,
            "\n",
            r#"{"version":"1","type":"spark_event","notebook_id":"b","sender_id":"k","timestamp":"2026-02-07T21:00:01Z","payload":{"msgtype":"sparkJobStart","jobId":1,"submissionTime":5}}"#,
            "\n",
        );
        let output = replay_bytes(input.as_bytes(), &MonitorConfig::default(), DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(output.frames_applied, 3);
        assert_eq!(output.notebooks.len(), 2);

        let a = &output.notebooks[0];
        assert_eq!(a.notebook.notebook_id, "a");
        let c1 = a
            .cells
            .iter()
            .find(|cell| cell.cell_id.as_str() == "c1")
            .expect("c1 snapshot");
        assert_eq!(c1.num_active_jobs, 1);

        let b = &output.notebooks[1];
        assert!(b.cells.iter().all(|cell| cell.cell_id.as_str() != "c1"));
    }

    #[test]
    fn bad_lines_and_stale_versions_are_skipped() {
        let input = concat!(
            "not json\n",
            r#"{"version":"9","type":"kernel_restarted","notebook_id":"a","sender_id":"h","timestamp":"2026-02-07T21:00:00Z"}"#,
            "\n",
            r#"{"version":"1","type":"hello","notebook_id":"a","sender_id":"h","timestamp":"2026-02-07T21:00:00Z","payload":{"client_id":"h","role":"host"}}"#,
            "\n",
        );
        let output = replay_bytes(input.as_bytes(), &MonitorConfig::default(), DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(output.frames_applied, 0);
        assert_eq!(output.frames_skipped, 3);
    }
}
