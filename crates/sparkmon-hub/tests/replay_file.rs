use serde_json::json;
use sparkmon_core::wire::DEFAULT_MAX_FRAME_BYTES;
use sparkmon_engine::MonitorConfig;
use sparkmon_hub::replay::replay_file;
use std::io::Write;

fn line(kind: &str, payload: serde_json::Value) -> String {
    json!({
        "version": "1",
        "type": kind,
        "notebook_id": "nb",
        "sender_id": "recorder",
        "timestamp": "2026-02-07T21:00:00.000Z",
        "payload": payload,
    })
    .to_string()
}

#[test]
fn recorded_session_replays_to_final_snapshots() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    let lines = [
        line("active_cell", json!({"cell_id": "c1"})),
        line("spark_event", json!({"msgtype": "sparkExecutorAdded", "executorId": "1", "numCores": 4, "time": 0})),
        line("spark_event", json!({"msgtype": "sparkJobStart", "jobId": 1, "submissionTime": 1, "stageIds": [1]})),
        line("spark_event", json!({"msgtype": "sparkTaskStart", "taskId": 1, "stageId": 1, "launchTime": 2})),
        line("spark_event", json!({"msgtype": "sparkTaskEnd", "taskId": 1, "stageId": 1, "launchTime": 2, "finishTime": 6, "status": "SUCCESS"})),
        line("spark_event", json!({"msgtype": "sparkJobEnd", "jobId": 1, "completionTime": 7, "status": "SUCCEEDED"})),
        line("cell_executed_again", json!({"cell_id": "c1", "marker": "run-2"})),
    ];
    for entry in &lines {
        writeln!(file, "{entry}").expect("write line");
    }
    // Trailing partial line without newline is still decoded.
    write!(file, "{}", line("cell_display", json!({"cell_id": "c1", "view": "timeline"})))
        .expect("write tail");
    file.flush().expect("flush");

    let output = replay_file(file.path(), &MonitorConfig::default(), DEFAULT_MAX_FRAME_BYTES)
        .expect("replay");
    assert_eq!(output.frames_applied, lines.len() + 1);
    assert_eq!(output.frames_skipped, 0);

    let notebook = &output.notebooks[0];
    assert_eq!(notebook.notebook.num_total_cores, 4);
    let c1 = notebook
        .cells
        .iter()
        .find(|cell| cell.cell_id.as_str() == "c1")
        .expect("c1");
    // The re-run starts a fresh execution; the finished job belongs to the
    // previous one.
    assert_eq!(c1.execution, 2);
    assert_eq!(c1.num_completed_jobs, 0);
    assert!(c1.jobs.is_empty());
    assert_eq!(serde_json::to_value(&c1.view).expect("view"), json!("timeline"));
}

#[test]
fn missing_file_is_reported() {
    let err = replay_file(
        std::path::Path::new("/nonexistent/recording.ndjson"),
        &MonitorConfig::default(),
        DEFAULT_MAX_FRAME_BYTES,
    )
    .expect_err("missing file");
    assert!(err.to_string().contains("reading replay"));
}
