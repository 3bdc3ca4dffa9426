//! One actor per notebook. Every mutation and read of a `NotebookMonitor`
//! goes through the actor's queue, so engine state is only ever touched from
//! a single task.

use serde_json::Value;
use sparkmon_core::signals::HostSignal;
use sparkmon_core::views::{CellSnapshot, NotebookSnapshot};
use sparkmon_core::wire::WireMsg;
use sparkmon_core::CellId;
use sparkmon_engine::{ApplyReport, MonitorConfig, NotebookMonitor};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

const SESSION_QUEUE_DEPTH: usize = 1024;
const FEED_DEPTH: usize = 64;
const MAX_BATCH: usize = 256;

/// Frames published after one batch of queued mutations.
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub revision: u64,
    pub frames: Vec<WireMsg>,
}

pub struct Subscription {
    /// Full state at subscription time.
    pub initial: Vec<WireMsg>,
    pub updates: broadcast::Receiver<Arc<SessionUpdate>>,
}

pub enum SessionCommand {
    Event(Value),
    Signal(HostSignal),
    NotebookSnapshot(oneshot::Sender<NotebookSnapshot>),
    CellSnapshot {
        cell_id: CellId,
        reply: oneshot::Sender<Option<CellSnapshot>>,
    },
    FullSnapshot(oneshot::Sender<Vec<WireMsg>>),
    Subscribe(oneshot::Sender<Subscription>),
}

#[derive(Clone)]
pub struct SessionHandle {
    notebook_id: String,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn notebook_id(&self) -> &str {
        &self.notebook_id
    }

    pub async fn send_event(&self, data: Value) -> anyhow::Result<()> {
        self.send(SessionCommand::Event(data)).await
    }

    pub async fn send_signal(&self, signal: HostSignal) -> anyhow::Result<()> {
        self.send(SessionCommand::Signal(signal)).await
    }

    pub async fn notebook_snapshot(&self) -> anyhow::Result<NotebookSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::NotebookSnapshot(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn cell_snapshot(&self, cell_id: CellId) -> anyhow::Result<Option<CellSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::CellSnapshot { cell_id, reply })
            .await?;
        Ok(rx.await?)
    }

    /// Notebook snapshot followed by every cell snapshot.
    pub async fn full_snapshot(&self) -> anyhow::Result<Vec<WireMsg>> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::FullSnapshot(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn subscribe(&self) -> anyhow::Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Subscribe(reply)).await?;
        Ok(rx.await?)
    }

    async fn send(&self, command: SessionCommand) -> anyhow::Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("session {} closed", self.notebook_id))
    }
}

struct Session {
    monitor: NotebookMonitor,
    rx: mpsc::Receiver<SessionCommand>,
    feed: broadcast::Sender<Arc<SessionUpdate>>,
}

/// Starts the actor on the current tokio runtime. It stops once every handle
/// is dropped.
pub fn spawn_session(notebook_id: impl Into<String>, config: MonitorConfig) -> SessionHandle {
    let notebook_id = notebook_id.into();
    let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
    let (feed, _) = broadcast::channel(FEED_DEPTH);
    let session = Session {
        monitor: NotebookMonitor::new(notebook_id.clone(), config),
        rx,
        feed,
    };
    info!(event = "session_started", notebook_id = %notebook_id);
    tokio::spawn(session.run());
    SessionHandle { notebook_id, tx }
}

impl Session {
    async fn run(mut self) {
        let mut batch = Vec::new();
        while let Some(first) = self.rx.recv().await {
            batch.push(first);
            while batch.len() < MAX_BATCH {
                match self.rx.try_recv() {
                    Ok(next) => batch.push(next),
                    Err(_) => break,
                }
            }
            let size = batch.len();
            for command in batch.drain(..) {
                self.handle(command);
            }
            self.publish();
            debug!(
                event = "batch_applied",
                notebook_id = %self.monitor.notebook_id(),
                size,
                revision = self.monitor.revision()
            );
        }
        info!(event = "session_stopped", notebook_id = %self.monitor.notebook_id());
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Event(data) => {
                let report = self.monitor.apply_raw(&data);
                self.log_report("spark_event", &report);
            }
            SessionCommand::Signal(signal) => {
                let kind = signal.as_str();
                let report = self.monitor.apply_signal(signal);
                self.log_report(kind, &report);
            }
            // Reads flush pending changes first so subscribers never lag
            // behind what a reader has already seen.
            SessionCommand::NotebookSnapshot(reply) => {
                self.publish();
                let _ = reply.send(self.monitor.notebook_snapshot());
            }
            SessionCommand::CellSnapshot { cell_id, reply } => {
                self.publish();
                let _ = reply.send(self.monitor.cell_snapshot(&cell_id));
            }
            SessionCommand::FullSnapshot(reply) => {
                self.publish();
                let _ = reply.send(self.full_snapshot());
            }
            SessionCommand::Subscribe(reply) => {
                self.publish();
                let _ = reply.send(Subscription {
                    initial: self.full_snapshot(),
                    updates: self.feed.subscribe(),
                });
            }
        }
    }

    fn full_snapshot(&self) -> Vec<WireMsg> {
        full_snapshot(&self.monitor)
    }

    /// Drains the change feed and broadcasts one update for it.
    fn publish(&mut self) {
        let changes = self.monitor.take_changes();
        if changes.is_empty() {
            return;
        }
        let mut frames = Vec::with_capacity(changes.cells.len() + 1);
        if changes.notebook {
            frames.push(WireMsg::NotebookSnapshot(self.monitor.notebook_snapshot()));
        }
        frames.extend(
            changes
                .cells
                .iter()
                .filter_map(|cell_id| self.monitor.cell_snapshot(cell_id))
                .map(WireMsg::CellSnapshot),
        );
        let update = SessionUpdate {
            revision: changes.revision,
            frames,
        };
        // No receivers is fine; nobody is watching yet.
        let _ = self.feed.send(Arc::new(update));
    }

    fn log_report(&self, kind: &str, report: &ApplyReport) {
        if !report.is_clean() {
            debug!(
                event = "apply_diagnostics",
                notebook_id = %self.monitor.notebook_id(),
                kind,
                count = report.diagnostics.len()
            );
        }
    }
}

pub fn full_snapshot(monitor: &NotebookMonitor) -> Vec<WireMsg> {
    let mut frames = vec![WireMsg::NotebookSnapshot(monitor.notebook_snapshot())];
    frames.extend(
        monitor
            .cell_ids()
            .iter()
            .filter_map(|cell_id| monitor.cell_snapshot(cell_id))
            .map(WireMsg::CellSnapshot),
    );
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn cell(id: &str) -> CellId {
        CellId::new(id)
    }

    async fn recv_update(sub: &mut Subscription) -> Arc<SessionUpdate> {
        tokio::time::timeout(Duration::from_secs(2), sub.updates.recv())
            .await
            .expect("update in time")
            .expect("feed open")
    }

    #[tokio::test]
    async fn events_queued_after_signal_land_in_the_active_cell() {
        let handle = spawn_session("nb", MonitorConfig::default());
        handle
            .send_signal(HostSignal::ActiveCell {
                cell_id: Some(cell("c1")),
            })
            .await
            .expect("signal");
        handle
            .send_event(json!({"msgtype": "sparkJobStart", "jobId": 1, "submissionTime": 10}))
            .await
            .expect("event");

        let snapshot = handle
            .cell_snapshot(cell("c1"))
            .await
            .expect("reply")
            .expect("c1 exists");
        assert_eq!(snapshot.num_active_jobs, 1);
        let notebook = handle.notebook_snapshot().await.expect("reply");
        assert_eq!(notebook.active_cell, Some(cell("c1")));
        assert_eq!(handle.notebook_id(), "nb");
    }

    #[tokio::test]
    async fn subscriber_gets_initial_state_then_changed_cells() {
        let handle = spawn_session("nb", MonitorConfig::default());
        handle
            .send_signal(HostSignal::ActiveCell {
                cell_id: Some(cell("c1")),
            })
            .await
            .expect("signal");
        let mut sub = handle.subscribe().await.expect("subscribe");
        assert!(matches!(sub.initial[0], WireMsg::NotebookSnapshot(_)));
        assert!(sub
            .initial
            .iter()
            .any(|frame| matches!(frame, WireMsg::CellSnapshot(s) if s.cell_id == cell("c1"))));

        handle
            .send_event(json!({"msgtype": "sparkJobStart", "jobId": 7, "submissionTime": 10}))
            .await
            .expect("event");
        let update = recv_update(&mut sub).await;
        let cells: Vec<&CellSnapshot> = update
            .frames
            .iter()
            .filter_map(|frame| match frame {
                WireMsg::CellSnapshot(snapshot) => Some(snapshot),
                _ => None,
            })
            .collect();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].cell_id, cell("c1"));
        assert_eq!(cells[0].num_active_jobs, 1);
    }

    #[tokio::test]
    async fn rejected_events_publish_nothing() {
        let handle = spawn_session("nb", MonitorConfig::default());
        let mut sub = handle.subscribe().await.expect("subscribe");
        handle
            .send_event(json!({"msgtype": "sparkSomethingElse"}))
            .await
            .expect("event");
        handle
            .send_event(json!({"msgtype": "sparkJobEnd"}))
            .await
            .expect("event");
        // A read forces the batch through; any publication would precede it.
        handle.notebook_snapshot().await.expect("reply");
        assert!(matches!(
            sub.updates.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn removed_cell_shows_up_in_notebook_frame() {
        let handle = spawn_session("nb", MonitorConfig::default());
        handle
            .send_signal(HostSignal::CellRegistered { cell_id: cell("c1") })
            .await
            .expect("signal");
        let mut sub = handle.subscribe().await.expect("subscribe");
        handle
            .send_signal(HostSignal::CellRemoved { cell_id: cell("c1") })
            .await
            .expect("signal");
        let update = recv_update(&mut sub).await;
        let notebook = update
            .frames
            .iter()
            .find_map(|frame| match frame {
                WireMsg::NotebookSnapshot(snapshot) => Some(snapshot),
                _ => None,
            })
            .expect("notebook frame");
        assert!(!notebook.cells.contains(&cell("c1")));
        assert!(handle
            .cell_snapshot(cell("c1"))
            .await
            .expect("reply")
            .is_none());
    }
}
