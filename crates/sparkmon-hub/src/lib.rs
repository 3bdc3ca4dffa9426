//! Websocket hub that hosts one `NotebookMonitor` per notebook and fans its
//! snapshots out to display clients.

pub mod config;
pub mod logging;
pub mod replay;
pub mod server;
pub mod session;
