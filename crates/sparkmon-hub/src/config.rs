use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use sparkmon_core::wire::DEFAULT_MAX_FRAME_BYTES;
use sparkmon_engine::MonitorConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HUB_ADDR: &str = "127.0.0.1:42180";
pub const DEFAULT_LOG_DIR: &str = ".sparkmon/logs";
const DEFAULT_PING_INTERVAL_SECS: u64 = 10;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 2;

#[derive(Parser, Debug, Default)]
#[command(name = "sparkmon-hub", about = "Spark job monitor hub for notebook kernels")]
pub struct Args {
    #[arg(long)]
    pub addr: Option<String>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Seconds between websocket pings; 0 disables keepalive.
    #[arg(long)]
    pub ping_interval: Option<u64>,
    #[arg(long)]
    pub write_timeout: Option<u64>,
    #[arg(long)]
    pub log_dir: Option<String>,
    /// TOML file with optional `[hub]` and `[monitor]` tables.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Feed an NDJSON file of wire envelopes through a monitor and print the
    /// resulting snapshots instead of serving.
    #[arg(long)]
    pub replay: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub hub: HubSection,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub addr: Option<String>,
    pub log_dir: Option<String>,
    pub ping_interval_secs: Option<u64>,
    pub write_timeout_secs: Option<u64>,
    pub max_frame_bytes: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: String,
    pub debug: bool,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub log_dir: String,
    pub max_frame_bytes: usize,
    pub monitor: MonitorConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_HUB_ADDR.to_string(),
            debug: false,
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            monitor: MonitorConfig::default(),
        }
    }
}

pub fn load_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

/// Flags win over env vars, env vars over the config file.
pub fn resolve_config(
    args: &Args,
    file: FileConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> HubConfig {
    let env = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
    let flag = |value: &Option<String>| value.clone().filter(|value| !value.trim().is_empty());

    let addr = flag(&args.addr)
        .or_else(|| env("SPARKMON_HUB_ADDR"))
        .or(file.hub.addr)
        .unwrap_or_else(|| DEFAULT_HUB_ADDR.to_string());
    let log_dir = flag(&args.log_dir)
        .or_else(|| env("SPARKMON_LOG_DIR"))
        .or(file.hub.log_dir)
        .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string());
    let debug = args.debug || env("SPARKMON_HUB_DEBUG").is_some_and(|value| is_truthy(&value));
    let ping_interval = args
        .ping_interval
        .or(file.hub.ping_interval_secs)
        .unwrap_or(DEFAULT_PING_INTERVAL_SECS);
    let write_timeout = args
        .write_timeout
        .or(file.hub.write_timeout_secs)
        .unwrap_or(DEFAULT_WRITE_TIMEOUT_SECS);

    HubConfig {
        addr,
        debug,
        ping_interval: Duration::from_secs(ping_interval),
        write_timeout: Duration::from_secs(write_timeout.max(1)),
        log_dir,
        max_frame_bytes: file.hub.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES),
        monitor: file.monitor,
    }
}

pub fn load_config(args: &Args) -> anyhow::Result<HubConfig> {
    let file = match &args.config {
        Some(path) => load_file_config(path)?,
        None => FileConfig::default(),
    };
    Ok(resolve_config(args, file, |key| std::env::var(key).ok()))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkmon_engine::ExecutionRetention;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_flags_env_or_file() {
        let config = resolve_config(&Args::default(), FileConfig::default(), env_of(&[]));
        assert_eq!(config.addr, DEFAULT_HUB_ADDR);
        assert_eq!(config.log_dir, DEFAULT_LOG_DIR);
        assert!(!config.debug);
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(config.monitor, MonitorConfig::default());
    }

    #[test]
    fn flags_beat_env_and_env_beats_file() {
        let file: FileConfig = toml::from_str(
            r#"
[hub]
addr = "127.0.0.1:5000"
log_dir = "/tmp/from-file"
ping_interval_secs = 30
"#,
        )
        .expect("parse file config");
        let env = env_of(&[
            ("SPARKMON_HUB_ADDR", "127.0.0.1:6000"),
            ("SPARKMON_HUB_DEBUG", "yes"),
        ]);
        let args = Args {
            log_dir: Some("/tmp/from-flag".to_string()),
            ..Args::default()
        };
        let config = resolve_config(&args, file, env);
        assert_eq!(config.addr, "127.0.0.1:6000");
        assert_eq!(config.log_dir, "/tmp/from-flag");
        assert!(config.debug);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let env = env_of(&[("SPARKMON_HUB_ADDR", "  "), ("SPARKMON_HUB_DEBUG", "0")]);
        let config = resolve_config(&Args::default(), FileConfig::default(), env);
        assert_eq!(config.addr, DEFAULT_HUB_ADDR);
        assert!(!config.debug);
    }

    #[test]
    fn monitor_table_reaches_engine_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sparkmon.toml");
        std::fs::write(
            &path,
            r#"
[monitor]
retention = "keep_history"
max_retained_executions = 4
"#,
        )
        .expect("write config");
        let args = Args {
            config: Some(path),
            ..Args::default()
        };
        let config = load_config(&args).expect("load config");
        assert_eq!(config.monitor.retention, ExecutionRetention::KeepHistory);
        assert_eq!(config.monitor.retained_executions(), Some(4));
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let args = Args {
            config: Some(PathBuf::from("/nonexistent/sparkmon.toml")),
            ..Args::default()
        };
        let err = load_config(&args).expect_err("missing file");
        assert!(err.to_string().contains("reading config"));
    }
}
