use clap::Parser;
use sparkmon_hub::config::{load_config, Args};
use sparkmon_hub::logging::{init_logging, Console};
use sparkmon_hub::{replay, server};
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config_error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(path) = &args.replay {
        let _log_guard = init_logging(&config, Console::Stderr);
        let output = match replay::replay_file(path, &config.monitor, config.max_frame_bytes) {
            Ok(output) => output,
            Err(err) => {
                error!(event = "replay_error", error = %format!("{err:#}"));
                return ExitCode::FAILURE;
            }
        };
        return match serde_json::to_string_pretty(&output) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(event = "replay_error", error = %err);
                ExitCode::FAILURE
            }
        };
    }

    let _log_guard = init_logging(&config, Console::Stdout);
    if let Err(err) = server::serve(config).await {
        error!(event = "hub_error", error = %format!("{err:#}"));
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
