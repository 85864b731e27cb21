//! gamewarden: keeps a dedicated game server running, talks to it over
//! BattlEye RCON and runs scheduled actions against both.
//!
//! Run with: gamewarden --config config.toml

mod config;
mod supervisor;

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use gamewarden_core::{QuitReason, QuitSignal};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dedicated game-server supervisor")]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();
    install_panic_hook();

    let config = match Config::load(&args.config).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let quit = QuitSignal::new();
    tokio::spawn({
        let quit = quit.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => quit.raise(QuitReason::Requested("interrupt".to_string())),
                Err(e) => tracing::warn!(error = %e, "Cannot listen for Ctrl-C"),
            }
        }
    });

    let reason = match tokio::spawn(supervisor::run(config, quit.clone())).await {
        Ok(reason) => reason,
        Err(e) => {
            let reason = QuitReason::Fatal {
                component: "supervisor".to_string(),
                error: e.to_string(),
            };
            tracing::error!(%reason, "Supervisor task aborted");
            // Stops whatever the supervisor left running.
            quit.raise(reason.clone());
            reason
        }
    };

    if reason.is_fatal() {
        tracing::error!(%reason, "Exiting after fatal error");
        ExitCode::FAILURE
    } else {
        tracing::info!(%reason, "Exiting");
        ExitCode::SUCCESS
    }
}

/// Report panics through tracing before the default hook prints them.
fn install_panic_hook() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(%location, %message, "Panic");
        default(info);
    }));
}
