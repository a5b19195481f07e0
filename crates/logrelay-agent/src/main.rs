// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use logrelay::{
    agent::{self, RunningAgent},
    batcher::PushError,
    config,
    error::AgentError,
    event::LogEvent,
    logger,
    sink::{IngestFailureListener, SinkError},
};

const CONFIG_PATH_ENV: &str = "LOGRELAY_CONFIG";

/// Reports terminal ingest failures on the agent's own log.
#[derive(Debug)]
struct LogFailures;

impl IngestFailureListener for LogFailures {
    fn on_terminal_failure(&self, error: &SinkError) {
        match error {
            SinkError::Unauthenticated(_) | SinkError::Credential(_) => {
                error!("Unable to ingest logs, sign in again: {error}");
            }
            _ => error!("Unable to ingest logs, new lines are discarded: {error}"),
        }
    }
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let config_path = env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    let config = match config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("LOGRELAY | ERROR | {e}");
            return ExitCode::FAILURE;
        }
    };

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(logger::env_filter(&config.log_level))
        .event_format(logger::Formatter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("LOGRELAY | ERROR | setting default subscriber failed: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    if let Err(e) = logrelay_tls::install_crypto_provider() {
        error!("Unable to set up TLS: {e}");
        return ExitCode::FAILURE;
    }

    let shutdown = CancellationToken::new();
    let running = match start(&config, &shutdown).await {
        Ok(running) => running,
        Err(e) => {
            error!("Unable to start logrelay agent: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "logrelay agent {} running as {} on {}",
        logrelay::AGENT_VERSION,
        running.role().name(),
        running.address()
    );

    tokio::spawn(wait_for_signal(shutdown.clone()));
    read_stdin(&running, &shutdown).await;
    shutdown.cancel();

    let report = running.shutdown().await;
    if report.is_clean() {
        info!("Shutdown complete");
    } else {
        warn!("Shutdown finished with undelivered data: {report:?}");
    }
    ExitCode::SUCCESS
}

async fn start(
    config: &config::AgentConfig,
    shutdown: &CancellationToken,
) -> Result<RunningAgent, AgentError> {
    let credentials = agent::credential_provider(config)?;
    agent::start(config, credentials, Arc::new(LogFailures), shutdown).await
}

/// Pushes every stdin line until end of input or shutdown.
async fn read_stdin(running: &RunningAgent, shutdown: &CancellationToken) {
    let producer = running.producer();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if line.is_empty() => {}
            Ok(Some(line)) => match producer.push(LogEvent::decode(line), shutdown).await {
                Ok(()) => {}
                Err(PushError::Cancelled) => return,
                Err(e @ PushError::TooLarge { .. }) => warn!("Skipping log line: {e}"),
                Err(e) => {
                    error!("Log pipeline closed, stopping stdin reader: {e}");
                    return;
                }
            },
            Ok(None) => {
                debug!("End of input");
                return;
            }
            Err(e) => {
                error!("Failed to read stdin: {e}");
                return;
            }
        }
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
