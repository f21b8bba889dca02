//! Console host.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Create the [`tokio`] runtime.
//! 4. Start the [`Host`], which launches and supervises the worker.
//! 5. Read commands from stdin until `quit` or end of input.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use voice_sidecar::{
    config::AppConfig,
    host::Host,
    session::HostEvent,
    supervisor::CommandLauncher,
};

const HELP: &str = "commands: start | stop | cancel | ack | pause | resume | init <model> | \
                    download <id> | purge [id] | restart | status | history | quit";

// ---------------------------------------------------------------------------
// Event printer
// ---------------------------------------------------------------------------

async fn print_events(mut events: broadcast::Receiver<HostEvent>) {
    loop {
        match events.recv().await {
            Ok(HostEvent::Status(s)) => {
                let detail = s.detail.as_deref().unwrap_or("");
                log::info!(
                    "[{}] worker={:?} model={:?} {detail}",
                    s.display_label(),
                    s.sidecar.state,
                    s.model.status
                );
            }
            Ok(HostEvent::Transcript(t)) => println!("{}", t.text),
            Ok(HostEvent::AudioLevel(level)) => {
                log::trace!("level rms={:.3} peak={:.3}", level.rms, level.peak);
            }
            Ok(HostEvent::Recording(r)) => {
                log::debug!("recording active={} elapsed={:?}", r.active, r.elapsed_ms);
            }
            Err(broadcast::error::RecvError::Lagged(n)) => log::warn!("missed {n} event(s)"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Command loop
// ---------------------------------------------------------------------------

/// Returns `false` when the loop should end.
async fn run_command(host: &Host, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return true;
    };
    let arg = words.next();
    let session = host.session();

    let outcome: Result<()> = match (command, arg) {
        ("start", _) => session
            .start_recording()
            .await
            .map(|id| log::info!("session {id}"))
            .map_err(Into::into),
        ("stop", _) => session.stop_recording().await.map_err(Into::into),
        ("cancel", _) => session.cancel_recording().await.map_err(Into::into),
        ("ack", _) => session.acknowledge_error().map_err(Into::into),
        ("pause", _) => {
            session.set_enabled(false);
            Ok(())
        }
        ("resume", _) => {
            session.set_enabled(true);
            Ok(())
        }
        ("init", Some(model)) => host
            .initialize_model(model)
            .await
            .map(|v| log::info!("initialised: {v}"))
            .map_err(Into::into),
        ("download", Some(id)) => host
            .download_model(id)
            .await
            .map(|v| log::info!("downloaded: {v}"))
            .map_err(Into::into),
        ("purge", id) => host
            .purge_models(id)
            .await
            .map(|v| log::info!("purged: {v}"))
            .map_err(Into::into),
        ("restart", _) => host.supervisor().restart().await.map_err(Into::into),
        ("status", _) => {
            let s = session.snapshot();
            println!(
                "{} | worker {:?} (restarts {}) | model {:?} | pending rpc {}",
                s.display_label(),
                s.sidecar.state,
                s.sidecar.restart_count,
                s.model.status,
                host.correlator().pending_len()
            );
            Ok(())
        }
        ("history", _) => {
            for entry in session.history() {
                println!("{}: {}", entry.session_id, entry.text);
            }
            Ok(())
        }
        ("quit" | "exit", _) => return false,
        _ => {
            println!("{HELP}");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        log::warn!("{command}: {e}");
    }
    true
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("voice-sidecar host starting up");

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    rt.block_on(async move {
        // 4. Host
        let launcher = Arc::new(CommandLauncher::new(config.worker.clone()));
        let host = Host::start(config, launcher).await;
        tokio::spawn(print_events(host.subscribe()));
        println!("{HELP}");

        // 5. Commands
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if !run_command(&host, line.trim()).await {
                break;
            }
        }

        host.shutdown().await;
        Ok::<(), anyhow::Error>(())
    })
}
