//! Attendance reader daemon (kintai-rd) - Main entry point
//!
//! Polls the PC/SC card reader, feeds taps through the presence engine,
//! appends the resulting events to the month-partitioned event log, and
//! echoes each event as one JSON line on stdout. A periodic sweep task
//! closes stale presences; both producers share one engine lock so the
//! log only ever sees events in acceptance order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod reader;

use kintai_common::config::resolve_root_folder;
use kintai_common::events::{AttendanceEvent, UNKNOWN_EMPLOYEE};
use kintai_common::presence::PresenceState;
use kintai_common::{store, time};

/// Command-line arguments for kintai-rd
#[derive(Parser, Debug)]
#[command(name = "kintai-rd")]
#[command(about = "Attendance reader daemon for kintai")]
#[command(version)]
struct Args {
    /// Root folder containing config and state
    #[arg(short, long, env = "KINTAI_ROOT")]
    root_folder: Option<PathBuf>,

    /// Preferred PC/SC reader index
    #[arg(long, default_value = "0", env = "KINTAI_READER_INDEX")]
    reader_index: usize,

    /// Sweep period in milliseconds
    #[arg(long, default_value = "1000", env = "KINTAI_SWEEP_PERIOD_MS")]
    sweep_period_ms: u64,
}

/// Presence state plus the month partition it was restored from,
/// guarded by one lock shared between the tap loop and the sweep task
struct Engine {
    state: PresenceState,
    month: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kintai_rd=info,kintai_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let cli_root = args.root_folder.as_ref().and_then(|p| p.to_str());
    let root = resolve_root_folder(cli_root, "KINTAI_ROOT").context("Failed to resolve root folder")?;

    info!("Starting kintai reader daemon");
    info!("Root folder: {}", root.display());

    let uid_map = load_uid_map(&root.join("config").join("attendance").join("uid_map.json"));
    info!("Loaded {} card mappings", uid_map.len());

    // Replay the current month before accepting any live tap, so recovery
    // is consistent with whatever was durably appended
    let month = store::month_key(&time::now());
    let events = store::read_month_events(&root, &month)
        .with_context(|| format!("Failed to replay month partition {month}"))?;
    info!("Restored presence state from {} events in {}", events.len(), month);

    let engine = Arc::new(Mutex::new(Engine {
        state: PresenceState::restore(events),
        month,
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep = tokio::spawn(sweep_task(
        engine.clone(),
        root.clone(),
        Duration::from_millis(args.sweep_period_ms.max(1)),
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    tap_loop(engine, &root, &uid_map, args.reader_index, shutdown_rx).await?;

    // The sweep task stops on the same shutdown signal
    sweep.await.ok();
    info!("Reader daemon shutdown complete");
    Ok(())
}

/// Static card-uid to employee-id mapping; missing or malformed files
/// resolve every card to "unknown"
fn load_uid_map(path: &Path) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<HashMap<String, String>>(&text) {
            Ok(map) => map,
            Err(e) => {
                warn!("Ignoring malformed uid map {}: {}", path.display(), e);
                HashMap::new()
            }
        },
        Err(_) => {
            warn!("No uid map at {}", path.display());
            HashMap::new()
        }
    }
}

/// Consume taps until shutdown.
///
/// The reader poll blocks for an arbitrary time waiting for a card, so it
/// runs on a blocking thread outside the engine lock; the lock is taken
/// only once a tap has actually occurred.
async fn tap_loop(
    engine: Arc<Mutex<Engine>>,
    root: &Path,
    uid_map: &HashMap<String, String>,
    reader_index: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let poll = tokio::task::spawn_blocking(move || reader::poll_card_uid(reader_index));
        let uid = tokio::select! {
            res = poll => match res.context("reader task panicked")? {
                Ok(uid) => uid,
                Err(e) => {
                    warn!("Reader poll failed (will retry): {e:#}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        let now = time::now();
        let employee = uid_map
            .get(&uid)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_EMPLOYEE.to_string());

        let mut engine = engine.lock().await;

        // Re-replay when the active month partition changed, before the
        // tap is applied
        let month = store::month_key(&now);
        if month != engine.month {
            info!("Month partition changed to {month}, replaying log");
            let events = store::read_month_events(root, &month)
                .with_context(|| format!("Failed to replay month partition {month}"))?;
            engine.state = PresenceState::restore(events);
            engine.month = month;
        }

        for ev in engine.state.on_tap(now, &uid, &employee) {
            emit(root, &ev)?;
        }
    }
    Ok(())
}

/// Close stale presences on a fixed period, under the same lock as the
/// tap loop
async fn sweep_task(
    engine: Arc<Mutex<Engine>>,
    root: PathBuf,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = time::now();
                let mut engine = engine.lock().await;
                for ev in engine.state.sweep(now) {
                    if let Err(e) = emit(&root, &ev) {
                        error!("Failed to persist sweep event: {e:#}");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Append one event to the log and echo it on stdout.
///
/// Called while holding the engine lock so append order to the log is
/// exactly acceptance order across both producers.
fn emit(root: &Path, event: &AttendanceEvent) -> Result<()> {
    store::append_event(root, event).context("Failed to append event")?;
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
