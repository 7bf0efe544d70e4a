//! Attendance notifier (kintai-nt) - Main entry point
//!
//! Tails the current month's event log and posts one human-readable line
//! per attendance event to a Discord-compatible chat webhook. OUT lines
//! include the duration since the employee's IN, reconstructed from the
//! month's existing events at startup. Delivery is best-effort: a failed
//! post is logged and the tail keeps going.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod discord;

use discord::ChatWebhook;
use kintai_common::config::resolve_root_folder;
use kintai_common::employees::{EmployeeDirectory, EnvFileDirectory};
use kintai_common::events::{AttendanceEvent, EventAction};
use kintai_common::{store, time};

/// Command-line arguments for kintai-nt
#[derive(Parser, Debug)]
#[command(name = "kintai-nt")]
#[command(about = "Attendance chat notifier for kintai")]
#[command(version)]
struct Args {
    /// Root folder containing config and state
    #[arg(short, long, env = "KINTAI_ROOT")]
    root_folder: Option<PathBuf>,

    /// Chat webhook URL to post event lines to
    #[arg(long, env = "KINTAI_WEBHOOK_URL")]
    webhook_url: String,

    /// Log poll period in milliseconds
    #[arg(long, default_value = "200", env = "KINTAI_TAIL_POLL_MS")]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kintai_nt=info,kintai_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let cli_root = args.root_folder.as_ref().and_then(|p| p.to_str());
    let root = resolve_root_folder(cli_root, "KINTAI_ROOT").context("Failed to resolve root folder")?;

    info!("Starting kintai notifier");
    info!("Root folder: {}", root.display());

    let webhook = ChatWebhook::new(args.webhook_url)?;
    let directory = EnvFileDirectory::new(&root);
    let poll = Duration::from_millis(args.poll_ms.max(1));

    tokio::select! {
        res = tail_loop(&root, &directory, &webhook, poll) => res,
        _ = shutdown_signal() => {
            info!("Notifier shutdown complete");
            Ok(())
        }
    }
}

/// Follow the active month partition forever, posting each new event
async fn tail_loop(
    root: &Path,
    directory: &EnvFileDirectory,
    webhook: &ChatWebhook,
    poll: Duration,
) -> Result<()> {
    let mut month = store::month_key(&time::now());
    let mut open_in = restore_open_in(&store::read_month_events(root, &month)?);
    let mut file = open_tail(&store::month_events_path(root, &month))?;
    info!("Tailing month partition {month}");

    loop {
        let now_month = store::month_key(&time::now());
        if now_month != month {
            month = now_month;
            open_in = restore_open_in(&store::read_month_events(root, &month)?);
            file = open_tail(&store::month_events_path(root, &month))?;
            info!("Rolled over to month partition {month}");
        }

        let mut line = String::new();
        if file.read_line(&mut line)? == 0 {
            tokio::time::sleep(poll).await;
            continue;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(ev) = serde_json::from_str::<AttendanceEvent>(line) else {
            continue;
        };

        let profile = directory.lookup(&ev.employee_id);
        let display = if profile.display_name.is_empty() {
            ev.employee_id.clone()
        } else {
            profile.display_name
        };

        let text = render_event(&ev, &display, &mut open_in);
        if let Err(e) = webhook.notify(&text).await {
            error!("Chat delivery failed: {e:#}");
        }
    }
}

/// Rebuild the employee-keyed open-entry map from the month's events so
/// OUT lines can carry a duration after a notifier restart
fn restore_open_in(events: &[AttendanceEvent]) -> HashMap<String, DateTime<FixedOffset>> {
    let mut open_in = HashMap::new();
    for ev in events {
        match ev.action {
            EventAction::In => {
                open_in.insert(ev.employee_id.clone(), ev.at);
            }
            EventAction::Out | EventAction::Error => {
                open_in.remove(&ev.employee_id);
            }
        }
    }
    open_in
}

/// Open the month file for tailing, positioned at the end
fn open_tail(path: &Path) -> Result<BufReader<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.seek(SeekFrom::End(0))?;
    Ok(BufReader::new(file))
}

/// One chat line per event, updating the open-entry map as a side effect
fn render_event(
    ev: &AttendanceEvent,
    display: &str,
    open_in: &mut HashMap<String, DateTime<FixedOffset>>,
) -> String {
    let stamp = ev
        .at
        .with_timezone(&time::local_offset())
        .format("%Y-%m-%d %H:%M");

    match ev.action {
        EventAction::In => {
            open_in.insert(ev.employee_id.clone(), ev.at);
            format!("{stamp}  {display}  IN")
        }
        EventAction::Out => match open_in.remove(&ev.employee_id) {
            Some(t0) => match format_duration((ev.at - t0).num_seconds()) {
                Some(dur) => format!("{stamp}  {display}  OUT  ({dur})"),
                None => format!("{stamp}  {display}  OUT"),
            },
            None => format!("{stamp}  {display}  OUT"),
        },
        EventAction::Error => {
            open_in.remove(&ev.employee_id);
            match ev.error_code.as_deref().filter(|c| !c.trim().is_empty()) {
                Some(code) => format!("{stamp}  {display}  ERROR  {code}"),
                None => format!("{stamp}  {display}  ERROR"),
            }
        }
    }
}

/// `XhYYm` shift duration; `None` for a negative span
fn format_duration(secs: i64) -> Option<String> {
    if secs < 0 {
        return None;
    }
    let mins = secs / 60;
    Some(format!("{}h{:02}m", mins / 60, mins % 60))
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

#[cfg(test)]
mod tests {
    use super::*;
    use kintai_common::time::parse_iso;

    fn ev(at: &str, employee: &str, action: EventAction, code: Option<&str>) -> AttendanceEvent {
        AttendanceEvent::new(parse_iso(at).unwrap(), "CARD1", employee, action, code)
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0).as_deref(), Some("0h00m"));
        assert_eq!(format_duration(9 * 3600 + 5 * 60).as_deref(), Some("9h05m"));
        assert_eq!(format_duration(-60), None);
    }

    #[test]
    fn test_render_in_then_out_with_duration() {
        let mut open_in = HashMap::new();
        let line = render_event(
            &ev("2025-04-01T09:00:00+09:00", "alice", EventAction::In, None),
            "Alice",
            &mut open_in,
        );
        assert_eq!(line, "2025-04-01 09:00  Alice  IN");

        let line = render_event(
            &ev("2025-04-01T17:30:00+09:00", "alice", EventAction::Out, None),
            "Alice",
            &mut open_in,
        );
        assert_eq!(line, "2025-04-01 17:30  Alice  OUT  (8h30m)");
        assert!(open_in.is_empty());
    }

    #[test]
    fn test_render_out_without_open_entry() {
        let mut open_in = HashMap::new();
        let line = render_event(
            &ev("2025-04-01T17:30:00+09:00", "alice", EventAction::Out, None),
            "Alice",
            &mut open_in,
        );
        assert_eq!(line, "2025-04-01 17:30  Alice  OUT");
    }

    #[test]
    fn test_render_error_includes_code_and_clears_entry() {
        let mut open_in = HashMap::new();
        render_event(
            &ev("2025-04-01T22:00:00+09:00", "alice", EventAction::In, None),
            "Alice",
            &mut open_in,
        );
        let line = render_event(
            &ev(
                "2025-04-02T00:30:00+09:00",
                "alice",
                EventAction::Error,
                Some("day_rollover"),
            ),
            "Alice",
            &mut open_in,
        );
        assert_eq!(line, "2025-04-02 00:30  Alice  ERROR  day_rollover");
        assert!(open_in.is_empty());
    }

    #[test]
    fn test_restore_open_in() {
        let events = vec![
            ev("2025-04-01T09:00:00+09:00", "alice", EventAction::In, None),
            ev("2025-04-01T09:30:00+09:00", "bob", EventAction::In, None),
            ev("2025-04-01T17:00:00+09:00", "alice", EventAction::Out, None),
        ];
        let open_in = restore_open_in(&events);
        assert_eq!(open_in.len(), 1);
        assert!(open_in.contains_key("bob"));
    }
}
