//! Payroll runner (kintai-pr) - Main entry point
//!
//! Aggregates one month of attendance events into per-employee-per-day
//! payroll records, replaces the month's payroll file wholesale, submits
//! the records to the payroll ingestion sink, and prints one JSON summary
//! to stdout. During the first two days of a month the previous month is
//! re-run as well, so taps landing around the boundary are settled.
//!
//! Record ids are a pure function of (date, employee id), so re-running a
//! month is idempotent on the sink side.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, FixedOffset};
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod sink;

use kintai_common::config::resolve_root_folder;
use kintai_common::employees::EnvFileDirectory;
use kintai_common::payroll::build_daily_records;
use kintai_common::{store, time};
use sink::PayrollSink;

/// Command-line arguments for kintai-pr
#[derive(Parser, Debug)]
#[command(name = "kintai-pr")]
#[command(about = "Payroll aggregation runner for kintai")]
#[command(version)]
struct Args {
    /// Root folder containing config and state
    #[arg(short, long, env = "KINTAI_ROOT")]
    root_folder: Option<PathBuf>,

    /// Month partition to aggregate (YYYY-MM); defaults to the current
    /// month, plus the previous month on the 1st and 2nd
    #[arg(long, env = "KINTAI_MONTH")]
    month: Option<String>,

    /// Payroll sink URL; aggregation stays local when unset
    #[arg(long, env = "KINTAI_PAYROLL_URL")]
    payroll_url: Option<String>,

    /// Auth token sent as X-Auth-Token
    #[arg(long, env = "KINTAI_PAYROLL_TOKEN")]
    payroll_token: Option<String>,

    /// Sink request timeout in seconds
    #[arg(long, default_value = "20", env = "KINTAI_PAYROLL_TIMEOUT_SEC")]
    timeout_sec: u64,

    /// Sink submission attempts
    #[arg(long, default_value = "3", env = "KINTAI_PAYROLL_RETRIES")]
    retries: u32,

    /// Sleep between submission attempts in seconds
    #[arg(long, default_value = "2.0", env = "KINTAI_PAYROLL_RETRY_SLEEP_SEC")]
    retry_sleep_sec: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; stdout is reserved for the summary JSON
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kintai_pr=info,kintai_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let cli_root = args.root_folder.as_ref().and_then(|p| p.to_str());
    let root = resolve_root_folder(cli_root, "KINTAI_ROOT").context("Failed to resolve root folder")?;
    info!("Root folder: {}", root.display());

    let months = match &args.month {
        Some(ym) => vec![ym.clone()],
        None => months_to_run(&time::now()),
    };

    let sink = match args.payroll_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Some(PayrollSink::new(
            url.to_string(),
            args.payroll_token
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            Duration::from_secs(args.timeout_sec),
            args.retries,
            Duration::from_secs_f64(args.retry_sleep_sec.max(0.0)),
        )?),
        _ => None,
    };

    let directory = EnvFileDirectory::new(&root);

    let mut summaries = Vec::new();
    for ym in &months {
        let summary = run_month(&root, ym, &directory, sink.as_ref())
            .await
            .with_context(|| format!("Payroll run failed for {ym}"))?;
        summaries.push(summary);
    }

    if summaries.len() == 1 {
        println!("{}", serde_json::to_string(&summaries[0])?);
    } else {
        println!("{}", serde_json::to_string(&json!({ "months": summaries }))?);
    }
    Ok(())
}

/// The month partitions this invocation settles
fn months_to_run(now: &DateTime<FixedOffset>) -> Vec<String> {
    let current = store::month_key(now);
    let day = now.with_timezone(&time::local_offset()).day();
    if (1..=2).contains(&day) {
        if let Some(prev) = store::prev_month_key(&current) {
            return vec![prev, current];
        }
    }
    vec![current]
}

/// Aggregate, persist, and submit one month; returns the summary object
async fn run_month(
    root: &Path,
    ym: &str,
    directory: &EnvFileDirectory,
    sink: Option<&PayrollSink>,
) -> Result<Value> {
    let events = store::read_month_events(root, ym)
        .with_context(|| format!("Failed to read events for {ym}"))?;
    let (records, summary) = build_daily_records(&events, directory);
    let path = store::replace_payroll(root, ym, &records)
        .with_context(|| format!("Failed to replace payroll file for {ym}"))?;
    info!(
        "Wrote {} payroll records for {ym} to {}",
        records.len(),
        path.display()
    );

    let mut out = serde_json::to_value(&summary)?;
    let obj = out.as_object_mut().expect("summary serializes to an object");
    obj.insert("month".to_string(), json!(ym));
    obj.insert("local_path".to_string(), json!(path.display().to_string()));
    obj.insert("local_records".to_string(), json!(records.len()));

    if let Some(sink) = sink {
        let ack = sink.submit(&records).await?;
        obj.insert("sink".to_string(), ack);
    }
    Ok(out)
}
