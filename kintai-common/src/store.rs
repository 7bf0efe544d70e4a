//! Month-partitioned JSON-lines event log
//!
//! Layout under the root folder:
//! - `state/attendance/events/<YYYY-MM>.jsonl` — append-only event log
//! - `state/attendance/payroll/<YYYY-MM>.jsonl` — payroll output, replaced
//!   wholesale on every aggregator run
//!
//! The event log may contain a torn line from a crashed writer, so reads
//! skip anything that does not parse as a complete record.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};

use crate::events::{AttendanceEvent, PayrollRecord};
use crate::time::local_offset;
use crate::Result;

/// Partition key (`YYYY-MM`) of a timestamp's local calendar month
pub fn month_key(at: &DateTime<FixedOffset>) -> String {
    at.with_timezone(&local_offset()).format("%Y-%m").to_string()
}

/// Partition key of the month before `ym`, if `ym` is well-formed
pub fn prev_month_key(ym: &str) -> Option<String> {
    let (year, month) = ym.split_once('-')?;
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    let (year, month) = if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    };
    Some(format!("{year:04}-{month:02}"))
}

/// Event log file for one month partition
pub fn month_events_path(root: &Path, ym: &str) -> PathBuf {
    root.join("state")
        .join("attendance")
        .join("events")
        .join(format!("{ym}.jsonl"))
}

/// Payroll output file for one month partition
pub fn month_payroll_path(root: &Path, ym: &str) -> PathBuf {
    root.join("state")
        .join("attendance")
        .join("payroll")
        .join(format!("{ym}.jsonl"))
}

/// Append one event to the month partition of its own timestamp.
///
/// Appends naturally roll over to a new file when the event's month
/// changes; nothing is ever rewritten.
pub fn append_event(root: &Path, event: &AttendanceEvent) -> Result<()> {
    let path = month_events_path(root, &month_key(&event.at));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    let line = serde_json::to_string(event)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

/// All events of one month partition, in append order.
///
/// A missing partition is an empty month. Blank and unparseable lines are
/// skipped silently.
pub fn read_month_events(root: &Path, ym: &str) -> Result<Vec<AttendanceEvent>> {
    let path = month_events_path(root, ym);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AttendanceEvent>(line) {
            Ok(ev) => events.push(ev),
            Err(e) => {
                // Torn writes from a crashed appender are expected
                tracing::debug!("skipping unparseable event line: {}", e);
            }
        }
    }
    Ok(events)
}

/// Replace the payroll file for one month atomically.
///
/// Writes a temp file in the same directory, fsyncs it, renames it over
/// the target, then fsyncs the directory so the rename is durable.
pub fn replace_payroll(root: &Path, ym: &str, records: &[PayrollRecord]) -> Result<PathBuf> {
    let path = month_payroll_path(root, ym);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("jsonl.tmp.{}", std::process::id()));

    if let Err(e) = write_records(&tmp, records) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, &path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(path)
}

fn write_records(path: &Path, records: &[PayrollRecord]) -> Result<()> {
    let mut file = File::create(path)?;
    for rec in records {
        let line = serde_json::to_string(rec)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventAction;
    use crate::time::parse_iso;

    fn ev(at: &str) -> AttendanceEvent {
        AttendanceEvent::new(parse_iso(at).unwrap(), "CARD1", "alice", EventAction::In, None)
    }

    #[test]
    fn test_month_key_uses_local_calendar() {
        // 23:30 UTC on Mar 31 is already April in JST
        let at = parse_iso("2025-03-31T23:30:00+00:00").unwrap();
        assert_eq!(month_key(&at), "2025-04");
    }

    #[test]
    fn test_prev_month_key() {
        assert_eq!(prev_month_key("2025-04").as_deref(), Some("2025-03"));
        assert_eq!(prev_month_key("2025-01").as_deref(), Some("2024-12"));
        assert_eq!(prev_month_key("garbage"), None);
        assert_eq!(prev_month_key("2025-13"), None);
    }

    #[test]
    fn test_append_then_read_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let first = ev("2025-04-01T09:00:00+09:00");
        let second = ev("2025-04-01T17:00:00+09:00");
        append_event(tmp.path(), &first).unwrap();
        append_event(tmp.path(), &second).unwrap();

        let events = read_month_events(tmp.path(), "2025-04").unwrap();
        assert_eq!(events, vec![first, second]);
    }

    #[test]
    fn test_missing_month_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_month_events(tmp.path(), "2025-04").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let good = ev("2025-04-01T09:00:00+09:00");
        append_event(tmp.path(), &good).unwrap();

        // Simulate a torn write and stray garbage after a crash
        let path = month_events_path(tmp.path(), "2025-04");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"\n{\"id\":\"trunc\n[1,2,3]\nnot json\n").unwrap();

        let events = read_month_events(tmp.path(), "2025-04").unwrap();
        assert_eq!(events, vec![good]);
    }

    #[test]
    fn test_events_partition_by_their_own_month() {
        let tmp = tempfile::tempdir().unwrap();
        append_event(tmp.path(), &ev("2025-04-30T23:59:00+09:00")).unwrap();
        append_event(tmp.path(), &ev("2025-05-01T00:10:00+09:00")).unwrap();

        assert_eq!(read_month_events(tmp.path(), "2025-04").unwrap().len(), 1);
        assert_eq!(read_month_events(tmp.path(), "2025-05").unwrap().len(), 1);
    }

    #[test]
    fn test_replace_payroll_overwrites_wholesale() {
        let tmp = tempfile::tempdir().unwrap();
        let rec = PayrollRecord {
            id: "deadbeef".to_string(),
            date: "2025-04-01".to_string(),
            employee_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            minutes_raw: 540,
            minutes_rounded: 540,
            hourly_rate: 1500,
            pay: 13500,
            flags: vec![],
        };
        let path = replace_payroll(tmp.path(), "2025-04", std::slice::from_ref(&rec)).unwrap();
        let first = fs::read_to_string(&path).unwrap();
        assert_eq!(first.lines().count(), 1);

        // A second run fully replaces the file
        let path = replace_payroll(tmp.path(), "2025-04", &[]).unwrap();
        let second = fs::read_to_string(&path).unwrap();
        assert!(second.is_empty());
    }
}
