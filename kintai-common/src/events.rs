//! Shared record types for the attendance pipeline
//!
//! These are the wire/log shapes: one compact JSON object per event log
//! line, and the payroll record submitted downstream. Events are immutable
//! once created; payroll records are recomputed wholesale on every run.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Employee id used when a card uid has no mapping
pub const UNKNOWN_EMPLOYEE: &str = "unknown";

/// Attendance action recorded for a card presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    /// Card holder entered
    #[serde(rename = "IN")]
    In,
    /// Card holder left
    #[serde(rename = "OUT")]
    Out,
    /// Stale presence closed by the engine (see `error_code`)
    #[serde(rename = "ERROR")]
    Error,
}

/// One attendance event, one line of the append-only event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    /// Opaque unique id (v4 UUID, simple hex)
    pub id: String,
    /// Event timestamp, fixed local offset, second precision
    pub at: DateTime<FixedOffset>,
    /// Card uid as reported by the reader
    pub card_id: String,
    /// Resolved employee id, or `"unknown"`
    pub employee_id: String,
    /// IN / OUT / ERROR
    pub action: EventAction,
    /// Present iff `action == Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl AttendanceEvent {
    /// Build a new event with a fresh id
    pub fn new(
        at: DateTime<FixedOffset>,
        card_id: &str,
        employee_id: &str,
        action: EventAction,
        error_code: Option<&str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            at,
            card_id: card_id.to_string(),
            employee_id: employee_id.to_string(),
            action,
            error_code: match action {
                EventAction::Error => error_code.map(str::to_string),
                _ => None,
            },
        }
    }
}

/// One payroll row: one employee, one local calendar date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayrollRecord {
    /// Deterministic id, a function of `(date, employee_id)` only
    pub id: String,
    /// Local calendar date, `YYYY-MM-DD`
    pub date: String,
    /// Employee id
    pub employee_id: String,
    /// Display name from the employee profile (may be empty)
    pub display_name: String,
    /// Paired minutes before rounding
    pub minutes_raw: i64,
    /// Minutes rounded down to the employee's rounding unit
    pub minutes_rounded: i64,
    /// Hourly rate in yen
    pub hourly_rate: i64,
    /// Pay in yen, floor(minutes_rounded * hourly_rate / 60)
    pub pay: i64,
    /// Sorted anomaly flags, empty when the day was clean
    pub flags: Vec<String>,
}

/// Deterministic payroll record id for `(date, employee_id)`
///
/// Recomputation for the same pair always yields the same id, so the
/// downstream sink can upsert idempotently.
pub fn payroll_record_id(date: &str, employee_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(date.as_bytes());
    hasher.update(b"|");
    hasher.update(employee_id.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Aggregation totals reported after a payroll run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayrollSummary {
    /// Total input events handed to the aggregator
    pub events: usize,
    /// Events dropped because the employee was unknown
    pub events_unknown_employee: usize,
    /// Emitted payroll records
    pub buckets: usize,
    /// Emitted records carrying at least one flag
    pub flagged_buckets: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_iso;

    #[test]
    fn test_event_encoding_omits_error_code_for_in_out() {
        let at = parse_iso("2025-04-01T09:00:00+09:00").unwrap();
        let ev = AttendanceEvent::new(at, "04A1B2", "alice", EventAction::In, None);
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"action\":\"IN\""));
        assert!(json.contains("\"at\":\"2025-04-01T09:00:00+09:00\""));
        assert!(!json.contains("error_code"));
    }

    #[test]
    fn test_event_encoding_keeps_error_code_for_error() {
        let at = parse_iso("2025-04-01T09:00:00+09:00").unwrap();
        let ev = AttendanceEvent::new(at, "04A1B2", "alice", EventAction::Error, Some("day_rollover"));
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"action\":\"ERROR\""));
        assert!(json.contains("\"error_code\":\"day_rollover\""));

        let back: AttendanceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_error_code_dropped_for_non_error_action() {
        let at = parse_iso("2025-04-01T09:00:00+09:00").unwrap();
        let ev = AttendanceEvent::new(at, "04A1B2", "alice", EventAction::Out, Some("stray"));
        assert_eq!(ev.error_code, None);
    }

    #[test]
    fn test_payroll_record_id_is_deterministic() {
        let a = payroll_record_id("2025-04-01", "alice");
        let b = payroll_record_id("2025-04-01", "alice");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_payroll_record_id_varies_by_date_and_employee() {
        let base = payroll_record_id("2025-04-01", "alice");
        assert_ne!(base, payroll_record_id("2025-04-02", "alice"));
        assert_ne!(base, payroll_record_id("2025-04-01", "bob"));
    }
}
