//! Payroll aggregation
//!
//! A pure batch function over one month of attendance events. Input order
//! is irrelevant (events are re-sorted by timestamp); no state survives
//! between invocations. Anomalies are never rejected or auto-corrected:
//! every suspicious bucket is surfaced with a flag for human review.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, FixedOffset};

use crate::employees::EmployeeDirectory;
use crate::events::{
    payroll_record_id, AttendanceEvent, EventAction, PayrollRecord, PayrollSummary,
    UNKNOWN_EMPLOYEE,
};
use crate::time::local_date;

/// Anomaly flag: a second IN superseded an open entry
pub const FLAG_DOUBLE_IN: &str = "double_in";
/// Anomaly flag: an OUT with no matching open entry
pub const FLAG_ORPHAN_OUT: &str = "orphan_out";
/// Anomaly flag: an OUT earlier than its IN
pub const FLAG_NEGATIVE_DURATION: &str = "negative_duration";
/// Anomaly flag: the session crossed local midnight
pub const FLAG_CROSS_DAY: &str = "cross_day";
/// Anomaly flag: an open entry never saw its OUT
pub const FLAG_MISSING_OUT: &str = "missing_out";
/// Anomaly flag: the employee has no positive hourly rate configured
pub const FLAG_MISSING_HOURLY_YEN: &str = "missing_hourly_yen";

/// Bucket key: local calendar date then employee id, the output sort order
type BucketKey = (String, String);

/// Derive per-employee-per-day payroll records from one month of events.
///
/// Pairing is employee-scoped but time-global: one employee cannot hold two
/// concurrent open sessions on different cards. Minutes are attributed
/// entirely to the entry day, even when the exit crosses midnight.
pub fn build_daily_records(
    events: &[AttendanceEvent],
    directory: &dyn EmployeeDirectory,
) -> (Vec<PayrollRecord>, PayrollSummary) {
    let mut unknown_employee = 0usize;
    let mut considered: Vec<&AttendanceEvent> = Vec::new();
    for ev in events {
        if ev.employee_id == UNKNOWN_EMPLOYEE {
            unknown_employee += 1;
            continue;
        }
        considered.push(ev);
    }
    considered.sort_by_key(|ev| ev.at);

    let mut open_in: HashMap<String, DateTime<FixedOffset>> = HashMap::new();
    let mut minutes: BTreeMap<BucketKey, i64> = BTreeMap::new();
    let mut flags: BTreeMap<BucketKey, BTreeSet<String>> = BTreeMap::new();

    fn flag(flags: &mut BTreeMap<BucketKey, BTreeSet<String>>, key: BucketKey, name: String) {
        flags.entry(key).or_default().insert(name);
    }

    for ev in &considered {
        let date = local_date(&ev.at).to_string();
        let employee = ev.employee_id.clone();

        match ev.action {
            EventAction::In => {
                if open_in.contains_key(&employee) {
                    // The superseded entry is discarded; no minutes are
                    // ever credited for it.
                    flag(
                        &mut flags,
                        (date.clone(), employee.clone()),
                        FLAG_DOUBLE_IN.to_string(),
                    );
                }
                open_in.insert(employee, ev.at);
            }
            EventAction::Out => {
                let Some(t0) = open_in.remove(&employee) else {
                    flag(&mut flags, (date, employee), FLAG_ORPHAN_OUT.to_string());
                    continue;
                };
                let entry_date = local_date(&t0).to_string();
                let duration_min = (ev.at - t0).num_seconds().div_euclid(60);
                if duration_min < 0 {
                    flag(
                        &mut flags,
                        (entry_date, employee),
                        FLAG_NEGATIVE_DURATION.to_string(),
                    );
                    continue;
                }
                *minutes
                    .entry((entry_date.clone(), employee.clone()))
                    .or_insert(0) += duration_min;
                if entry_date != date {
                    flag(&mut flags, (entry_date, employee), FLAG_CROSS_DAY.to_string());
                }
            }
            EventAction::Error => {
                let code = ev
                    .error_code
                    .as_deref()
                    .filter(|c| !c.is_empty())
                    .unwrap_or("error");
                flag(
                    &mut flags,
                    (date, employee.clone()),
                    format!("error:{code}"),
                );
                if let Some(t0) = open_in.remove(&employee) {
                    flag(
                        &mut flags,
                        (local_date(&t0).to_string(), employee),
                        FLAG_MISSING_OUT.to_string(),
                    );
                }
            }
        }
    }

    // Entries never closed by the end of the month
    for (employee, t0) in &open_in {
        flag(
            &mut flags,
            (local_date(t0).to_string(), employee.clone()),
            FLAG_MISSING_OUT.to_string(),
        );
    }

    let mut keys: BTreeSet<BucketKey> = minutes.keys().cloned().collect();
    keys.extend(flags.keys().cloned());

    let mut records = Vec::new();
    let mut flagged_buckets = 0usize;

    for (date, employee) in keys {
        let key = (date.clone(), employee.clone());
        let minutes_raw = minutes.get(&key).copied().unwrap_or(0);
        let mut bucket_flags = flags.get(&key).cloned().unwrap_or_default();
        if minutes_raw == 0 && bucket_flags.is_empty() {
            continue;
        }

        let profile = directory.lookup(&employee);
        let unit = profile.rounding_unit_minutes.max(1);
        if profile.hourly_rate <= 0 {
            bucket_flags.insert(FLAG_MISSING_HOURLY_YEN.to_string());
        }

        let minutes_rounded = (minutes_raw / unit) * unit;
        let pay = minutes_rounded * profile.hourly_rate / 60;

        if !bucket_flags.is_empty() {
            flagged_buckets += 1;
        }

        records.push(PayrollRecord {
            id: payroll_record_id(&date, &employee),
            date,
            employee_id: employee,
            display_name: profile.display_name,
            minutes_raw,
            minutes_rounded,
            hourly_rate: profile.hourly_rate,
            pay,
            flags: bucket_flags.into_iter().collect(),
        });
    }

    let summary = PayrollSummary {
        events: events.len(),
        events_unknown_employee: unknown_employee,
        buckets: records.len(),
        flagged_buckets,
    };
    (records, summary)
}
