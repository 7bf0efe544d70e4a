//! Employee profile lookup
//!
//! Profiles live as flat `KEY=VALUE` env files under
//! `<root>/config/employees/<employee_id>.env` with the keys `NAME`,
//! `HOURLY_YEN` and `ROUND_UNIT_MINUTES`. A missing or malformed file
//! yields the defaults, never an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Profile values consumed by the payroll aggregator and the notifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmployeeProfile {
    /// Human-readable name, empty when unconfigured
    pub display_name: String,
    /// Hourly rate in yen, 0 when unconfigured
    pub hourly_rate: i64,
    /// Rounding unit in minutes, 5 when unconfigured
    pub rounding_unit_minutes: i64,
}

impl Default for EmployeeProfile {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            hourly_rate: 0,
            rounding_unit_minutes: 5,
        }
    }
}

/// Source of employee profiles
pub trait EmployeeDirectory {
    /// Profile for an employee; defaults when nothing is configured
    fn lookup(&self, employee_id: &str) -> EmployeeProfile;
}

/// In-memory directory, used by tests and tooling
impl EmployeeDirectory for HashMap<String, EmployeeProfile> {
    fn lookup(&self, employee_id: &str) -> EmployeeProfile {
        self.get(employee_id).cloned().unwrap_or_default()
    }
}

/// Directory backed by per-employee env files, with a per-process cache
pub struct EnvFileDirectory {
    employees_dir: PathBuf,
    cache: Mutex<HashMap<String, EmployeeProfile>>,
}

impl EnvFileDirectory {
    pub fn new(root: &Path) -> Self {
        Self {
            employees_dir: root.join("config").join("employees"),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn load(&self, employee_id: &str) -> EmployeeProfile {
        let path = self.employees_dir.join(format!("{employee_id}.env"));
        let vars = match std::fs::read_to_string(&path) {
            Ok(text) => parse_env_text(&text),
            Err(_) => return EmployeeProfile::default(),
        };
        let defaults = EmployeeProfile::default();
        EmployeeProfile {
            display_name: vars.get("NAME").cloned().unwrap_or_default(),
            hourly_rate: int_var(&vars, "HOURLY_YEN", defaults.hourly_rate),
            rounding_unit_minutes: int_var(
                &vars,
                "ROUND_UNIT_MINUTES",
                defaults.rounding_unit_minutes,
            ),
        }
    }
}

impl EmployeeDirectory for EnvFileDirectory {
    fn lookup(&self, employee_id: &str) -> EmployeeProfile {
        let mut cache = self.cache.lock().expect("employee cache lock");
        if let Some(profile) = cache.get(employee_id) {
            return profile.clone();
        }
        let profile = self.load(employee_id);
        cache.insert(employee_id.to_string(), profile.clone());
        profile
    }
}

fn parse_env_text(text: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if !key.is_empty() {
            vars.insert(key.to_string(), value.trim().to_string());
        }
    }
    vars
}

fn int_var(vars: &HashMap<String, String>, key: &str, default: i64) -> i64 {
    vars.get(key)
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}
