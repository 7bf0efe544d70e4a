//! # Kintai Common Library
//!
//! Shared code for the kintai attendance suite including:
//! - Attendance event and payroll record types
//! - Presence state machine (debounce, day rollover, stale timeout, replay)
//! - Payroll aggregation
//! - Month-partitioned JSON-lines event log
//! - Employee profile lookup
//! - JST timestamp utilities
//! - Configuration loading

pub mod config;
pub mod employees;
pub mod error;
pub mod events;
pub mod payroll;
pub mod presence;
pub mod store;
pub mod time;

pub use error::{Error, Result};
