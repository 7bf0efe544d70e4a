//! Presence state machine
//!
//! Turns a stream of (card id, timestamp, resolved employee) taps into
//! IN/OUT/ERROR attendance events. Owns all per-card state; the daemon
//! wraps one `PresenceState` in a single lock shared by the tap loop and
//! the periodic sweep task.
//!
//! The full state is reconstructible from one month of persisted events
//! via [`PresenceState::restore`], so nothing here is persisted on its own.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset, NaiveDate};

use crate::events::{AttendanceEvent, EventAction, UNKNOWN_EMPLOYEE};
use crate::time::local_date;

/// Repeated taps within this window of the last accepted tap are ignored
pub const DEBOUNCE_SECS: i64 = 5 * 60;

/// A card left inside longer than this is closed with an ERROR event
pub const STALE_TIMEOUT_SECS: i64 = 15 * 3600;

/// Error code: presence spanned a local-midnight boundary
pub const ERROR_DAY_ROLLOVER: &str = "day_rollover";

/// Error code: presence exceeded the 15 hour timeout
pub const ERROR_TIMEOUT_15H: &str = "timeout_15h";

/// Presence of a single card
#[derive(Debug, Clone, PartialEq)]
pub struct CardPresence {
    /// Whether the card is currently considered checked in
    pub inside: bool,
    /// Last presence-relevant timestamp for this card
    pub last_seen: DateTime<FixedOffset>,
    /// Employee currently bound to this card (`"unknown"` until mapped)
    pub employee: String,
}

/// All per-card state owned by the presence engine
#[derive(Debug, Default)]
pub struct PresenceState {
    cards: HashMap<String, CardPresence>,
    /// Timestamp of the last *accepted* tap per card; debounce anchor only
    last_accepted: HashMap<String, DateTime<FixedOffset>>,
    /// Cards that already completed an OUT on the given local date
    done_day: HashMap<String, NaiveDate>,
}

impl PresenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presence record for a card, if the card has ever been seen
    pub fn card(&self, card_id: &str) -> Option<&CardPresence> {
        self.cards.get(card_id)
    }

    /// Apply one tap, returning the events it produced (possibly none).
    ///
    /// Returns zero or one stale-presence ERROR followed by exactly one
    /// IN/OUT event, or an empty vec when the tap was debounced or the
    /// card already finished its cycle today.
    pub fn on_tap(
        &mut self,
        now: DateTime<FixedOffset>,
        card_id: &str,
        employee_id: &str,
    ) -> Vec<AttendanceEvent> {
        // Debounce against the last accepted tap. The marker is not
        // advanced here, so repeated taps never push the window forward.
        if let Some(last) = self.last_accepted.get(card_id) {
            if (now - *last).num_seconds() < DEBOUNCE_SECS {
                return Vec::new();
            }
        }
        self.last_accepted.insert(card_id.to_string(), now);

        let today = local_date(&now);
        match self.done_day.get(card_id) {
            // New day: the card becomes usable again
            Some(done) if *done != today => {
                self.done_day.remove(card_id);
            }
            // Already completed an OUT today
            Some(_) => return Vec::new(),
            None => {}
        }

        let card = self
            .cards
            .entry(card_id.to_string())
            .or_insert_with(|| CardPresence {
                inside: false,
                last_seen: now,
                employee: employee_id.to_string(),
            });

        // A known identity always wins over a stale or unknown binding
        if employee_id != UNKNOWN_EMPLOYEE {
            card.employee = employee_id.to_string();
        }

        let mut events = Vec::new();

        // Close an expired or day-spanning presence before toggling, so a
        // card can never silently re-enter across midnight or a timeout.
        if let Some(ev) = stale_event(card, now, card_id) {
            events.push(ev);
        }

        let action = if card.inside {
            EventAction::Out
        } else {
            EventAction::In
        };
        let employee = if employee_id == UNKNOWN_EMPLOYEE {
            card.employee.clone()
        } else {
            employee_id.to_string()
        };
        events.push(AttendanceEvent::new(now, card_id, &employee, action, None));

        card.inside = action == EventAction::In;
        card.last_seen = now;
        card.employee = employee;
        if action == EventAction::Out {
            self.done_day.insert(card_id.to_string(), today);
        }

        events
    }

    /// Close every stale presence, independent of any tap.
    ///
    /// Runs on a fixed period from the sweep task, under the same lock as
    /// [`Self::on_tap`].
    pub fn sweep(&mut self, now: DateTime<FixedOffset>) -> Vec<AttendanceEvent> {
        let mut events = Vec::new();
        for (card_id, card) in self.cards.iter_mut() {
            if let Some(ev) = stale_event(card, now, card_id) {
                events.push(ev);
            }
        }
        events
    }

    /// Rebuild engine state by replaying one month of persisted events in
    /// append order. No events are re-emitted.
    pub fn restore<I>(events: I) -> Self
    where
        I: IntoIterator<Item = AttendanceEvent>,
    {
        let mut state = Self::new();
        for ev in events {
            state.apply_restored(&ev);
        }
        state
    }

    fn apply_restored(&mut self, ev: &AttendanceEvent) {
        let date = local_date(&ev.at);
        self.last_accepted.insert(ev.card_id.clone(), ev.at);

        let card = self
            .cards
            .entry(ev.card_id.clone())
            .or_insert_with(|| CardPresence {
                inside: false,
                last_seen: ev.at,
                employee: ev.employee_id.clone(),
            });
        if card.employee == UNKNOWN_EMPLOYEE && ev.employee_id != UNKNOWN_EMPLOYEE {
            card.employee = ev.employee_id.clone();
        }

        card.last_seen = ev.at;
        match ev.action {
            EventAction::In => {
                card.inside = true;
                if self.done_day.get(&ev.card_id) == Some(&date) {
                    self.done_day.remove(&ev.card_id);
                }
            }
            EventAction::Out => {
                card.inside = false;
                self.done_day.insert(ev.card_id.clone(), date);
            }
            EventAction::Error => {
                card.inside = false;
                if self.done_day.get(&ev.card_id) == Some(&date) {
                    self.done_day.remove(&ev.card_id);
                }
            }
        }
    }
}

/// Shared stale-presence rule for the per-tap check and the sweep.
///
/// Forces the card out (employee preserved, `last_seen` reset to `now`)
/// and returns the ERROR event, or `None` when the presence is still live.
fn stale_event(
    card: &mut CardPresence,
    now: DateTime<FixedOffset>,
    card_id: &str,
) -> Option<AttendanceEvent> {
    if !card.inside {
        return None;
    }
    let code = if local_date(&card.last_seen) != local_date(&now) {
        ERROR_DAY_ROLLOVER
    } else if (now - card.last_seen).num_seconds() > STALE_TIMEOUT_SECS {
        ERROR_TIMEOUT_15H
    } else {
        return None;
    };
    card.inside = false;
    card.last_seen = now;
    Some(AttendanceEvent::new(
        now,
        card_id,
        &card.employee,
        EventAction::Error,
        Some(code),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::parse_iso;
    use chrono::Duration;

    fn ts(s: &str) -> DateTime<FixedOffset> {
        parse_iso(s).unwrap()
    }

    /// Comparable shape of an event, ignoring the random id
    fn shape(ev: &AttendanceEvent) -> (String, String, String, EventAction, Option<String>) {
        (
            ev.at.to_rfc3339(),
            ev.card_id.clone(),
            ev.employee_id.clone(),
            ev.action,
            ev.error_code.clone(),
        )
    }

    #[test]
    fn test_first_tap_is_in() {
        let mut st = PresenceState::new();
        let events = st.on_tap(ts("2025-04-01T09:00:00+09:00"), "CARD1", "alice");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventAction::In);
        assert_eq!(events[0].employee_id, "alice");
        assert_eq!(events[0].error_code, None);
    }

    #[test]
    fn test_debounce_window_anchored_to_accepted_tap() {
        let mut st = PresenceState::new();
        let t0 = ts("2025-04-01T09:00:00+09:00");
        assert_eq!(st.on_tap(t0, "CARD1", "alice").len(), 1);
        // 2 minutes later: inside the window
        assert!(st.on_tap(t0 + Duration::minutes(2), "CARD1", "alice").is_empty());
        // 4 minutes after the *accepted* tap: still inside, because the
        // debounced tap did not advance the window
        assert!(st.on_tap(t0 + Duration::minutes(4), "CARD1", "alice").is_empty());
        // 5 minutes after the accepted tap: accepted again
        assert_eq!(st.on_tap(t0 + Duration::minutes(5), "CARD1", "alice").len(), 1);
    }

    #[test]
    fn test_in_then_out_then_done_for_the_day() {
        let mut st = PresenceState::new();
        let events = st.on_tap(ts("2025-04-01T09:00:00+09:00"), "CARD1", "alice");
        assert_eq!(events[0].action, EventAction::In);
        let events = st.on_tap(ts("2025-04-01T09:10:00+09:00"), "CARD1", "alice");
        assert_eq!(events[0].action, EventAction::Out);
        // Same-day tap after a completed cycle produces nothing
        assert!(st.on_tap(ts("2025-04-01T17:00:00+09:00"), "CARD1", "alice").is_empty());
    }

    #[test]
    fn test_done_marker_clears_on_new_day() {
        let mut st = PresenceState::new();
        st.on_tap(ts("2025-04-01T09:00:00+09:00"), "CARD1", "alice");
        st.on_tap(ts("2025-04-01T17:00:00+09:00"), "CARD1", "alice");
        let events = st.on_tap(ts("2025-04-02T09:00:00+09:00"), "CARD1", "alice");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventAction::In);
    }

    #[test]
    fn test_sweep_day_rollover() {
        let mut st = PresenceState::new();
        st.on_tap(ts("2025-04-01T22:00:00+09:00"), "CARD1", "alice");
        let now = ts("2025-04-02T00:30:00+09:00");
        let events = st.sweep(now);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventAction::Error);
        assert_eq!(events[0].error_code.as_deref(), Some(ERROR_DAY_ROLLOVER));
        assert_eq!(events[0].employee_id, "alice");
        assert!(!st.card("CARD1").unwrap().inside);
        // Already closed: a second sweep is a no-op
        assert!(st.sweep(now + Duration::minutes(1)).is_empty());
    }

    #[test]
    fn test_sweep_timeout_same_day() {
        let mut st = PresenceState::new();
        st.on_tap(ts("2025-04-01T00:30:00+09:00"), "CARD1", "alice");
        let events = st.sweep(ts("2025-04-01T15:31:00+09:00"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_code.as_deref(), Some(ERROR_TIMEOUT_15H));
    }

    #[test]
    fn test_sweep_leaves_live_presence_alone() {
        let mut st = PresenceState::new();
        st.on_tap(ts("2025-04-01T09:00:00+09:00"), "CARD1", "alice");
        assert!(st.sweep(ts("2025-04-01T18:00:00+09:00")).is_empty());
        assert!(st.card("CARD1").unwrap().inside);
    }

    #[test]
    fn test_tap_after_rollover_closes_then_enters() {
        let mut st = PresenceState::new();
        st.on_tap(ts("2025-04-01T22:00:00+09:00"), "CARD1", "alice");
        let events = st.on_tap(ts("2025-04-02T09:00:00+09:00"), "CARD1", "alice");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, EventAction::Error);
        assert_eq!(events[0].error_code.as_deref(), Some(ERROR_DAY_ROLLOVER));
        assert_eq!(events[1].action, EventAction::In);
    }

    #[test]
    fn test_unknown_tap_keeps_bound_employee() {
        let mut st = PresenceState::new();
        st.on_tap(ts("2025-04-01T09:00:00+09:00"), "CARD1", "alice");
        let events = st.on_tap(ts("2025-04-01T12:00:00+09:00"), "CARD1", UNKNOWN_EMPLOYEE);
        assert_eq!(events[0].action, EventAction::Out);
        assert_eq!(events[0].employee_id, "alice");
    }

    #[test]
    fn test_known_identity_rebinds_card() {
        let mut st = PresenceState::new();
        let events = st.on_tap(ts("2025-04-01T09:00:00+09:00"), "CARD1", UNKNOWN_EMPLOYEE);
        assert_eq!(events[0].employee_id, UNKNOWN_EMPLOYEE);
        let events = st.on_tap(ts("2025-04-01T12:00:00+09:00"), "CARD1", "alice");
        assert_eq!(events[0].employee_id, "alice");
        assert_eq!(st.card("CARD1").unwrap().employee, "alice");
    }

    #[test]
    fn test_restore_then_continue_matches_live() {
        let taps = [
            ("2025-04-01T09:00:00+09:00", "CARD1", "alice"),
            ("2025-04-01T09:30:00+09:00", "CARD2", "bob"),
            ("2025-04-01T17:00:00+09:00", "CARD1", "alice"),
            ("2025-04-02T08:45:00+09:00", "CARD1", "alice"),
        ];

        let mut live = PresenceState::new();
        let mut persisted = Vec::new();
        for (at, card, emp) in taps {
            persisted.extend(live.on_tap(ts(at), card, emp));
        }

        let mut restored = PresenceState::restore(persisted.clone());

        // The next live tap must come out identically from both engines
        let next = ts("2025-04-02T09:00:00+09:00");
        let from_live = live.on_tap(next, "CARD2", "bob");
        let from_restored = restored.on_tap(next, "CARD2", "bob");
        assert_eq!(
            from_live.iter().map(shape).collect::<Vec<_>>(),
            from_restored.iter().map(shape).collect::<Vec<_>>()
        );
        assert!(!from_live.is_empty());
    }

    #[test]
    fn test_restore_rebuilds_done_marker() {
        let t_in = ts("2025-04-01T09:00:00+09:00");
        let t_out = ts("2025-04-01T17:00:00+09:00");
        let events = vec![
            AttendanceEvent::new(t_in, "CARD1", "alice", EventAction::In, None),
            AttendanceEvent::new(t_out, "CARD1", "alice", EventAction::Out, None),
        ];
        let mut st = PresenceState::restore(events);
        // Completed cycle restored: a same-day tap stays suppressed
        assert!(st.on_tap(ts("2025-04-01T18:00:00+09:00"), "CARD1", "alice").is_empty());
    }

    #[test]
    fn test_restore_error_clears_same_day_done_marker() {
        let events = vec![
            AttendanceEvent::new(ts("2025-04-01T09:00:00+09:00"), "CARD1", "alice", EventAction::In, None),
            AttendanceEvent::new(ts("2025-04-01T12:00:00+09:00"), "CARD1", "alice", EventAction::Out, None),
            AttendanceEvent::new(
                ts("2025-04-01T12:30:00+09:00"),
                "CARD1",
                "alice",
                EventAction::Error,
                Some(ERROR_TIMEOUT_15H),
            ),
        ];
        let mut st = PresenceState::restore(events);
        let events = st.on_tap(ts("2025-04-01T18:00:00+09:00"), "CARD1", "alice");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, EventAction::In);
    }

    #[test]
    fn test_restore_upgrades_unknown_binding() {
        let events = vec![
            AttendanceEvent::new(ts("2025-04-01T09:00:00+09:00"), "CARD1", UNKNOWN_EMPLOYEE, EventAction::In, None),
            AttendanceEvent::new(ts("2025-04-01T17:00:00+09:00"), "CARD1", "alice", EventAction::Out, None),
        ];
        let st = PresenceState::restore(events);
        assert_eq!(st.card("CARD1").unwrap().employee, "alice");
    }
}
