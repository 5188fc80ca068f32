use chrono::{DateTime, Duration, Utc};

use super::types::MachineState;

/// Outcome of one evaluation tick for one machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusDecision {
    pub status: MachineState,
    pub down_since: Option<DateTime<Utc>>,
}

/// What the downtime ledger should be told after a tick.
///
/// `Start` is issued for every DOWN tick, not only the first: the ledger's
/// duration bookkeeping is segment-based and each call folds in exactly the
/// delta since the previous call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAction {
    Start,
    End,
    None,
}

/// Hysteresis decision for one machine. The only carried state is the
/// persisted `down_since` anchor; re-running with identical inputs yields
/// an identical decision.
pub fn decide_status(
    prior_down_since: Option<DateTime<Utc>>,
    has_production: bool,
    now: DateTime<Utc>,
    down_threshold: Duration,
) -> StatusDecision {
    if has_production {
        return StatusDecision {
            status: MachineState::Running,
            down_since: None,
        };
    }

    match prior_down_since {
        // First no-production observation: the grace period starts now and
        // the machine is still reported RUNNING.
        None => StatusDecision {
            status: MachineState::Running,
            down_since: Some(now),
        },
        // The anchor outlives the whole stall so the ledger can recover the
        // exact stall start if needed.
        Some(anchor) => {
            let status = if now - anchor >= down_threshold {
                MachineState::Down
            } else {
                MachineState::Running
            };
            StatusDecision {
                status,
                down_since: Some(anchor),
            }
        }
    }
}

/// Dispatch is keyed off the previously *persisted* status, never an
/// in-memory flag, so it stays exactly-once across restarts and repeated
/// ticks.
pub fn ledger_action(prior: Option<MachineState>, next: MachineState) -> LedgerAction {
    let was_down = prior == Some(MachineState::Down);
    let is_down = next == MachineState::Down;
    match (was_down, is_down) {
        (_, true) => LedgerAction::Start,
        (true, false) => LedgerAction::End,
        (false, false) => LedgerAction::None,
    }
}

/// True only on a RUNNING/DOWN edge, used for the tick's transition count.
pub fn is_transition(prior: Option<MachineState>, next: MachineState) -> bool {
    (prior == Some(MachineState::Down)) != (next == MachineState::Down)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn threshold() -> Duration {
        Duration::minutes(10)
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, h, m, s).unwrap()
    }

    #[test]
    fn production_clears_the_anchor_regardless_of_prior_state() {
        let decision = decide_status(Some(at(9, 50, 0)), true, at(10, 0, 0), threshold());
        assert_eq!(decision.status, MachineState::Running);
        assert_eq!(decision.down_since, None);
    }

    #[test]
    fn first_stall_tick_starts_grace_and_stays_running() {
        let now = at(10, 0, 0);
        let decision = decide_status(None, false, now, threshold());
        assert_eq!(decision.status, MachineState::Running);
        assert_eq!(decision.down_since, Some(now));
    }

    #[test]
    fn grace_period_flips_exactly_at_threshold() {
        let anchor = at(10, 0, 0);

        let just_before = decide_status(Some(anchor), false, at(10, 9, 59), threshold());
        assert_eq!(just_before.status, MachineState::Running);
        assert_eq!(just_before.down_since, Some(anchor));

        let at_threshold = decide_status(Some(anchor), false, at(10, 10, 0), threshold());
        assert_eq!(at_threshold.status, MachineState::Down);
        assert_eq!(at_threshold.down_since, Some(anchor));

        let well_after = decide_status(Some(anchor), false, at(11, 30, 0), threshold());
        assert_eq!(well_after.status, MachineState::Down);
        assert_eq!(well_after.down_since, Some(anchor), "anchor never moves during a stall");
    }

    #[test]
    fn re_evaluation_with_identical_inputs_is_idempotent() {
        let anchor = at(10, 0, 0);
        let now = at(10, 12, 0);
        let first = decide_status(Some(anchor), false, now, threshold());
        let second = decide_status(first.down_since, false, now, threshold());
        assert_eq!(first, second);
    }

    #[test]
    fn tick_sequence_matches_worked_example() {
        // No production from 10:00 onward, one tick per minute: RUNNING
        // with a stable anchor until 10:09, DOWN from the 10:10 tick.
        let mut down_since = None;
        for minute in 0..=11u32 {
            let decision = decide_status(down_since, false, at(10, minute, 0), threshold());
            if minute < 10 {
                assert_eq!(decision.status, MachineState::Running, "minute {minute}");
            } else {
                assert_eq!(decision.status, MachineState::Down, "minute {minute}");
            }
            assert_eq!(decision.down_since, Some(at(10, 0, 0)));
            down_since = decision.down_since;
        }
    }

    #[test]
    fn ledger_dispatch_follows_persisted_status_edges() {
        use MachineState::*;
        assert_eq!(ledger_action(Some(Running), Down), LedgerAction::Start);
        assert_eq!(ledger_action(None, Down), LedgerAction::Start);
        assert_eq!(ledger_action(Some(Down), Down), LedgerAction::Start);
        assert_eq!(ledger_action(Some(Down), Running), LedgerAction::End);
        assert_eq!(ledger_action(Some(Running), Running), LedgerAction::None);
        assert_eq!(ledger_action(None, Running), LedgerAction::None);

        assert!(is_transition(Some(Running), Down));
        assert!(is_transition(Some(Down), Running));
        assert!(!is_transition(Some(Down), Down));
        assert!(!is_transition(None, Running));
    }
}
