use chrono::{DateTime, Utc};

/// Operating state persisted per machine per local day.
///
/// `Idle` exists in the stored schema but is never produced by the
/// evaluator; it is kept so historical rows and external writers remain
/// readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Running,
    Idle,
    Down,
}

impl MachineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Idle => "IDLE",
            Self::Down => "DOWN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "RUNNING" => Some(Self::Running),
            "IDLE" => Some(Self::Idle),
            "DOWN" => Some(Self::Down),
            _ => None,
        }
    }
}

/// State carried from the previously persisted status row. `down_since`
/// anchors an in-progress grace period; `status` is what the ledger
/// dispatch compares against.
#[derive(Debug, Clone, Copy)]
pub struct PriorState {
    pub status: MachineState,
    pub down_since: Option<DateTime<Utc>>,
}
