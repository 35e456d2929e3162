// Quarter boundaries
//
// A cycle spans `duration` seconds split into four equal quarters. Cycle
// c+1 begins exactly one duration after record c started.

use super::types::CycleRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of the cycle state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Quarter {
    NotStarted,
    /// Cycle boundary: commit the previous record
    Q0,
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    pub fn as_index(&self) -> i8 {
        match self {
            Quarter::NotStarted => -1,
            Quarter::Q0 => 0,
            Quarter::Q1 => 1,
            Quarter::Q2 => 2,
            Quarter::Q3 => 3,
            Quarter::Q4 => 4,
        }
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quarter::NotStarted => f.write_str("not-started"),
            other => write!(f, "Q{}", other.as_index()),
        }
    }
}

/// Absolute quarter boundaries of one cycle, in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleTimes {
    pub start_q1: u64,
    pub start_q2: u64,
    pub start_q3: u64,
    pub start_q4: u64,
    pub end: u64,
}

impl CycleTimes {
    pub fn quarter_ms(&self) -> u64 {
        self.start_q2 - self.start_q1
    }

    pub fn start_of(&self, quarter: Quarter) -> Option<u64> {
        match quarter {
            Quarter::Q1 => Some(self.start_q1),
            Quarter::Q2 => Some(self.start_q2),
            Quarter::Q3 => Some(self.start_q3),
            Quarter::Q4 => Some(self.start_q4),
            Quarter::Q0 => Some(self.end),
            Quarter::NotStarted => None,
        }
    }
}

/// Boundaries of the cycle that follows `prev`
pub fn calc_cycle_times(prev: &CycleRecord) -> CycleTimes {
    let duration_ms = prev.duration * 1000;
    let quarter = duration_ms / 4;
    let start_q1 = prev.start * 1000 + duration_ms;

    CycleTimes {
        start_q1,
        start_q2: start_q1 + quarter,
        start_q3: start_q1 + 2 * quarter,
        start_q4: start_q1 + 3 * quarter,
        end: start_q1 + duration_ms,
    }
}
