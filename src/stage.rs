//! Stage Classifier: elapsed inactivity to discrete severity stage, and the
//! transition decision against persisted state (pure, no DB).

use crate::rules::StageDef;

/// Elapsed time since a user's last meaningful activity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Elapsed {
    Days(f64),
    /// No enabled signal source ever returned a value. Classifies into the
    /// highest configured stage, never into "no risk".
    Never,
}

impl Elapsed {
    /// Whole days for template substitution; `None` for the never-active case.
    pub fn whole_days(&self) -> Option<i64> {
        match self {
            Elapsed::Days(d) => Some(*d as i64),
            Elapsed::Never => None,
        }
    }
}

/// Map elapsed inactivity to a stage: the highest stage whose threshold is
/// within the elapsed days, else 0. Monotonic in elapsed days for any fixed
/// threshold list.
pub fn classify(elapsed: Elapsed, stages: &[StageDef]) -> i64 {
    match elapsed {
        Elapsed::Never => stages.len() as i64,
        Elapsed::Days(days) => stages
            .iter()
            .take_while(|s| (s.threshold_days as f64) <= days)
            .count() as i64,
    }
}

/// The decision for a (previous, computed) stage pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Stage increased — the only transition that can trigger dispatch.
    Forward { from: i64, to: i64 },
    /// Stage unchanged — silent no-op, no writes, no audit entry.
    NoChange,
    /// Activity resumed — the single legal decrease, a pure reset to 0 with
    /// no dispatch.
    Recovery { from: i64 },
    /// A partial decrease (0 < new < current). Not a defined transition;
    /// treated as a data/config error to be logged, never applied.
    Invalid { from: i64, to: i64 },
}

pub fn decide(current: i64, new: i64) -> Transition {
    if new > current {
        Transition::Forward {
            from: current,
            to: new,
        }
    } else if new == current {
        Transition::NoChange
    } else if new == 0 {
        Transition::Recovery { from: current }
    } else {
        Transition::Invalid {
            from: current,
            to: new,
        }
    }
}
