use std::fmt;

/// Connection lifecycle states, ordered by rank.
///
/// Transitions only move forward, except between `Active` and `Holding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    NotInitialized,
    NotValidated,
    Active,
    Holding,
    Closing,
    ClosingPending,
    Closed,
    Finished,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::NotInitialized => "not-initialized",
            State::NotValidated => "not-validated",
            State::Active => "active",
            State::Holding => "holding",
            State::Closing => "closing",
            State::ClosingPending => "closing-pending",
            State::Closed => "closed",
            State::Finished => "finished",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
