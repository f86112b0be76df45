//! Connected/disconnected tracking so a persistently offline sensor logs one
//! line per state change instead of one per poll.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connected,
    Disconnected,
}

/// Starts disconnected: the first successful poll reports `Connected`.
#[derive(Debug, Default)]
pub struct Link {
    available: bool,
}

impl Link {
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Record the outcome of the latest cycle. Returns the transition only
    /// when availability actually flipped.
    pub fn update(&mut self, available: bool) -> Option<Transition> {
        if available == self.available {
            return None;
        }
        self.available = available;
        Some(if available {
            Transition::Connected
        } else {
            Transition::Disconnected
        })
    }
}

/// Run of consecutive failures on a link that reconnects on its own. Only
/// the failure that opens a streak is worth reporting.
#[derive(Debug, Default)]
pub struct Streak {
    failing: bool,
}

impl Streak {
    /// Record a failure. Returns true if it starts a new streak.
    pub fn fail(&mut self) -> bool {
        !std::mem::replace(&mut self.failing, true)
    }

    /// A success ends the current streak.
    pub fn reset(&mut self) {
        self.failing = false;
    }
}
