//! Generation counter for auto-save requests

/// Monotonically increasing id of the latest auto-save request.
///
/// Each trigger bumps the session's generation and hands the new value to
/// its timer; a timer whose captured generation is no longer current has
/// been superseded and must not write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    pub fn new() -> Self {
        Self(0)
    }

    /// Increment and return the next generation
    pub fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
