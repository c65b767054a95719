use parking_lot::Mutex;
use tracing::warn;

/// Name of the header carrying a peer's causal stamp.
pub const CLOCK_HEADER: &str = "Lamport-Clock";

/// Lamport logical clock shared by every connection handler.
///
/// All operations take the same lock, so `tick`, `observe` and `read`
/// are linearizable with respect to each other.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: Mutex<u64>,
}

impl LamportClock {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock for a local event. Returns the new value.
    pub fn tick(&self) -> u64 {
        let mut value = self.value.lock();
        *value = value.saturating_add(1);
        *value
    }

    /// Fold a peer stamp into the clock: `max(local, peer) + 1`.
    pub fn observe(&self, peer: u64) -> u64 {
        let mut value = self.value.lock();
        *value = (*value).max(peer).saturating_add(1);
        *value
    }

    /// Fold a raw header value into the clock.
    ///
    /// A missing or unparsable stamp counts as zero, which degrades to a
    /// plain tick.
    pub fn observe_header(&self, raw: Option<&str>) -> u64 {
        let peer = match raw.map(str::trim) {
            None => 0,
            Some(raw) => raw.parse::<u64>().unwrap_or_else(|e| {
                warn!(value = raw, error = %e, "ignoring malformed Lamport-Clock stamp");
                0
            }),
        };

        self.observe(peer)
    }

    /// Current clock value.
    pub fn read(&self) -> u64 {
        *self.value.lock()
    }
}
