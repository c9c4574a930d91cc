//! Byte-level throughput accounting for the active link.

use std::fmt;
use std::time::Instant;

/// Floor applied to elapsed time when deriving rates, so a counter read
/// immediately after a reset never divides by zero.
const RATE_EPSILON_SECS: f64 = 0.001;

/// Cumulative transmit/receive byte counters for the current session
///
/// Counters are reset whenever a new connection attempt begins and on manual
/// disconnect. Rates are derived on read, never stored.
#[derive(Debug, Clone)]
pub struct ThroughputStats {
    tx_bytes: u64,
    rx_bytes: u64,
    started: Instant,
}

impl ThroughputStats {
    /// Create counters starting from zero at the current instant
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx_bytes: 0,
            rx_bytes: 0,
            started: Instant::now(),
        }
    }

    /// Zero both counters and restart the session clock
    pub fn reset(&mut self) {
        self.tx_bytes = 0;
        self.rx_bytes = 0;
        self.started = Instant::now();
    }

    /// Account for `len` transmitted bytes
    pub fn record_tx(&mut self, len: usize) {
        self.tx_bytes = self.tx_bytes.saturating_add(len as u64);
    }

    /// Account for `len` received bytes
    pub fn record_rx(&mut self, len: usize) {
        self.rx_bytes = self.rx_bytes.saturating_add(len as u64);
    }

    /// Total bytes transmitted since the last reset
    #[must_use]
    pub const fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    /// Total bytes received since the last reset
    #[must_use]
    pub const fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    /// Seconds elapsed since the last reset, floored to the rate epsilon
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64().max(RATE_EPSILON_SECS)
    }

    /// Derived transmit rate in bytes per second
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn tx_rate(&self) -> f64 {
        self.tx_bytes as f64 / self.elapsed_secs()
    }

    /// Derived receive rate in bytes per second
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rx_rate(&self) -> f64 {
        self.rx_bytes as f64 / self.elapsed_secs()
    }

    /// Formatted one-line rate summary for presentation
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "tx {} B ({:.1} B/s), rx {} B ({:.1} B/s)",
            self.tx_bytes,
            self.tx_rate(),
            self.rx_bytes,
            self.rx_rate()
        )
    }
}

impl Default for ThroughputStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThroughputStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}
