//! Per-transfer timing knobs.

use core::time::Duration;

/// How long a single receive waits before the packet is sent again.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Number of sends of one packet before a transfer gives up.
pub const MAX_ATTEMPTS: u8 = 5;

/// Retry policy shared by every transfer a server spawns.
///
/// Copied into each transfer, so changing it only affects transfers started afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Receive timeout for one attempt.
    pub timeout: Duration,
    /// Attempts allowed before the transfer times out. Zero behaves like one.
    pub max_attempts: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: TIMEOUT,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}
