// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Engine configuration.
//!
//! # Example
//!
//! ```
//! use evio::EngineConfig;
//!
//! let config = EngineConfig {
//!     max_handles: 64,
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

/// Default per-handle receive buffer length (5 KiB).
pub const DEFAULT_RECV_BUF_LEN: usize = 5 * 1024;

/// Default bounded wait applied inside the multiplexer loop so the stop
/// flag is observed even when no descriptor becomes ready.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(400);

/// Default bounded wait for a non-blocking connect to resolve.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default TCP listen backlog.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 10;

/// Default number of short retries for a TCP send that reports
/// transient unavailability.
pub const DEFAULT_SEND_RETRIES: u32 = 3;

/// Default cap on cached free blocks per pool size class.
pub const DEFAULT_CACHED_BLOCKS: usize = 20;

/// Engine configuration.
///
/// Every field has a working default; callers typically override only
/// `max_handles`.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Maximum number of simultaneously monitored handles.
    pub max_handles: usize,

    /// Receive buffer length allocated per client/UDP handle.
    ///
    /// Also the back-pressure bound: a full buffer stops further reads on
    /// that handle until the callback consumes data.
    pub recv_buf_len: usize,

    /// Multiplexer wait bound per loop iteration.
    pub poll_timeout: Duration,

    /// Bounded wait for an in-progress non-blocking connect.
    pub connect_timeout: Duration,

    /// Pending-connection queue length for TCP listeners.
    pub listen_backlog: i32,

    /// Retry budget for a TCP send hitting transient unavailability.
    pub send_retries: u32,

    /// Cap on cached free blocks per allocator size class (min 2).
    pub cached_blocks_per_class: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_handles: 128,
            recv_buf_len: DEFAULT_RECV_BUF_LEN,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            send_retries: DEFAULT_SEND_RETRIES,
            cached_blocks_per_class: DEFAULT_CACHED_BLOCKS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.max_handles > 0);
        assert_eq!(cfg.recv_buf_len, 5 * 1024);
        assert_eq!(cfg.poll_timeout, Duration::from_millis(400));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.send_retries, 3);
    }
}
