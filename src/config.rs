//! Socket and loop configuration
//!
//! This module provides the tuning knobs applied when a handle binds its
//! native socket: TCP_NODELAY, kernel buffer sizes, multicast scoping, and
//! the event-batch capacity of the loop itself. All parameters have sensible
//! defaults; presets cover the two common profiles.
//!
//! # Examples
//!
//! ```rust,no_run
//! use meridian_sockets::{EventLoop, NetConfig};
//!
//! // Default profile
//! let lp = EventLoop::new()?;
//!
//! // Latency-sensitive profile
//! let lp = EventLoop::with_config(NetConfig::low_latency())?;
//! # Ok::<(), std::io::Error>(())
//! ```

use crate::raw;
use std::io;

/// How an armed read or receive behaves after delivering data.
///
/// The transport exposes one read implementation; this value selects between
/// the re-arming and the fire-once contract.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Stay armed and keep delivering until `stop_read`/`stop_receive`
    /// or `close`.
    Continuous,
    /// Deliver once, then disarm; the caller re-issues to continue.
    Oneshot,
}

/// Configuration for sockets bound through one event loop.
///
/// Platform-specific options are ignored on unsupported platforms. `None`
/// leaves the system default in place.
#[derive(Clone, Debug, PartialEq)]
pub struct NetConfig {
    /// Enable TCP_NODELAY on connected and accepted stream sockets.
    ///
    /// **Default**: `true`
    pub tcp_nodelay: bool,

    /// Socket receive buffer size in bytes.
    ///
    /// **Default**: `None` (system default)
    pub recv_buf: Option<usize>,

    /// Socket send buffer size in bytes.
    ///
    /// **Default**: `None` (system default)
    pub send_buf: Option<usize>,

    /// Time-to-live for outgoing multicast datagrams.
    ///
    /// **Default**: `None` (system default, typically 1)
    pub multicast_ttl: Option<u32>,

    /// Whether multicast sends loop back to the local host.
    ///
    /// **Default**: `None` (system default)
    pub multicast_loop: Option<bool>,

    /// Capacity of the loop's readiness-event batch.
    ///
    /// **Default**: `1024`
    pub events_capacity: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            recv_buf: None,
            send_buf: None,
            multicast_ttl: None,
            multicast_loop: None,
            events_capacity: 1024,
        }
    }
}

impl NetConfig {
    /// Profile for latency-sensitive traffic: immediate sends, small
    /// kernel buffers to minimize queuing delay.
    pub fn low_latency() -> Self {
        Self {
            tcp_nodelay: true,
            recv_buf: Some(256 * 1024),
            send_buf: Some(256 * 1024),
            multicast_ttl: None,
            multicast_loop: None,
            events_capacity: 4096,
        }
    }

    /// Profile for bulk transfers: Nagle left on, large kernel buffers.
    pub fn high_throughput() -> Self {
        Self {
            tcp_nodelay: false,
            recv_buf: Some(4 << 20),
            send_buf: Some(4 << 20),
            multicast_ttl: None,
            multicast_loop: None,
            events_capacity: 1024,
        }
    }
}

/// Applies stream-socket options to a native socket.
pub(crate) fn apply_stream(os: raw::OsSocket, cfg: &NetConfig) -> io::Result<()> {
    if let Some(sz) = cfg.recv_buf {
        raw::set_recv_buffer(os, sz as i32)?;
    }
    if let Some(sz) = cfg.send_buf {
        raw::set_send_buffer(os, sz as i32)?;
    }
    if cfg.tcp_nodelay {
        raw::set_tcp_nodelay(os, true)?;
    }
    Ok(())
}

/// Applies datagram-socket options to a native socket.
pub(crate) fn apply_datagram(os: raw::OsSocket, cfg: &NetConfig) -> io::Result<()> {
    if let Some(sz) = cfg.recv_buf {
        raw::set_recv_buffer(os, sz as i32)?;
    }
    if let Some(sz) = cfg.send_buf {
        raw::set_send_buffer(os, sz as i32)?;
    }
    if let Some(ttl) = cfg.multicast_ttl {
        raw::set_multicast_ttl(os, ttl)?;
    }
    if let Some(on) = cfg.multicast_loop {
        raw::set_multicast_loop(os, on)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetConfig::default();
        assert_eq!(config.tcp_nodelay, true);
        assert_eq!(config.recv_buf, None);
        assert_eq!(config.events_capacity, 1024);
    }

    #[test]
    fn test_low_latency_config() {
        let config = NetConfig::low_latency();
        assert_eq!(config.recv_buf, Some(256 * 1024));
        assert_eq!(config.send_buf, Some(256 * 1024));
        assert_eq!(config.tcp_nodelay, true);
    }

    #[test]
    fn test_high_throughput_config() {
        let config = NetConfig::high_throughput();
        assert_eq!(config.recv_buf, Some(4 << 20));
        assert_eq!(config.tcp_nodelay, false);
    }

    #[test]
    fn test_config_clone() {
        let config1 = NetConfig::low_latency();
        let config2 = config1.clone();
        assert_eq!(config1, config2);
    }
}
