#![deny(unsafe_op_in_unsafe_fn)]

//! Callback-driven single-threaded network reactor.
//!
//! One [`EventLoop`] wraps the OS readiness poller. The handles bound to it
//! ([`TcpSocket`], [`TcpAcceptor`], [`UdpSocket`], [`DeadlineTimer`],
//! [`AsyncRequest`]) issue asynchronous operations and receive completion
//! callbacks synchronously on the loop thread. Issuing never blocks; closing
//! a handle completes asynchronously through a final close callback, after
//! which the handle may be opened again.
//!
//! The loop and its handles are deliberately `!Send`: exactly one thread
//! runs [`EventLoop::run`] and every callback. The only cross-thread entry
//! points are [`LoopProxy`] (posted callbacks) and [`AsyncSignal`] (handle
//! wakes), both backed by the poller's wake primitive.
//!
//! ```rust,no_run
//! use meridian_sockets::{DeadlineTimer, EventLoop, RunMode};
//! use std::time::Duration;
//!
//! let lp = EventLoop::new()?;
//! let timer = DeadlineTimer::new(&lp);
//! let t = timer.clone();
//! timer.start_wait(Duration::from_millis(100), None, move || {
//!     println!("fired");
//!     t.close(|| {});
//! });
//! lp.run(RunMode::Default)?;
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod async_request;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event_loop;
mod handle;
pub mod raw; // OS-level socket helpers (Unix/Windows)
pub mod tcp;
pub mod timer;
pub mod udp;

/// Owned byte storage submitted to scatter/gather operations.
///
/// Submission moves the buffers into the pending operation; the completion
/// handler receives the same buffers back, so backing storage cannot be
/// released while the operation is in flight.
pub type Buffer = Vec<u8>;

/// Convenience re-exports
pub use async_request::{AsyncRequest, AsyncSignal};
pub use config::{NetConfig, ReadPolicy};
pub use endpoint::Endpoint;
pub use error::ErrorCode;
pub use event_loop::{EventLoop, LoopProxy, RunMode};
pub use tcp::{TcpAcceptor, TcpSocket};
pub use timer::DeadlineTimer;
pub use udp::UdpSocket;
