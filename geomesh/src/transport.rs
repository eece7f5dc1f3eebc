//! The datagram transport surface consumed by the mesh node.

use std::io;

use localtime::LocalDuration;

/// Callback invoked with each received datagram.
pub type Receiver = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked when a periodic timer fires.
pub type TimerCallback = Box<dyn Fn(TimerId) + Send + Sync>;

/// Identifier returned by [`Transport::add_timer`].
pub type TimerId = usize;

/// A lossy datagram transport.
///
/// Implementations are fire-and-forget: no delivery guarantee, no
/// ordering across peers, no backpressure. They must be thread safe, and
/// must not hold internal locks while dispatching callbacks, since
/// callbacks re-enter the transport to transmit and reconcile
/// connections.
pub trait Transport: Send + Sync {
    /// The local endpoint address.
    fn address(&self) -> &str;

    /// Start transmitting to `address`. Idempotent; returns whether the
    /// address was newly connected.
    fn connect(&self, address: &str) -> io::Result<bool>;

    /// Stop transmitting to `address`. Idempotent; returns whether the
    /// address was connected. Implementations must keep this symmetric
    /// with [`Transport::connect`], or echo suppression will leak
    /// connections.
    fn disconnect(&self, address: &str) -> io::Result<bool>;

    /// Enqueue one datagram to every connected address in `group`.
    fn transmit(&self, buffer: &[u8], group: &str) -> io::Result<()>;

    /// Register a callback for datagrams received in `group`.
    fn add_receiver(&self, receiver: Receiver, group: &str) -> io::Result<()>;

    /// Schedule a periodic callback.
    fn add_timer(&self, interval: LocalDuration, callback: TimerCallback) -> io::Result<TimerId>;

    /// Run due timers and drain queued datagrams into the receivers,
    /// waiting up to `timeout`. Returns the number of datagrams
    /// dispatched.
    fn poll(&self, timeout: LocalDuration) -> io::Result<usize>;
}
