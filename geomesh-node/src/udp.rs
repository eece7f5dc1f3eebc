//! UDP datagram transport.
//!
//! One socket, fan-out transmit: a datagram is sent to every connected
//! address, best effort. Polling interleaves timer execution with socket
//! drains until the timeout elapses. Groups are accepted and ignored;
//! UDP gives us a single datagram domain.

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use localtime::LocalDuration;
use socket2::{Domain, Protocol, Socket, Type};

use geomesh::transport::{Receiver, TimerCallback, TimerId, Transport};

pub const SCHEME: &str = "udp://";

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 65_535;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn resolve(address: &str) -> io::Result<SocketAddr> {
    let address = address.strip_prefix(SCHEME).unwrap_or(address);
    address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("cannot resolve `{address}`"),
        )
    })
}

struct Timer {
    interval: Duration,
    due: Instant,
    callback: Arc<dyn Fn(TimerId) + Send + Sync>,
}

pub struct UdpTransport {
    address: String,
    socket: UdpSocket,
    connections: Mutex<BTreeMap<String, SocketAddr>>,
    receivers: Mutex<Vec<Arc<dyn Fn(&[u8]) + Send + Sync>>>,
    timers: Mutex<Vec<Timer>>,
}

impl UdpTransport {
    /// Bind a transport to `address`, eg. `udp://0.0.0.0:11511`.
    pub fn bind(address: &str) -> io::Result<Self> {
        let bind_addr = resolve(address)?;
        let socket = Socket::new(
            Domain::for_address(bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;

        Ok(Self {
            address: address.to_owned(),
            socket: socket.into(),
            connections: Mutex::default(),
            receivers: Mutex::default(),
            timers: Mutex::default(),
        })
    }
}

impl Transport for UdpTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&self, address: &str) -> io::Result<bool> {
        let resolved = resolve(address)?;
        Ok(lock(&self.connections)
            .insert(address.to_owned(), resolved)
            .is_none())
    }

    fn disconnect(&self, address: &str) -> io::Result<bool> {
        Ok(lock(&self.connections).remove(address).is_some())
    }

    fn transmit(&self, buffer: &[u8], _group: &str) -> io::Result<()> {
        let connections = lock(&self.connections).clone();
        for (address, resolved) in &connections {
            // Fire and forget; an unreachable peer is not our problem.
            if let Err(e) = self.socket.send_to(buffer, resolved) {
                log::trace!(target: "transport", "send to {address} failed: {e}");
            }
        }
        Ok(())
    }

    fn add_receiver(&self, receiver: Receiver, _group: &str) -> io::Result<()> {
        lock(&self.receivers).push(Arc::from(receiver));
        Ok(())
    }

    fn add_timer(&self, interval: LocalDuration, callback: TimerCallback) -> io::Result<TimerId> {
        let mut timers = lock(&self.timers);
        let interval = Duration::from_millis(interval.as_millis() as u64);
        timers.push(Timer {
            interval,
            due: Instant::now() + interval,
            callback: Arc::from(callback),
        });
        Ok(timers.len() - 1)
    }

    fn poll(&self, timeout: LocalDuration) -> io::Result<usize> {
        let deadline = Instant::now() + Duration::from_millis(timeout.as_millis() as u64);
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let mut count = 0;

        loop {
            let now = Instant::now();
            // Snapshot due timers before firing: callbacks re-enter the
            // transport.
            let due: Vec<(TimerId, Arc<dyn Fn(TimerId) + Send + Sync>)> = {
                let mut timers = lock(&self.timers);
                let mut due = Vec::new();
                for (id, timer) in timers.iter_mut().enumerate() {
                    if timer.due <= now {
                        timer.due = now + timer.interval;
                        due.push((id, timer.callback.clone()));
                    }
                }
                due
            };
            for (id, callback) in due {
                callback(id);
            }

            let now = Instant::now();
            let next_due = lock(&self.timers).iter().map(|t| t.due).min();
            let mut wait = deadline.saturating_duration_since(now);
            if let Some(next_due) = next_due {
                wait = wait.min(next_due.saturating_duration_since(now));
            }
            if wait.is_zero() {
                if Instant::now() >= deadline {
                    break;
                }
                continue;
            }
            self.socket.set_read_timeout(Some(wait))?;
            match self.socket.recv_from(&mut buffer) {
                Ok((len, _)) => {
                    let receivers = lock(&self.receivers).clone();
                    for receiver in &receivers {
                        receiver(&buffer[..len]);
                    }
                    count += 1;
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        Ok(count)
    }
}
