//! A deterministic in-memory datagram network.
//!
//! Every transport on a [`Network`] shares one virtual clock; polling a
//! transport advances the clock, fires due timers and drains that
//! transport's inbox, so multi-node tests run the same way every time
//! without sockets.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use localtime::LocalDuration;

use crate::clock::{LocalClock, Timestamp, MSEC};
use crate::transport::{Receiver, TimerCallback, TimerId, Transport};

/// Virtual nanosecond clock shared across a [`Network`].
#[derive(Clone, Default)]
pub struct VirtualClock(Arc<AtomicI64>);

impl VirtualClock {
    pub fn now(&self) -> Timestamp {
        self.0.load(Ordering::Relaxed)
    }

    pub fn advance(&self, ns: Timestamp) {
        self.0.fetch_add(ns, Ordering::Relaxed);
    }

    /// A [`LocalClock`] view for node configs.
    pub fn local_clock(&self) -> LocalClock {
        let clock = self.clone();
        Box::new(move || clock.now())
    }
}

type Inbox = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// The wires between memory transports.
#[derive(Clone, Default)]
pub struct Network {
    inboxes: Arc<Mutex<HashMap<String, Inbox>>>,
    clock: VirtualClock,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    /// Create a transport bound to `address` on this network.
    pub fn transport(&self, address: &str) -> Arc<MemoryTransport> {
        let inbox = Inbox::default();
        self.inboxes
            .lock()
            .unwrap()
            .insert(address.to_owned(), inbox.clone());

        Arc::new(MemoryTransport {
            address: address.to_owned(),
            network: self.clone(),
            inbox,
            connections: Mutex::default(),
            receivers: Mutex::default(),
            timers: Mutex::default(),
        })
    }
}

struct Timer {
    interval: Timestamp,
    due: Timestamp,
    callback: Arc<dyn Fn(TimerId) + Send + Sync>,
}

pub struct MemoryTransport {
    address: String,
    network: Network,
    inbox: Inbox,
    connections: Mutex<BTreeSet<String>>,
    receivers: Mutex<Vec<Arc<dyn Fn(&[u8]) + Send + Sync>>>,
    timers: Mutex<Vec<Timer>>,
}

impl Transport for MemoryTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&self, address: &str) -> io::Result<bool> {
        Ok(self.connections.lock().unwrap().insert(address.to_owned()))
    }

    fn disconnect(&self, address: &str) -> io::Result<bool> {
        Ok(self.connections.lock().unwrap().remove(address))
    }

    fn transmit(&self, buffer: &[u8], _group: &str) -> io::Result<()> {
        let connections = self.connections.lock().unwrap().clone();
        let inboxes = self.network.inboxes.lock().unwrap();
        for address in &connections {
            // Unknown addresses swallow the datagram. The network is lossy.
            if let Some(inbox) = inboxes.get(address) {
                inbox.lock().unwrap().push_back(buffer.to_vec());
            }
        }
        Ok(())
    }

    fn add_receiver(&self, receiver: Receiver, _group: &str) -> io::Result<()> {
        self.receivers.lock().unwrap().push(Arc::from(receiver));
        Ok(())
    }

    fn add_timer(&self, interval: LocalDuration, callback: TimerCallback) -> io::Result<TimerId> {
        let mut timers = self.timers.lock().unwrap();
        let interval = interval.as_millis() as Timestamp * MSEC;
        timers.push(Timer {
            interval,
            due: self.network.clock.now() + interval,
            callback: Arc::from(callback),
        });
        Ok(timers.len() - 1)
    }

    fn poll(&self, timeout: LocalDuration) -> io::Result<usize> {
        self.network.clock.advance(timeout.as_millis() as Timestamp * MSEC);
        let now = self.network.clock.now();

        // Snapshot due timers before firing: callbacks re-enter the
        // transport.
        let due: Vec<(TimerId, Arc<dyn Fn(TimerId) + Send + Sync>)> = {
            let mut timers = self.timers.lock().unwrap();
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

        let mut count = 0;
        loop {
            let Some(buffer) = self.inbox.lock().unwrap().pop_front() else {
                break;
            };
            let receivers = self.receivers.lock().unwrap().clone();
            for receiver in &receivers {
                receiver(&buffer);
            }
            count += 1;
        }
        Ok(count)
    }
}
