//! The mesh node: owns the peer tracker, ego sphere, time sync and
//! transport, and glues them into a receive-and-forward pipeline with
//! periodic peer-update and expiry ticks.
//!
//! Scheduling is a single-threaded cooperative loop: the transport's
//! [`Transport::poll`] drains datagrams into the receive handler and runs
//! the timers on the caller's thread. External threads may originate
//! entities through [`MeshNode::update_entities`] and use the read
//! accessors; the peer tracker itself is only driven from the poll
//! thread.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use localtime::LocalDuration;
use log::*;

use crate::clock::{steady_clock, LocalClock, TimeSync};
use crate::events::{Event, Watch};
use crate::message::{Entity, Message, NodeInfo};
use crate::sphere::{self, EgoSphere};
use crate::tracker::{self, PeerTracker, Reject};
use crate::transport::Transport;
use crate::wire;

/// Default period of the peer-selection broadcast.
pub const PEER_UPDATE_INTERVAL: LocalDuration = LocalDuration::from_secs(1);
/// Default period of the entity expiry sweep.
pub const ENTITY_EXPIRY_INTERVAL: LocalDuration = LocalDuration::from_secs(1);
/// Default bound on the serialized size of one outgoing entity batch.
pub const ENTITY_UPDATES_SIZE: usize = 7000;

/// Lock that shrugs off poisoning; a panicked handler must not wedge the
/// poll loop.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Node configuration.
pub struct Config {
    pub peer_update_interval: LocalDuration,
    pub entity_expiry_interval: LocalDuration,
    /// Max serialized bytes per outgoing entity batch before splitting.
    pub entity_updates_size: usize,
    /// Monitor role: forward nothing, advertise address only.
    pub spectator: bool,
    pub ego_sphere: sphere::Config,
    pub peer_tracker: tracker::Config,
    pub transport: Arc<dyn Transport>,
    pub watch: Arc<Watch>,
    /// Local monotonic clock; defaults to a steady clock.
    pub local_clock: Option<LocalClock>,
}

impl Config {
    pub fn new(peer_tracker: tracker::Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            peer_update_interval: PEER_UPDATE_INTERVAL,
            entity_expiry_interval: ENTITY_EXPIRY_INTERVAL,
            entity_updates_size: ENTITY_UPDATES_SIZE,
            spectator: false,
            ego_sphere: sphere::Config::default(),
            peer_tracker,
            transport,
            watch: Arc::new(Watch::new()),
            local_clock: None,
        }
    }
}

/// Fatal construction failure. The constructor refuses to yield a node.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Tracker(#[from] tracker::Error),
    #[error("failed to register receive handler: {0}")]
    AddReceiver(#[source] io::Error),
    #[error("failed to register timer: {0}")]
    AddTimer(#[source] io::Error),
}

pub struct MeshNode {
    peer_tracker: Mutex<PeerTracker>,
    ego_sphere: Mutex<EgoSphere>,
    time_sync: Arc<TimeSync>,
    transport: Arc<dyn Transport>,
    /// Addresses currently connected on the transport. Sorted.
    connected_peers: Mutex<Vec<String>>,
    watch: Arc<Watch>,
    entity_updates_size: usize,
    spectator: bool,
}

impl MeshNode {
    pub fn new(config: Config) -> Result<Arc<Self>, Error> {
        let Config {
            peer_update_interval,
            entity_expiry_interval,
            entity_updates_size,
            spectator,
            ego_sphere,
            peer_tracker,
            transport,
            watch,
            local_clock,
        } = config;

        let time_sync = Arc::new(TimeSync::new(local_clock.unwrap_or_else(steady_clock)));
        {
            let time_sync = time_sync.clone();
            watch.set_clock(Box::new(move || time_sync.now()));
        }
        let peer_tracker = PeerTracker::new(peer_tracker, watch.clone())?;
        let ego_sphere = EgoSphere::new(ego_sphere, watch.clone());
        let address = peer_tracker.node_info().address.clone();

        let node = Arc::new(Self {
            peer_tracker: Mutex::new(peer_tracker),
            ego_sphere: Mutex::new(ego_sphere),
            time_sync,
            transport,
            connected_peers: Mutex::new(Vec::new()),
            watch,
            entity_updates_size,
            spectator,
        });

        // The transport outlives nothing here: callbacks hold weak
        // references so dropping the node tears the cycle down.
        let weak = Arc::downgrade(&node);
        node.transport
            .add_receiver(
                Box::new(move |buffer| {
                    if let Some(node) = weak.upgrade() {
                        node.receive_message(buffer);
                    }
                }),
                "",
            )
            .map_err(Error::AddReceiver)?;

        let weak = Arc::downgrade(&node);
        node.transport
            .add_timer(
                peer_update_interval,
                Box::new(move |_| {
                    if let Some(node) = weak.upgrade() {
                        node.send_peer_updates();
                    }
                }),
            )
            .map_err(Error::AddTimer)?;

        let weak = Arc::downgrade(&node);
        node.transport
            .add_timer(
                entity_expiry_interval,
                Box::new(move |_| {
                    if let Some(node) = weak.upgrade() {
                        node.expire_entities();
                    }
                }),
            )
            .map_err(Error::AddTimer)?;

        node.watch.emit(Event::Initialized, &address);

        Ok(node)
    }

    /// Originate entity state from this node. The entities are wrapped in
    /// a synthetic message from self and pushed through the receive
    /// pipeline, split into batches whose serialized size stays within
    /// the configured datagram budget. Returns the outbound buffers
    /// produced, one per batch.
    ///
    /// Safe to call from outside the poll thread.
    pub fn update_entities(&self, entities: &[Entity]) -> Vec<Vec<u8>> {
        let self_info = lock(&self.peer_tracker).node_info().clone();
        let base = wire::serialize(&Message {
            source: Some(self.advertised(&self_info)),
            ..Message::default()
        })
        .len();

        let mut messages = Vec::new();
        let mut batch: Vec<Entity> = Vec::new();
        let mut size = base;
        for entity in entities {
            let len = wire::serialize(entity).len();
            if !batch.is_empty() && size + len > self.entity_updates_size {
                messages.extend(self.originate(std::mem::take(&mut batch), &self_info));
                size = base;
            }
            batch.push(entity.clone());
            size += len;
        }
        if !batch.is_empty() {
            messages.extend(self.originate(batch, &self_info));
        }
        if !messages.is_empty() {
            self.watch.emit(Event::EntityUpdatesSent, "");
        }
        messages
    }

    /// Wrap one batch into a synthetic message received from self and run
    /// it through the forward path, so origination and relay share one
    /// pipeline. Returns the outbound buffer, if any was produced.
    fn originate(&self, mut entities: Vec<Entity>, self_info: &NodeInfo) -> Option<Vec<u8>> {
        entities.sort_by(|a, b| a.name.cmp(&b.name));
        let msg = Message {
            timestamp: self.time_sync.now(),
            hops: 0,
            source: Some(self.advertised(self_info)),
            peers: vec![],
            entities,
        };
        self.forward_entity_updates(&msg)
    }

    /// Rebase relative expiries onto mesh time, so callers can say
    /// "N from now" without knowing the mesh clock.
    pub fn offset_relative_expiry(&self, entities: &mut [Entity]) {
        let now = self.time_sync.now();
        for entity in entities.iter_mut() {
            entity.expiry += now;
        }
    }

    /// Push a message's entities through the ego sphere and, unless this
    /// node is a spectator or nothing survived, relay them onward with an
    /// incremented hop count. Returns the detached outbound buffer so
    /// callers may queue it outside the lock.
    pub fn forward_entity_updates(&self, msg: &Message) -> Option<Vec<u8>> {
        let (forward, self_info) = {
            let tracker = lock(&self.peer_tracker);
            let connected = lock(&self.connected_peers);
            let mut sphere = lock(&self.ego_sphere);
            let forward =
                sphere.receive_entity_updates(msg, &tracker, &connected, self.time_sync.now());
            (forward, tracker.node_info().clone())
        };
        if self.spectator || forward.is_empty() {
            return None;
        }
        let mut entities = forward;
        entities.sort_by(|a, b| a.name.cmp(&b.name));
        let out = Message {
            // Forwarders preserve the originator's timestamp: it is the
            // dedup key at every hop.
            timestamp: msg.timestamp,
            hops: msg.hops + 1,
            source: Some(self.advertised(&self_info)),
            peers: vec![],
            entities,
        };
        let buffer = wire::serialize(&out);

        // Suppress the trivial back-echo to whoever just sent this:
        // disconnect the source, transmit, reconnect only if we were
        // connected in the first place.
        let source_address = msg
            .source
            .as_ref()
            .map(|s| s.address.as_str())
            .filter(|a| !a.is_empty());
        let reconnect = source_address.is_some_and(|address| {
            self.transport.disconnect(address).unwrap_or_else(|e| {
                warn!(target: "node", "disconnect of {address} failed: {e}");
                false
            })
        });
        if let Err(e) = self.transport.transmit(&buffer, "") {
            warn!(target: "node", "transmit failed: {e}");
        }
        if reconnect {
            if let Some(address) = source_address {
                if let Err(e) = self.transport.connect(address) {
                    warn!(target: "node", "reconnect of {address} failed: {e}");
                }
            }
        }
        self.watch.emit(Event::EntityUpdatesForwarded, "");

        Some(buffer)
    }

    /// Timer tick: broadcast the current neighbor selection and reconcile
    /// the transport's connection set with the new recipient list.
    fn send_peer_updates(&self) {
        let (message, recipients) = {
            let mut tracker = lock(&self.peer_tracker);
            let (selected, recipients) = tracker.update_peer_selections();
            let peers = selected
                .iter()
                .filter_map(|address| tracker.peers().get(address))
                .map(|peer| self.advertised(&peer.node_info))
                .collect();
            let message = Message {
                timestamp: self.time_sync.now(),
                // Peer updates are not forwarded further.
                hops: 1,
                source: Some(self.advertised(tracker.node_info())),
                peers,
                entities: vec![],
            };
            (message, recipients)
        };
        {
            let mut connected = lock(&self.connected_peers);
            for address in connected.iter() {
                if recipients.binary_search(address).is_err() {
                    if let Err(e) = self.transport.disconnect(address) {
                        warn!(target: "node", "disconnect of {address} failed: {e}");
                    }
                }
            }
            for address in &recipients {
                if connected.binary_search(address).is_err() {
                    if let Err(e) = self.transport.connect(address) {
                        warn!(target: "node", "connect to {address} failed: {e}");
                    }
                }
            }
            *connected = recipients;
        }
        let buffer = wire::serialize(&message);
        if let Err(e) = self.transport.transmit(&buffer, "") {
            warn!(target: "node", "transmit failed: {e}");
        }
        self.watch.emit(Event::PeerUpdatesSent, "");
    }

    /// Timer tick: sweep dead entities.
    fn expire_entities(&self) {
        let now = self.time_sync.now();
        let self_info = lock(&self.peer_tracker).node_info().clone();
        lock(&self.ego_sphere).expire(now, Some(&self_info));
    }

    /// Receive-handler entry point: verify the frame, apply the source and
    /// peer updates, then hand any entity payload to the forward path.
    fn receive_message(&self, buffer: &[u8]) {
        let msg: Message = match wire::deserialize(buffer) {
            Ok(msg) => msg,
            Err(e) => {
                self.watch.emit(Event::MessageVerifyFail, &e.to_string());
                return;
            }
        };
        let outcome = lock(&self.peer_tracker).update(msg.source.as_ref(), true);
        if outcome.is_ok() {
            // Only direct, first-hop messages carry a usable time sample.
            if msg.hops == 1 && msg.timestamp > 0 {
                let weight = 1. / (1 + lock(&self.connected_peers).len()) as f32;
                self.time_sync.sync(msg.timestamp, weight);
                self.watch.emit(Event::TimeSynced, "");
            }
            self.watch.emit(Event::SourceUpdateReceived, "");
        }
        // Informational rejects leave the rest of the frame usable.
        let informational = matches!(
            outcome,
            Ok(()) | Err(Reject::Null | Reject::AddressMissing | Reject::CoordinatesMissing)
        );
        if informational
            && !msg.peers.is_empty()
            && lock(&self.peer_tracker).receive_peer_updates(&msg) > 0
        {
            self.watch.emit(Event::PeerUpdatesReceived, "");
        }
        // A stale source header may still carry fresh entity payloads.
        if (informational || outcome == Err(Reject::SourceSequenceStale))
            && !msg.entities.is_empty()
        {
            self.watch.emit(Event::EntityUpdatesReceived, "");
            self.forward_entity_updates(&msg);
        }
    }

    /// The node info we put on the wire. Spectators advertise address
    /// only, so they never enter the overlay geometry.
    fn advertised(&self, info: &NodeInfo) -> NodeInfo {
        let mut info = info.clone();
        if self.spectator {
            info.coordinates.clear();
            info.power_radius = 0.;
        }
        info
    }

    /// Run the transport's poll step on the calling thread.
    pub fn poll(&self, timeout: LocalDuration) -> io::Result<usize> {
        self.transport.poll(timeout)
    }

    /// Exclusive access to the peer tracker. Poll-thread only.
    pub fn peer_tracker(&self) -> MutexGuard<'_, PeerTracker> {
        lock(&self.peer_tracker)
    }

    /// Scoped view of the ego sphere. The entity lock is held until the
    /// guard is dropped.
    pub fn entities(&self) -> MutexGuard<'_, EgoSphere> {
        lock(&self.ego_sphere)
    }

    pub fn connected_peers(&self) -> Vec<String> {
        lock(&self.connected_peers).clone()
    }

    pub fn time_sync(&self) -> &TimeSync {
        &self.time_sync
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn watch(&self) -> &Watch {
        &self.watch
    }
}
