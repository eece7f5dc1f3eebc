//! Peer discovery, sequence tracking and geometric neighbor selection.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::events::{Event, Watch};
use crate::hull;
use crate::message::{Message, NodeInfo};

/// Squared euclidean distance. A dimension mismatch ranks as unreachable.
pub(crate) fn distance_sqr(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }
    a.iter().zip(b).map(|(x, y)| (y - x) * (y - x)).sum()
}

/// Fatal tracker construction error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configured address is empty")]
    AddressConfigEmpty,
}

/// Why a peer update was not applied.
///
/// `Null`, `AddressMissing` and `CoordinatesMissing` are informational:
/// the rest of the frame that carried the update may still be processed.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    #[error("peer is missing")]
    Null,
    #[error("peer address missing")]
    AddressMissing,
    #[error("peer coordinates missing")]
    CoordinatesMissing,
    #[error("peer is self")]
    IsSelf,
    #[error("peer sequence is stale")]
    SequenceStale,
    #[error("source sequence is stale")]
    SourceSequenceStale,
}

/// Tracked state of a remote node.
#[derive(Debug, Clone, Default)]
pub struct Peer {
    pub node_info: NodeInfo,
    /// Last sequence seen with this peer as the message source. Distinct
    /// from `node_info.sequence`, which may also advance indirectly
    /// through relayed peer lists.
    pub source_sequence: u32,
    /// Sequence count below which the peer is always selected.
    pub latch_until: u32,
    /// Sequence count below which the peer survives garbage collection.
    pub track_until: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    /// The local endpoint. Must be unique across the mesh and non-empty.
    pub address: String,
    pub coordinates: Vec<f32>,
    /// Radial bias advertised for nearest-peer ranking. Negative widens
    /// the local cost, making this node less preferred as "nearest".
    pub power_radius: f32,
    /// A peer is a neighbor candidate only if the masks intersect.
    pub group_mask: u32,
    /// Sequences a non-selected peer is retained before collection.
    pub tracking_duration: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            coordinates: Vec::new(),
            power_radius: 0.,
            group_mask: u32::MAX,
            tracking_duration: u32::MAX,
        }
    }
}

/// The peer table.
///
/// Not synchronized: meant to be driven from the poll thread only.
pub struct PeerTracker {
    config: Config,
    node_info: NodeInfo,
    peers: BTreeMap<String, Peer>,
    /// Addresses owed a reply since the last selection pass.
    recipients: Vec<String>,
    watch: Arc<Watch>,
}

impl PeerTracker {
    pub fn new(config: Config, watch: Arc<Watch>) -> Result<Self, Error> {
        if config.address.is_empty() {
            return Err(Error::AddressConfigEmpty);
        }
        let node_info = NodeInfo {
            name: config.name.clone(),
            address: config.address.clone(),
            coordinates: config.coordinates.clone(),
            power_radius: config.power_radius,
            group_mask: config.group_mask,
            ..NodeInfo::default()
        };
        log::debug!(target: "tracker", "tracking as {}", node_info.address);

        Ok(Self {
            config,
            node_info,
            peers: BTreeMap::new(),
            recipients: Vec::new(),
            watch,
        })
    }

    /// Pin `address` into the selection for the next `duration` sequences,
    /// creating the peer if needed. This is how a node bootstraps into a
    /// mesh it knows nothing about.
    pub fn latch(&mut self, address: &str, duration: u32) -> Result<(), Reject> {
        if address.is_empty() {
            self.watch.emit(Event::PeerAddressMissing, "cannot latch");
            return Err(Reject::AddressMissing);
        }
        if address == self.node_info.address {
            self.watch.emit(Event::PeerIsSelf, "cannot latch");
            return Err(Reject::IsSelf);
        }
        let peer = self.peers.entry(address.to_owned()).or_default();
        if peer.node_info.address.is_empty() {
            peer.node_info.address = address.to_owned();
        }
        peer.latch_until = self.node_info.sequence.saturating_add(duration);
        self.watch.emit(Event::PeerLatched, address);

        Ok(())
    }

    /// Apply a received `NodeInfo` to the peer table.
    ///
    /// `is_source` marks updates whose subject is the message sender
    /// itself; those are checked against the stricter `source_sequence`
    /// and refresh the peer's tracking lease even when stale.
    pub fn update(&mut self, node_info: Option<&NodeInfo>, is_source: bool) -> Result<(), Reject> {
        let Some(info) = node_info else {
            self.watch.emit(Event::PeerIsNull, "");
            return Err(Reject::Null);
        };
        if info.address.is_empty() {
            self.watch.emit(Event::PeerAddressMissing, &info.name);
            return Err(Reject::AddressMissing);
        }
        if info.address == self.node_info.address {
            return Err(Reject::IsSelf);
        }
        if info.coordinates.is_empty() {
            self.watch.emit(Event::PeerCoordinatesMissing, &info.address);
            return Err(Reject::CoordinatesMissing);
        }
        let track_until = self
            .node_info
            .sequence
            .saturating_add(self.config.tracking_duration);
        let is_new = !self.peers.contains_key(&info.address);
        if is_new {
            self.watch.emit(Event::NewPeerDiscovered, &info.address);
        }
        let peer = self.peers.entry(info.address.clone()).or_default();
        if !is_new {
            if is_source {
                // Hearing from the peer directly keeps it tracked, stale or not.
                peer.track_until = track_until;
                if info.sequence <= peer.source_sequence {
                    self.watch.emit(Event::SourceSequenceStale, &info.address);
                    return Err(Reject::SourceSequenceStale);
                }
                peer.source_sequence = info.sequence;
            } else if info.sequence <= peer.node_info.sequence {
                self.watch.emit(Event::PeerSequenceStale, &info.address);
                return Err(Reject::SequenceStale);
            }
        }
        peer.node_info = info.clone();
        peer.track_until = track_until;
        self.watch.emit(Event::PeerUpdated, &info.address);

        Ok(())
    }

    /// Apply a message's carried peer list. Returns how many entries were
    /// accepted. An entry naming this node catches our sequence up and
    /// marks the sender as owed a reply.
    pub fn receive_peer_updates(&mut self, msg: &Message) -> usize {
        let mut updated = 0;
        for info in &msg.peers {
            match self.update(Some(info), false) {
                Ok(()) => updated += 1,
                Err(Reject::IsSelf) => {
                    self.node_info.sequence = self.node_info.sequence.max(info.sequence);
                    if let Some(source) = msg.source.as_ref().filter(|s| !s.address.is_empty()) {
                        self.recipients.push(source.address.clone());
                    }
                }
                Err(_) => {}
            }
        }
        updated
    }

    /// Compute the outbound neighbor set and recipient list, garbage
    /// collecting peers whose latch and tracking leases have both lapsed.
    /// Ticks the local sequence.
    ///
    /// Selection is geometric: candidate positions are sphere-inverted
    /// about this node, the origin is appended so the hull must reach it,
    /// and every candidate whose image is a hull vertex is an interior
    /// neighbor.
    pub fn update_peer_selections(&mut self) -> (Vec<String>, Vec<String>) {
        let mut selected = Vec::new();
        let mut recipients = std::mem::take(&mut self.recipients);
        let sequence = self.node_info.sequence;
        let group_mask = self.node_info.group_mask;

        let mut candidates: Vec<String> = Vec::with_capacity(self.peers.len());
        let mut points: Vec<hull::Point> = Vec::with_capacity(self.peers.len() + 1);
        self.peers.retain(|address, peer| {
            if peer.latch_until >= sequence {
                selected.push(address.clone());
                recipients.push(address.clone());
                return true;
            }
            if peer.track_until < sequence {
                return false;
            }
            if group_mask & peer.node_info.group_mask != 0 {
                candidates.push(address.clone());
                points.push(peer.node_info.coordinates.clone());
            }
            true
        });

        hull::sphere_inversion(&mut points, &self.node_info.coordinates);
        points.push(vec![0.; self.node_info.coordinates.len()]);
        let vertices = hull::convex_hull(&points);
        for (i, address) in candidates.into_iter().enumerate() {
            if vertices.contains(&i) {
                selected.push(address.clone());
                recipients.push(address);
            }
        }
        recipients.sort_unstable();
        recipients.dedup();
        self.node_info.sequence += 1;
        self.watch.emit(Event::PeerSelectionsGenerated, "");

        (selected, recipients)
    }

    /// Among self and the peers named in `subset`, the node closest to
    /// `coordinates`. The radial cost is the squared distance minus
    /// `power_radius·|power_radius|`; ties keep the earlier candidate
    /// (self first, then subset order). Unknown addresses are skipped.
    pub fn nearest_peer(&self, coordinates: &[f32], subset: &[String]) -> &NodeInfo {
        fn radial_cost(coordinates: &[f32], info: &NodeInfo) -> f32 {
            distance_sqr(coordinates, &info.coordinates)
                - info.power_radius * info.power_radius.abs()
        }
        let mut nearest = &self.node_info;
        let mut min_cost = radial_cost(coordinates, nearest);
        for address in subset {
            let Some(peer) = self.peers.get(address) else {
                continue;
            };
            let cost = radial_cost(coordinates, &peer.node_info);
            if cost < min_cost {
                min_cost = cost;
                nearest = &peer.node_info;
            }
        }
        nearest
    }

    // Accessors. Not thread safe; drive from the poll thread.
    pub fn peers(&self) -> &BTreeMap<String, Peer> {
        &self.peers
    }

    pub fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }
}
