//! A decentralized spatial mesh networking runtime.
//!
//! Nodes share geo-located *entities* with nearby peers over a lossy
//! datagram transport. Each node keeps a peer table biased by spatial
//! proximity ([`tracker`]), a local replica of entities with filter-based
//! gossip semantics ([`sphere`]), a distributed clock estimate ([`clock`])
//! and a message forwarding pipeline ([`node`]). Neighbor selection is
//! geometric: candidate peers are sphere-inverted about the local node and
//! the ones landing on the convex hull form the immediate neighborhood
//! ([`hull`]).
#![warn(clippy::unwrap_used)]
pub mod clock;
pub mod events;
pub mod hull;
pub mod message;
pub mod node;
pub mod sphere;
#[cfg(test)]
pub mod test;
pub mod tracker;
pub mod transport;
pub mod wire;

pub mod prelude {
    pub use crate::clock::{TimeSync, Timestamp};
    pub use crate::events::{Event, Severity, Watch};
    pub use crate::message::{Entity, Filter, Message, NodeInfo};
    pub use crate::node::MeshNode;
    pub use crate::sphere::{EgoSphere, EntityUpdate};
    pub use crate::tracker::PeerTracker;
    pub use crate::transport::Transport;
}
