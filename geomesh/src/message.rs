//! Message types exchanged between mesh nodes.

use std::io;

use crate::clock::Timestamp;
use crate::wire;
use crate::wire::{Decode, Encode};

/// Identity and spatial state of a mesh participant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfo {
    /// Free-form label, not necessarily unique.
    pub name: String,
    /// Opaque endpoint string. The primary key across the mesh.
    pub address: String,
    /// Position in the shared coordinate space. Dimensionality is agreed
    /// across the mesh; empty means unknown.
    pub coordinates: Vec<f32>,
    /// Radial bias applied in nearest-peer ranking. Negative repels.
    pub power_radius: f32,
    /// A peer is a neighbor candidate only if the masks intersect.
    pub group_mask: u32,
    /// Monotonically increasing per originator.
    pub sequence: u32,
    /// Mesh time at origination.
    pub timestamp: Timestamp,
}

/// Per-entity replication policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Filter {
    /// Install and propagate at every node.
    #[default]
    All = 0,
    /// Install only at the node closest to the entity.
    Nearest = 1,
}

/// A named, optionally spatial record shared across the mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    pub name: String,
    /// Empty means the entity has no position.
    pub coordinates: Vec<f32>,
    /// Absolute mesh time after which the entity is dead.
    pub expiry: Timestamp,
    /// Maximum distance between a replica and the entity; 0 disables.
    pub range: f32,
    /// Maximum number of forward steps; 0 disables.
    pub hop_limit: u32,
    pub filter: Filter,
    /// Opaque application payload.
    pub payload: Vec<u8>,
}

/// Wire frame. Everything sent over the network is one of these.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Mesh time at the originator. Also the dedup key for the carried
    /// entities, so forwarders must preserve it.
    pub timestamp: Timestamp,
    /// Forward steps taken so far; originators send 0.
    pub hops: u32,
    /// The node this frame was received from.
    pub source: Option<NodeInfo>,
    /// The sender's current neighbor selection.
    pub peers: Vec<NodeInfo>,
    /// Entity state updates, sorted by name. Enforced on decode.
    pub entities: Vec<Entity>,
}

impl Message {
    /// Look up a carried entity by name. `O(log n)` over the sorted vector.
    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entities[i])
    }
}

impl Encode for NodeInfo {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.name.encode(writer)?;
        n += self.address.encode(writer)?;
        n += self.coordinates.encode(writer)?;
        n += self.power_radius.encode(writer)?;
        n += self.group_mask.encode(writer)?;
        n += self.sequence.encode(writer)?;
        n += self.timestamp.encode(writer)?;

        Ok(n)
    }
}

impl Decode for NodeInfo {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let name = String::decode(reader)?;
        let address = String::decode(reader)?;
        let coordinates = Vec::<f32>::decode(reader)?;
        let power_radius = f32::decode(reader)?;
        let group_mask = u32::decode(reader)?;
        let sequence = u32::decode(reader)?;
        let timestamp = Timestamp::decode(reader)?;

        Ok(Self {
            name,
            address,
            coordinates,
            power_radius,
            group_mask,
            sequence,
            timestamp,
        })
    }
}

impl Encode for Filter {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (*self as u8).encode(writer)
    }
}

impl Decode for Filter {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        match u8::decode(reader)? {
            0 => Ok(Self::All),
            1 => Ok(Self::Nearest),
            n => Err(wire::Error::InvalidFilter(n)),
        }
    }
}

impl Encode for Entity {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.name.encode(writer)?;
        n += self.coordinates.encode(writer)?;
        n += self.expiry.encode(writer)?;
        n += self.range.encode(writer)?;
        n += self.hop_limit.encode(writer)?;
        n += self.filter.encode(writer)?;
        n += self.payload.as_slice().encode(writer)?;

        Ok(n)
    }
}

impl Decode for Entity {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let name = String::decode(reader)?;
        let coordinates = Vec::<f32>::decode(reader)?;
        let expiry = Timestamp::decode(reader)?;
        let range = f32::decode(reader)?;
        let hop_limit = u32::decode(reader)?;
        let filter = Filter::decode(reader)?;
        let payload = Vec::<u8>::decode(reader)?;

        Ok(Self {
            name,
            coordinates,
            expiry,
            range,
            hop_limit,
            filter,
            payload,
        })
    }
}

impl Encode for Message {
    fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut n = 0;

        n += self.timestamp.encode(writer)?;
        n += self.hops.encode(writer)?;
        n += self.source.encode(writer)?;
        n += self.peers.encode(writer)?;
        n += self.entities.encode(writer)?;

        Ok(n)
    }
}

impl Decode for Message {
    fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, wire::Error> {
        let timestamp = Timestamp::decode(reader)?;
        let hops = u32::decode(reader)?;
        let source = Option::<NodeInfo>::decode(reader)?;
        let peers = Vec::<NodeInfo>::decode(reader)?;
        let entities = Vec::<Entity>::decode(reader)?;

        if entities.windows(2).any(|w| w[0].name > w[1].name) {
            return Err(wire::Error::UnsortedEntities);
        }
        Ok(Self {
            timestamp,
            hops,
            source,
            peers,
            entities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qcheck_macros::quickcheck;

    use crate::wire::{deserialize, serialize};

    fn entity(name: &str) -> Entity {
        Entity {
            name: name.to_owned(),
            coordinates: vec![1., 2.],
            expiry: 1_000_000_000,
            range: 10.,
            hop_limit: 2,
            filter: Filter::Nearest,
            payload: vec![0xde, 0xad],
        }
    }

    #[quickcheck]
    fn prop_node_info(
        name: String,
        address: String,
        coordinates: Vec<f32>,
        sequence: u32,
        timestamp: i64,
    ) -> qcheck::TestResult {
        if name.len() > u8::MAX as usize || address.len() > u8::MAX as usize {
            return qcheck::TestResult::discard();
        }
        let info = NodeInfo {
            name,
            address,
            coordinates,
            power_radius: -1.5,
            group_mask: 0xF0F0,
            sequence,
            timestamp,
        };
        assert_eq!(deserialize::<NodeInfo>(&serialize(&info)).unwrap(), info);

        qcheck::TestResult::passed()
    }

    #[quickcheck]
    fn prop_message(timestamp: i64, hops: u32) {
        let msg = Message {
            timestamp,
            hops,
            source: Some(NodeInfo {
                address: "udp://127.0.0.1:11511".to_owned(),
                coordinates: vec![0., 0.],
                ..NodeInfo::default()
            }),
            peers: vec![NodeInfo::default()],
            entities: vec![entity("a"), entity("b")],
        };
        assert_eq!(deserialize::<Message>(&serialize(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_entity_lookup() {
        let msg = Message {
            entities: vec![entity("a"), entity("b"), entity("d")],
            ..Message::default()
        };
        assert_eq!(msg.entity("b").map(|e| e.name.as_str()), Some("b"));
        assert!(msg.entity("c").is_none());
    }

    #[test]
    fn test_unsorted_entities() {
        let msg = Message {
            entities: vec![entity("b"), entity("a")],
            ..Message::default()
        };
        assert!(matches!(
            deserialize::<Message>(&serialize(&msg)),
            Err(wire::Error::UnsortedEntities)
        ));
    }

    #[test]
    fn test_invalid_filter() {
        let mut buf = serialize(&entity("a"));
        // The filter byte sits right before the payload length.
        let at = buf.len() - 2 - 2 - 1;
        buf[at] = 7;

        assert!(matches!(
            deserialize::<Entity>(&buf),
            Err(wire::Error::InvalidFilter(7))
        ));
    }
}
