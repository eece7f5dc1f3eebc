//! The ego sphere: a node's replicated view of the entities shared across
//! the mesh.
//!
//! Incoming entity updates run through a fixed pipeline: dedup by
//! `(name, message timestamp)`, filter selection and evaluation, expiry
//! and range checks, then an optional application veto. Whatever survives
//! is installed locally and collected into a forward set for the node to
//! relay. Deletions travel the same way: a dead entity is forwarded once
//! so downstream replicas learn of the death.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::clock::Timestamp;
use crate::events::{Event, Watch};
use crate::message::{Entity, Filter, Message, NodeInfo};
use crate::tracker::{distance_sqr, PeerTracker};

/// Application callback consulted before each entity mutation, with the
/// incoming record, the existing one, and the update's source. Returning
/// `false` vetoes the mutation; deletions ignore the verdict.
pub type UpdateHandler =
    Box<dyn FnMut(Option<&EntityUpdate>, Option<&EntityUpdate>, Option<&NodeInfo>) -> bool + Send>;

pub struct Config {
    /// Bound on the `(name, timestamp)` dedup set. When exceeded, the
    /// oldest half is evicted in one cut.
    pub timestamp_lookup_size: usize,
    pub entity_update_handler: Option<UpdateHandler>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timestamp_lookup_size: 1024,
            entity_update_handler: None,
        }
    }
}

/// A replicated entity and the local bookkeeping around it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdate {
    pub entity: Entity,
    /// Mesh time when this version was accepted locally.
    pub receive_timestamp: Timestamp,
    /// The originating message's timestamp.
    pub source_timestamp: Timestamp,
    /// Hop count carried by the accepting message.
    pub hops: u32,
}

pub struct EgoSphere {
    config: Config,
    entities: HashMap<String, EntityUpdate>,
    /// Recently accepted `(timestamp, name)` pairs, oldest first.
    seen: BTreeSet<(Timestamp, String)>,
    watch: Arc<Watch>,
}

impl EgoSphere {
    pub fn new(config: Config, watch: Arc<Watch>) -> Self {
        Self {
            config,
            entities: HashMap::new(),
            seen: BTreeSet::new(),
            watch,
        }
    }

    /// Run a message's entities through the receive pipeline. Returns the
    /// canonical records to forward, death notices included.
    ///
    /// `connected_peers` scopes the nearest-peer evaluation to the node's
    /// current neighborhood.
    pub fn receive_entity_updates(
        &mut self,
        msg: &Message,
        tracker: &PeerTracker,
        connected_peers: &[String],
        current_time: Timestamp,
    ) -> Vec<Entity> {
        let mut forward = Vec::new();
        let source = msg.source.as_ref();
        let from_self = source.is_some_and(|s| s.address == tracker.node_info().address);

        for entity in &msg.entities {
            if entity.name.is_empty() {
                self.watch.emit(Event::EntityNameMissing, "");
                continue;
            }
            let key = (msg.timestamp, entity.name.clone());
            if self.seen.contains(&key) {
                self.watch.emit(Event::EntityAlreadyReceived, &entity.name);
                continue;
            }
            // Updates from self bypass filtering; otherwise the filter is
            // locked by the first accepted version of the entity.
            let filter = if from_self {
                Filter::All
            } else if let Some(known) = self.entities.get(&entity.name) {
                known.entity.filter
            } else {
                entity.filter
            };
            if entity.coordinates.is_empty() && (entity.range > 0. || filter == Filter::Nearest) {
                self.watch.emit(Event::EntityCoordinatesMissing, &entity.name);
                continue;
            }
            match filter {
                Filter::All => {}
                Filter::Nearest => {
                    let Some(source) = source.filter(|s| !s.address.is_empty()) else {
                        self.watch.emit(Event::MessageSourceInvalid, &entity.name);
                        continue;
                    };
                    let nearest = tracker.nearest_peer(&entity.coordinates, connected_peers);
                    // An unknown entity nearest to this node is accepted so
                    // that entities entering the mesh here are not dropped
                    // before anyone hears of them.
                    let accept = nearest.address == source.address
                        || (!self.entities.contains_key(&entity.name)
                            && nearest.address == tracker.node_info().address);
                    if !accept {
                        self.watch.emit(Event::EntityNearestFiltered, &entity.name);
                        continue;
                    }
                }
            }
            self.insert_timestamp(key);
            // A dead or out-of-range entity that was replicated here is
            // forwarded once more, so downstream replicas learn of the
            // death. One that was never installed is simply dropped.
            if entity.expiry <= current_time {
                if self.delete(&entity.name, source) {
                    forward.push(entity.clone());
                }
                self.watch.emit(Event::EntityExpired, &entity.name);
                continue;
            }
            if entity.range > 0.
                && distance_sqr(&entity.coordinates, &tracker.node_info().coordinates)
                    > entity.range * entity.range
            {
                if self.delete(&entity.name, source) {
                    forward.push(entity.clone());
                }
                self.watch.emit(Event::EntityRangeExceeded, &entity.name);
                continue;
            }
            let mut record = EntityUpdate {
                entity: entity.clone(),
                receive_timestamp: current_time,
                source_timestamp: msg.timestamp,
                hops: msg.hops,
            };
            if !from_self {
                record.entity.filter = filter;
            }
            let existing = self.entities.get(&entity.name);
            if let Some(handler) = &mut self.config.entity_update_handler {
                if !handler(Some(&record), existing, source) {
                    continue;
                }
            }
            let created = existing.is_none();
            let canonical = record.entity.clone();
            self.entities.insert(entity.name.clone(), record);
            self.watch.emit(
                if created {
                    Event::EntityCreated
                } else {
                    Event::EntityUpdated
                },
                &entity.name,
            );
            // The originator always forwards; relays stop at the hop limit.
            if from_self || entity.hop_limit == 0 || msg.hops < entity.hop_limit {
                forward.push(canonical);
            }
        }
        forward
    }

    /// Remove an entity, notifying the handler. Returns whether anything
    /// was removed.
    pub fn delete(&mut self, name: &str, source: Option<&NodeInfo>) -> bool {
        let Some(old) = self.entities.remove(name) else {
            return false;
        };
        if let Some(handler) = &mut self.config.entity_update_handler {
            handler(None, Some(&old), source);
        }
        self.watch.emit(Event::EntityDeleted, name);
        true
    }

    /// Sweep out every entity dead at `current_time`.
    pub fn expire(&mut self, current_time: Timestamp, source: Option<&NodeInfo>) {
        let dead: Vec<String> = self
            .entities
            .iter()
            .filter(|(_, record)| record.entity.expiry <= current_time)
            .map(|(name, _)| name.clone())
            .collect();
        for name in dead {
            if let Some(old) = self.entities.remove(&name) {
                if let Some(handler) = &mut self.config.entity_update_handler {
                    handler(None, Some(&old), source);
                }
                self.watch.emit(Event::EntityExpired, &name);
            }
        }
    }

    fn insert_timestamp(&mut self, key: (Timestamp, String)) {
        if !self.seen.insert(key) {
            return;
        }
        if self.seen.len() > self.config.timestamp_lookup_size {
            if let Some(pivot) = self.seen.iter().nth(self.seen.len() / 2).cloned() {
                self.seen = self.seen.split_off(&pivot);
                self.watch.emit(Event::EntityTimestampsTrimmed, "");
            }
        }
    }

    pub fn entities(&self) -> &HashMap<String, EntityUpdate> {
        &self.entities
    }

    pub fn get(&self, name: &str) -> Option<&EntityUpdate> {
        self.entities.get(name)
    }

    pub(crate) fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::clock::SEC;
    use crate::test::counter;
    use crate::tracker;

    struct Fixture {
        sphere: EgoSphere,
        tracker: PeerTracker,
        connected: Vec<String>,
        counts: Arc<Mutex<HashMap<Event, usize>>>,
    }

    impl Fixture {
        fn new(config: Config) -> Self {
            let watch = Arc::new(Watch::new());
            let counts = counter(&watch);
            let mut tracker = PeerTracker::new(
                tracker::Config {
                    name: "self".to_owned(),
                    address: "mem://self".to_owned(),
                    coordinates: vec![0., 0.],
                    ..tracker::Config::default()
                },
                watch.clone(),
            )
            .unwrap();
            tracker
                .update(Some(&source_info("mem://src", vec![5., 5.])), true)
                .unwrap();

            Self {
                sphere: EgoSphere::new(config, watch),
                tracker,
                connected: vec!["mem://src".to_owned()],
                counts,
            }
        }

        fn receive(&mut self, msg: &Message) -> Vec<Entity> {
            self.sphere
                .receive_entity_updates(msg, &self.tracker, &self.connected, 2 * SEC)
        }

        fn count(&self, event: Event) -> usize {
            *self.counts.lock().unwrap().get(&event).unwrap_or(&0)
        }
    }

    fn source_info(address: &str, coordinates: Vec<f32>) -> NodeInfo {
        NodeInfo {
            name: address.to_owned(),
            address: address.to_owned(),
            coordinates,
            sequence: 1,
            ..NodeInfo::default()
        }
    }

    fn entity(name: &str, coordinates: Vec<f32>, filter: Filter) -> Entity {
        Entity {
            name: name.to_owned(),
            coordinates,
            expiry: 10 * SEC,
            filter,
            ..Entity::default()
        }
    }

    fn message(source: &str, timestamp: Timestamp, entities: Vec<Entity>) -> Message {
        Message {
            timestamp,
            hops: 1,
            source: Some(source_info(source, vec![5., 5.])),
            peers: vec![],
            entities,
        }
    }

    #[test]
    fn test_duplicate_timestamp_is_rejected() {
        let mut fix = Fixture::new(Config::default());
        let msg = message("mem://src", 100, vec![entity("a", vec![], Filter::All)]);

        assert_eq!(fix.receive(&msg).len(), 1);
        assert!(fix.receive(&msg).is_empty());
        assert_eq!(fix.count(Event::EntityAlreadyReceived), 1);
        assert_eq!(fix.count(Event::EntityCreated), 1);
    }

    #[test]
    fn test_nearest_accepts_the_closest_source() {
        let mut fix = Fixture::new(Config::default());
        let msg = message("mem://src", 100, vec![entity("a", vec![5., 5.], Filter::Nearest)]);

        assert_eq!(fix.receive(&msg).len(), 1);
        assert_eq!(fix.count(Event::EntityCreated), 1);
    }

    #[test]
    fn test_nearest_fallback_seeds_unknown_entity() {
        let mut fix = Fixture::new(Config::default());

        // Self is nearest to (0, 0), not the source; the entity is unknown,
        // so the fallback lets it enter the mesh through this node.
        let msg = message("mem://src", 100, vec![entity("a", vec![0., 0.], Filter::Nearest)]);
        assert_eq!(fix.receive(&msg).len(), 1);
        assert_eq!(fix.count(Event::EntityCreated), 1);

        // Once known, the fallback no longer applies.
        let msg = message("mem://src", 101, vec![entity("a", vec![0., 0.], Filter::Nearest)]);
        assert!(fix.receive(&msg).is_empty());
        assert_eq!(fix.count(Event::EntityNearestFiltered), 1);
    }

    #[test]
    fn test_filter_is_locked_on_first_accept() {
        let mut fix = Fixture::new(Config::default());

        let msg = message("mem://src", 100, vec![entity("a", vec![0., 0.], Filter::Nearest)]);
        assert_eq!(fix.receive(&msg).len(), 1);

        // A later version may claim ALL, but the stored NEAREST governs.
        let msg = message("mem://src", 101, vec![entity("a", vec![0., 0.], Filter::All)]);
        assert!(fix.receive(&msg).is_empty());
        assert_eq!(fix.count(Event::EntityNearestFiltered), 1);
    }

    #[test]
    fn test_nearest_without_source_is_invalid() {
        let mut fix = Fixture::new(Config::default());
        let msg = Message {
            timestamp: 100,
            hops: 1,
            source: None,
            peers: vec![],
            entities: vec![entity("a", vec![0., 0.], Filter::Nearest)],
        };
        assert!(fix.receive(&msg).is_empty());
        assert_eq!(fix.count(Event::MessageSourceInvalid), 1);
    }

    #[test]
    fn test_missing_coordinates() {
        let mut fix = Fixture::new(Config::default());
        let mut ranged = entity("a", vec![], Filter::All);
        ranged.range = 10.;
        let msg = message(
            "mem://src",
            100,
            vec![ranged, entity("b", vec![], Filter::Nearest)],
        );
        assert!(fix.receive(&msg).is_empty());
        assert_eq!(fix.count(Event::EntityCoordinatesMissing), 2);
    }

    #[test]
    fn test_received_dead_entity_is_deleted_and_forwarded() {
        let mut fix = Fixture::new(Config::default());
        let msg = message("mem://src", 100, vec![entity("a", vec![], Filter::All)]);
        assert_eq!(fix.receive(&msg).len(), 1);

        let mut dead = entity("a", vec![], Filter::All);
        dead.expiry = 1;
        let msg = message("mem://src", 101, vec![dead]);
        let forward = fix.receive(&msg);

        assert_eq!(forward.len(), 1, "the death notice is forwarded");
        assert!(fix.sphere.get("a").is_none());
        assert_eq!(fix.count(Event::EntityExpired), 1);
        assert_eq!(fix.count(Event::EntityDeleted), 1);
    }

    #[test]
    fn test_out_of_range_entity_is_dropped() {
        let mut fix = Fixture::new(Config::default());
        let mut far = entity("a", vec![10., 1.], Filter::All);
        far.range = 10.;
        let msg = message("mem://src", 100, vec![far]);

        // Never installed here, so there is no death to announce.
        assert!(fix.receive(&msg).is_empty());
        assert!(fix.sphere.get("a").is_none());
        assert_eq!(fix.count(Event::EntityRangeExceeded), 1);
    }

    #[test]
    fn test_entity_leaving_range_is_deleted_and_forwarded() {
        let mut fix = Fixture::new(Config::default());
        let mut near = entity("a", vec![1., 0.], Filter::All);
        near.range = 10.;
        let msg = message("mem://src", 100, vec![near]);
        assert_eq!(fix.receive(&msg).len(), 1);

        let mut far = entity("a", vec![10., 1.], Filter::All);
        far.range = 10.;
        let msg = message("mem://src", 101, vec![far]);
        let forward = fix.receive(&msg);

        assert_eq!(forward.len(), 1, "the death notice is forwarded");
        assert!(fix.sphere.get("a").is_none());
        assert_eq!(fix.count(Event::EntityRangeExceeded), 1);
        assert_eq!(fix.count(Event::EntityDeleted), 1);
    }

    #[test]
    fn test_hop_limit_stops_forwarding() {
        let mut fix = Fixture::new(Config::default());
        let mut limited = entity("a", vec![], Filter::All);
        limited.hop_limit = 1;
        let msg = message("mem://src", 100, vec![limited.clone()]);

        // Installed, but hops (1) has reached the limit: nothing to forward.
        assert!(fix.receive(&msg).is_empty());
        assert!(fix.sphere.get("a").is_some());

        // The originator is exempt.
        let msg = Message {
            timestamp: 101,
            hops: 0,
            source: Some(source_info("mem://self", vec![0., 0.])),
            peers: vec![],
            entities: vec![limited],
        };
        assert_eq!(fix.receive(&msg).len(), 1);
    }

    #[test]
    fn test_handler_can_veto() {
        let config = Config {
            entity_update_handler: Some(Box::new(|new, _, _| {
                new.map_or(true, |update| update.entity.name != "blocked")
            })),
            ..Config::default()
        };
        let mut fix = Fixture::new(config);
        let msg = message(
            "mem://src",
            100,
            vec![
                entity("blocked", vec![], Filter::All),
                entity("ok", vec![], Filter::All),
            ],
        );
        let forward = fix.receive(&msg);

        assert_eq!(forward.len(), 1);
        assert!(fix.sphere.get("blocked").is_none());
        assert!(fix.sphere.get("ok").is_some());

        // The veto does not undo the dedup commit.
        assert!(fix.receive(&msg).is_empty());
        assert_eq!(fix.count(Event::EntityAlreadyReceived), 2);
    }

    #[test]
    fn test_expire_sweep() {
        let mut fix = Fixture::new(Config::default());
        let mut early = entity("a", vec![], Filter::All);
        early.expiry = 3 * SEC;
        let late = entity("b", vec![], Filter::All);
        let msg = message("mem://src", 100, vec![early, late]);
        assert_eq!(fix.receive(&msg).len(), 2);

        fix.sphere.expire(5 * SEC, None);
        assert!(fix.sphere.get("a").is_none());
        assert!(fix.sphere.get("b").is_some());
        assert_eq!(fix.count(Event::EntityExpired), 1);
    }

    #[test]
    fn test_timestamp_lookup_is_halved() {
        let mut fix = Fixture::new(Config {
            timestamp_lookup_size: 10,
            ..Config::default()
        });
        for i in 0..11 {
            let msg = message("mem://src", 100 + i, vec![entity("a", vec![], Filter::All)]);
            assert_eq!(fix.receive(&msg).len(), 1);
        }
        assert_eq!(fix.count(Event::EntityTimestampsTrimmed), 1);
        assert!(fix.sphere.seen_count() <= 10);

        // The oldest timestamps were evicted: replaying the first frame is
        // accepted again. Documented limitation of the bounded lookup.
        let msg = message("mem://src", 100, vec![entity("a", vec![], Filter::All)]);
        assert_eq!(fix.receive(&msg).len(), 1);
    }
}
