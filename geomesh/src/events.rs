//! Runtime events and sinks.
//!
//! Every notable runtime occurrence carries a numeric code partitioned by
//! component (mesh node 100s, peer tracker 200s, ego sphere 300s) and a
//! fixed severity. Events fan out to subscribers of a [`Watch`] and are
//! mirrored to the [`log`] facade, so embedders can count or inspect them
//! without parsing log lines.

use std::fmt;
use std::sync::Mutex;

use crate::clock::{LocalClock, Timestamp};

/// Event severity, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Severity {
    fn to_log(self) -> log::Level {
        match self {
            Self::Fatal | Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

/// Everything the runtime reports at runtime, by numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Event {
    // mesh node
    MessageVerifyFail = 101,
    Initialized = 102,
    PeerUpdatesSent = 103,
    SourceUpdateReceived = 104,
    PeerUpdatesReceived = 105,
    EntityUpdatesSent = 106,
    EntityUpdatesForwarded = 107,
    EntityUpdatesReceived = 108,
    TimeSynced = 109,
    // peer tracker
    PeerIsNull = 201,
    PeerAddressMissing = 202,
    PeerCoordinatesMissing = 203,
    NewPeerDiscovered = 204,
    PeerLatched = 205,
    PeerSequenceStale = 206,
    SourceSequenceStale = 207,
    PeerUpdated = 208,
    PeerIsSelf = 209,
    PeerSelectionsGenerated = 210,
    // ego sphere
    EntityNameMissing = 301,
    EntityCoordinatesMissing = 302,
    MessageSourceInvalid = 303,
    EntityAlreadyReceived = 304,
    EntityNearestFiltered = 305,
    EntityExpired = 306,
    EntityRangeExceeded = 307,
    EntityCreated = 308,
    EntityUpdated = 309,
    EntityDeleted = 310,
    EntityTimestampsTrimmed = 311,
}

impl Event {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn severity(self) -> Severity {
        use Event::*;

        match self {
            MessageVerifyFail | PeerIsNull | PeerAddressMissing | PeerCoordinatesMissing
            | EntityNameMissing | EntityCoordinatesMissing | MessageSourceInvalid => Severity::Warn,
            Initialized | PeerUpdatesSent | EntityUpdatesSent | NewPeerDiscovered | PeerLatched => {
                Severity::Info
            }
            PeerSequenceStale | SourceSequenceStale | EntityExpired | EntityRangeExceeded
            | EntityCreated | EntityDeleted | EntityTimestampsTrimmed | EntityUpdatesForwarded => {
                Severity::Debug
            }
            SourceUpdateReceived | PeerUpdatesReceived | EntityUpdatesReceived | TimeSynced
            | PeerUpdated | PeerIsSelf | PeerSelectionsGenerated | EntityAlreadyReceived
            | EntityNearestFiltered | EntityUpdated => Severity::Trace,
        }
    }

    fn target(self) -> &'static str {
        match self.code() {
            200..=299 => "tracker",
            300..=399 => "sphere",
            _ => "node",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Event::*;

        let s = match self {
            MessageVerifyFail => "failed to verify message",
            Initialized => "mesh node initialized",
            PeerUpdatesSent => "peer updates sent",
            SourceUpdateReceived => "source update received",
            PeerUpdatesReceived => "peer updates received",
            EntityUpdatesSent => "entity updates sent",
            EntityUpdatesForwarded => "entity updates forwarded",
            EntityUpdatesReceived => "entity updates received",
            TimeSynced => "time synced",
            PeerIsNull => "peer is missing",
            PeerAddressMissing => "peer address missing",
            PeerCoordinatesMissing => "peer coordinates missing",
            NewPeerDiscovered => "new peer discovered",
            PeerLatched => "peer latched",
            PeerSequenceStale => "peer sequence stale",
            SourceSequenceStale => "source sequence stale",
            PeerUpdated => "peer updated",
            PeerIsSelf => "peer is self",
            PeerSelectionsGenerated => "peer selections generated",
            EntityNameMissing => "entity name missing",
            EntityCoordinatesMissing => "entity coordinates missing",
            MessageSourceInvalid => "message source invalid",
            EntityAlreadyReceived => "entity already received",
            EntityNearestFiltered => "entity rejected by nearest filter",
            EntityExpired => "entity expired",
            EntityRangeExceeded => "entity range exceeded",
            EntityCreated => "entity created",
            EntityUpdated => "entity updated",
            EntityDeleted => "entity deleted",
            EntityTimestampsTrimmed => "entity timestamps trimmed",
        };
        write!(f, "{s}")
    }
}

type Handler = Box<dyn Fn(Timestamp, Severity, Event, &str) + Send + Sync>;

/// Fan-out sink for runtime events.
///
/// Subscribers register with a verbosity; an event reaches every
/// subscriber whose verbosity is at or below the event's severity. Events
/// are stamped with mesh time once a clock is attached (the mesh node
/// attaches its own on construction) and mirrored to the `log` facade.
#[derive(Default)]
pub struct Watch {
    clock: Mutex<Option<LocalClock>>,
    handlers: Mutex<Vec<(Severity, Handler)>>,
}

impl Watch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the time source used to stamp events.
    pub fn set_clock(&self, clock: LocalClock) {
        *lock(&self.clock) = Some(clock);
    }

    /// Register a handler for events at `verbosity` or more severe.
    pub fn subscribe<F>(&self, verbosity: Severity, handler: F)
    where
        F: Fn(Timestamp, Severity, Event, &str) + Send + Sync + 'static,
    {
        lock(&self.handlers).push((verbosity, Box::new(handler)));
    }

    /// Report an event with some human-readable context.
    pub fn emit(&self, event: Event, context: &str) {
        let severity = event.severity();
        if context.is_empty() {
            log::log!(target: event.target(), severity.to_log(), "{event}");
        } else {
            log::log!(target: event.target(), severity.to_log(), "{event}: {context}");
        }
        let time = lock(&self.clock).as_ref().map(|clock| clock()).unwrap_or(0);
        for (verbosity, handler) in lock(&self.handlers).iter() {
            if severity <= *verbosity {
                handler(time, severity, event, context);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
