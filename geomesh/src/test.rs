//! Test support.

pub mod transport;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::events::{Event, Severity, Watch};

/// Subscribe a counting sink to `watch` recording how often each event
/// fired.
pub fn counter(watch: &Watch) -> Arc<Mutex<HashMap<Event, usize>>> {
    let counts = Arc::new(Mutex::new(HashMap::new()));
    let sink = counts.clone();
    watch.subscribe(Severity::Trace, move |_, _, event, _| {
        *sink.lock().unwrap().entry(event).or_insert(0) += 1;
    });
    counts
}
