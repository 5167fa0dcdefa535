//! Grouping of buffered entries into streams.

use std::collections::HashMap;

use crate::entry::{Entry, LabeledEntry};

/// Entries sharing one label set, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    /// Canonical label set string.
    pub labels: String,
    /// Entries in the order they were enqueued.
    pub entries: Vec<Entry>,
}

/// Groups entries by identical label set.
///
/// Streams appear in the order their label set was first seen, and entries
/// keep their relative order inside each stream. Loki rejects out-of-order
/// entries within a stream, so nothing here sorts.
pub fn group_streams(entries: Vec<LabeledEntry>) -> Vec<Stream> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut streams: Vec<Stream> = Vec::new();

    for LabeledEntry { entry, labels } in entries {
        match index.get(&labels) {
            Some(&i) => streams[i].entries.push(entry),
            None => {
                index.insert(labels.clone(), streams.len());
                streams.push(Stream {
                    labels,
                    entries: vec![entry],
                });
            }
        }
    }

    streams
}

/// Total number of entries across `streams`.
pub fn entry_count(streams: &[Stream]) -> usize {
    streams.iter().map(|s| s.entries.len()).sum()
}
