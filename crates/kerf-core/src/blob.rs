//! Concurrent cache of extracted BLOB payloads.
//!
//! BLOB columns decoded during recovery are parked here under a key derived
//! from the database name, the payload's file offset, and a sequence number,
//! so exporters and viewers can fetch them after the scan without holding the
//! whole row set. Entries accumulate for the lifetime of one analysis run;
//! there is no eviction.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// One extracted binary payload
#[derive(Debug, Clone)]
pub struct BlobElement {
    bytes: Bytes,
}

impl BlobElement {
    /// Wrap extracted payload bytes
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// The raw payload
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length payload
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lowercase hex rendering of the payload
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.bytes.len() * 2);
        for byte in self.bytes.iter() {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// ASCII rendering with non-printable bytes replaced by `.`
    pub fn to_printable_ascii(&self) -> String {
        self.bytes
            .iter()
            .map(|&b| {
                if (0x20..0x7F).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect()
    }
}

/// Thread-safe keyed store of extracted BLOBs.
///
/// Multiple page workers insert concurrently; keys are unique by
/// construction (the sequence counter), so writers never collide on a key.
#[derive(Debug, Default)]
pub struct BlobCache {
    entries: RwLock<HashMap<String, BlobElement>>,
    seq: AtomicU64,
}

impl BlobCache {
    /// An empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload under a generated `db:offset:seq` key; returns the key.
    pub fn store(&self, db: &str, file_offset: u64, bytes: Bytes) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = format!("{db}:{file_offset}:{seq}");
        self.entries
            .write()
            .insert(key.clone(), BlobElement::new(bytes));
        key
    }

    /// Insert under an explicit key
    pub fn insert(&self, key: String, element: BlobElement) {
        self.entries.write().insert(key, element);
    }

    /// Fetch an entry by key. The payload is reference-counted, so the clone
    /// is cheap.
    pub fn get(&self, key: &str) -> Option<BlobElement> {
        self.entries.read().get(key).cloned()
    }

    /// All keys currently present, in no particular order
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of cached payloads
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if nothing has been cached
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
