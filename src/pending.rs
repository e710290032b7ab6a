//! Mates waiting for their partner during read-end extraction

use std::collections::HashMap;

use bstr::{BString, ByteSlice};

use crate::read_ends::PendingPair;

/// Pairs whose first mate has been seen, keyed by the reference the second
/// mate will arrive on and `"RG:name"`.
#[derive(Debug, Default)]
pub struct PendingPairs {
    pairs: HashMap<(i32, BString), PendingPair>,
}

/// Build the `"RG:name"` lookup key. A missing read group yields `"null:name"`.
pub fn pair_key(read_group: Option<&[u8]>, name: &[u8]) -> BString {
    let mut key = BString::from(read_group.unwrap_or(b"null"));
    key.push(b':');
    key.extend_from_slice(name);
    key
}

impl PendingPairs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the waiting mate for a read on `reference_index`, if any.
    pub fn remove(&mut self, reference_index: i32, key: &BString) -> Option<PendingPair> {
        self.pairs.remove(&(reference_index, key.clone()))
    }

    /// Park a first mate until the read on its mate's reference shows up.
    pub fn insert(&mut self, key: BString, pending: PendingPair) {
        let mate_reference = pending.mate_reference_index();
        self.pairs.insert((mate_reference, key), pending);
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Names of the mates that never found a partner, for logging.
    pub fn unmatched_names(&self, limit: usize) -> Vec<String> {
        self.pairs
            .keys()
            .take(limit)
            .map(|(_, key)| key.to_str_lossy().into_owned())
            .collect()
    }
}
