//! Per-peer table of bundles currently being reassembled from fragments
//! arriving over the radio link.

use crate::segment::SegmentList;
use std::collections::HashMap;
use thiserror::Error;

/// Maximum number of bundles a single peer may have in flight at once,
/// mirroring the original's `MAX_BUNDLES_IN_FLIGHT`.
pub const MAX_BUNDLES_IN_FLIGHT: usize = 16;

/// Recovers the 64 hex character BID from a reassembled manifest buffer,
/// mirroring `manifest_extract_bid`: it requires a literal ASCII `ID=`
/// prefix at the start of the manifest. Real Rhizome manifests are
/// newline-delimited key=value pairs and `id=` may appear on any line, not
/// necessarily the first — this narrower check is carried over verbatim
/// from the original rather than generalised, so a manifest a peer sends
/// with `id=` elsewhere is (deliberately) treated as malformed here.
pub fn extract_bid(manifest: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(manifest).ok()?;
    let rest = text.strip_prefix("ID=")?;
    let bid = rest.get(0..64)?;
    if bid.len() == 64 && bid.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(bid.to_ascii_uppercase())
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Manifest,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// The fragment was accepted, but the bundle isn't complete yet.
    Accepted,
    /// The fragment completed the manifest and/or body for this bundle.
    Complete,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NoteFragmentError {
    #[error("bid prefix '{0}' is ambiguous against an in-flight transfer")]
    AmbiguousPrefix(String),
}

/// One bundle's reassembly state for a single peer.
#[derive(Debug, Clone)]
pub struct PartialBundle {
    pub bid_prefix: String,
    pub bundle_version: i64,
    pub manifest_length: Option<usize>,
    pub body_length: Option<usize>,
    pub manifest_segments: SegmentList,
    pub body_segments: SegmentList,
    /// Logical clock, bumped on every `note_fragment` call this slot
    /// receives; the slot with the smallest value is the least recently
    /// updated and the first candidate for eviction when the table is full.
    last_updated_seq: u64,
}

impl PartialBundle {
    fn new(bid_prefix: String, bundle_version: i64, updated_seq: u64) -> Self {
        PartialBundle {
            bid_prefix,
            bundle_version,
            manifest_length: None,
            body_length: None,
            manifest_segments: SegmentList::new(),
            body_segments: SegmentList::new(),
            last_updated_seq: updated_seq,
        }
    }

    pub fn manifest_complete(&self) -> bool {
        self.manifest_length
            .map(|len| self.manifest_segments.is_complete(len))
            .unwrap_or(false)
    }

    pub fn body_complete(&self) -> bool {
        self.body_length
            .map(|len| self.body_segments.is_complete(len))
            .unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.manifest_complete() && self.body_complete()
    }

    pub fn assembled_manifest(&self) -> Option<Vec<u8>> {
        self.manifest_length
            .and_then(|len| self.manifest_segments.assemble(len))
    }

    pub fn assembled_body(&self) -> Option<Vec<u8>> {
        self.body_length.and_then(|len| self.body_segments.assemble(len))
    }
}

/// All bundles one peer currently has in flight, indexed by BID prefix.
#[derive(Debug, Default)]
pub struct PeerPartials {
    slots: HashMap<String, PartialBundle>,
    /// Monotonic counter handed out to `PartialBundle::last_updated_seq` on
    /// every touch, used to find the least-recently-updated slot for
    /// eviction. A logical clock rather than wall time, so eviction order
    /// is exact even when two fragments land in the same millisecond.
    next_seq: u64,
}

impl PeerPartials {
    pub fn new() -> Self {
        PeerPartials {
            slots: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn get(&self, bid_prefix: &str) -> Option<&PartialBundle> {
        self.slots.get(bid_prefix)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartialBundle> {
        self.slots.values()
    }

    pub fn clear(&mut self, bid_prefix: &str) {
        self.slots.remove(bid_prefix);
    }

    /// Removes any in-flight transfer whose BID prefix matches `bid` at a
    /// version no newer than `version`, used when a bundle shows up fully
    /// formed in the catalogue while a fragmented transfer for it is still
    /// in progress. The prefix match is case-insensitive, matching the
    /// original's cull semantics (hex BIDs arrive in whatever case a peer's
    /// radio line or a Rhizome listing row happens to use).
    pub fn cull(&mut self, bid: &str, version: i64) -> bool {
        let bid_lower = bid.to_ascii_lowercase();
        let matching: Vec<String> = self
            .slots
            .iter()
            .filter(|(prefix, p)| {
                version >= p.bundle_version && bid_lower.starts_with(&prefix.to_ascii_lowercase())
            })
            .map(|(prefix, _)| prefix.clone())
            .collect();
        let culled = !matching.is_empty();
        for prefix in matching {
            self.slots.remove(&prefix);
        }
        culled
    }

    /// Records a newly received byte range for either the manifest or body
    /// of the bundle identified by `bid_prefix`, creating a new in-flight
    /// slot if needed. If every slot is already occupied, the
    /// least-recently-updated one is evicted to make room, mirroring
    /// spec's "if all occupied, evict the least-recently-updated" rule —
    /// a stalled or abandoned transfer never permanently blocks new ones.
    pub fn note_fragment(
        &mut self,
        bid_prefix: &str,
        bundle_version: i64,
        kind: FragmentKind,
        total_length: usize,
        start_offset: usize,
        data: Vec<u8>,
    ) -> Result<FragmentOutcome, NoteFragmentError> {
        if !self.slots.contains_key(bid_prefix) && self.slots.len() >= MAX_BUNDLES_IN_FLIGHT {
            if let Some(oldest) = self
                .slots
                .iter()
                .min_by_key(|(_, p)| p.last_updated_seq)
                .map(|(prefix, _)| prefix.clone())
            {
                tracing::debug!(evicted = %oldest, bid_prefix, "partial table full, evicting least-recently-updated slot");
                self.slots.remove(&oldest);
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = self
            .slots
            .entry(bid_prefix.to_string())
            .or_insert_with(|| PartialBundle::new(bid_prefix.to_string(), bundle_version, seq));

        if slot.bundle_version != bundle_version {
            return Err(NoteFragmentError::AmbiguousPrefix(bid_prefix.to_string()));
        }
        slot.last_updated_seq = seq;

        match kind {
            FragmentKind::Manifest => {
                slot.manifest_length = Some(total_length);
                slot.manifest_segments.insert(start_offset, data);
            }
            FragmentKind::Body => {
                slot.body_length = Some(total_length);
                slot.body_segments.insert(start_offset, data);
            }
        }

        if slot.is_complete() {
            Ok(FragmentOutcome::Complete)
        } else {
            Ok(FragmentOutcome::Accepted)
        }
    }
}

/// All peers' in-flight transfers, keyed by peer identifier (station name
/// or ALE address string).
#[derive(Debug, Default)]
pub struct PartialTable {
    peers: HashMap<String, PeerPartials>,
}

impl PartialTable {
    pub fn new() -> Self {
        PartialTable {
            peers: HashMap::new(),
        }
    }

    pub fn peer(&mut self, peer_id: &str) -> &mut PeerPartials {
        self.peers.entry(peer_id.to_string()).or_default()
    }

    pub fn peer_ref(&self, peer_id: &str) -> Option<&PeerPartials> {
        self.peers.get(peer_id)
    }

    /// Culls any in-flight transfer across all peers superseded by a bundle
    /// that has just been fully catalogued.
    pub fn cull_all(&mut self, bid: &str, version: i64) {
        for (peer_id, peer) in self.peers.iter_mut() {
            if peer.cull(bid, version) {
                tracing::debug!(peer_id, bid, "culled in-progress transfer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_accumulate_until_both_halves_complete() {
        let mut peer = PeerPartials::new();
        let outcome = peer
            .note_fragment("abcd", 1, FragmentKind::Manifest, 4, 0, vec![1, 2, 3, 4])
            .unwrap();
        assert_eq!(outcome, FragmentOutcome::Accepted);

        let outcome = peer
            .note_fragment("abcd", 1, FragmentKind::Body, 2, 0, vec![9, 9])
            .unwrap();
        assert_eq!(outcome, FragmentOutcome::Complete);

        let p = peer.get("abcd").unwrap();
        assert_eq!(p.assembled_manifest().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(p.assembled_body().unwrap(), vec![9, 9]);
    }

    #[test]
    fn table_full_evicts_the_least_recently_updated_slot() {
        let mut peer = PeerPartials::new();
        for i in 0..MAX_BUNDLES_IN_FLIGHT {
            peer.note_fragment(&format!("bid{i}"), 1, FragmentKind::Manifest, 1, 0, vec![1])
                .unwrap();
        }
        // "bid0" was touched first and is now the least recently updated.
        peer.note_fragment("overflow", 1, FragmentKind::Manifest, 1, 0, vec![1])
            .unwrap();
        assert!(peer.get("bid0").is_none());
        assert!(peer.get("overflow").is_some());
        assert_eq!(peer.slots.len(), MAX_BUNDLES_IN_FLIGHT);
    }

    #[test]
    fn re_touching_a_slot_protects_it_from_eviction() {
        let mut peer = PeerPartials::new();
        for i in 0..MAX_BUNDLES_IN_FLIGHT {
            peer.note_fragment(&format!("bid{i}"), 1, FragmentKind::Manifest, 4, 0, vec![1])
                .unwrap();
        }
        // Touch "bid0" again so "bid1" becomes the oldest instead.
        peer.note_fragment("bid0", 1, FragmentKind::Manifest, 4, 1, vec![2])
            .unwrap();
        peer.note_fragment("overflow", 1, FragmentKind::Manifest, 1, 0, vec![1])
            .unwrap();
        assert!(peer.get("bid0").is_some());
        assert!(peer.get("bid1").is_none());
    }

    #[test]
    fn mismatched_version_on_same_prefix_is_ambiguous() {
        let mut peer = PeerPartials::new();
        peer.note_fragment("abcd", 1, FragmentKind::Manifest, 4, 0, vec![1, 2])
            .unwrap();
        let err = peer
            .note_fragment("abcd", 2, FragmentKind::Manifest, 4, 0, vec![1, 2])
            .unwrap_err();
        assert_eq!(err, NoteFragmentError::AmbiguousPrefix("abcd".to_string()));
    }

    #[test]
    fn cull_removes_transfers_superseded_by_a_newer_or_equal_version() {
        let mut peer = PeerPartials::new();
        peer.note_fragment("abcdef01", 3, FragmentKind::Manifest, 4, 0, vec![1, 2])
            .unwrap();
        assert!(peer.cull("abcdef0123456789", 3));
        assert!(peer.get("abcdef01").is_none());
    }

    #[test]
    fn cull_prefix_match_is_case_insensitive() {
        let mut peer = PeerPartials::new();
        peer.note_fragment("ABCDEF01", 3, FragmentKind::Manifest, 4, 0, vec![1, 2])
            .unwrap();
        assert!(peer.cull("abcdef0123456789", 3));
        assert!(peer.get("ABCDEF01").is_none());
    }

    #[test]
    fn cull_leaves_transfers_ahead_of_the_catalogued_version() {
        let mut peer = PeerPartials::new();
        peer.note_fragment("abcdef01", 5, FragmentKind::Manifest, 4, 0, vec![1, 2])
            .unwrap();
        assert!(!peer.cull("abcdef0123456789", 3));
        assert!(peer.get("abcdef01").is_some());
    }

    #[test]
    fn extract_bid_reads_the_id_header() {
        let bid = "A".repeat(64);
        let manifest = format!("ID={bid}\nservice=file\n");
        assert_eq!(extract_bid(manifest.as_bytes()), Some(bid));
    }

    #[test]
    fn extract_bid_rejects_manifests_without_the_literal_prefix() {
        let bid = "a".repeat(64);
        let manifest = format!("service=file\nid={bid}\n");
        assert_eq!(extract_bid(manifest.as_bytes()), None);
    }

    #[test]
    fn extract_bid_rejects_non_hex_payloads() {
        let manifest = format!("ID={}\n", "z".repeat(64));
        assert_eq!(extract_bid(manifest.as_bytes()), None);
    }
}
