//! The bundle catalogue: the authoritative record of every bundle this node
//! knows about, keyed by bundle id (BID).

use crate::partial::PartialTable;
use std::collections::HashMap;
use thiserror::Error;

/// Maximum number of distinct bundles tracked, mirroring the original's
/// `MAX_BUNDLES`.
pub const MAX_BUNDLES: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("catalogue is full ({MAX_BUNDLES} bundles)")]
    CatalogueFull,
}

/// A policy-driven rejection, distinct from [`RegisterError`]: the bundle
/// was handled fine, it's simply not wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotMeshms,
    TooOld,
    StaleVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    Updated,
    Rejected(Rejection),
}

#[derive(Debug, Clone)]
pub struct BundleRecord {
    pub bid: String,
    pub service: String,
    pub version: i64,
    pub author: String,
    pub originated_here: bool,
    pub length: i64,
    pub filehash: String,
    pub sender: String,
    pub recipient: String,
    pub last_offset_announced: i64,
    pub last_version_of_manifest_announced: i64,
    pub last_announced_time_ms: i64,
}

/// Filter policy applied before a bundle is admitted into the catalogue.
#[derive(Debug, Clone, Default)]
pub struct CatalogueFilter {
    pub meshms_only: bool,
    pub min_version: i64,
}

impl CatalogueFilter {
    fn reject(&self, service: &str, version: i64) -> Option<Rejection> {
        if self.meshms_only && !service.eq_ignore_ascii_case_prefix("meshms") {
            return Some(Rejection::NotMeshms);
        }
        if version < self.min_version && !service.eq_ignore_ascii_case_prefix("meshms2") {
            return Some(Rejection::TooOld);
        }
        None
    }
}

trait AsciiPrefix {
    fn eq_ignore_ascii_case_prefix(&self, prefix: &str) -> bool;
}

impl AsciiPrefix for str {
    fn eq_ignore_ascii_case_prefix(&self, prefix: &str) -> bool {
        self.len() >= prefix.len() && self[..prefix.len()].eq_ignore_ascii_case(prefix)
    }
}

#[derive(Debug, Default)]
pub struct Catalogue {
    filter: CatalogueFilter,
    bundles: HashMap<String, BundleRecord>,
}

impl Catalogue {
    pub fn new(filter: CatalogueFilter) -> Self {
        Catalogue {
            filter,
            bundles: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn get(&self, bid: &str) -> Option<&BundleRecord> {
        self.bundles.get(bid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BundleRecord> {
        self.bundles.values()
    }

    /// Admits or updates a bundle, applying the filter policy, rejecting
    /// stale versions of already-known bundles, and culling any in-flight
    /// partial transfer for the same bundle from `partials`.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        service: &str,
        bid: &str,
        version: i64,
        author: &str,
        originated_here: bool,
        length: i64,
        filehash: &str,
        sender: &str,
        recipient: &str,
        partials: &mut PartialTable,
    ) -> Result<RegisterOutcome, RegisterError> {
        if let Some(rejection) = self.filter.reject(service, version) {
            tracing::debug!(bid, service, ?rejection, "rejected bundle");
            return Ok(RegisterOutcome::Rejected(rejection));
        }

        partials.cull_all(bid, version);

        if let Some(existing) = self.bundles.get(bid) {
            if existing.version >= version {
                return Ok(RegisterOutcome::Rejected(Rejection::StaleVersion));
            }
        } else if self.bundles.len() >= MAX_BUNDLES {
            return Err(RegisterError::CatalogueFull);
        }

        let is_new = !self.bundles.contains_key(bid);
        self.bundles.insert(
            bid.to_string(),
            BundleRecord {
                bid: bid.to_string(),
                service: service.to_string(),
                version,
                author: author.to_string(),
                originated_here,
                length,
                filehash: filehash.to_string(),
                sender: sender.to_string(),
                recipient: recipient.to_string(),
                last_offset_announced: 0,
                last_version_of_manifest_announced: 0,
                last_announced_time_ms: 0,
            },
        );

        tracing::info!(bid, version, service, "bundle registered");
        Ok(if is_new {
            RegisterOutcome::Inserted
        } else {
            RegisterOutcome::Updated
        })
    }

    /// Picks the next bundle worth pushing out over the radio: the one not
    /// announced within `cooldown_ms`, preferring MeshMS traffic (the
    /// short-message service this whole exercise exists to prioritise) and
    /// otherwise the least recently announced, so every bundle eventually
    /// gets a turn.
    pub fn next_to_announce(&self, now_ms: i64, cooldown_ms: i64) -> Option<&BundleRecord> {
        self.bundles
            .values()
            .filter(|b| now_ms - b.last_announced_time_ms >= cooldown_ms)
            .min_by_key(|b| {
                let not_meshms = !b.service.eq_ignore_ascii_case_prefix("meshms");
                (not_meshms, b.last_announced_time_ms)
            })
    }

    /// Records that `bid` has just been offered to a peer over the radio.
    pub fn mark_announced(&mut self, bid: &str, now_ms: i64, offset: i64, manifest_version: i64) {
        if let Some(record) = self.bundles.get_mut(bid) {
            record.last_announced_time_ms = now_ms;
            record.last_offset_announced = offset;
            record.last_version_of_manifest_announced = manifest_version;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(
        cat: &mut Catalogue,
        bid: &str,
        version: i64,
        partials: &mut PartialTable,
    ) -> Result<RegisterOutcome, RegisterError> {
        cat.register(
            "file", bid, version, "author1", true, 100, "hash1", "s", "r", partials,
        )
    }

    #[test]
    fn new_bundle_is_inserted() {
        let mut cat = Catalogue::default();
        let mut partials = PartialTable::new();
        let outcome = register(&mut cat, "bid1", 1, &mut partials).unwrap();
        assert_eq!(outcome, RegisterOutcome::Inserted);
        assert_eq!(cat.len(), 1);
    }

    #[test]
    fn newer_version_updates_in_place() {
        let mut cat = Catalogue::default();
        let mut partials = PartialTable::new();
        register(&mut cat, "bid1", 1, &mut partials).unwrap();
        let outcome = register(&mut cat, "bid1", 2, &mut partials).unwrap();
        assert_eq!(outcome, RegisterOutcome::Updated);
        assert_eq!(cat.get("bid1").unwrap().version, 2);
    }

    #[test]
    fn older_or_equal_version_is_rejected() {
        let mut cat = Catalogue::default();
        let mut partials = PartialTable::new();
        register(&mut cat, "bid1", 2, &mut partials).unwrap();
        let outcome = register(&mut cat, "bid1", 2, &mut partials).unwrap();
        assert_eq!(outcome, RegisterOutcome::Rejected(Rejection::StaleVersion));
        assert_eq!(cat.get("bid1").unwrap().version, 2);
    }

    #[test]
    fn meshms_only_filters_other_services() {
        let mut cat = Catalogue::new(CatalogueFilter {
            meshms_only: true,
            min_version: 0,
        });
        let mut partials = PartialTable::new();
        let outcome = cat
            .register(
                "file", "bid1", 1, "author1", true, 100, "hash1", "s", "r", &mut partials,
            )
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Rejected(Rejection::NotMeshms));
        assert!(cat.is_empty());
    }

    #[test]
    fn too_old_is_rejected_unless_meshms2() {
        let mut cat = Catalogue::new(CatalogueFilter {
            meshms_only: false,
            min_version: 10,
        });
        let mut partials = PartialTable::new();
        let outcome = cat
            .register(
                "file", "bid1", 5, "author1", true, 100, "hash1", "s", "r", &mut partials,
            )
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Rejected(Rejection::TooOld));

        let outcome = cat
            .register(
                "meshms2", "bid2", 5, "author1", true, 100, "hash1", "s", "r", &mut partials,
            )
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::Inserted);
    }

    #[test]
    fn registering_culls_matching_in_flight_transfer() {
        use crate::partial::FragmentKind;

        let mut cat = Catalogue::default();
        let mut partials = PartialTable::new();
        partials
            .peer("peerA")
            .note_fragment("bid1pre", 1, FragmentKind::Manifest, 10, 0, vec![1, 2, 3])
            .unwrap();

        register(&mut cat, "bid1prefixvalue", 1, &mut partials).unwrap();

        assert!(partials.peer_ref("peerA").unwrap().get("bid1pre").is_none());
    }

    #[test]
    fn catalogue_full_is_reported() {
        let mut cat = Catalogue::default();
        let mut partials = PartialTable::new();
        for i in 0..MAX_BUNDLES {
            register(&mut cat, &format!("bid{i}"), 1, &mut partials).unwrap();
        }
        let err = register(&mut cat, "overflow", 1, &mut partials).unwrap_err();
        assert_eq!(err, RegisterError::CatalogueFull);
    }

    #[test]
    fn meshms_bundles_are_preferred_for_announcement() {
        let mut cat = Catalogue::default();
        let mut partials = PartialTable::new();
        register(&mut cat, "filebid", 1, &mut partials).unwrap();
        cat.register(
            "MeshMS2", "msgbid", 1, "author1", true, 10, "hash1", "s", "r", &mut partials,
        )
        .unwrap();

        let next = cat.next_to_announce(1000, 0).unwrap();
        assert_eq!(next.bid, "msgbid");
    }

    #[test]
    fn a_bundle_within_its_announcement_cooldown_is_skipped() {
        let mut cat = Catalogue::default();
        let mut partials = PartialTable::new();
        register(&mut cat, "bid1", 1, &mut partials).unwrap();
        cat.mark_announced("bid1", 1000, 0, 1);

        assert!(cat.next_to_announce(1500, 1000).is_none());
        assert!(cat.next_to_announce(2001, 1000).is_some());
    }
}
