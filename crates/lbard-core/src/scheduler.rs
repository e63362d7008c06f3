//! The outer cooperative loop: one thread, one tick at a time, pulling new
//! bundles from Rhizome, servicing the radio driver, and folding any
//! fragments that complete a bundle back into a push.

use crate::catalogue::Catalogue;
use crate::partial::{FragmentKind, PartialTable};
use crate::radio::{RadioDriver, ServiceResult};
use crate::rhizome::{PullState, RhizomeTransport};
use crate::time_account::TimeAccount;
use std::time::Duration;

/// How long a single `RadioDriver::service` call may block before the
/// scheduler reclaims the thread for the next phase.
const RADIO_SERVICE_BUDGET: Duration = Duration::from_millis(200);

pub struct Scheduler {
    pub catalogue: Catalogue,
    pub partials: PartialTable,
    pub pull_state: PullState,
    pub time_account: TimeAccount,
    radio: Box<dyn RadioDriver>,
    transport: Box<dyn RhizomeTransport>,
    tick_interval: Duration,
    /// When set, a discarded partial's raw manifest/body buffers are
    /// written here as `lbard.rejected.{manifest,body}` for offline
    /// inspection, mirroring the original's debug-build dump.
    debug_log_dir: Option<std::path::PathBuf>,
}

impl Scheduler {
    pub fn new(
        catalogue: Catalogue,
        radio: Box<dyn RadioDriver>,
        transport: Box<dyn RhizomeTransport>,
        tick_interval: Duration,
    ) -> Self {
        Scheduler {
            catalogue,
            partials: PartialTable::new(),
            pull_state: PullState::new(),
            time_account: TimeAccount::new(),
            radio,
            transport,
            tick_interval,
            debug_log_dir: None,
        }
    }

    /// Enables the C12 debug side channel: a discarded partial's manifest
    /// and body are dumped to `dir` instead of being silently dropped.
    pub fn with_debug_log_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.debug_log_dir = Some(dir.into());
        self
    }

    fn dump_rejected(&self, manifest: &[u8], body: &[u8]) {
        let Some(dir) = &self.debug_log_dir else {
            return;
        };
        if let Err(e) = std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::write(dir.join("lbard.rejected.manifest"), manifest))
            .and_then(|_| std::fs::write(dir.join("lbard.rejected.body"), body))
        {
            tracing::warn!(error = %e, "failed to dump rejected partial to debug log dir");
        }
    }

    /// Runs one full cycle: pull new bundles, service the radio, and fold
    /// any freshly completed fragments into the catalogue. Never blocks
    /// longer than `RADIO_SERVICE_BUDGET` in the radio phase.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        self.time_account.account_time("pull_rhizome");
        match self
            .pull_state
            .pull(&*self.transport, &mut self.catalogue, &mut self.partials)
        {
            Ok(outcome) => {
                if outcome.rows_registered > 0 {
                    tracing::info!(
                        rows_seen = outcome.rows_seen,
                        rows_registered = outcome.rows_registered,
                        "pulled rhizome bundle list"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "rhizome pull failed"),
        }

        self.time_account.account_time("service_radio");
        let mut fragments: Vec<String> = Vec::new();
        self.radio
            .service(RADIO_SERVICE_BUDGET, &mut |bytes| {
                if let Ok(text) = std::str::from_utf8(bytes) {
                    fragments.push(text.to_string());
                }
            })?;

        self.time_account.account_time("fold_fragments");
        for fragment in fragments {
            self.handle_fragment(&fragment);
        }

        self.time_account.account_time("announce_radio");
        self.announce_next();

        Ok(())
    }

    /// Applies one received AMD fragment payload to the in-flight partial
    /// table. The wire framing (sequence/index/count header, hex payload)
    /// is the radio driver's concern; by the time bytes reach here they are
    /// `<bid-prefix>:<version>:<manifest|body>:<offset>:<total>:<hex-data>`.
    fn handle_fragment(&mut self, fragment: &str) {
        let Some(parsed) = parse_fragment(fragment) else {
            tracing::debug!(fragment, "unparseable fragment, dropping");
            return;
        };

        let peer = self.partials.peer("radio");
        match peer.note_fragment(
            &parsed.bid_prefix,
            parsed.version,
            parsed.kind,
            parsed.total_len,
            parsed.offset,
            parsed.data,
        ) {
            Ok(crate::partial::FragmentOutcome::Complete) => {
                tracing::info!(bid_prefix = %parsed.bid_prefix, "bundle reassembly complete");
                self.finalise(&parsed.bid_prefix);
            }
            Ok(crate::partial::FragmentOutcome::Accepted) => {}
            Err(e) => tracing::debug!(error = %e, "fragment rejected"),
        }
    }

    /// A partial bundle's manifest and body have both assembled in full:
    /// extract its BID, check it against the peer's announced prefix, and
    /// hand the pair to the Rhizome collaborator for import. The slot is
    /// only cleared on a successful import — any other outcome (bad
    /// manifest header, prefix mismatch, non-2xx import) leaves it for the
    /// table's eviction policy to retry or replace.
    fn finalise(&mut self, bid_prefix: &str) {
        let peer = self.partials.peer("radio");
        let Some(bundle) = peer.get(bid_prefix) else {
            return;
        };
        let (Some(manifest), Some(body)) =
            (bundle.assembled_manifest(), bundle.assembled_body())
        else {
            return;
        };

        let Some(bid) = crate::partial::extract_bid(&manifest) else {
            tracing::warn!(bid_prefix, "discarding partial: malformed manifest header");
            self.dump_rejected(&manifest, &body);
            self.partials.peer("radio").clear(bid_prefix);
            return;
        };
        if !bid.to_ascii_lowercase().starts_with(&bid_prefix.to_ascii_lowercase()) {
            tracing::warn!(bid_prefix, bid, "discarding partial: BID/prefix mismatch");
            self.dump_rejected(&manifest, &body);
            self.partials.peer("radio").clear(bid_prefix);
            return;
        }

        match self.pull_state.push(&*self.transport, &manifest, &body) {
            Ok(crate::rhizome::PushOutcome::Accepted) => {
                tracing::info!(bid, "bundle pushed to rhizome");
                self.partials.peer("radio").clear(bid_prefix);
            }
            Ok(crate::rhizome::PushOutcome::Rejected(status)) => {
                tracing::debug!(bid, status, "rhizome import rejected, retrying later");
            }
            Err(e) => tracing::warn!(bid, error = %e, "rhizome import failed, retrying later"),
        }
    }

    /// Offers the next due bundle to the radio, if the link is ready to
    /// accept a send, bracketing the (possibly blocking, multi-fragment)
    /// send with the time-accounting pause/resume the scheduler uses for
    /// every suspension point outside its own phases.
    fn announce_next(&mut self) {
        const ANNOUNCE_COOLDOWN_MS: i64 = 5_000;

        if !self.radio.ready() {
            return;
        }
        let now = crate::gettime_ms();
        let Some(record) = self.catalogue.next_to_announce(now, ANNOUNCE_COOLDOWN_MS) else {
            return;
        };
        let bid = record.bid.clone();
        let version = record.version;
        let frame = format!("{bid}:{version}:{}", record.service).into_bytes();

        self.time_account.pause();
        let sent = self.radio.send_packet(&frame);
        self.time_account.resume();

        match sent {
            Ok(true) => {
                tracing::info!(bid, version, "announced bundle to radio");
                self.catalogue.mark_announced(&bid, now, 0, version);
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(bid, error = %e, "radio send failed"),
        }
    }

    /// Drives the scheduler forever, pacing ticks by `tick_interval` and
    /// folding the sleep into the time-accounting pause/resume bracket so
    /// it is never misattributed to whichever phase ran last.
    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.tick()?;
            self.time_account.pause();
            std::thread::sleep(self.tick_interval);
            self.time_account.resume();
        }
    }
}

struct ParsedFragment {
    bid_prefix: String,
    version: i64,
    kind: FragmentKind,
    offset: usize,
    total_len: usize,
    data: Vec<u8>,
}

fn parse_fragment(s: &str) -> Option<ParsedFragment> {
    let mut parts = s.splitn(6, ':');
    let bid_prefix = parts.next()?.to_string();
    let version: i64 = parts.next()?.parse().ok()?;
    let kind = match parts.next()? {
        "manifest" => FragmentKind::Manifest,
        "body" => FragmentKind::Body,
        _ => return None,
    };
    let offset: usize = parts.next()?.parse().ok()?;
    let total_len: usize = parts.next()?.parse().ok()?;
    let hex = parts.next()?;
    let data = hex_decode(hex)?;
    Some(ParsedFragment {
        bid_prefix,
        version,
        kind,
        offset,
        total_len,
        data,
    })
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::CatalogueFilter;
    use std::collections::VecDeque;
    use std::time::Duration as StdDuration;

    struct FakeRadio {
        inbox: VecDeque<String>,
    }

    impl RadioDriver for FakeRadio {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn ready(&self) -> bool {
            true
        }
        fn service(
            &mut self,
            _max_block: StdDuration,
            on_receive: &mut dyn FnMut(&[u8]),
        ) -> anyhow::Result<ServiceResult> {
            if let Some(line) = self.inbox.pop_front() {
                on_receive(line.as_bytes());
                Ok(ServiceResult::Progressed)
            } else {
                Ok(ServiceResult::Idle)
            }
        }
        fn send_packet(&mut self, _packet: &[u8]) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    struct EmptyTransport;
    impl RhizomeTransport for EmptyTransport {
        fn get_bundle_list(
            &self,
            _path: &str,
            _timeout: StdDuration,
        ) -> anyhow::Result<(u16, String, i64)> {
            Ok((200, String::new(), crate::gettime_ms() - 10_000))
        }
        fn post_bundle(
            &self,
            _manifest: &[u8],
            _body: &[u8],
            _timeout: StdDuration,
        ) -> anyhow::Result<u16> {
            Ok(200)
        }
    }

    fn scheduler_with_fragments(fragments: Vec<String>) -> Scheduler {
        Scheduler::new(
            Catalogue::new(CatalogueFilter::default()),
            Box::new(FakeRadio {
                inbox: fragments.into(),
            }),
            Box::new(EmptyTransport),
            StdDuration::from_millis(1),
        )
    }

    #[test]
    fn tick_with_no_radio_traffic_does_not_error() {
        let mut scheduler = scheduler_with_fragments(vec![]);
        scheduler.tick().unwrap();
    }

    #[test]
    fn tick_folds_a_complete_bundle_and_pushes_it_to_rhizome() {
        let bid = format!("abcd1234{}", "0".repeat(56));
        let manifest = format!("ID={bid}\n");
        let manifest_hex = hex_encode(manifest.as_bytes());
        let body_hex = hex_encode(b"body!");
        let mut scheduler = scheduler_with_fragments(vec![
            format!(
                "abcd1234:1:manifest:0:{}:{manifest_hex}",
                manifest.len()
            ),
            format!("abcd1234:1:body:0:5:{body_hex}"),
        ]);

        scheduler.tick().unwrap();
        scheduler.tick().unwrap();

        // A successful push clears the in-flight slot; the bundle is now
        // Rhizome's responsibility, not the radio driver's.
        assert!(scheduler.partials.peer_ref("radio").unwrap().get("abcd1234").is_none());
    }

    #[test]
    fn a_manifest_missing_the_id_header_is_discarded_without_pushing() {
        let manifest_hex = hex_encode(b"manifest!");
        let body_hex = hex_encode(b"body!");
        let mut scheduler = scheduler_with_fragments(vec![
            format!("abcd1234:1:manifest:0:9:{manifest_hex}"),
            format!("abcd1234:1:body:0:5:{body_hex}"),
        ]);

        scheduler.tick().unwrap();
        scheduler.tick().unwrap();

        assert!(scheduler.partials.peer_ref("radio").unwrap().get("abcd1234").is_none());
    }

    #[test]
    fn malformed_fragment_is_dropped_without_panicking() {
        let mut scheduler = scheduler_with_fragments(vec!["not-a-fragment".to_string()]);
        scheduler.tick().unwrap();
        assert!(scheduler.partials.peer_ref("radio").is_none());
    }

    fn hex_encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
