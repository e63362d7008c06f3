//! Collaborator with the local Rhizome store: pulls new/changed bundles
//! into the [`Catalogue`](crate::catalogue::Catalogue) and pushes
//! reassembled bundles back in.

use crate::catalogue::{Catalogue, RegisterError};
use crate::partial::PartialTable;
use std::time::Duration;

/// Row layout of the Rhizome `bundlelist.json` feed: index of each field
/// this collaborator cares about. Matches the original's 14-column parse.
mod field {
    pub const TOKEN: usize = 0;
    pub const SERVICE: usize = 2;
    pub const BID: usize = 3;
    pub const VERSION: usize = 4;
    pub const AUTHOR: usize = 7;
    pub const ORIGINATED_HERE: usize = 8;
    pub const LENGTH: usize = 9;
    pub const FILEHASH: usize = 10;
    pub const SENDER: usize = 11;
    pub const RECIPIENT: usize = 12;
    pub const ROW_LEN: usize = 14;
}

/// Thin transport seam so the pull/push logic can be tested without a real
/// HTTP server. The production implementation wraps `reqwest::blocking`.
pub trait RhizomeTransport {
    /// Fetches a bundle-list page at `path`. Returns the HTTP status, the
    /// response body, and how long (in ms since the epoch) it took the
    /// server to finish sending it, so the caller can detect a truncated
    /// read.
    fn get_bundle_list(&self, path: &str, timeout: Duration) -> anyhow::Result<(u16, String, i64)>;

    /// Submits a manifest/body pair for import, returning the HTTP status.
    fn post_bundle(
        &self,
        manifest: &[u8],
        body: &[u8],
        timeout: Duration,
    ) -> anyhow::Result<u16>;
}

/// `reqwest`-backed transport against a local Rhizome REST endpoint.
pub struct RhizomeClient {
    client: reqwest::blocking::Client,
    base_url: String,
    credential: String,
}

impl RhizomeClient {
    pub fn new(base_url: impl Into<String>, credential: impl Into<String>) -> Self {
        RhizomeClient {
            client: reqwest::blocking::Client::new(),
            base_url: base_url.into(),
            credential: credential.into(),
        }
    }
}

impl RhizomeTransport for RhizomeClient {
    /// Streams the response body instead of calling `resp.text()`, so
    /// `last_read_ms` reflects the instant the last byte actually arrived
    /// on the socket rather than the instant the whole body finished
    /// parsing. The token-gating check in `pull()` depends on that
    /// distinction: a fetch that is still trickling in when the timeout
    /// fires must be reported as such, not as having completed "just now".
    fn get_bundle_list(&self, path: &str, timeout: Duration) -> anyhow::Result<(u16, String, i64)> {
        use std::io::Read;

        let url = format!("{}{}", self.base_url, path);
        let mut resp = self
            .client
            .get(&url)
            .basic_auth("lbard", Some(&self.credential))
            .timeout(timeout)
            .send()?;
        let status = resp.status().as_u16();

        let mut buf = [0u8; 8192];
        let mut body = Vec::new();
        let mut last_read_ms = crate::gettime_ms();
        loop {
            match resp.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    body.extend_from_slice(&buf[..n]);
                    last_read_ms = crate::gettime_ms();
                }
                Err(e) if !body.is_empty() => {
                    // Timed out (or otherwise failed) partway through a
                    // non-empty read: treat what we have as a truncated
                    // fetch rather than failing the whole pull outright.
                    tracing::debug!(error = %e, "rhizome bundle list read ended early");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok((status, String::from_utf8_lossy(&body).into_owned(), last_read_ms))
    }

    fn post_bundle(&self, manifest: &[u8], body: &[u8], timeout: Duration) -> anyhow::Result<u16> {
        let url = format!("{}/rhizome/import", self.base_url);
        let form = reqwest::blocking::multipart::Form::new()
            .part(
                "manifest",
                reqwest::blocking::multipart::Part::bytes(manifest.to_vec()),
            )
            .part(
                "payload",
                reqwest::blocking::multipart::Part::bytes(body.to_vec()),
            );
        let resp = self
            .client
            .post(&url)
            .basic_auth("lbard", Some(&self.credential))
            .timeout(timeout)
            .multipart(form)
            .send()?;
        Ok(resp.status().as_u16())
    }
}

#[derive(Debug, Default)]
pub struct PullState {
    token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOutcome {
    pub rows_seen: usize,
    pub rows_registered: usize,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    Rejected(u16),
}

impl PullState {
    pub fn new() -> Self {
        PullState { token: None }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Queries the Rhizome store for new or changed bundles and registers
    /// them into `catalogue`. Roughly 1-in-16 calls force a full list fetch
    /// even when a progressive-fetch token is held, to guard against a
    /// token silently going stale.
    pub fn pull(
        &mut self,
        transport: &dyn RhizomeTransport,
        catalogue: &mut Catalogue,
        partials: &mut PartialTable,
    ) -> anyhow::Result<PullOutcome> {
        let force_full = self.token.is_none() || rand::random::<u8>() & 0xf == 0;
        let (path, timeout) = match (&self.token, force_full) {
            (Some(token), false) => (
                format!("/restful/rhizome/newsince/{token}/bundlelist.json"),
                Duration::from_millis(2000),
            ),
            _ => (
                "/restful/rhizome/bundlelist.json".to_string(),
                Duration::from_millis(2000),
            ),
        };

        let (status, body, last_read_ms) = transport.get_bundle_list(&path, timeout)?;
        anyhow::ensure!(status == 200, "rhizome HTTP API request failed: {path} -> {status}");

        // A read that ran right up to the edge of its time budget may not
        // have captured the whole list; if so, don't trust a new token.
        let ignore_token = (crate::gettime_ms() - last_read_ms) < 100;

        let rows = parse_bundle_list(&body);
        let mut rows_registered = 0;
        let mut new_token = self.token.clone();

        for row in &rows {
            if row.len() != field::ROW_LEN {
                continue;
            }
            if row[field::TOKEN] != "null" && !ignore_token {
                new_token = Some(row[field::TOKEN].clone());
            }

            let version: i64 = row[field::VERSION].parse().unwrap_or(0);
            let length: i64 = row[field::LENGTH].parse().unwrap_or(0);
            let originated_here = row[field::ORIGINATED_HERE] != "0";

            let outcome = catalogue.register(
                &row[field::SERVICE],
                &row[field::BID],
                version,
                &row[field::AUTHOR],
                originated_here,
                length,
                &row[field::FILEHASH],
                &row[field::SENDER],
                &row[field::RECIPIENT],
                partials,
            );
            match outcome {
                Ok(_) => rows_registered += 1,
                Err(RegisterError::CatalogueFull) => {
                    tracing::warn!("catalogue full, dropping remaining rows this pull");
                    break;
                }
            }
        }

        self.token = new_token.clone();
        Ok(PullOutcome {
            rows_seen: rows.len(),
            rows_registered,
            token: new_token,
        })
    }

    /// Submits a reassembled manifest/body pair to the Rhizome store.
    pub fn push(
        &self,
        transport: &dyn RhizomeTransport,
        manifest: &[u8],
        body: &[u8],
    ) -> anyhow::Result<PushOutcome> {
        let status = transport.post_bundle(manifest, body, Duration::from_millis(15000))?;
        if (200..=202).contains(&status) {
            Ok(PushOutcome::Accepted)
        } else {
            Ok(PushOutcome::Rejected(status))
        }
    }
}

/// Parses the simple tab-separated bundle-list rows this collaborator
/// expects (one logical row per line, fields separated by `\t`), mirroring
/// the fixed-width-field parse the original performed over its JSON lines.
fn parse_bundle_list(body: &str) -> Vec<Vec<String>> {
    body.lines()
        .filter(|line| !line.is_empty())
        .map(|line| line.split('\t').map(|f| f.to_string()).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FakeTransport {
        list_body: String,
        last_read_ms: i64,
        post_status: u16,
        posted: RefCell<Vec<(Vec<u8>, Vec<u8>)>>,
    }

    impl RhizomeTransport for FakeTransport {
        fn get_bundle_list(
            &self,
            _path: &str,
            _timeout: Duration,
        ) -> anyhow::Result<(u16, String, i64)> {
            Ok((200, self.list_body.clone(), self.last_read_ms))
        }

        fn post_bundle(
            &self,
            manifest: &[u8],
            body: &[u8],
            _timeout: Duration,
        ) -> anyhow::Result<u16> {
            self.posted
                .borrow_mut()
                .push((manifest.to_vec(), body.to_vec()));
            Ok(self.post_status)
        }
    }

    fn sample_row(bid: &str, version: i64) -> String {
        format!(
            "tok1\tx\tfile\t{bid}\t{version}\tx\tx\tauth\t1\t100\thash\tsnd\trcp\ty"
        )
    }

    #[test]
    fn pull_registers_every_well_formed_row() {
        let transport = FakeTransport {
            list_body: format!("{}\n{}", sample_row("bidA", 1), sample_row("bidB", 2)),
            last_read_ms: crate::gettime_ms() - 5000,
            post_status: 200,
            posted: RefCell::new(Vec::new()),
        };
        let mut state = PullState::new();
        let mut catalogue = Catalogue::default();
        let mut partials = PartialTable::new();

        let outcome = state.pull(&transport, &mut catalogue, &mut partials).unwrap();
        assert_eq!(outcome.rows_seen, 2);
        assert_eq!(outcome.rows_registered, 2);
        assert_eq!(catalogue.len(), 2);
    }

    #[test]
    fn pull_ignores_a_fresh_token_when_the_read_ran_to_the_wire() {
        let transport = FakeTransport {
            list_body: sample_row("bidA", 1),
            last_read_ms: crate::gettime_ms(),
            post_status: 200,
            posted: RefCell::new(Vec::new()),
        };
        let mut state = PullState::new();
        let mut catalogue = Catalogue::default();
        let mut partials = PartialTable::new();

        let outcome = state.pull(&transport, &mut catalogue, &mut partials).unwrap();
        assert_eq!(outcome.token, None);
    }

    #[test]
    fn push_reports_acceptance_range_correctly() {
        let transport = FakeTransport {
            list_body: String::new(),
            last_read_ms: 0,
            post_status: 202,
            posted: RefCell::new(Vec::new()),
        };
        let state = PullState::new();
        let outcome = state.push(&transport, b"manifest", b"body").unwrap();
        assert_eq!(outcome, PushOutcome::Accepted);
        assert_eq!(transport.posted.borrow().len(), 1);
    }

    #[test]
    fn push_reports_rejection_outside_the_2xx_import_range() {
        let transport = FakeTransport {
            list_body: String::new(),
            last_read_ms: 0,
            post_status: 500,
            posted: RefCell::new(Vec::new()),
        };
        let state = PullState::new();
        let outcome = state.push(&transport, b"manifest", b"body").unwrap();
        assert_eq!(outcome, PushOutcome::Rejected(500));
    }
}
