//! Core engine for LBARD: bundle catalogue, partial-reassembly, Rhizome
//! collaborator, radio driver framework, and the HF/ALE Barrett state
//! machine. Everything here is transport-agnostic and single-threaded;
//! the binary crate wires it to a config, a serial port, and an HTTP
//! client and drives it from one cooperative loop.

pub mod barrett;
pub mod catalogue;
pub mod partial;
pub mod radio;
pub mod rhizome;
pub mod scheduler;
pub mod segment;
pub mod time_account;

pub use barrett::{BarrettProtocol, BarrettSerialDriver, HfState, Station};
pub use catalogue::{BundleRecord, Catalogue, CatalogueFilter, RegisterError};
pub use partial::{extract_bid, FragmentOutcome, NoteFragmentError, PartialTable};
pub use radio::RadioDriver;
pub use rhizome::{PullOutcome, PushOutcome, RhizomeClient, RhizomeTransport};
pub use scheduler::Scheduler;
pub use segment::Segment;
pub use time_account::TimeAccount;

/// Milliseconds since the Unix epoch, the clock unit used throughout the
/// engine (mirrors the original's `gettime_ms()`).
pub fn gettime_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
