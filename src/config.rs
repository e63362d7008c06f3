//! `lbard.toml` configuration: the Rhizome endpoint, the radio driver and
//! serial device, filter policy, a seed station table, and the debug side
//! channel.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level LBARD configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LbardConfig {
    #[serde(default)]
    pub rhizome: RhizomeConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Seed station table, used to prime the HF/ALE station table before
    /// any `AIATBL` response has arrived from the modem.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    #[serde(default)]
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RhizomeConfig {
    #[serde(default = "RhizomeConfig::default_server")]
    pub server: String,
    #[serde(default)]
    pub credential: String,
}

impl RhizomeConfig {
    fn default_server() -> String {
        "http://localhost:4110".into()
    }
}

impl Default for RhizomeConfig {
    fn default() -> Self {
        Self {
            server: Self::default_server(),
            credential: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RadioConfig {
    /// Driver id, e.g. `"hfbarrett"` — the only driver this build ships.
    #[serde(default = "RadioConfig::default_driver")]
    pub driver: String,
    #[serde(default = "RadioConfig::default_device")]
    pub device: String,
    #[serde(default = "RadioConfig::default_baud")]
    pub baud: u32,
    /// This node's own 2-character ALE self index, used to match link
    /// table entries against the station table.
    #[serde(default = "RadioConfig::default_self_index")]
    pub self_index: String,
    /// Scheduler tick pacing.
    #[serde(default = "RadioConfig::default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl RadioConfig {
    fn default_driver() -> String {
        "hfbarrett".into()
    }
    fn default_device() -> String {
        "/dev/ttyUSB0".into()
    }
    fn default_baud() -> u32 {
        38400
    }
    fn default_self_index() -> String {
        "00".into()
    }
    fn default_tick_interval_ms() -> u64 {
        1000
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            driver: Self::default_driver(),
            device: Self::default_device(),
            baud: Self::default_baud(),
            self_index: Self::default_self_index(),
            tick_interval_ms: Self::default_tick_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Only admit bundles whose service begins with `meshms` (case
    /// insensitive) into the catalogue.
    #[serde(default)]
    pub meshms_only: bool,
    /// Reject bundles older than this version, except `meshms2` journal
    /// bundles, whose version is an append offset rather than a timestamp.
    #[serde(default)]
    pub min_version: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerEntry {
    pub name: String,
    /// 2-character ALE station index.
    pub index: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DebugConfig {
    /// Mirror every `register()` outcome to `<log_dir>/lbard-rhizome.log`.
    #[serde(default)]
    pub log_registrations: bool,
    /// Directory the debug side channel writes into; created if missing.
    #[serde(default = "DebugConfig::default_log_dir")]
    pub log_dir: String,
}

impl DebugConfig {
    fn default_log_dir() -> String {
        "/var/log/lbard".into()
    }
}

impl LbardConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// A representative starting point for a two-node HF/ALE link,
    /// printed by `lbard init`.
    pub fn default_example() -> Self {
        Self {
            rhizome: RhizomeConfig::default(),
            radio: RadioConfig::default(),
            policy: PolicyConfig {
                meshms_only: false,
                min_version: 0,
            },
            peers: vec![
                PeerEntry {
                    name: "base-camp".into(),
                    index: "01".into(),
                },
                PeerEntry {
                    name: "field-unit-2".into(),
                    index: "02".into(),
                },
            ],
            debug: DebugConfig {
                log_registrations: false,
                log_dir: DebugConfig::default_log_dir(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let example = LbardConfig::default_example();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed: LbardConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.rhizome.server, example.rhizome.server);
        assert_eq!(parsed.peers.len(), 2);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: LbardConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.radio.driver, "hfbarrett");
        assert_eq!(cfg.policy.min_version, 0);
        assert!(cfg.peers.is_empty());
    }
}
