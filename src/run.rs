//! `lbard run` — the long-lived scheduler loop.
//!
//! Opens the configured radio, wires it and a Rhizome REST client into the
//! core [`Scheduler`](lbard_core::Scheduler), seeds the station table from
//! config, and drives ticks until the process is killed. This is the only
//! subcommand that doesn't return under normal operation.

use anyhow::Result;
use lbard_core::{BarrettSerialDriver, Catalogue, CatalogueFilter, RhizomeClient, Scheduler, Station};
use std::time::Duration;

use crate::config::LbardConfig;

pub fn run(config: &LbardConfig) -> Result<()> {
    anyhow::ensure!(
        config.radio.driver == "hfbarrett",
        "unknown radio driver '{}': this build only ships the hfbarrett driver",
        config.radio.driver
    );

    tracing::info!(
        device = %config.radio.device,
        baud = config.radio.baud,
        rhizome = %config.rhizome.server,
        "starting lbard"
    );

    let mut driver = BarrettSerialDriver::open(
        &config.radio.device,
        config.radio.baud,
        config.radio.self_index.clone(),
    )?;
    for peer in &config.peers {
        driver.stations_mut().push(Station {
            name: peer.name.clone(),
            index: peer.index.clone(),
            consecutive_connection_failures: 0,
        });
    }

    let transport = RhizomeClient::new(
        config.rhizome.server.clone(),
        config.rhizome.credential.clone(),
    );

    let catalogue = Catalogue::new(CatalogueFilter {
        meshms_only: config.policy.meshms_only,
        min_version: config.policy.min_version,
    });

    let mut scheduler = Scheduler::new(
        catalogue,
        Box::new(driver),
        Box::new(transport),
        Duration::from_millis(config.radio.tick_interval_ms),
    );
    if config.debug.log_registrations {
        scheduler = scheduler.with_debug_log_dir(&config.debug.log_dir);
    }

    scheduler.run()
}
