//! `lbard status` — show recent activity from the debug side channel.
//!
//! LBARD has no persistent state of its own — Rhizome is the source of
//! truth and the progressive-fetch token lives only in the running
//! process's memory — so there is nothing for a separate CLI invocation to
//! query directly. When `debug.log_registrations` is enabled, this renders
//! the tail of the mirrored `lbard-rhizome.log`, which is the same log the
//! original's HTML status page would have read from externally.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use std::path::Path;

use crate::color;
use crate::config::LbardConfig;

const TAIL_LINES: usize = 40;

pub fn run(config: &LbardConfig) -> Result<()> {
    if !config.debug.log_registrations {
        println!(
            "Debug logging is disabled (debug.log_registrations = false in config)."
        );
        println!("Enable it to let `lbard status` show recent activity, or tail stderr");
        println!("of a running `lbard run` (e.g. under `journalctl -u lbard -f`).");
        return Ok(());
    }

    let log_path = Path::new(&config.debug.log_dir).join("lbard-rhizome.log");
    let content = match std::fs::read_to_string(&log_path) {
        Ok(c) => c,
        Err(_) => {
            println!("No activity log found at {}.", log_path.display());
            println!("Start the service first: lbard service start");
            return Ok(());
        }
    };

    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        println!("Activity log is empty — service may just be starting.");
        return Ok(());
    }

    let now = Utc::now();
    println!("{}", color::bold_cyan(&format!("LBARD STATUS  {}", now.format("%Y-%m-%d %H:%M:%S UTC"))));
    println!("Log: {}", log_path.display());
    println!();

    let tail = lines.iter().rev().take(TAIL_LINES).rev();
    for line in tail {
        println!("  {}", line);
    }

    println!();
    println!("Showing the last {} line(s) of {} total.", lines.len().min(TAIL_LINES), lines.len());
    Ok(())
}

/// Formats a `TimeAccount` excursion table (`recent` or `alltime`) the way
/// the original's `show_time_accounting()` rendered it to the HTML status
/// page — here as a plain-text table for the terminal.
#[allow(dead_code)]
pub fn render_excursions(label: &str, excursions: &[lbard_core::time_account::Excursion]) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", color::bold(label)));
    if excursions.is_empty() {
        out.push_str("  (none recorded)\n");
        return out;
    }
    for e in excursions {
        let when = Utc.timestamp_millis_opt(e.when_ms).single();
        let when_str = when
            .map(|d| d.format("%H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| "?".into());
        out.push_str(&format!(
            "  {:>8} ms  {:<24} at {}\n",
            e.duration_ms, e.source, when_str
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbard_core::time_account::Excursion;

    #[test]
    fn empty_excursion_list_renders_a_placeholder() {
        let rendered = render_excursions("recent", &[]);
        assert!(rendered.contains("none recorded"));
    }

    #[test]
    fn excursions_render_their_label_and_duration() {
        let excursions = vec![Excursion {
            source: "service_radio",
            duration_ms: 400,
            when_ms: 0,
        }];
        let rendered = render_excursions("recent", &excursions);
        assert!(rendered.contains("service_radio"));
        assert!(rendered.contains("400"));
    }
}
