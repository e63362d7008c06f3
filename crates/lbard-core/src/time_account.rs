//! Processor time accounting.
//!
//! LBARD runs one cooperative loop with no debugger in the field, so when it
//! stalls we need a log of which phase burned the time. `TimeAccount` keeps
//! two small fixed-capacity tables: `recent`, the last N excursions in
//! chronological order, and `alltime`, the N longest excursions ever seen.
//! Both tables only record spans over [`EXCURSION_THRESHOLD_MS`].

use crate::gettime_ms;

pub const MAX_EXCURSIONS: usize = 32;
pub const EXCURSION_THRESHOLD_MS: i64 = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excursion {
    pub source: &'static str,
    pub duration_ms: i64,
    pub when_ms: i64,
}

/// Tracks time spent in named phases of the outer loop and keeps a rolling
/// and all-time log of excursions over the threshold.
pub struct TimeAccount {
    recent: Vec<Excursion>,
    alltime: Vec<Excursion>,
    accumulated_ms: i64,
    interval_start_ms: i64,
    interval_source: Option<&'static str>,
}

impl Default for TimeAccount {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeAccount {
    pub fn new() -> Self {
        TimeAccount {
            recent: Vec::with_capacity(MAX_EXCURSIONS),
            alltime: Vec::with_capacity(MAX_EXCURSIONS),
            accumulated_ms: 0,
            interval_start_ms: 0,
            interval_source: None,
        }
    }

    pub fn recent(&self) -> &[Excursion] {
        &self.recent
    }

    pub fn alltime(&self) -> &[Excursion] {
        &self.alltime
    }

    /// Records an excursion of `duration_ms` attributed to `source`, if it
    /// clears the threshold. `recent` keeps the most recent
    /// `MAX_EXCURSIONS` entries in arrival order; `alltime` keeps the
    /// `MAX_EXCURSIONS` longest entries ever seen, longest first.
    pub fn log_time(&mut self, duration_ms: i64, source: &'static str) {
        if duration_ms < EXCURSION_THRESHOLD_MS {
            return;
        }
        let when_ms = gettime_ms();
        let excursion = Excursion {
            source,
            duration_ms,
            when_ms,
        };

        self.recent.insert(0, excursion.clone());
        self.recent.truncate(MAX_EXCURSIONS);

        let insert_at = self
            .alltime
            .iter()
            .position(|e| e.duration_ms < duration_ms);
        match insert_at {
            Some(i) => {
                self.alltime.insert(i, excursion);
                self.alltime.truncate(MAX_EXCURSIONS);
            }
            None if self.alltime.len() < MAX_EXCURSIONS => {
                self.alltime.push(excursion);
            }
            None => {
                // Full, and not longer than anything already recorded: drop.
            }
        }
    }

    /// Folds the time spent paused (e.g. blocked in a `read()`) out of the
    /// current interval so it isn't misattributed to the active phase.
    pub fn pause(&mut self) {
        self.accumulated_ms += gettime_ms() - self.interval_start_ms;
    }

    pub fn resume(&mut self) {
        self.interval_start_ms = gettime_ms();
    }

    /// Closes out the current interval (logging it if it exceeds the
    /// threshold) and opens a new one attributed to `source`.
    pub fn account_time(&mut self, source: &'static str) {
        if self.interval_start_ms != 0 {
            let mut interval_duration = gettime_ms() - self.interval_start_ms;
            interval_duration += self.accumulated_ms;
            self.accumulated_ms = 0;
            if let Some(prev_source) = self.interval_source {
                self.log_time(interval_duration, prev_source);
            }
        }

        self.interval_start_ms = gettime_ms();
        self.accumulated_ms = 0;
        self.interval_source = Some(source);
        tracing::trace!(source, "account_time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excursions_below_threshold_are_ignored() {
        let mut ta = TimeAccount::new();
        ta.log_time(EXCURSION_THRESHOLD_MS - 1, "radio_poll");
        assert!(ta.recent().is_empty());
        assert!(ta.alltime().is_empty());
    }

    #[test]
    fn recent_keeps_arrival_order_newest_first() {
        let mut ta = TimeAccount::new();
        ta.log_time(300, "a");
        ta.log_time(400, "b");
        ta.log_time(500, "c");
        let sources: Vec<_> = ta.recent().iter().map(|e| e.source).collect();
        assert_eq!(sources, vec!["c", "b", "a"]);
    }

    #[test]
    fn recent_drops_oldest_past_capacity_without_corruption() {
        let mut ta = TimeAccount::new();
        for i in 0..(MAX_EXCURSIONS + 5) {
            // distinct &'static str per iteration isn't practical; reuse one
            // label, we only care about count and duration fidelity here.
            ta.log_time(300 + i as i64, "loop");
        }
        assert_eq!(ta.recent().len(), MAX_EXCURSIONS);
        assert_eq!(ta.recent()[0].duration_ms, 300 + (MAX_EXCURSIONS + 4) as i64);
    }

    #[test]
    fn alltime_ranks_by_duration_descending() {
        let mut ta = TimeAccount::new();
        ta.log_time(300, "a");
        ta.log_time(900, "b");
        ta.log_time(600, "c");
        let durations: Vec<_> = ta.alltime().iter().map(|e| e.duration_ms).collect();
        assert_eq!(durations, vec![900, 600, 300]);
    }

    #[test]
    fn alltime_at_capacity_appends_tail_instead_of_dropping_oldest() {
        let mut ta = TimeAccount::new();
        for i in 0..MAX_EXCURSIONS {
            ta.log_time(1000 - i as i64, "fill");
        }
        assert_eq!(ta.alltime().len(), MAX_EXCURSIONS);

        // Smaller than everything already recorded: the fixed behaviour is
        // to drop it, not to corrupt the table via an out-of-range insert.
        ta.log_time(300, "small");
        assert_eq!(ta.alltime().len(), MAX_EXCURSIONS);
        assert!(ta.alltime().iter().all(|e| e.duration_ms >= 300));

        // Larger than the smallest: bumps the smallest entry out.
        let smallest_before = ta.alltime().last().unwrap().duration_ms;
        ta.log_time(smallest_before + 1, "bigger");
        assert_eq!(ta.alltime().len(), MAX_EXCURSIONS);
        assert!(ta.alltime().iter().any(|e| e.source == "bigger"));
    }

    #[test]
    fn pause_resume_folds_blocked_time_into_next_close() {
        let mut ta = TimeAccount::new();
        ta.account_time("phase_a");
        ta.pause();
        ta.resume();
        // Closing phase_a should not panic or lose the accumulated pause.
        ta.account_time("phase_b");
    }
}
