use serde::Serialize;

/// Running counters for the tick pipeline.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayMetrics {
    pub ticks_processed: u64,
    pub ticks_regressed: u64,
    pub rows_skipped: u64,
    pub paths_sent: u64,
    pub paths_omitted: u64,
    pub last_tick: Option<i64>,
}

impl RelayMetrics {
    /// Share of path fields the diff managed to leave out.
    pub fn omission_ratio(&self) -> f64 {
        let total = self.paths_sent + self.paths_omitted;
        if total > 0 {
            self.paths_omitted as f64 / total as f64
        } else {
            0.0
        }
    }
}
