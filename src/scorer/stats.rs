//! Link statistics snapshots and per-tick feature derivation
//!
//! A [`LinkStats`] snapshot holds the raw cumulative counters reported by
//! the driver for one polling tick. A [`StatsEntry`] pairs a snapshot with
//! the previous one to produce per-tick deltas and derived ratios.
//!
//! Sanitization draws a hard line between two kinds of unusable values:
//! - a negative delta of a monotonic counter means the counter rolled back
//!   (rollover, radio restart, stat reset): the window is invalid and the
//!   feature becomes NaN, never a clamped zero;
//! - abnormally high traffic is a trained-distribution outlier: rate
//!   features are dropped to NaN by a separate guard so outliers cannot be
//!   mistaken for missing data and vice versa.
//! NaN is the internal missing-value sentinel; it is replaced by window or
//! training means only at feature-extraction time.

use serde::{Deserialize, Serialize};

use crate::scorer::features::Normalization;
use crate::scorer::MIN_DURATION_UPDATING_CCA_MS;

/// Features derived from one snapshot pair, in the fixed (alphabetical)
/// order the model was trained with.
pub const NUM_FEATURES_PER_ENTRY: usize = 15;

/// Minimum tx attempts in a tick before per-attempt ratios are meaningful.
pub const TX_PKT_COUNT_FOR_UPDATE_STATS_THRESHOLD: f64 = 3.0;
/// Minimum rx successes in a tick before the rx link speed is meaningful.
pub const RX_PKT_COUNT_FOR_UPDATE_STATS_THRESHOLD: f64 = 3.0;
/// Per-tick success count above which traffic is treated as an outlier.
pub const SUCCESS_PKT_COUNT_VERY_HIGH_THRESHOLD: f64 = 45.0;

/// Raw cumulative counters from one polling tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    pub timestamp_ms: i64,
    pub total_radio_on_time_ms: i64,
    pub total_tx_success: i64,
    pub total_tx_retries: i64,
    pub total_tx_bad: i64,
    pub total_rx_success: i64,
    pub total_radio_tx_time_ms: i64,
    pub total_radio_rx_time_ms: i64,
    pub total_scan_time_ms: i64,
    pub total_roam_scan_time_ms: i64,
    pub total_radio_on_freq_time_ms: i64,
    pub total_cca_busy_freq_time_ms: i64,
    pub total_beacon_rx: i64,
    pub link_speed_mbps: i32,
    pub rx_link_speed_mbps: i32,
    pub rssi: i32,
}

/// How derived ratios are sanitized.
#[derive(Debug, Clone)]
pub struct SanitizePolicy {
    /// Substitute the training-time mean CCA busy ratio instead of the
    /// windowed ratio.
    pub use_default_mean_cca_busy_ratio: bool,
    /// Subtract radio rx time from CCA busy time before forming the ratio.
    pub subtract_rx_time_from_cca_busy_time: bool,
}

impl Default for SanitizePolicy {
    fn default() -> Self {
        Self {
            use_default_mean_cca_busy_ratio: true,
            subtract_rx_time_from_cca_busy_time: false,
        }
    }
}

/// One snapshot with its per-tick deltas and derived features.
#[derive(Debug, Clone)]
pub struct StatsEntry {
    stats: LinkStats,

    // Diffed cumulative counters.
    pub total_radio_on_time_diff: f64,
    pub total_tx_success_diff: f64,
    pub total_rx_success_diff: f64,
    pub total_tx_retries_diff: f64,
    pub total_radio_rx_time_ms_diff: f64,
    pub total_radio_tx_time_ms_diff: f64,
    pub total_scan_time_ms_diff: f64,
    pub total_roam_scan_time_ms_diff: f64,
    pub total_radio_on_freq_time_ms_diff: f64,
    pub total_cca_busy_freq_time_ms_diff: f64,
    pub total_tx_bad: f64,
    pub total_beacon_rx: f64,

    // Non-diffed features.
    pub link_speed_mbps: f64,
    pub rx_link_speed_mbps: f64,
    pub rssi: f64,

    // Derived features.
    pub total_radio_on_time_diff_per_attempt: f64,
    pub total_tx_success_diff_per_tx_attempt: f64,
    pub total_tx_retries_diff_per_tx_attempt: f64,
    pub total_radio_tx_time_ms_diff_per_tx_attempt: f64,
    pub total_radio_rx_time_ms_diff_per_rx_success: f64,
    pub total_cca_busy_freq_time_ratio: f64,
    pub total_tx_attempts: f64,
    pub est_tx_tput: f64,
    pub est_rx_tput: f64,
}

fn invalidate_negative(value: &mut f64) {
    if *value < 0.0 {
        *value = f64::NAN;
    }
}

impl StatsEntry {
    pub fn new(stats: LinkStats) -> Self {
        Self {
            stats,
            total_radio_on_time_diff: 0.0,
            total_tx_success_diff: 0.0,
            total_rx_success_diff: 0.0,
            total_tx_retries_diff: 0.0,
            total_radio_rx_time_ms_diff: 0.0,
            total_radio_tx_time_ms_diff: 0.0,
            total_scan_time_ms_diff: 0.0,
            total_roam_scan_time_ms_diff: 0.0,
            total_radio_on_freq_time_ms_diff: 0.0,
            total_cca_busy_freq_time_ms_diff: 0.0,
            total_tx_bad: 0.0,
            total_beacon_rx: 0.0,
            link_speed_mbps: 0.0,
            rx_link_speed_mbps: 0.0,
            rssi: 0.0,
            total_radio_on_time_diff_per_attempt: 0.0,
            total_tx_success_diff_per_tx_attempt: 0.0,
            total_tx_retries_diff_per_tx_attempt: 0.0,
            total_radio_tx_time_ms_diff_per_tx_attempt: 0.0,
            total_radio_rx_time_ms_diff_per_rx_success: 0.0,
            total_cca_busy_freq_time_ratio: 0.0,
            total_tx_attempts: 0.0,
            est_tx_tput: 0.0,
            est_rx_tput: 0.0,
        }
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Compute deltas against the previous snapshot, sanitize, and derive
    /// ratios. Keep the derivations in sync with the model's training-time
    /// feature processing.
    pub fn set_diffs(&mut self, previous: &LinkStats, policy: &SanitizePolicy, norm: &Normalization) {
        let s = self.stats;
        self.total_radio_on_time_diff =
            (s.total_radio_on_time_ms - previous.total_radio_on_time_ms) as f64;
        self.total_tx_success_diff = (s.total_tx_success - previous.total_tx_success) as f64;
        self.total_rx_success_diff = (s.total_rx_success - previous.total_rx_success) as f64;
        self.total_tx_retries_diff = (s.total_tx_retries - previous.total_tx_retries) as f64;
        self.total_radio_rx_time_ms_diff =
            (s.total_radio_rx_time_ms - previous.total_radio_rx_time_ms) as f64;
        self.total_radio_tx_time_ms_diff =
            (s.total_radio_tx_time_ms - previous.total_radio_tx_time_ms) as f64;
        self.total_scan_time_ms_diff = (s.total_scan_time_ms - previous.total_scan_time_ms) as f64;
        self.total_roam_scan_time_ms_diff =
            (s.total_roam_scan_time_ms - previous.total_roam_scan_time_ms) as f64;
        self.total_radio_on_freq_time_ms_diff =
            (s.total_radio_on_freq_time_ms - previous.total_radio_on_freq_time_ms) as f64;
        self.total_cca_busy_freq_time_ms_diff =
            (s.total_cca_busy_freq_time_ms - previous.total_cca_busy_freq_time_ms) as f64;
        self.total_tx_bad = (s.total_tx_bad - previous.total_tx_bad) as f64;
        self.total_beacon_rx = (s.total_beacon_rx - previous.total_beacon_rx) as f64;

        // Outlier guard, evaluated before rollback sanitization so the two
        // conditions stay independent.
        let is_traffic_very_high = self.total_tx_success_diff
            >= SUCCESS_PKT_COUNT_VERY_HIGH_THRESHOLD
            || self.total_rx_success_diff >= SUCCESS_PKT_COUNT_VERY_HIGH_THRESHOLD;

        // Counter rollback: the source counters are monotonic, so a negative
        // delta is an invalid window, not a measurement.
        invalidate_negative(&mut self.total_radio_on_time_diff);
        invalidate_negative(&mut self.total_tx_success_diff);
        invalidate_negative(&mut self.total_rx_success_diff);
        invalidate_negative(&mut self.total_tx_retries_diff);
        invalidate_negative(&mut self.total_radio_rx_time_ms_diff);
        invalidate_negative(&mut self.total_radio_tx_time_ms_diff);
        invalidate_negative(&mut self.total_scan_time_ms_diff);
        invalidate_negative(&mut self.total_roam_scan_time_ms_diff);
        invalidate_negative(&mut self.total_radio_on_freq_time_ms_diff);
        invalidate_negative(&mut self.total_cca_busy_freq_time_ms_diff);
        invalidate_negative(&mut self.total_tx_bad);
        invalidate_negative(&mut self.total_beacon_rx);

        // Tx per-attempt ratios.
        if self.total_tx_success_diff.is_nan() || self.total_tx_retries_diff.is_nan() {
            self.total_tx_success_diff_per_tx_attempt = f64::NAN;
            self.total_tx_retries_diff_per_tx_attempt = f64::NAN;
            self.total_tx_attempts = f64::NAN;
        } else {
            self.total_tx_attempts = self.total_tx_success_diff + self.total_tx_retries_diff;
            if self.total_tx_attempts == 0.0
                || (self.total_tx_attempts <= TX_PKT_COUNT_FOR_UPDATE_STATS_THRESHOLD
                    && self.total_tx_success_diff == 0.0)
                || is_traffic_very_high
            {
                self.total_tx_success_diff_per_tx_attempt = f64::NAN;
                self.total_tx_retries_diff_per_tx_attempt = f64::NAN;
            } else {
                self.total_tx_success_diff_per_tx_attempt =
                    self.total_tx_success_diff / self.total_tx_attempts;
                self.total_tx_retries_diff_per_tx_attempt =
                    self.total_tx_retries_diff / self.total_tx_attempts;
                if !self.total_radio_tx_time_ms_diff_per_tx_attempt.is_nan() {
                    self.total_radio_tx_time_ms_diff_per_tx_attempt =
                        self.total_radio_tx_time_ms_diff / self.total_tx_attempts;
                }
            }
        }

        // Link speeds and RSSI. Low traffic makes a reported link speed a
        // stale artifact rather than a measurement.
        self.link_speed_mbps = if s.link_speed_mbps < 0
            || self.total_tx_attempts <= TX_PKT_COUNT_FOR_UPDATE_STATS_THRESHOLD
            || is_traffic_very_high
        {
            f64::NAN
        } else {
            f64::from(s.link_speed_mbps)
        };
        self.rx_link_speed_mbps = if s.rx_link_speed_mbps < 0
            || self.total_rx_success_diff <= RX_PKT_COUNT_FOR_UPDATE_STATS_THRESHOLD
            || is_traffic_very_high
        {
            f64::NAN
        } else {
            f64::from(s.rx_link_speed_mbps)
        };
        self.rssi = f64::from(s.rssi);

        // Rx time per successful packet.
        if self.total_rx_success_diff.is_nan()
            || self.total_radio_rx_time_ms_diff.is_nan()
            || self.total_rx_success_diff == 0.0
            || self.total_radio_rx_time_ms_diff == 0.0
        {
            self.total_radio_rx_time_ms_diff_per_rx_success = f64::NAN;
        } else {
            self.total_radio_rx_time_ms_diff_per_rx_success =
                self.total_radio_rx_time_ms_diff / self.total_rx_success_diff;
        }

        // Radio-on time per attempt, scan time excluded.
        if self.total_tx_success_diff.is_nan()
            || self.total_rx_success_diff.is_nan()
            || self.total_tx_retries_diff.is_nan()
        {
            self.total_radio_on_time_diff_per_attempt = f64::NAN;
        } else {
            let attempts = self.total_tx_success_diff
                + self.total_rx_success_diff
                + self.total_tx_retries_diff;
            if attempts == 0.0
                || self.total_radio_on_time_diff.is_nan()
                || self.total_scan_time_ms_diff.is_nan()
            {
                self.total_radio_on_time_diff_per_attempt = f64::NAN;
            } else {
                self.total_radio_on_time_diff_per_attempt =
                    (self.total_radio_on_time_diff - self.total_scan_time_ms_diff) / attempts;
            }
        }

        // CCA busy ratio.
        if policy.use_default_mean_cca_busy_ratio {
            self.total_cca_busy_freq_time_ratio = norm.mean_cca_busy_ratio();
        } else if self.total_cca_busy_freq_time_ms_diff.is_nan()
            || self.total_radio_on_freq_time_ms_diff.is_nan()
            || self.total_radio_rx_time_ms_diff.is_nan()
            || self.total_radio_on_freq_time_ms_diff <= MIN_DURATION_UPDATING_CCA_MS
        {
            self.total_cca_busy_freq_time_ratio = f64::NAN;
        } else {
            let cca_busy_ratio = if policy.subtract_rx_time_from_cca_busy_time {
                (self.total_cca_busy_freq_time_ms_diff - self.total_radio_rx_time_ms_diff)
                    / self.total_radio_on_freq_time_ms_diff
            } else {
                self.total_cca_busy_freq_time_ms_diff / self.total_radio_on_freq_time_ms_diff
            };
            self.total_cca_busy_freq_time_ratio = if (0.0..=1.0).contains(&cca_busy_ratio) {
                cca_busy_ratio
            } else {
                f64::NAN
            };
        }

        // Throughput estimates; missing-ness propagates through.
        if !self.total_cca_busy_freq_time_ratio.is_nan()
            && !self.total_tx_retries_diff_per_tx_attempt.is_nan()
            && !self.link_speed_mbps.is_nan()
        {
            self.est_tx_tput = self.link_speed_mbps
                * (1.0 - self.total_tx_retries_diff_per_tx_attempt)
                * (1.0 - self.total_cca_busy_freq_time_ratio);
        } else {
            self.est_tx_tput = f64::NAN;
        }
        if !self.total_cca_busy_freq_time_ratio.is_nan() && !self.rx_link_speed_mbps.is_nan() {
            self.est_rx_tput = self.rx_link_speed_mbps * (1.0 - self.total_cca_busy_freq_time_ratio);
        } else {
            self.est_rx_tput = f64::NAN;
        }
    }

    /// Seed every feature from the training-time means. Used for the first
    /// entry of a session, which has no previous snapshot to diff against.
    pub fn set_default_values(&mut self, norm: &Normalization) {
        let means = norm.means();
        self.est_tx_tput = means[0];
        self.link_speed_mbps = means[1];
        self.rssi = means[2];
        self.total_cca_busy_freq_time_ratio = means[3];
        self.total_radio_on_freq_time_ms_diff = means[4];
        self.total_radio_on_time_diff_per_attempt = means[5];
        self.total_radio_rx_time_ms_diff_per_rx_success = means[6];
        self.total_radio_tx_time_ms_diff_per_tx_attempt = means[7];
        self.total_roam_scan_time_ms_diff = means[8];
        self.total_rx_success_diff = means[9];
        self.total_scan_time_ms_diff = means[10];
        self.total_tx_attempts = means[11];
        self.total_tx_bad = means[12];
        self.total_tx_retries_diff_per_tx_attempt = means[13];
        self.total_tx_success_diff_per_tx_attempt = means[14];
    }

    /// Features in training order (alphabetical by name).
    pub fn features_as_array(&self) -> [f64; NUM_FEATURES_PER_ENTRY] {
        [
            self.est_tx_tput,
            self.link_speed_mbps,
            self.rssi,
            self.total_cca_busy_freq_time_ratio,
            self.total_radio_on_freq_time_ms_diff,
            self.total_radio_on_time_diff_per_attempt,
            self.total_radio_rx_time_ms_diff_per_rx_success,
            self.total_radio_tx_time_ms_diff_per_tx_attempt,
            self.total_roam_scan_time_ms_diff,
            self.total_rx_success_diff,
            self.total_scan_time_ms_diff,
            self.total_tx_attempts,
            self.total_tx_bad,
            self.total_tx_retries_diff_per_tx_attempt,
            self.total_tx_success_diff_per_tx_attempt,
        ]
    }
}
