//! Connection-score adjustment and scan/NUD gating
//!
//! Sits between a scorer's output and the rest of the stack. The adjuster
//! never lets the score cross the transition threshold upward on noise
//! alone, holds a downward breach for a minimum dwell time, throttles NUD
//! probes, and rate-limits low-score connectivity scans.

use tracing::debug;

use crate::scorer::score::LinkInfo;
use crate::{INVALID_TIMESTAMP_MS, WIFI_TRANSITION_SCORE};

/// Minimum dwell below the transition score before an upward re-crossing
/// is honored again, to prevent oscillation.
pub const MIN_TIME_TO_KEEP_BELOW_TRANSITION_SCORE_MS: i64 = 9000;
/// Floor between consecutive NUD probes.
pub const NUD_THROTTLE_MS: i64 = 5000;
/// Time constant of the decaying NUD-check bar.
pub const TIME_INTERVAL_TO_CALCULATE_NUD_CHECK_SCORE_MS: i64 = 30000;

/// Work-scheduling facility able to force an immediate connectivity scan.
pub trait ScanScheduler: Send + Sync {
    fn force_connectivity_scan(&self);
}

/// IP-configuration confirmation facility backing a NUD probe.
pub trait NudProber: Send + Sync {
    fn confirm_configuration(&self);
}

/// Tunable thresholds consumed by the adjuster.
#[derive(Debug, Clone)]
pub struct ScoringParams {
    pub entry_rssi_24ghz_dbm: i32,
    pub entry_rssi_5ghz_dbm: i32,
    pub entry_rssi_6ghz_dbm: i32,
    /// Sustained tx and rx packet rate treated as proof of a working link.
    pub sustained_packet_rate_pps: f64,
    /// NUD aggressiveness, 0 (off) to 10 (most aggressive).
    pub nud_knob: u32,
    /// Minimum period between low-score connectivity scans.
    pub low_score_scan_period_seconds: i64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            entry_rssi_24ghz_dbm: -80,
            entry_rssi_5ghz_dbm: -77,
            entry_rssi_6ghz_dbm: -77,
            sustained_packet_rate_pps: 24.0,
            nud_knob: 8,
            low_score_scan_period_seconds: 60,
        }
    }
}

impl ScoringParams {
    /// Entry RSSI threshold for the band containing `frequency_mhz`.
    pub fn entry_rssi(&self, frequency_mhz: i32) -> i32 {
        if frequency_mhz >= 5925 {
            self.entry_rssi_6ghz_dbm
        } else if frequency_mhz >= 4900 {
            self.entry_rssi_5ghz_dbm
        } else {
            self.entry_rssi_24ghz_dbm
        }
    }
}

/// Per-session timing state, reset when the association changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreState {
    pub last_downward_breach_time_ms: i64,
    pub last_scan_time_ms: i64,
    pub last_nud_request_time_ms: i64,
    pub last_nud_request_score: i32,
    pub last_nud_check_time_ms: i64,
}

impl Default for ScoreState {
    fn default() -> Self {
        Self {
            last_downward_breach_time_ms: INVALID_TIMESTAMP_MS,
            last_scan_time_ms: INVALID_TIMESTAMP_MS,
            last_nud_request_time_ms: INVALID_TIMESTAMP_MS,
            last_nud_request_score: 0,
            last_nud_check_time_ms: INVALID_TIMESTAMP_MS,
        }
    }
}

impl ScoreState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Debounces score transitions and gates scan/NUD side effects.
pub struct ScoreAdjuster {
    params: ScoringParams,
}

impl ScoreAdjuster {
    pub fn new(params: ScoringParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ScoringParams {
        &self.params
    }

    /// Adjust a velocity-based score against the transition threshold.
    ///
    /// An upward crossing is only honored when sustained throughput proves
    /// the link works, or when the filtered or instantaneous RSSI clears the
    /// band's entry threshold. Both RSSI views are checked because the
    /// measurement is noisy and the filtered value lags the trend. A
    /// downward re-crossing within the dwell window keeps the previous
    /// score.
    pub fn adjust_score(
        &self,
        link: &LinkInfo,
        filtered_rssi: f64,
        last_downward_breach_time_ms: i64,
        now_ms: i64,
        transition_score: i32,
        score: i32,
    ) -> i32 {
        let mut adjusted_score = score;
        if link.score > transition_score
            && adjusted_score <= transition_score
            && link.tx_success_pps >= self.params.sustained_packet_rate_pps
            && link.rx_success_pps >= self.params.sustained_packet_rate_pps
        {
            adjusted_score = transition_score + 1;
        }

        if link.score > transition_score && adjusted_score <= transition_score {
            let entry = self.params.entry_rssi(link.frequency_mhz);
            if filtered_rssi >= f64::from(entry) || link.rssi >= entry {
                // Stay a notch above the transition score to reduce ambiguity.
                adjusted_score = transition_score + 1;
            }
        }

        if link.score < transition_score && adjusted_score >= transition_score {
            let elapsed_ms = now_ms - last_downward_breach_time_ms;
            if elapsed_ms < MIN_TIME_TO_KEEP_BELOW_TRANSITION_SCORE_MS {
                adjusted_score = link.score;
            }
        }
        adjusted_score
    }

    /// Force a connectivity scan when the scorer asked for one and the
    /// configured scan period has elapsed. `INVALID_TIMESTAMP_MS` as the
    /// last scan time means always eligible.
    pub fn trigger_scan_if_needed(
        &self,
        scheduler: &dyn ScanScheduler,
        last_scan_time_ms: i64,
        now_ms: i64,
        should_trigger_scan: bool,
    ) -> bool {
        if should_trigger_scan && self.enough_time_passed_since_last_scan(last_scan_time_ms, now_ms)
        {
            debug!("forcing connectivity scan");
            scheduler.force_connectivity_scan();
            return true;
        }
        false
    }

    fn enough_time_passed_since_last_scan(&self, last_scan_time_ms: i64, now_ms: i64) -> bool {
        last_scan_time_ms == INVALID_TIMESTAMP_MS
            || now_ms - last_scan_time_ms > self.params.low_score_scan_period_seconds * 1000
    }

    /// Whether the adjusted score has fallen below the NUD-check bar.
    ///
    /// The bar starts below the transition score after a NUD request made at
    /// a low score and decays exponentially back up toward the steady-state
    /// transition score. Five time constants put it within 1%, so the decay
    /// is skipped beyond that.
    pub fn should_check_nud(
        &self,
        last_nud_request_time_ms: i64,
        now_ms: i64,
        transition_score: i32,
        last_nud_request_score: i32,
        adjusted_score: i32,
    ) -> bool {
        let nud = self.params.nud_knob;
        if nud == 0 {
            return false;
        }

        let last_nud_request_score = if last_nud_request_time_ms == INVALID_TIMESTAMP_MS {
            transition_score
        } else {
            last_nud_request_score
        };

        let quotient = (now_ms - last_nud_request_time_ms) as f64
            / TIME_INTERVAL_TO_CALCULATE_NUD_CHECK_SCORE_MS as f64;
        // nud is between 1 and 10 at this point
        let delta_level = f64::from(11 - nud.min(10) as i32);
        let next_nud_breach = if last_nud_request_score < WIFI_TRANSITION_SCORE && quotient < 5.0 {
            let a = (-quotient).exp();
            a * (f64::from(last_nud_request_score) - delta_level)
                + (1.0 - a) * f64::from(transition_score)
        } else {
            f64::from(transition_score)
        };
        f64::from(adjusted_score) < next_nud_breach
    }

    /// Run a NUD probe, at most once per throttle window.
    pub fn check_nud_if_needed(
        &self,
        prober: Option<&dyn NudProber>,
        last_nud_check_time_ms: i64,
        now_ms: i64,
    ) -> bool {
        // Never probe back-to-back; the previous one needs time to finish.
        if now_ms - last_nud_check_time_ms < NUD_THROTTLE_MS {
            return false;
        }
        match prober {
            Some(prober) => {
                prober.confirm_configuration();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TRANSITION: i32 = WIFI_TRANSITION_SCORE;

    struct CountingScheduler {
        scans: AtomicUsize,
    }

    impl ScanScheduler for CountingScheduler {
        fn force_connectivity_scan(&self) {
            self.scans.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingProber {
        probes: AtomicUsize,
    }

    impl NudProber for CountingProber {
        fn confirm_configuration(&self) {
            self.probes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn adjuster() -> ScoreAdjuster {
        ScoreAdjuster::new(ScoringParams::default())
    }

    fn link_with_score(score: i32) -> LinkInfo {
        LinkInfo {
            bssid: Some("aa:bb:cc:dd:ee:ff".to_string()),
            frequency_mhz: 5180,
            score,
            tx_success_pps: 0.0,
            rx_success_pps: 0.0,
            rssi: -88,
        }
    }

    #[test]
    fn test_adjust_score_passthrough_when_no_crossing() {
        let adjuster = adjuster();
        // Both above transition
        let link = link_with_score(TRANSITION + 9);
        assert_eq!(
            adjuster.adjust_score(&link, -88.0, INVALID_TIMESTAMP_MS, 0, TRANSITION, TRANSITION + 5),
            TRANSITION + 5
        );
        // Both below transition
        let link = link_with_score(TRANSITION - 9);
        assert_eq!(
            adjuster.adjust_score(&link, -88.0, INVALID_TIMESTAMP_MS, 0, TRANSITION, TRANSITION - 5),
            TRANSITION - 5
        );
    }

    #[test]
    fn test_downward_crossing_held_up_by_throughput() {
        let adjuster = adjuster();
        let mut link = link_with_score(TRANSITION + 5);
        link.tx_success_pps = 30.0;
        link.rx_success_pps = 30.0;
        let adjusted = adjuster.adjust_score(
            &link,
            -88.0,
            INVALID_TIMESTAMP_MS,
            0,
            TRANSITION,
            TRANSITION - 5,
        );
        assert_eq!(adjusted, TRANSITION + 1);
    }

    #[test]
    fn test_downward_crossing_held_up_by_instantaneous_rssi() {
        let adjuster = adjuster();
        let mut link = link_with_score(TRANSITION + 5);
        link.rssi = -60; // above the 5 GHz entry threshold
        let adjusted = adjuster.adjust_score(
            &link,
            -88.0,
            INVALID_TIMESTAMP_MS,
            0,
            TRANSITION,
            TRANSITION - 5,
        );
        assert_eq!(adjusted, TRANSITION + 1);
    }

    #[test]
    fn test_downward_crossing_held_up_by_filtered_rssi() {
        let adjuster = adjuster();
        let link = link_with_score(TRANSITION + 5);
        let adjusted = adjuster.adjust_score(
            &link,
            -60.0,
            INVALID_TIMESTAMP_MS,
            0,
            TRANSITION,
            TRANSITION - 5,
        );
        assert_eq!(adjusted, TRANSITION + 1);
    }

    #[test]
    fn test_downward_crossing_allowed_when_both_rssi_low() {
        let adjuster = adjuster();
        let link = link_with_score(TRANSITION + 5);
        let adjusted = adjuster.adjust_score(
            &link,
            -88.0,
            INVALID_TIMESTAMP_MS,
            0,
            TRANSITION,
            TRANSITION - 5,
        );
        assert_eq!(adjusted, TRANSITION - 5);
    }

    #[test]
    fn test_upward_crossing_suppressed_within_dwell() {
        let adjuster = adjuster();
        let link = link_with_score(TRANSITION - 5);
        // Breach happened 3 s ago: the upward crossing keeps the old score
        let adjusted =
            adjuster.adjust_score(&link, -88.0, 10_000, 13_000, TRANSITION, TRANSITION + 5);
        assert_eq!(adjusted, TRANSITION - 5);

        // 9 s later the crossing is honored
        let adjusted =
            adjuster.adjust_score(&link, -88.0, 10_000, 19_001, TRANSITION, TRANSITION + 5);
        assert_eq!(adjusted, TRANSITION + 5);
    }

    #[test]
    fn test_trigger_scan_gating() {
        let adjuster = adjuster();
        let scheduler = CountingScheduler {
            scans: AtomicUsize::new(0),
        };
        let now = 100_000;

        // Not requested: never fires, regardless of elapsed time
        assert!(!adjuster.trigger_scan_if_needed(&scheduler, INVALID_TIMESTAMP_MS, now, false));
        // Requested, no previous scan: fires
        assert!(adjuster.trigger_scan_if_needed(&scheduler, INVALID_TIMESTAMP_MS, now, true));
        // Requested but inside the period: suppressed
        assert!(!adjuster.trigger_scan_if_needed(&scheduler, now - 30_000, now, true));
        // Requested and past the period: fires
        assert!(adjuster.trigger_scan_if_needed(&scheduler, now - 61_000, now, true));
        assert_eq!(scheduler.scans.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_nud_knob_zero_disables_checks() {
        let adjuster = ScoreAdjuster::new(ScoringParams {
            nud_knob: 0,
            ..ScoringParams::default()
        });
        assert!(!adjuster.should_check_nud(INVALID_TIMESTAMP_MS, 0, TRANSITION, 0, 0));
    }

    #[test]
    fn test_nud_steady_state_bar_is_transition_score() {
        let adjuster = adjuster();
        // No previous request: the bar is the transition score
        assert!(adjuster.should_check_nud(
            INVALID_TIMESTAMP_MS,
            0,
            TRANSITION,
            0,
            TRANSITION - 1
        ));
        assert!(!adjuster.should_check_nud(INVALID_TIMESTAMP_MS, 0, TRANSITION, 0, TRANSITION));
    }

    #[test]
    fn test_nud_bar_decays_from_last_request_score() {
        let adjuster = adjuster(); // knob 8 -> delta 3
        let last_request_time = 0;
        let last_request_score = TRANSITION - 10;

        // Immediately after the request the bar sits at the depressed level
        // last_score - delta = TRANSITION - 13.
        assert!(!adjuster.should_check_nud(
            last_request_time,
            0,
            TRANSITION,
            last_request_score,
            TRANSITION - 13
        ));
        assert!(adjuster.should_check_nud(
            last_request_time,
            0,
            TRANSITION,
            last_request_score,
            TRANSITION - 14
        ));

        // One time constant later the bar has recovered most of the way:
        // bar = e^-1 * (TRANSITION - 13) + (1 - e^-1) * TRANSITION
        let one_tc = TIME_INTERVAL_TO_CALCULATE_NUD_CHECK_SCORE_MS;
        let bar = (-1.0f64).exp() * f64::from(TRANSITION - 13)
            + (1.0 - (-1.0f64).exp()) * f64::from(TRANSITION);
        let below = bar.floor() as i32;
        assert!(adjuster.should_check_nud(
            last_request_time,
            one_tc,
            TRANSITION,
            last_request_score,
            below
        ));
        assert!(!adjuster.should_check_nud(
            last_request_time,
            one_tc,
            TRANSITION,
            last_request_score,
            below + 1
        ));

        // Past five time constants the decay is skipped entirely
        assert!(adjuster.should_check_nud(
            last_request_time,
            5 * one_tc + 1,
            TRANSITION,
            last_request_score,
            TRANSITION - 1
        ));
    }

    #[test]
    fn test_nud_probe_throttled() {
        let adjuster = adjuster();
        let prober = CountingProber {
            probes: AtomicUsize::new(0),
        };
        assert!(adjuster.check_nud_if_needed(Some(&prober), 0, NUD_THROTTLE_MS));
        assert!(!adjuster.check_nud_if_needed(Some(&prober), 0, NUD_THROTTLE_MS - 1));
        assert_eq!(prober.probes.load(Ordering::SeqCst), 1);
        // No prober wired: nothing to run
        assert!(!adjuster.check_nud_if_needed(None, 0, NUD_THROTTLE_MS));
    }
}
