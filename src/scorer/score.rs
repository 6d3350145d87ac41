//! Windowed ML scoring with debouncing and hysteresis
//!
//! [`MlScorer`] keeps a bounded window of statistics entries for the
//! current association, asks the classifier for a raw usability score, and
//! folds it into an adjusted connection score. The adjustment layer owns
//! the anti-flapping state: scan-trigger edge detection, the notch around
//! the transition score, network-status hysteresis, and BSSID blocking.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scorer::forest::UsabilityClassifier;
use crate::scorer::stats::{LinkStats, SanitizePolicy, StatsEntry};
use crate::scorer::{
    HYSTERESIS_NETWORK_STATUS_CHANGE_MILLIS, LINK_SPEED_LOW_MBPS, LINK_SPEED_VERY_LOW_MBPS,
    MAX_BUFFER_SIZE, MAX_SCORE, MIN_BUFFER_SIZE, MIN_TIME_TO_WAIT_BEFORE_BLOCK_BSSID_MILLIS,
    POLLING_DELAY_MS, POLLING_INTERVAL_MS, RAW_SCORE_THRESHOLD, RAW_SCORE_THRESHOLD_HYSTERESIS,
    RSSI_THRESHOLD_NO_HYSTERESIS_NETWORK_STATUS_CHANGE_DBM, SCAN_TRIGGERING_THRESHOLD,
    SCORE_BREACHING_RSSI_THRESHOLD, SCORE_LOW_RSSI_THR_DBM, SCORE_LOW_TX_BAD_THR,
    SCORE_LOW_TX_SUCCESS_TO_BAD_RATIO_THR, UNCLASSIFIED_SCORE,
};
use crate::{INVALID_TIMESTAMP_MS, WIFI_MAX_SCORE, WIFI_TRANSITION_SCORE};

/// Snapshot of the current association as seen by the connection manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub bssid: Option<String>,
    pub frequency_mhz: i32,
    /// Connection score currently reported to the network stack.
    pub score: i32,
    pub tx_success_pps: f64,
    pub rx_success_pps: f64,
    pub rssi: i32,
}

/// One scoring tick's outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub score: i32,
    pub adjusted_score: i32,
    pub is_wifi_usable: bool,
    pub should_trigger_scan: bool,
    pub should_check_nud: bool,
    pub should_block_bssid: bool,
}

/// True when BSSID and frequency are unchanged since the last tick. An
/// unknown previous association counts as unchanged so a fresh scorer does
/// not immediately reset.
pub fn is_same_bssid_and_freq(
    previous_bssid: &Option<String>,
    previous_frequency: i32,
    link: &LinkInfo,
) -> bool {
    let Some(previous) = previous_bssid else {
        return true;
    };
    if previous_frequency == -1 {
        return true;
    }
    link.bssid.as_deref() == Some(previous.as_str()) && link.frequency_mhz == previous_frequency
}

/// True when the gap between two snapshots exceeds one polling interval
/// plus the reporting delay; deltas across such a gap are meaningless.
pub fn is_timestamp_gap_too_large(previous: &LinkStats, current: &LinkStats) -> bool {
    current.timestamp_ms - previous.timestamp_ms > POLLING_INTERVAL_MS + POLLING_DELAY_MS
}

/// Link already demonstrably bad, regardless of what the model thinks.
pub fn is_link_quality_bad(total_tx_bad_diff: f64, total_tx_success_diff: f64, rssi: i32) -> bool {
    if rssi <= SCORE_LOW_RSSI_THR_DBM {
        return true;
    }
    total_tx_bad_diff * SCORE_LOW_TX_SUCCESS_TO_BAD_RATIO_THR >= total_tx_success_diff
        && rssi <= SCORE_BREACHING_RSSI_THRESHOLD
        && total_tx_bad_diff >= SCORE_LOW_TX_BAD_THR
}

pub fn is_rssi_very_low_and_link_speed_low(stats: &LinkStats) -> bool {
    let tx_low = stats.link_speed_mbps <= LINK_SPEED_LOW_MBPS && stats.link_speed_mbps > 0;
    let rx_low = stats.rx_link_speed_mbps <= LINK_SPEED_LOW_MBPS && stats.rx_link_speed_mbps > 0;
    let rssi_very_low = stats.rssi <= RSSI_THRESHOLD_NO_HYSTERESIS_NETWORK_STATUS_CHANGE_DBM;
    rssi_very_low && (tx_low || rx_low)
}

pub fn is_rssi_low_and_link_speed_very_low(stats: &LinkStats) -> bool {
    let tx_very_low = stats.link_speed_mbps <= LINK_SPEED_VERY_LOW_MBPS && stats.link_speed_mbps > 0;
    let rx_very_low =
        stats.rx_link_speed_mbps <= LINK_SPEED_VERY_LOW_MBPS && stats.rx_link_speed_mbps > 0;
    let rssi_low = stats.rssi < SCORE_BREACHING_RSSI_THRESHOLD;
    rssi_low && (tx_very_low || rx_very_low)
}

/// Windowed ML connection scorer for one interface.
pub struct MlScorer {
    buffer: VecDeque<StatsEntry>,
    policy: SanitizePolicy,
    classifier: Box<dyn UsabilityClassifier>,

    prev_score: f64,
    prev_raw_score: f64,
    is_score_scan_threshold_breach: bool,
    recommend_default_network: bool,
    last_score_breach_time_ms: i64,
    block_current_bssid: bool,
    is_score_trending_downwards: bool,

    last_bssid: Option<String>,
    last_frequency: i32,
}

impl MlScorer {
    pub fn new(classifier: Box<dyn UsabilityClassifier>) -> Self {
        Self {
            buffer: VecDeque::new(),
            policy: SanitizePolicy::default(),
            classifier,
            prev_score: MAX_SCORE,
            prev_raw_score: MAX_SCORE,
            is_score_scan_threshold_breach: false,
            recommend_default_network: true,
            last_score_breach_time_ms: INVALID_TIMESTAMP_MS,
            block_current_bssid: false,
            is_score_trending_downwards: false,
            last_bssid: None,
            last_frequency: -1,
        }
    }

    pub fn with_policy(classifier: Box<dyn UsabilityClassifier>, policy: SanitizePolicy) -> Self {
        Self {
            policy,
            ..Self::new(classifier)
        }
    }

    /// Score one polling tick.
    pub fn generate_score_result(
        &mut self,
        link: &LinkInfo,
        stats: &LinkStats,
        now_ms: i64,
        is_primary: bool,
    ) -> ScoreResult {
        let same_bssid_and_freq =
            is_same_bssid_and_freq(&self.last_bssid, self.last_frequency, link);
        self.last_bssid = link.bssid.clone();
        self.last_frequency = link.frequency_mhz;

        // The model is trained on primary-connection traffic only.
        let score = if is_primary {
            self.updated_score(same_bssid_and_freq, stats)
        } else {
            UNCLASSIFIED_SCORE
        };

        let mut adjusted_score = UNCLASSIFIED_SCORE;
        let mut should_check_nud = false;
        if score != UNCLASSIFIED_SCORE {
            adjusted_score = self.adjust_score(
                score,
                same_bssid_and_freq,
                stats.rssi,
                RAW_SCORE_THRESHOLD,
                RAW_SCORE_THRESHOLD_HYSTERESIS,
                now_ms,
            );
            should_check_nud = score < f64::from(WIFI_TRANSITION_SCORE)
                || is_rssi_very_low_and_link_speed_low(stats)
                || is_rssi_low_and_link_speed_very_low(stats);
        }

        ScoreResult {
            score: score as i32,
            adjusted_score: adjusted_score as i32,
            is_wifi_usable: self.recommend_default_network,
            should_trigger_scan: self.is_score_scan_threshold_breach,
            should_check_nud,
            should_block_bssid: self.block_current_bssid,
        }
    }

    /// Fold the new snapshot into the window and produce the raw score.
    fn updated_score(&mut self, same_bssid_and_freq: bool, stats: &LinkStats) -> f64 {
        let is_time_gap_too_large = self
            .buffer
            .back()
            .is_some_and(|last| is_timestamp_gap_too_large(last.stats(), stats));
        if !same_bssid_and_freq || is_time_gap_too_large {
            debug!(
                same_bssid_and_freq,
                is_time_gap_too_large, "dropping stale scoring window"
            );
            self.buffer.clear();
        }

        let mut entry = StatsEntry::new(*stats);
        match self.buffer.back().map(|last| *last.stats()) {
            Some(previous) => {
                entry.set_diffs(&previous, &self.policy, self.classifier.normalization())
            }
            None => entry.set_default_values(self.classifier.normalization()),
        }
        let total_tx_bad_diff = entry.total_tx_bad;
        let total_tx_success_diff = entry.total_tx_success_diff;

        self.buffer.push_back(entry);
        if self.buffer.len() > MAX_BUFFER_SIZE {
            self.buffer.pop_front();
        }
        if self.buffer.len() < MIN_BUFFER_SIZE {
            return UNCLASSIFIED_SCORE;
        }

        let raw_score = self.classifier.calculate_score(&self.buffer);
        // A link that is already demonstrably bad is clamped below the raw
        // threshold, except across a stale gap where the diffs are noise.
        if !is_time_gap_too_large
            && is_link_quality_bad(total_tx_bad_diff, total_tx_success_diff, stats.rssi)
        {
            return RAW_SCORE_THRESHOLD - 1.0;
        }
        raw_score
    }

    fn scale_score_for_threshold(score: f64, threshold: f64) -> f64 {
        ((f64::from(WIFI_TRANSITION_SCORE) / threshold) * score).min(MAX_SCORE)
    }

    /// Map the raw model score onto the connection-score scale and apply
    /// the anti-flapping state machine.
    fn adjust_score(
        &mut self,
        raw_score: f64,
        same_bssid_and_freq: bool,
        rssi: i32,
        threshold: f64,
        threshold_hysteresis: f64,
        now_ms: i64,
    ) -> f64 {
        let mut raw_score = raw_score;
        if !same_bssid_and_freq {
            // Roam or reconnect: give the new network a clean slate.
            self.reset();
            raw_score = MAX_SCORE;
        }

        let mut adjusted_threshold = threshold;
        if self.prev_score != UNCLASSIFIED_SCORE && self.prev_score < f64::from(WIFI_TRANSITION_SCORE)
        {
            adjusted_threshold += threshold_hysteresis;
        }
        let mut score = Self::scale_score_for_threshold(raw_score, adjusted_threshold);

        self.is_score_scan_threshold_breach = (0.0..SCAN_TRIGGERING_THRESHOLD).contains(&raw_score)
            && self.prev_raw_score >= SCAN_TRIGGERING_THRESHOLD;

        // Stay a notch away from the transition score to reduce ambiguity.
        if score as i32 == WIFI_TRANSITION_SCORE {
            score = if self.prev_score > f64::from(WIFI_TRANSITION_SCORE) {
                score + 1.0
            } else {
                score - 1.0
            };
        }

        let is_score_breach_low = rssi < SCORE_BREACHING_RSSI_THRESHOLD
            && (0.0..f64::from(WIFI_TRANSITION_SCORE)).contains(&score)
            && self.prev_score >= f64::from(WIFI_TRANSITION_SCORE);
        if is_score_breach_low {
            // A previous score already under the ceiling means the score was
            // trending down before the breach; skip the status hysteresis.
            self.is_score_trending_downwards = self.prev_score < f64::from(WIFI_MAX_SCORE);
        }
        let is_score_breach_high = (0.0..f64::from(WIFI_TRANSITION_SCORE))
            .contains(&self.prev_score)
            && score >= f64::from(WIFI_TRANSITION_SCORE);

        if is_score_breach_low || is_score_breach_high {
            self.last_score_breach_time_ms = now_ms;
        }

        if self.last_score_breach_time_ms != INVALID_TIMESTAMP_MS {
            let since_breach = now_ms - self.last_score_breach_time_ms;
            if (since_breach > HYSTERESIS_NETWORK_STATUS_CHANGE_MILLIS
                || self.is_score_trending_downwards
                || rssi <= RSSI_THRESHOLD_NO_HYSTERESIS_NETWORK_STATUS_CHANGE_DBM)
                && rssi < SCORE_BREACHING_RSSI_THRESHOLD
                && score < f64::from(WIFI_TRANSITION_SCORE)
            {
                self.recommend_default_network = false;
            }
            if since_breach > HYSTERESIS_NETWORK_STATUS_CHANGE_MILLIS
                && score > f64::from(WIFI_TRANSITION_SCORE)
            {
                self.recommend_default_network = true;
            }
        }

        self.block_current_bssid = score < f64::from(WIFI_TRANSITION_SCORE)
            && rssi < SCORE_BREACHING_RSSI_THRESHOLD
            && self.last_score_breach_time_ms != INVALID_TIMESTAMP_MS
            && (now_ms - self.last_score_breach_time_ms)
                > MIN_TIME_TO_WAIT_BEFORE_BLOCK_BSSID_MILLIS;

        self.prev_score = score;
        self.prev_raw_score = raw_score;
        score
    }

    /// Clear the per-session hysteresis state for a new connection.
    pub fn reset(&mut self) {
        self.prev_score = MAX_SCORE;
        self.prev_raw_score = MAX_SCORE;
        self.recommend_default_network = true;
        self.block_current_bssid = false;
        self.last_score_breach_time_ms = INVALID_TIMESTAMP_MS;
        self.is_score_trending_downwards = false;
    }

    #[cfg(test)]
    pub(crate) fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
