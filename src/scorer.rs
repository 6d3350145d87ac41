//! ML connection-quality scoring pipeline
//!
//! A stream of link-layer statistics snapshots is windowed, diffed and
//! sanitized (`stats`), turned into a dense normalized feature vector
//! (`features`), scored by a random-forest ensemble (`forest`), and folded
//! into a connection score with debouncing and hysteresis (`score`,
//! `adjuster`).

pub mod adjuster;
pub mod features;
pub mod forest;
pub mod score;
pub mod stats;

// Polling cadence of the statistics source.
pub const POLLING_INTERVAL_MS: i64 = 3000;
/// Slack between a poll being triggered and its stats arriving.
pub const POLLING_DELAY_MS: i64 = 3000;

/// Window bounds: one scoring example is between 1 and 5 snapshots.
pub const MAX_BUFFER_SIZE: usize = 5;
pub const MIN_BUFFER_SIZE: usize = 1;

/// Score reported when the model could not produce a prediction.
pub const UNCLASSIFIED_SCORE: f64 = -1.0;
/// Upper bound of the raw and adjusted score scales.
pub const MAX_SCORE: f64 = 100.0;

/// Minimum on-channel time before a CCA busy ratio is trusted.
pub const MIN_DURATION_UPDATING_CCA_MS: f64 = 50.0;

// Raw-score thresholds feeding the adjusted-score scaling.
pub const RAW_SCORE_THRESHOLD: f64 = 10.0;
pub const RAW_SCORE_THRESHOLD_HYSTERESIS: f64 = 70.0;
pub const SCAN_TRIGGERING_THRESHOLD: f64 = 10.0;

// Network-status debouncing.
pub const HYSTERESIS_NETWORK_STATUS_CHANGE_MILLIS: i64 = 5000;
pub const MIN_TIME_TO_WAIT_BEFORE_BLOCK_BSSID_MILLIS: i64 = 29000;
pub const RSSI_THRESHOLD_NO_HYSTERESIS_NETWORK_STATUS_CHANGE_DBM: i32 = -81;
pub const SCORE_BREACHING_RSSI_THRESHOLD: i32 = -67;

// Already-bad-link overrides.
pub const SCORE_LOW_RSSI_THR_DBM: i32 = -86;
pub const SCORE_LOW_TX_BAD_THR: f64 = 1000.0;
pub const SCORE_LOW_TX_SUCCESS_TO_BAD_RATIO_THR: f64 = 6.0;

// Link-speed sanity floors for the NUD heuristics.
pub const LINK_SPEED_LOW_MBPS: i32 = 18;
pub const LINK_SPEED_VERY_LOW_MBPS: i32 = 6;
