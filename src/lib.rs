//! argus: Wi-Fi link-quality monitor
//!
//! Two subsystems:
//! 1. A generic netlink (nl80211) protocol engine: wire codec, raw socket
//!    transport with synchronous and asynchronous request correlation, and
//!    a broadcast monitor demultiplexing kernel events to registered
//!    listeners on a serialized control thread. See [`netlink`].
//! 2. A streaming connection-quality scorer: windowed feature extraction
//!    over periodic radio statistics, a random-forest usability classifier,
//!    and a score adjuster driving scan/NUD decisions with debouncing and
//!    hysteresis. See [`scorer`].
//!
//! Threading model: callers block on the synchronous request path; the
//! broadcast monitor reads on a background pool worker; completions and
//! event dispatches are posted to one serialized [`runner::EventRunner`].

pub mod netlink;
pub mod runner;
pub mod scorer;

/// Sentinel for "this has never happened" timestamps.
pub const INVALID_TIMESTAMP_MS: i64 = -1;

/// Ceiling of the connection-score scale reported to the network stack.
pub const WIFI_MAX_SCORE: i32 = 60;
/// Threshold separating a usable connection from a low-quality one.
pub const WIFI_TRANSITION_SCORE: i32 = 50;

pub use netlink::{
    GenericNetlinkMsg, NlAttr, Nl80211Client, Nl80211Proxy, ParsedFrame, ResponseListener,
};
pub use runner::EventRunner;
pub use scorer::adjuster::{NudProber, ScanScheduler, ScoreAdjuster, ScoreState, ScoringParams};
pub use scorer::forest::{RandomForestClassifier, RandomForestModel, UsabilityClassifier};
pub use scorer::score::{LinkInfo, MlScorer, ScoreResult};
pub use scorer::stats::LinkStats;

#[cfg(test)]
mod tests;
