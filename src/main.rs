// ============================================================================
// ARGUS: Wi-Fi LINK QUALITY MONITOR
// ============================================================================
// Two modes:
// - live (default): initialize the nl80211 proxy, list wireless interfaces,
//   subscribe to scan/regulatory broadcasts, and log events as they arrive.
// - replay: feed recorded link statistics (JSON lines of {link, stats})
//   through the ML scorer and score adjuster, printing one ScoreResult JSON
//   line per tick. Used to evaluate models against captured traces.

use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use threadpool::ThreadPool;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use argus::netlink::message::GenericNetlinkMsg;
use argus::netlink::monitor::BroadcastCallback;
use argus::netlink::structures::{
    NL80211_CMD_NEW_SCAN_RESULTS, NL80211_CMD_REG_CHANGE, NL80211_CMD_SCAN_ABORTED,
};
use argus::scorer::adjuster::{NudProber, ScanScheduler, ScoreAdjuster, ScoreState, ScoringParams};
use argus::scorer::forest::{classifier_for_model, RANDOM_FOREST_MODEL_ID};
use argus::scorer::score::{LinkInfo, MlScorer};
use argus::scorer::stats::LinkStats;
use argus::{EventRunner, Nl80211Client, Nl80211Proxy, WIFI_TRANSITION_SCORE};

const USAGE: &str = "usage: argus [--model <model.json>] [--replay <stats.jsonl>]";

struct Options {
    model_path: Option<PathBuf>,
    replay_path: Option<PathBuf>,
}

fn parse_args() -> Result<Options, String> {
    let mut options = Options {
        model_path: None,
        replay_path: None,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--model" => {
                options.model_path = Some(PathBuf::from(
                    args.next().ok_or("--model requires a path")?,
                ));
            }
            "--replay" => {
                options.replay_path = Some(PathBuf::from(
                    args.next().ok_or("--replay requires a path")?,
                ));
            }
            "--help" | "-h" => return Err(USAGE.to_string()),
            other => return Err(format!("unknown argument: {other}\n{USAGE}")),
        }
    }
    Ok(options)
}

/// One recorded scoring tick.
#[derive(Debug, Deserialize)]
struct ReplayRecord {
    link: LinkInfo,
    stats: LinkStats,
}

struct LoggingScanScheduler;

impl ScanScheduler for LoggingScanScheduler {
    fn force_connectivity_scan(&self) {
        info!("connectivity scan requested");
    }
}

struct LoggingNudProber;

impl NudProber for LoggingNudProber {
    fn confirm_configuration(&self) {
        info!("NUD probe requested");
    }
}

struct EventLogger;

impl BroadcastCallback for EventLogger {
    fn on_event(&self, command: u8, message: &GenericNetlinkMsg) {
        info!(
            command,
            attributes = message.attributes.len(),
            "nl80211 broadcast"
        );
    }
}

fn run_replay(model_path: &PathBuf, replay_path: &PathBuf) -> ExitCode {
    let Some(classifier) = classifier_for_model(RANDOM_FOREST_MODEL_ID, model_path) else {
        error!(path = %model_path.display(), "model unavailable, cannot replay");
        return ExitCode::FAILURE;
    };
    let mut scorer = MlScorer::new(classifier);
    let adjuster = ScoreAdjuster::new(ScoringParams::default());
    let mut state = ScoreState::default();
    let scheduler = LoggingScanScheduler;
    let prober = LoggingNudProber;

    let file = match File::open(replay_path) {
        Ok(file) => file,
        Err(e) => {
            error!(path = %replay_path.display(), "could not open replay file: {e}");
            return ExitCode::FAILURE;
        }
    };

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(line_no, "read error: {e}");
                return ExitCode::FAILURE;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line_no, "skipping undecodable record: {e}");
                continue;
            }
        };

        let now_ms = record.stats.timestamp_ms;
        let result = scorer.generate_score_result(&record.link, &record.stats, now_ms, true);

        if result.adjusted_score < WIFI_TRANSITION_SCORE
            && state.last_downward_breach_time_ms == argus::INVALID_TIMESTAMP_MS
        {
            state.last_downward_breach_time_ms = now_ms;
        }
        if adjuster.trigger_scan_if_needed(
            &scheduler,
            state.last_scan_time_ms,
            now_ms,
            result.should_trigger_scan,
        ) {
            state.last_scan_time_ms = now_ms;
        }
        if result.should_check_nud
            && adjuster.check_nud_if_needed(Some(&prober), state.last_nud_check_time_ms, now_ms)
        {
            state.last_nud_check_time_ms = now_ms;
            state.last_nud_request_time_ms = now_ms;
            state.last_nud_request_score = result.adjusted_score;
        }

        match serde_json::to_string(&result) {
            Ok(json) => println!("{json}"),
            Err(e) => error!("could not serialize result: {e}"),
        }
    }
    ExitCode::SUCCESS
}

fn run_live() -> ExitCode {
    let control_runner = EventRunner::new("wifi-control");
    let background_pool = ThreadPool::new(2);

    let proxy = Arc::new(Nl80211Proxy::new(Arc::clone(&control_runner)));
    let client = Nl80211Client::with_proxy(Arc::clone(&proxy));
    if !client.initialize(&background_pool) {
        error!("nl80211 initialization failed (missing kernel support or permissions)");
        return ExitCode::FAILURE;
    }

    match client.interface_names() {
        Some(names) => info!(?names, "wireless interfaces"),
        None => warn!("could not enumerate wireless interfaces"),
    }

    let logger = Arc::new(EventLogger);
    for command in [
        NL80211_CMD_NEW_SCAN_RESULTS,
        NL80211_CMD_SCAN_ABORTED,
        NL80211_CMD_REG_CHANGE,
    ] {
        if !proxy.register_broadcast_callback(command, logger.clone() as _) {
            warn!(command, "broadcast registration failed");
        }
    }

    info!("monitoring nl80211 broadcasts");
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = match parse_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    match (&options.replay_path, &options.model_path) {
        (Some(replay), Some(model)) => run_replay(model, replay),
        (Some(_), None) => {
            eprintln!("--replay requires --model\n{USAGE}");
            ExitCode::FAILURE
        }
        (None, _) => run_live(),
    }
}
