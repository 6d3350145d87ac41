// Cross-module tests: end-to-end flows through the protocol engine and the
// scoring pipeline, plus wire-format round trips over varied payloads.

use std::collections::VecDeque;
use std::sync::Arc;

use threadpool::ThreadPool;

use crate::netlink::attr::{decode_all, NlAttr};
use crate::netlink::message::GenericNetlinkMsg;
use crate::netlink::structures::{
    CTRL_ATTR_FAMILY_NAME, CTRL_CMD_GETFAMILY, GENL_ID_CTRL, NLM_F_DUMP, NL80211_ATTR_IFNAME,
    NL80211_CMD_GET_INTERFACE, NL80211_CMD_NEW_SCAN_RESULTS, NLM_F_MULTI, NLM_F_REQUEST,
};
use crate::netlink::testutil::{done_buffer, family_response, FakeNetlinkFactory};
use crate::netlink::{BroadcastCallback, Nl80211Client, Nl80211Proxy};
use crate::runner::EventRunner;
use crate::scorer::forest::{
    DecisionTreeModel, RandomForestClassifier, RandomForestModel, TreeNode, UsabilityClassifier,
};
use crate::scorer::features::FEATURE_VECTOR_LEN;
use crate::scorer::score::{LinkInfo, MlScorer};
use crate::scorer::stats::{LinkStats, StatsEntry};
use crate::{INVALID_TIMESTAMP_MS, WIFI_TRANSITION_SCORE};

fn single_leaf_model(probability: f64) -> RandomForestModel {
    RandomForestModel {
        decision_trees: vec![DecisionTreeModel {
            nodes: vec![TreeNode::leaf(probability)],
        }],
        feature_norm_means: vec![0.0; FEATURE_VECTOR_LEN],
        feature_norm_stds: vec![1.0; FEATURE_VECTOR_LEN],
    }
}

// ============================================================================
// Protocol engine end-to-end
// ============================================================================

#[test]
fn test_initialization_handshake_end_to_end() {
    let runner = EventRunner::new("control");
    let factory = FakeNetlinkFactory::new();
    let pool = ThreadPool::new(1);

    // Family response: {CTRL_ATTR_FAMILY_ID: 25} plus the multicast groups.
    factory
        .request_io
        .queue_response(family_response(25, 1).pack());

    let proxy = Nl80211Proxy::with_factory(Arc::clone(&factory) as _, runner);
    assert!(proxy.initialize(&pool));

    // The handshake sent exactly one request: GETFAMILY for "nl80211",
    // addressed to the controller family.
    let sent = factory.request_io.sent_requests();
    assert_eq!(sent.len(), 1);
    let request = GenericNetlinkMsg::unpack(&sent[0]).unwrap();
    assert_eq!(request.header.nlmsg_type, GENL_ID_CTRL);
    assert_eq!(request.command(), CTRL_CMD_GETFAMILY);
    assert_eq!(
        request
            .get_attribute(CTRL_ATTR_FAMILY_NAME)
            .and_then(NlAttr::as_string)
            .as_deref(),
        Some("nl80211")
    );

    // Requests created afterwards carry the resolved family id.
    let request = proxy.create_request(NL80211_CMD_GET_INTERFACE, 0).unwrap();
    assert_eq!(request.header.nlmsg_type, 25);
}

#[test]
fn test_interface_dump_end_to_end() {
    let runner = EventRunner::new("control");
    let factory = FakeNetlinkFactory::new();
    let pool = ThreadPool::new(1);
    factory
        .request_io
        .queue_response(family_response(25, 1).pack());

    let proxy = Arc::new(Nl80211Proxy::with_factory(Arc::clone(&factory) as _, runner));
    let client = Nl80211Client::with_proxy(Arc::clone(&proxy));
    assert!(client.initialize(&pool));

    // Dump reply (sequence 2): two interfaces, then DONE.
    let mut buffer = Vec::new();
    for name in ["wlan0", "p2p0"] {
        let mut msg = GenericNetlinkMsg::new(
            NL80211_CMD_GET_INTERFACE,
            0,
            25,
            NLM_F_REQUEST | NLM_F_MULTI,
        );
        msg.header.nlmsg_seq = 2;
        msg.add_attribute(NlAttr::new_string(NL80211_ATTR_IFNAME, name));
        buffer.extend_from_slice(&msg.pack());
    }
    buffer.extend_from_slice(&done_buffer(2));
    factory.request_io.queue_response(buffer);

    assert_eq!(
        client.interface_names(),
        Some(vec!["wlan0".to_string(), "p2p0".to_string()])
    );

    // The dump request was flagged as such.
    let sent = factory.request_io.sent_requests();
    let dump_request = GenericNetlinkMsg::unpack(&sent[1]).unwrap();
    assert_eq!(dump_request.header.nlmsg_flags & NLM_F_DUMP, NLM_F_DUMP);
}

#[test]
fn test_broadcast_flow_through_proxy() {
    use parking_lot::Mutex;

    struct RecordingCallback {
        commands: Mutex<Vec<u8>>,
    }
    impl BroadcastCallback for RecordingCallback {
        fn on_event(&self, command: u8, _message: &GenericNetlinkMsg) {
            self.commands.lock().push(command);
        }
    }

    let runner = EventRunner::new("control");
    let factory = FakeNetlinkFactory::new();
    let pool = ThreadPool::new(1);
    factory
        .request_io
        .queue_response(family_response(25, 1).pack());

    let proxy = Nl80211Proxy::with_factory(Arc::clone(&factory) as _, Arc::clone(&runner));
    assert!(proxy.initialize(&pool));
    assert_eq!(*factory.joined_groups.lock(), vec![11, 12, 13]);

    let callback = Arc::new(RecordingCallback {
        commands: Mutex::new(Vec::new()),
    });
    assert!(proxy
        .register_broadcast_callback(NL80211_CMD_NEW_SCAN_RESULTS, callback.clone() as _));

    // Unregistration works while the monitor is live.
    let as_dyn = callback.clone() as Arc<dyn BroadcastCallback>;
    assert!(proxy.unregister_broadcast_callback(NL80211_CMD_NEW_SCAN_RESULTS, &as_dyn));
    assert!(proxy.register_broadcast_callback(NL80211_CMD_NEW_SCAN_RESULTS, as_dyn));
}

#[test]
fn test_attribute_round_trip_varied_payload_sizes() {
    // decode(encode(x)) == x across payload lengths straddling every
    // padding residue.
    for size in 0..32usize {
        let payload: Vec<u8> = (0..size).map(|i| (i * 7 + 3) as u8).collect();
        let attr = NlAttr::new(9, payload);
        let encoded = attr.encode();
        assert_eq!(encoded.len() % 4, 0);
        let (decoded, consumed) = NlAttr::decode(&encoded, 0).unwrap();
        assert_eq!(decoded, attr);
        assert_eq!(consumed, encoded.len());
    }
}

#[test]
fn test_message_round_trip_with_deep_nesting() {
    let leaf = vec![NlAttr::new_u32(1, 7), NlAttr::new_string(2, "inner")];
    let mid = vec![NlAttr::new_nested(1, &leaf), NlAttr::new_u16(2, 25)];
    let mut msg = GenericNetlinkMsg::new(33, 0, 25, NLM_F_REQUEST);
    msg.header.nlmsg_seq = 4;
    msg.add_attribute(NlAttr::new_nested(5, &mid));
    msg.add_attribute(NlAttr::new_u64(6, u64::MAX));

    let unpacked = GenericNetlinkMsg::unpack(&msg.pack()).unwrap();
    assert_eq!(unpacked, msg);

    let container = unpacked.get_attribute(5).unwrap();
    let mid_decoded = container.as_nested().unwrap();
    assert_eq!(mid_decoded, mid);
    assert_eq!(mid_decoded[0].as_nested().unwrap(), leaf);
}

#[test]
fn test_every_byte_of_attribute_stream_is_consumed() {
    let mut buf = Vec::new();
    let attrs = vec![
        NlAttr::new_u8(1, 1),
        NlAttr::new_string(2, "abc"),
        NlAttr::new_nested(3, &[NlAttr::new_u16(1, 2)]),
    ];
    for attr in &attrs {
        attr.encode_into(&mut buf);
    }
    assert_eq!(decode_all(&buf).unwrap(), attrs);
}

// ============================================================================
// Scoring pipeline end-to-end
// ============================================================================

#[test]
fn test_leaf_probability_maps_to_score() {
    // A forest whose single one-node tree holds probability 0.2 scores
    // 100 * (1 - 0.2) for any input.
    let classifier = RandomForestClassifier::new(single_leaf_model(0.2));
    let mut window = VecDeque::new();
    window.push_back(StatsEntry::new(LinkStats::default()));
    assert!((classifier.calculate_score(&window) - 80.0).abs() < 1e-9);
    window.push_back(StatsEntry::new(LinkStats {
        rssi: -90,
        ..LinkStats::default()
    }));
    assert!((classifier.calculate_score(&window) - 80.0).abs() < 1e-9);
}

#[test]
fn test_snapshot_stream_to_score_result() {
    let classifier = Box::new(RandomForestClassifier::new(single_leaf_model(0.2)));
    let mut scorer = MlScorer::new(classifier);

    let link = LinkInfo {
        bssid: Some("aa:bb:cc:dd:ee:ff".to_string()),
        frequency_mhz: 5180,
        score: 60,
        tx_success_pps: 30.0,
        rx_success_pps: 30.0,
        rssi: -55,
    };

    let mut result = None;
    for tick in 0..3i64 {
        let stats = LinkStats {
            timestamp_ms: tick * 3000,
            total_tx_success: 100 * tick,
            total_rx_success: 100 * tick,
            total_radio_on_time_ms: 1000 * tick,
            link_speed_mbps: 144,
            rx_link_speed_mbps: 144,
            rssi: -55,
            ..LinkStats::default()
        };
        result = Some(scorer.generate_score_result(&link, &stats, tick * 3000, true));
    }

    let result = result.unwrap();
    // Raw 80 scales by transition/threshold (50/10) and caps at 100.
    assert_eq!(result.score, 80);
    assert_eq!(result.adjusted_score, 100);
    assert!(result.is_wifi_usable);
    assert!(!result.should_trigger_scan);
    assert!(!result.should_check_nud);
    assert!(!result.should_block_bssid);
}

#[test]
fn test_downward_breach_debounced_across_ticks() {
    use crate::scorer::adjuster::{
        ScoreAdjuster, ScoringParams, MIN_TIME_TO_KEEP_BELOW_TRANSITION_SCORE_MS,
    };

    let adjuster = ScoreAdjuster::new(ScoringParams::default());
    let link = LinkInfo {
        bssid: Some("aa:bb:cc:dd:ee:ff".to_string()),
        frequency_mhz: 2437,
        score: WIFI_TRANSITION_SCORE - 3,
        tx_success_pps: 0.0,
        rx_success_pps: 0.0,
        rssi: -88,
    };

    // With a breach on record, the score cannot re-cross upward inside the
    // dwell window given unchanged inputs.
    let breach_time = 50_000;
    for offset in (0..MIN_TIME_TO_KEEP_BELOW_TRANSITION_SCORE_MS).step_by(3000) {
        let adjusted = adjuster.adjust_score(
            &link,
            -88.0,
            breach_time,
            breach_time + offset,
            WIFI_TRANSITION_SCORE,
            WIFI_TRANSITION_SCORE + 2,
        );
        assert_eq!(adjusted, link.score);
    }
    let adjusted = adjuster.adjust_score(
        &link,
        -88.0,
        breach_time,
        breach_time + MIN_TIME_TO_KEEP_BELOW_TRANSITION_SCORE_MS,
        WIFI_TRANSITION_SCORE,
        WIFI_TRANSITION_SCORE + 2,
    );
    assert_eq!(adjusted, WIFI_TRANSITION_SCORE + 2);
}

#[test]
fn test_fresh_session_state_is_all_invalid() {
    use crate::scorer::adjuster::ScoreState;

    let state = ScoreState::default();
    assert_eq!(state.last_downward_breach_time_ms, INVALID_TIMESTAMP_MS);
    assert_eq!(state.last_scan_time_ms, INVALID_TIMESTAMP_MS);
    assert_eq!(state.last_nud_request_time_ms, INVALID_TIMESTAMP_MS);
    assert_eq!(state.last_nud_check_time_ms, INVALID_TIMESTAMP_MS);

    let mut used = state;
    used.last_scan_time_ms = 5;
    used.reset();
    assert_eq!(used, state);
}
