// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

pub static SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "auricle_sgw_sessions_active",
        "Currently live upstream streaming sessions"
    )
    .unwrap()
});

pub static SESSIONS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_sgw_sessions_dropped_total",
        "New SSRCs dropped because the session cap was reached"
    )
    .unwrap()
});

pub static RTP_PACKETS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "auricle_sgw_rtp_packets_total",
        "Inbound RTP datagrams per direction",
        &["dir"]
    )
    .unwrap()
});

pub static RTP_INVALID: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_sgw_rtp_invalid_total",
        "Datagrams dropped because they did not parse as RTP"
    )
    .unwrap()
});

pub static FRAMES_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_sgw_frames_dropped_total",
        "PCM payloads dropped while the upstream socket was not open"
    )
    .unwrap()
});

pub static RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_sgw_reconnects_total",
        "Upstream socket reconnect attempts"
    )
    .unwrap()
});

pub static TRANSCRIPTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_sgw_transcripts_total",
        "Transcript results republished to widget rooms"
    )
    .unwrap()
});

pub static WIDGET_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_sgw_widget_events_total",
        "Events published to widget rooms"
    )
    .unwrap()
});

pub static WIDGET_SUBSCRIBERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "auricle_sgw_widget_subscribers",
        "Currently connected widget subscribers"
    )
    .unwrap()
});

pub static ASSIST_REQUESTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_sgw_assist_requests_total",
        "Conversation snapshots sent to the assistant endpoint"
    )
    .unwrap()
});

pub static ASSIST_REPLIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_sgw_assist_replies_total",
        "Assistant replies published to widget rooms"
    )
    .unwrap()
});

pub static SESSION_ENDS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "auricle_sgw_session_ends_total",
        "Ended sessions by terminal reason",
        &["reason"]
    )
    .unwrap()
});

pub fn render() -> String {
    let mut buf = Vec::new();

    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buf) {
        log::error!("failed to encode metrics: {e}");
    }

    String::from_utf8(buf).unwrap_or_default()
}
