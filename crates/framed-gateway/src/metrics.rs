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
        "auricle_fgw_sessions_active",
        "Currently live framed gateway sessions"
    )
    .unwrap()
});

pub static REGISTERS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_fgw_registers_total",
        "Accepted register requests"
    )
    .unwrap()
});

pub static REGISTER_CONFLICTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_fgw_register_conflicts_total",
        "Register requests rejected because the port was taken"
    )
    .unwrap()
});

pub static RTP_PACKETS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_fgw_rtp_packets_total",
        "Inbound RTP datagrams across all sessions"
    )
    .unwrap()
});

pub static RTP_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_fgw_rtp_bytes_total",
        "Inbound RTP payload bytes across all sessions"
    )
    .unwrap()
});

pub static RTP_INVALID: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_fgw_rtp_invalid_total",
        "Datagrams dropped because they did not parse as RTP"
    )
    .unwrap()
});

pub static AUDIO_FRAMES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_fgw_audio_frames_total",
        "AUDIO frames written or queued for the downstream peer"
    )
    .unwrap()
});

pub static QUEUE_FLUSHES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_fgw_queue_flushes_total",
        "Pre-connect queues flushed after the TCP connect completed"
    )
    .unwrap()
});

pub static SESSION_ENDS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "auricle_fgw_session_ends_total",
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
