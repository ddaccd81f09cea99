// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

pub static SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("auricle_tap_sessions_active", "Currently tracked tap sessions").unwrap()
});

pub static TAPS_STARTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "auricle_tap_started_total",
        "Accepted start_tap requests by backend",
        &["backend"]
    )
    .unwrap()
});

pub static TAPS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("auricle_tap_failed_total", "start_tap requests that failed").unwrap()
});

pub static SNOOPS_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("auricle_tap_snoops_total", "Snoop channels created").unwrap()
});

pub static BRIDGES_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("auricle_tap_bridges_total", "Mixing bridges created").unwrap()
});

pub static EXTERNAL_MEDIA_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_tap_external_media_total",
        "External media channels created"
    )
    .unwrap()
});

pub static GATEWAY_REGISTER_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "auricle_tap_gateway_register_failures_total",
        "Non-fatal gateway register failures"
    )
    .unwrap()
});

pub static CLEANUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "auricle_tap_cleanups_total",
        "Tap session cleanups by reason",
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
