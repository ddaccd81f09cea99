// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use anyhow::{Context, Result};
use auricle_stream_gateway::gateway::Gateway;
use auricle_stream_gateway::settings::Settings;
use auricle_stream_gateway::types::Direction;
use auricle_stream_gateway::{assist, http, intake, rooms};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::signal::ctrl_c;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let settings = Arc::new(Settings::load("config.toml").context("Failed to read config")?);
    let gateway = Gateway::new(settings.clone());

    let rtp_in = UdpSocket::bind(&settings.rtp.bind_in)
        .await
        .with_context(|| format!("Failed to bind in intake {}", settings.rtp.bind_in))?;
    let rtp_out = UdpSocket::bind(&settings.rtp.bind_out)
        .await
        .with_context(|| format!("Failed to bind out intake {}", settings.rtp.bind_out))?;

    log::info!(
        "rtp intakes on {} (in) and {} (out)",
        settings.rtp.bind_in,
        settings.rtp.bind_out
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut sig_term = signal(SignalKind::terminate()).expect("can not setup SIGTERM handler");

        select! {
            _ = ctrl_c() => { log::info!("received Ctrl-C"); }
            _ = sig_term.recv() => { log::info!("received SIGTERM"); }
        }

        shutdown_tx
            .send(true)
            .expect("failed to send shutdown signal");
    });

    tokio::spawn(intake::run(
        gateway.clone(),
        Direction::In,
        rtp_in,
        shutdown_rx.clone(),
    ));
    tokio::spawn(intake::run(
        gateway.clone(),
        Direction::Out,
        rtp_out,
        shutdown_rx.clone(),
    ));

    tokio::spawn(rooms::run(
        gateway.rooms.clone(),
        settings.widget.port,
        shutdown_rx.clone(),
    ));

    if settings.assistant.enabled {
        tokio::spawn(assist::run(gateway.clone(), shutdown_rx.clone()));
    }

    http::run(settings.http.port, gateway.clone(), shutdown_rx).await?;

    // drain live sessions so upstream sockets close cleanly
    gateway.drain("shutdown");

    for _ in 0..10 {
        if gateway.session_count() == 0 {
            break;
        }

        log::info!("waiting for {} sessions to end", gateway.session_count());

        sleep(Duration::from_millis(500)).await;
    }

    log::info!("stream gateway exiting, bye!");

    Ok(())
}
