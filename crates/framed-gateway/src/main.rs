// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use anyhow::{Context, Result};
use auricle_framed_gateway::http;
use auricle_framed_gateway::session::{SessionConfig, Sessions};
use auricle_framed_gateway::settings::Settings;
use std::time::Duration;
use tokio::select;
use tokio::signal::ctrl_c;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let settings = Settings::load("config.toml").context("Failed to read config")?;

    let sessions = Sessions::new(SessionConfig {
        downstream: format!("{}:{}", settings.downstream.host, settings.downstream.port),
        port_range: (settings.rtp.port_range.start, settings.rtp.port_range.end),
        inactivity: settings.rtp.inactivity,
        watchdog_period: Duration::from_secs(2),
        dump_dir: settings.rtp.dump.then(|| settings.rtp.dump_dir.clone()),
    });

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

    http::run(settings.http.port, sessions.clone(), shutdown_rx).await?;

    // drain live sessions so every downstream peer sees a final END
    sessions.drain("shutdown");

    for _ in 0..10 {
        if sessions.count() == 0 {
            break;
        }

        log::info!("waiting for {} sessions to end", sessions.count());

        sleep(Duration::from_millis(500)).await;
    }

    log::info!("framed gateway exiting, bye!");

    Ok(())
}
