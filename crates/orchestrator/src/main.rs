// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use anyhow::{Context, Result};
use auricle_orchestrator::settings::Settings;
use auricle_orchestrator::tap::Orchestrator;
use auricle_orchestrator::{events, http};
use std::sync::Arc;
use tokio::select;
use tokio::signal::ctrl_c;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let settings = Arc::new(Settings::load("config.toml").context("Failed to read config")?);

    let orchestrator = Orchestrator::new(settings.clone())?;

    let stasis_events = orchestrator.connect_events().await?;

    log::info!(
        "subscribed to stasis application '{}' at {}",
        settings.ari.app,
        settings.ari.base_url
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

    tokio::spawn(http::run(
        settings.http.port,
        orchestrator.clone(),
        shutdown_rx.clone(),
    ));

    let result = events::run(orchestrator.clone(), stasis_events, shutdown_rx).await;

    // tear down every remaining tap before exiting, whatever the cause
    for uuid in orchestrator.session_ids() {
        orchestrator.cleanup_session(&uuid, "shutdown").await;
    }

    log::info!("orchestrator exiting, bye!");

    result
}
