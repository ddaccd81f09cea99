// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! The stasis event loop.
//!
//! Snoop channels entering the application drive the pipeline; terminal
//! events on any tracked channel trigger cleanup. Handlers run as their own
//! tasks so one call's setup never blocks another's, and so the two snoops
//! of a streaming tap are handled concurrently.

use crate::tap::{Orchestrator, TapArgs, EXTERNAL_MEDIA_PREFIX};
use anyhow::{bail, Result};
use auricle_ari_client::{AriEvent, AriEvents, Channel};
use std::sync::Arc;
use tokio::sync::watch;

pub async fn run(
    orchestrator: Arc<Orchestrator>,
    mut events: AriEvents,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.next() => {
                match event? {
                    Some(event) => dispatch(&orchestrator, event),
                    None => bail!("stasis event stream closed"),
                }
            }
        }
    }

    Ok(())
}

fn dispatch(orchestrator: &Arc<Orchestrator>, event: AriEvent) {
    // only events of the configured stasis application are considered
    if let Some(application) = event.application() {
        if application != orchestrator.settings.ari.app {
            return;
        }
    }

    match event {
        AriEvent::StasisStart { args, channel, .. } => {
            handle_stasis_start(orchestrator, args, channel);
        }
        AriEvent::StasisEnd { channel, .. } => {
            spawn_terminal(orchestrator, channel.id, "stasis-end");
        }
        AriEvent::ChannelHangupRequest { channel, .. } => {
            spawn_terminal(orchestrator, channel.id, "hangup-request");
        }
        AriEvent::ChannelDestroyed { channel, .. } => {
            spawn_terminal(orchestrator, channel.id, "channel-destroyed");
        }
        AriEvent::Unknown { event_type, .. } => {
            log::trace!("ignoring {event_type} event");
        }
    }
}

fn handle_stasis_start(orchestrator: &Arc<Orchestrator>, args: Vec<String>, channel: Channel) {
    let args = TapArgs::parse(&args);

    // external-media channels re-enter the application when created; they
    // are tracked already and must not be treated as snoops
    if args.role.as_deref() == Some("em") || channel.name.starts_with(EXTERNAL_MEDIA_PREFIX) {
        log::debug!("ignoring external media channel {} entering stasis", channel.name);
        return;
    }

    if args.role.as_deref() != Some("snoop") {
        log::debug!("ignoring non-snoop channel {} entering stasis", channel.name);
        return;
    }

    let Some(uuid) = args.uuid.clone() else {
        log::warn!("snoop channel {} entered stasis without a call uuid", channel.name);
        return;
    };

    let orchestrator = orchestrator.clone();

    tokio::spawn(async move {
        if let Err(e) = orchestrator
            .handle_snoop_started(&uuid, &args, &channel)
            .await
        {
            log::error!("failed to set up snoop {} for call {uuid}: {e:#}", channel.id);

            orchestrator.cleanup_session(&uuid, "snoop-setup-failed").await;
        }
    });
}

fn spawn_terminal(orchestrator: &Arc<Orchestrator>, channel_id: String, reason: &'static str) {
    let orchestrator = orchestrator.clone();

    tokio::spawn(async move {
        orchestrator.handle_terminal_event(&channel_id, reason).await;
    });
}
