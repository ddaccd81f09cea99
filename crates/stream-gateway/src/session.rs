// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Per-SSRC streaming sessions.
//!
//! A session task owns its upstream speech socket across reconnects. Audio
//! arrives over an unbounded channel from the RTP intake, transcripts are
//! published to the call's widget room, and every terminal cause funnels
//! into one teardown path that removes the session from the table.

use crate::assist;
use crate::deepgram::{self, WsStream};
use crate::gateway::Gateway;
use crate::metrics;
use crate::roles;
use crate::rooms::WidgetEvent;
use crate::settings::Settings;
use crate::types::{Direction, Registration};
use auricle_media::wav::{WavDump, DEFAULT_DUMP_SECS};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, Sleep};
use tt::tungstenite::Message;

/// Payloads buffered while the first connect is still in flight (~1 s)
pub const BOOT_FRAME_CAP: usize = 50;

const WATCHDOG_PERIOD: Duration = Duration::from_secs(2);

pub struct SessionContext {
    pub gateway: Arc<Gateway>,
    pub direction: Direction,
    pub ssrc: u32,
    pub call_uuid: String,
    pub registration: Registration,
    pub room: String,
}

type ConnectFuture = Pin<Box<dyn Future<Output = anyhow::Result<WsStream>> + Send>>;

/// Upstream link state: connecting, open, or waiting out a backoff delay
enum Link {
    Connecting(ConnectFuture),
    Open(SplitSink<WsStream, Message>, mpsc::UnboundedReceiver<String>),
    Waiting(Pin<Box<Sleep>>),
}

enum LinkEvent {
    Connected(Box<WsStream>),
    ConnectFailed(anyhow::Error),
    Inbound(String),
    Closed,
    Retry,
}

async fn link_event(link: &mut Link) -> LinkEvent {
    match link {
        Link::Connecting(future) => match future.as_mut().await {
            Ok(websocket) => LinkEvent::Connected(Box::new(websocket)),
            Err(e) => LinkEvent::ConnectFailed(e),
        },
        Link::Open(_, inbound) => match inbound.recv().await {
            Some(text) => LinkEvent::Inbound(text),
            None => LinkEvent::Closed,
        },
        Link::Waiting(sleep) => {
            sleep.as_mut().await;
            LinkEvent::Retry
        }
    }
}

fn connect_link(settings: Arc<Settings>) -> Link {
    Link::Connecting(Box::pin(
        async move { deepgram::connect(&settings.speech).await },
    ))
}

fn schedule_reconnect(attempt: &mut u32) -> Link {
    let delay = backoff_delay(*attempt);
    *attempt += 1;

    metrics::RECONNECTS.inc();
    log::debug!("reconnecting upstream in {delay:?} (attempt {attempt})");

    Link::Waiting(Box::pin(tokio::time::sleep(delay)))
}

/// Exponential backoff: base 500 ms doubling per attempt, capped at 8 s,
/// plus up to 200 ms of jitter
pub fn backoff_delay(attempt: u32) -> Duration {
    const BASE_MS: u64 = 500;
    const CAP_MS: u64 = 8_000;
    const JITTER_MS: u64 = 200;

    let exp = BASE_MS.saturating_mul(2u64.saturating_pow(attempt)).min(CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=JITTER_MS);

    Duration::from_millis(exp + jitter)
}

pub async fn run(
    ctx: SessionContext,
    mut audio_rx: mpsc::UnboundedReceiver<Bytes>,
    mut end_rx: mpsc::UnboundedReceiver<&'static str>,
) {
    let settings = ctx.gateway.settings.clone();

    log::info!(
        "session {:08x} ({}) bound to call {} (room {})",
        ctx.ssrc,
        ctx.direction.as_str(),
        ctx.call_uuid,
        ctx.room
    );

    let mut dump = settings
        .rtp
        .dump
        .then(|| {
            let path = settings.rtp.dump_dir.join(format!(
                "{}-{}-{:08x}.wav",
                ctx.call_uuid,
                ctx.direction.as_str(),
                ctx.ssrc
            ));

            WavDump::create(&path, DEFAULT_DUMP_SECS)
                .map_err(|e| log::warn!("cannot create wav dump {}: {e}", path.display()))
                .ok()
        })
        .flatten();

    let mut link = connect_link(settings.clone());
    let mut boot: Vec<Bytes> = Vec::new();
    let mut ever_opened = false;
    let mut attempt: u32 = 0;
    let mut last_rtp = Instant::now();
    let mut watchdog = interval(WATCHDOG_PERIOD);

    let reason = 'session: loop {
        tokio::select! {
            event = link_event(&mut link) => match event {
                LinkEvent::Connected(websocket) => {
                    let (mut sink, stream) = (*websocket).split();
                    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

                    tokio::spawn(read_upstream(stream, inbound_tx));

                    attempt = 0;

                    let mut flush_failed = false;

                    if !ever_opened {
                        // the boot buffer replays exactly once, then is gone
                        ever_opened = true;

                        for pcm in boot.drain(..) {
                            if sink.send(Message::Binary(pcm.to_vec())).await.is_err() {
                                flush_failed = true;
                                break;
                            }
                        }

                        boot = Vec::new();
                    }

                    link = if flush_failed {
                        schedule_reconnect(&mut attempt)
                    } else {
                        Link::Open(sink, inbound_rx)
                    };
                }
                LinkEvent::ConnectFailed(e) => {
                    log::warn!("upstream connect failed for {:08x}: {e:#}", ctx.ssrc);
                    link = schedule_reconnect(&mut attempt);
                }
                LinkEvent::Inbound(text) => handle_inbound(&ctx, &text),
                LinkEvent::Closed => {
                    log::warn!("upstream socket closed for {:08x}", ctx.ssrc);
                    link = schedule_reconnect(&mut attempt);
                }
                LinkEvent::Retry => {
                    link = connect_link(settings.clone());
                }
            },
            received = audio_rx.recv() => match received {
                Some(pcm) => {
                    last_rtp = Instant::now();

                    if let Some(dump) = &mut dump {
                        dump.write(&pcm).ok();
                    }

                    match &mut link {
                        Link::Open(sink, _) => {
                            if let Err(e) = sink.send(Message::Binary(pcm.to_vec())).await {
                                log::warn!("upstream write failed for {:08x}: {e}", ctx.ssrc);
                                link = schedule_reconnect(&mut attempt);
                            }
                        }
                        _ => {
                            if !ever_opened && boot.len() < BOOT_FRAME_CAP {
                                boot.push(pcm);
                            } else {
                                metrics::FRAMES_DROPPED.inc();
                            }
                        }
                    }
                }
                None => break 'session "intake-gone",
            },
            _ = watchdog.tick() => {
                if last_rtp.elapsed() > settings.sessions.inactivity {
                    break 'session "inactivity";
                }
            }
            reason = end_rx.recv() => {
                break 'session reason.unwrap_or("shutdown");
            }
        }
    };

    // deliberate teardown: no reconnect beyond this point
    if let Link::Open(mut sink, _) = link {
        sink.send(Message::Close(None)).await.ok();
    }

    if let Some(dump) = &mut dump {
        dump.finalize().ok();
    }

    metrics::SESSION_ENDS.with_label_values(&[reason]).inc();

    log::info!("session {:08x} ended ({reason})", ctx.ssrc);

    ctx.gateway
        .remove_session(ctx.direction, ctx.ssrc, &ctx.call_uuid, &ctx.room);
}

async fn read_upstream(mut stream: SplitStream<WsStream>, tx: mpsc::UnboundedSender<String>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if tx.send(text).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

fn handle_inbound(ctx: &SessionContext, text: &str) {
    let Some(transcript) = deepgram::parse_results(text) else {
        return;
    };

    metrics::TRANSCRIPTS.inc();

    let mode = ctx.gateway.settings.role_mode;
    let speaker = roles::speaker(mode, ctx.direction, &ctx.registration);

    ctx.gateway.rooms.publish(
        &ctx.room,
        &WidgetEvent::Stt {
            text: transcript.text.clone(),
            is_final: transcript.is_final,
            words: transcript.words,
            uuid: ctx.call_uuid.clone(),
            dir: ctx.direction.as_str().to_owned(),
            speaker,
            exten: ctx.registration.extension.clone(),
            caller: ctx.registration.caller.clone(),
        },
    );

    if transcript.is_final && ctx.gateway.settings.assistant.enabled {
        assist::append(
            &ctx.gateway,
            &ctx.call_uuid,
            roles::conversation_role(mode, ctx.direction),
            &transcript.text,
        );
    }
}
