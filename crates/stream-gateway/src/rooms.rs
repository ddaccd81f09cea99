// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! The widget pub/sub socket.
//!
//! Browser widgets connect with `?room=<extension>` and receive every event
//! published to that room, in publication order. Slow or gone subscribers
//! are evicted on the first failed send.

use crate::metrics;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tt::tungstenite::handshake::server::{Request, Response};
use tt::tungstenite::Message;

/// Server-emitted widget events
#[derive(Debug, Serialize)]
#[serde(tag = "event")]
pub enum WidgetEvent {
    #[serde(rename = "call-start")]
    CallStart {
        uuid: String,
        exten: String,
        caller: String,
        callername: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "stt")]
    Stt {
        text: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
        words: serde_json::Value,
        uuid: String,
        dir: String,
        speaker: String,
        exten: String,
        caller: String,
    },
    #[serde(rename = "stt-end")]
    SttEnd { uuid: String },
    #[serde(rename = "assist")]
    Assist { text: String, speaker: String },
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
pub struct Rooms {
    next_id: AtomicU64,
    inner: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `event` to every subscriber of `room`
    pub fn publish(&self, room: &str, event: &WidgetEvent) {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                log::error!("failed to serialize widget event: {e}");
                return;
            }
        };

        metrics::WIDGET_EVENTS.inc();

        let mut inner = self.inner.lock();

        let Some(subscribers) = inner.get_mut(room) else {
            return;
        };

        subscribers.retain(|subscriber| {
            let delivered = subscriber.tx.send(Message::Text(text.clone())).is_ok();

            if !delivered {
                metrics::WIDGET_SUBSCRIBERS.dec();
            }

            delivered
        });

        if subscribers.is_empty() {
            inner.remove(room);
        }
    }

    pub(crate) fn subscribe(&self, room: &str) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .lock()
            .entry(room.to_owned())
            .or_default()
            .push(Subscriber { id, tx });

        metrics::WIDGET_SUBSCRIBERS.inc();

        (id, rx)
    }

    pub(crate) fn unsubscribe(&self, room: &str, id: u64) {
        let mut inner = self.inner.lock();

        if let Some(subscribers) = inner.get_mut(room) {
            let before = subscribers.len();
            subscribers.retain(|subscriber| subscriber.id != id);

            if subscribers.len() < before {
                metrics::WIDGET_SUBSCRIBERS.dec();
            }

            if subscribers.is_empty() {
                inner.remove(room);
            }
        }
    }
}

pub async fn run(rooms: Arc<Rooms>, port: u16, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;

    log::info!("widget socket listening on ws://0.0.0.0:{port}");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let rooms = rooms.clone();

                tokio::spawn(async move {
                    if let Err(e) = serve_subscriber(rooms, stream).await {
                        log::debug!("widget connection from {peer} ended: {e}");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn serve_subscriber(rooms: Arc<Rooms>, stream: TcpStream) -> Result<()> {
    let mut room = None;

    let websocket = tt::accept_hdr_async(stream, |request: &Request, response: Response| {
        room = room_from_query(request.uri().query());
        Ok(response)
    })
    .await?;

    let Some(room) = room else {
        anyhow::bail!("missing room query parameter");
    };

    log::debug!("widget subscribed to room {room}");

    let (id, mut events) = rooms.subscribe(&room);
    let (mut sink, mut inbound) = websocket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            message = inbound.next() => {
                match message {
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    rooms.unsubscribe(&room, id);

    Ok(())
}

fn room_from_query(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .find(|(key, _)| key == "room")
        .map(|(_, value)| value.into_owned())
        .filter(|room| !room.is_empty())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stt(text: &str) -> WidgetEvent {
        WidgetEvent::Stt {
            text: text.to_owned(),
            is_final: true,
            words: serde_json::Value::Null,
            uuid: "A1".to_owned(),
            dir: "in".to_owned(),
            speaker: "Ana".to_owned(),
            exten: "200".to_owned(),
            caller: "+34600000000".to_owned(),
        }
    }

    fn text_of(message: Message) -> String {
        match message {
            Message::Text(text) => text,
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn events_reach_only_their_room_in_order() {
        let rooms = Rooms::new();

        let (_, mut rx_200) = rooms.subscribe("200");
        let (_, mut rx_300) = rooms.subscribe("300");

        rooms.publish("200", &stt("first"));
        rooms.publish("200", &stt("second"));

        let first: serde_json::Value =
            serde_json::from_str(&text_of(rx_200.try_recv().unwrap())).unwrap();
        let second: serde_json::Value =
            serde_json::from_str(&text_of(rx_200.try_recv().unwrap())).unwrap();

        assert_eq!(first["event"], "stt");
        assert_eq!(first["text"], "first");
        assert_eq!(first["isFinal"], true);
        assert_eq!(second["text"], "second");

        assert!(rx_300.try_recv().is_err());
    }

    #[test]
    fn gone_subscribers_are_evicted() {
        let rooms = Rooms::new();

        let (_, rx) = rooms.subscribe("200");
        drop(rx);

        rooms.publish("200", &stt("anyone there?"));

        assert!(rooms.inner.lock().get("200").is_none());
    }

    #[test]
    fn room_query_parameter_is_decoded() {
        assert_eq!(room_from_query(Some("room=200")).as_deref(), Some("200"));
        assert_eq!(room_from_query(Some("x=1&room=a%20b")).as_deref(), Some("a b"));
        assert_eq!(room_from_query(Some("room=")), None);
        assert_eq!(room_from_query(None), None);
    }
}
