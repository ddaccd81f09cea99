// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! The ARI event stream.
//!
//! Events arrive as JSON text messages discriminated on their `type` field.
//! Known types are modelled as enum variants; everything else is delivered
//! unchanged in [`AriEvent::Unknown`] so consumers can still observe it.

use crate::types::Channel;
use crate::AriError;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::net::TcpStream;
use tt::tungstenite::Message;
use tt::{MaybeTlsStream, WebSocketStream};

/// Event received on the stasis application event stream
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum AriEvent {
    StasisStart {
        #[serde(default)]
        application: String,
        #[serde(default)]
        args: Vec<String>,
        channel: Channel,
    },
    StasisEnd {
        #[serde(default)]
        application: String,
        channel: Channel,
    },
    ChannelHangupRequest {
        #[serde(default)]
        application: String,
        channel: Channel,
        #[serde(default)]
        cause: Option<i32>,
        #[serde(default)]
        soft: Option<bool>,
    },
    ChannelDestroyed {
        #[serde(default)]
        application: String,
        channel: Channel,
    },
    #[serde(skip)]
    Unknown {
        event_type: String,
        body: serde_json::Value,
    },
}

impl AriEvent {
    /// Parse one event stream message. Unknown or unexpectedly shaped types
    /// land in [`AriEvent::Unknown`] with the raw body preserved.
    pub(crate) fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let body: serde_json::Value = serde_json::from_str(text)?;

        match serde_json::from_value::<AriEvent>(body.clone()) {
            Ok(event) => Ok(event),
            Err(_) => {
                let event_type = body
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_owned();

                Ok(AriEvent::Unknown { event_type, body })
            }
        }
    }

    /// The stasis application the event belongs to, if it carries one
    pub fn application(&self) -> Option<&str> {
        match self {
            AriEvent::StasisStart { application, .. }
            | AriEvent::StasisEnd { application, .. }
            | AriEvent::ChannelHangupRequest { application, .. }
            | AriEvent::ChannelDestroyed { application, .. } => Some(application),
            AriEvent::Unknown { body, .. } => body.get("application").and_then(|a| a.as_str()),
        }
    }

    /// The channel the event refers to, if any
    pub fn channel(&self) -> Option<&Channel> {
        match self {
            AriEvent::StasisStart { channel, .. }
            | AriEvent::StasisEnd { channel, .. }
            | AriEvent::ChannelHangupRequest { channel, .. }
            | AriEvent::ChannelDestroyed { channel, .. } => Some(channel),
            AriEvent::Unknown { .. } => None,
        }
    }
}

/// Open event stream subscribed to one stasis application.
///
/// Every event whose body carries a `channel` creates or refreshes an entry
/// in the stream's channel registry, so callers get the most recent channel
/// state alongside the event.
pub struct AriEvents {
    pub(crate) websocket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    channels: HashMap<String, Channel>,
}

impl AriEvents {
    pub(crate) fn new(websocket: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            websocket,
            channels: HashMap::new(),
        }
    }

    /// Receive the next event. Returns `None` when the stream closed.
    pub async fn next(&mut self) -> Result<Option<AriEvent>, AriError> {
        loop {
            match self.websocket.next().await {
                Some(Ok(Message::Ping(data))) => {
                    self.websocket.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Text(text))) => match AriEvent::from_json(&text) {
                    Ok(event) => {
                        if let Some(channel) = event.channel() {
                            self.channels.insert(channel.id.clone(), channel.clone());
                        }

                        return Ok(Some(event));
                    }
                    Err(e) => {
                        log::warn!("discarding undecodable event stream message: {e}");
                    }
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Latest known state of a channel seen on this stream
    pub fn channel(&self, id: &str) -> Option<&Channel> {
        self.channels.get(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_stasis_start() {
        let event = AriEvent::from_json(
            r#"{
                "type": "StasisStart",
                "application": "auricle",
                "args": ["role=snoop", "uuid=A1", "dir=in"],
                "channel": {"id": "1700000000.1", "name": "Snoop/SIP-100-0001", "state": "Up"}
            }"#,
        )
        .unwrap();

        match event {
            AriEvent::StasisStart {
                application,
                args,
                channel,
            } => {
                assert_eq!(application, "auricle");
                assert_eq!(args, ["role=snoop", "uuid=A1", "dir=in"]);
                assert_eq!(channel.id, "1700000000.1");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_passed_through() {
        let event = AriEvent::from_json(
            r#"{"type": "ChannelDtmfReceived", "digit": "5", "channel": {"id": "x", "name": "y"}}"#,
        )
        .unwrap();

        match event {
            AriEvent::Unknown { event_type, body } => {
                assert_eq!(event_type, "ChannelDtmfReceived");
                assert_eq!(body["digit"], "5");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn malformed_known_type_is_preserved_not_lost() {
        // StasisEnd without a channel does not decode into the typed variant
        let event = AriEvent::from_json(r#"{"type": "StasisEnd"}"#).unwrap();

        assert!(matches!(
            event,
            AriEvent::Unknown { event_type, .. } if event_type == "StasisEnd"
        ));
    }
}
