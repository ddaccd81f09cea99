// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Client side of the upstream streaming speech socket.
//!
//! Outbound messages are raw binary PCM; inbound messages are JSON text of
//! which only "Results" with a non-empty transcript are of interest.

use crate::settings::SpeechSettings;
use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::net::TcpStream;
use tt::tungstenite::client::IntoClientRequest;
use tt::tungstenite::http::header::AUTHORIZATION;
use tt::tungstenite::http::HeaderValue;
use tt::{MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Streaming url with the fixed audio parameters and the configured
/// language and feature toggles
pub fn stream_url(speech: &SpeechSettings) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("encoding", "linear16")
        .append_pair("sample_rate", "16000")
        .append_pair("interim_results", bool_str(speech.interim_results))
        .append_pair("punctuate", bool_str(speech.punctuate))
        .append_pair("smart_format", bool_str(speech.smart_format))
        .append_pair("diarize", bool_str(speech.diarize))
        .append_pair("language", &speech.language)
        .finish();

    format!("{}?{}", speech.url.trim_end_matches('/'), query)
}

/// Open one streaming session
pub async fn connect(speech: &SpeechSettings) -> Result<WsStream> {
    let url = stream_url(speech);

    let mut request = url
        .into_client_request()
        .context("invalid speech endpoint url")?;

    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Token {}", speech.key))
            .context("speech key is not a valid header value")?,
    );

    let (websocket, _) = tt::connect_async(request)
        .await
        .context("speech endpoint connect failed")?;

    Ok(websocket)
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// A forwardable transcript extracted from one inbound message
#[derive(Debug)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    pub words: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StreamingResponse {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    channel: Option<ResponseChannel>,
}

#[derive(Debug, Deserialize)]
struct ResponseChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    words: serde_json::Value,
}

/// Extract a transcript from a raw inbound message. Anything that is not a
/// "Results" message with at least one alternative carrying a non-empty
/// transcript yields `None`.
pub fn parse_results(text: &str) -> Option<Transcript> {
    let response: StreamingResponse = serde_json::from_str(text).ok()?;

    if response.kind != "Results" {
        return None;
    }

    let alternative = response.channel?.alternatives.into_iter().next()?;

    if alternative.transcript.is_empty() {
        return None;
    }

    Some(Transcript {
        text: alternative.transcript,
        is_final: response.is_final,
        words: alternative.words,
    })
}
