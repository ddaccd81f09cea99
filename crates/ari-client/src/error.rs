// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum AriError {
    #[error("invalid ARI url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tt::tungstenite::Error),

    #[error("failed to decode ARI payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ARI returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("channel '{0}' not found")]
    ChannelNotFound(String),
}

impl AriError {
    /// True for a 404 response, which cleanup paths treat as benign and the
    /// add-to-bridge path treats as retriable
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AriError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            } | AriError::ChannelNotFound(_)
        )
    }
}
