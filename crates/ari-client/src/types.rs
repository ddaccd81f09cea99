// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use serde::Deserialize;

/// A channel resource as returned by REST calls and carried in events
#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller: CallerId,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

/// A bridge resource
#[derive(Debug, Clone, Deserialize)]
pub struct Bridge {
    pub id: String,
    #[serde(default)]
    pub bridge_type: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Which leg of a channel a snoop taps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpyDirection {
    In,
    Out,
    Both,
}

impl SpyDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SpyDirection::In => "in",
            SpyDirection::Out => "out",
            SpyDirection::Both => "both",
        }
    }
}
