// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use auricle_ari_client::EventsEndpoint;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub ari: AriSettings,

    #[serde(default)]
    pub http: HttpSettings,

    pub framed: Option<FramedSettings>,

    pub streaming: Option<StreamingSettings>,
}

impl Settings {
    pub fn load(file_name: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::new(file_name, FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("AURICLE_ORC")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize)]
pub struct AriSettings {
    /// REST base, e.g. `http://pbx:8088/ari`
    pub base_url: String,

    /// Extra path prefix in front of every REST path and the event stream
    /// (reverse proxy deployments); not doubled when `base_url` already
    /// carries it
    #[serde(default)]
    pub path_prefix: Option<String>,

    pub username: String,
    pub password: String,

    #[serde(default = "default_app")]
    pub app: String,

    #[serde(default)]
    pub events_endpoint: EventsEndpoint,

    /// Full event stream url override; derived from `base_url` when unset
    #[serde(default)]
    pub events_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

/// Where the framed gateway lives
#[derive(Debug, Deserialize)]
pub struct FramedSettings {
    /// Control api base, e.g. `http://fgw:9093`
    pub control_url: String,

    /// Host the PBX sends per-call RTP to
    pub rtp_host: String,

    #[serde(default)]
    pub port_range: RtpPortRange,
}

/// Where the streaming gateway lives
#[derive(Debug, Deserialize)]
pub struct StreamingSettings {
    /// Control api base, e.g. `http://sgw:9094`
    pub control_url: String,

    /// Fixed `host:port` endpoints the PBX sends direction-coded RTP to
    pub rtp_in: String,
    pub rtp_out: String,
}

#[derive(Debug, Deserialize)]
pub struct RtpPortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for RtpPortRange {
    fn default() -> Self {
        Self {
            start: 40000,
            end: 49999,
        }
    }
}

fn default_app() -> String {
    "auricle".to_owned()
}

fn default_http_port() -> u16 {
    9092
}
