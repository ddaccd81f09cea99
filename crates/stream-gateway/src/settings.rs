// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use crate::roles::RoleMode;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub widget: WidgetSettings,

    #[serde(default)]
    pub rtp: RtpSettings,

    pub speech: SpeechSettings,

    #[serde(default)]
    pub sessions: SessionSettings,

    #[serde(default)]
    pub role_mode: RoleMode,

    #[serde(default)]
    pub assistant: AssistantSettings,
}

impl Settings {
    pub fn load(file_name: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::new(file_name, FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("AURICLE_SGW")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
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

/// The browser widget pub/sub socket
#[derive(Debug, Deserialize)]
pub struct WidgetSettings {
    #[serde(default = "default_widget_port")]
    pub port: u16,
}

impl Default for WidgetSettings {
    fn default() -> Self {
        Self {
            port: default_widget_port(),
        }
    }
}

/// The two direction-coded RTP intakes
#[derive(Debug, Deserialize)]
pub struct RtpSettings {
    #[serde(rename = "in", default = "default_rtp_in")]
    pub bind_in: String,

    #[serde(rename = "out", default = "default_rtp_out")]
    pub bind_out: String,

    /// Swap sample byte order (PBX emits big-endian PCM)
    #[serde(default)]
    pub swap_bytes: bool,

    #[serde(default)]
    pub dump: bool,

    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,
}

impl Default for RtpSettings {
    fn default() -> Self {
        Self {
            bind_in: default_rtp_in(),
            bind_out: default_rtp_out(),
            swap_bytes: false,
            dump: false,
            dump_dir: default_dump_dir(),
        }
    }
}

/// The upstream streaming speech endpoint
#[derive(Debug, Deserialize)]
pub struct SpeechSettings {
    #[serde(default = "default_speech_url")]
    pub url: String,

    pub key: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_true")]
    pub interim_results: bool,

    #[serde(default = "default_true")]
    pub punctuate: bool,

    #[serde(default = "default_true")]
    pub smart_format: bool,

    #[serde(default)]
    pub diarize: bool,
}

#[derive(Debug, Deserialize)]
pub struct SessionSettings {
    /// Hard cap on concurrent upstream sessions; new SSRCs beyond it are
    /// dropped silently
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Seconds without RTP after which a session is torn down
    #[serde(default = "default_inactivity", deserialize_with = "duration_secs")]
    pub inactivity: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            inactivity: default_inactivity(),
        }
    }
}

/// The generative assistant sampler
#[derive(Debug, Deserialize)]
pub struct AssistantSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_engine")]
    pub engine: String,

    #[serde(default)]
    pub url: String,

    /// Verbatim value of the Authorization header, empty for none
    #[serde(default)]
    pub authorization: String,

    /// Speaker name assist events are published under
    #[serde(default = "default_assist_speaker")]
    pub speaker: String,

    #[serde(default = "default_assist_interval", deserialize_with = "duration_secs")]
    pub interval: Duration,

    /// Trailing character window sent per request, 0 for the whole log
    #[serde(default = "default_tail_chars")]
    pub tail_chars: usize,

    /// Minimum conversation size before anything is sent
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            engine: default_engine(),
            url: String::new(),
            authorization: String::new(),
            speaker: default_assist_speaker(),
            interval: default_assist_interval(),
            tail_chars: default_tail_chars(),
            min_chars: default_min_chars(),
        }
    }
}

fn default_http_port() -> u16 {
    9094
}

fn default_widget_port() -> u16 {
    9095
}

fn default_rtp_in() -> String {
    "0.0.0.0:5090".to_owned()
}

fn default_rtp_out() -> String {
    "0.0.0.0:5091".to_owned()
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_speech_url() -> String {
    "wss://api.deepgram.com/v1/listen".to_owned()
}

fn default_language() -> String {
    "en".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_max_sessions() -> usize {
    64
}

fn default_inactivity() -> Duration {
    Duration::from_secs(8)
}

fn default_engine() -> String {
    "generic".to_owned()
}

fn default_assist_speaker() -> String {
    "Assistant".to_owned()
}

fn default_assist_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_tail_chars() -> usize {
    4000
}

fn default_min_chars() -> usize {
    20
}

pub fn duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Duration::from_secs(<u64>::deserialize(deserializer)?))
}
