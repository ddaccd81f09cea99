// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub downstream: DownstreamSettings,

    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub rtp: RtpSettings,
}

impl Settings {
    pub fn load(file_name: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::new(file_name, FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("AURICLE_FGW")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

/// The framed-protocol TCP peer every call's audio is forwarded to
#[derive(Debug, Deserialize)]
pub struct DownstreamSettings {
    pub host: String,
    pub port: u16,
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

#[derive(Debug, Deserialize)]
pub struct RtpSettings {
    #[serde(default)]
    pub port_range: RtpPortRange,

    /// Seconds without RTP after which a connected session is closed
    #[serde(default = "default_inactivity", deserialize_with = "duration_secs")]
    pub inactivity: Duration,

    /// Write the first seconds of each session's PCM to a WAV file
    #[serde(default)]
    pub dump: bool,

    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,
}

impl Default for RtpSettings {
    fn default() -> Self {
        Self {
            port_range: RtpPortRange::default(),
            inactivity: default_inactivity(),
            dump: false,
            dump_dir: default_dump_dir(),
        }
    }
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

fn default_http_port() -> u16 {
    9093
}

fn default_inactivity() -> Duration {
    Duration::from_secs(8)
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

pub fn duration_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Duration::from_secs(<u64>::deserialize(deserializer)?))
}
