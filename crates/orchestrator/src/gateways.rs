// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! HTTP signaling clients towards the two gateways

use crate::settings::Settings;
use crate::tap::{CallMeta, TapDirection};
use anyhow::{bail, Context, Result};

pub struct GatewayClients {
    http: reqwest::Client,
    framed_base: Option<String>,
    streaming_base: Option<String>,
}

impl GatewayClients {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            framed_base: settings
                .framed
                .as_ref()
                .map(|framed| framed.control_url.trim_end_matches('/').to_owned()),
            streaming_base: settings
                .streaming
                .as_ref()
                .map(|streaming| streaming.control_url.trim_end_matches('/').to_owned()),
        }
    }

    /// Reserve `port` for `uuid` at the framed gateway. A non-200 response
    /// is fatal for the tap: the caller frees the port and gives up.
    pub async fn framed_register(&self, uuid: &str, port: u16, meta: &CallMeta) -> Result<()> {
        let base = self.framed_base()?;

        let response = self
            .http
            .get(format!("{base}/register"))
            .query(&[
                ("uuid", uuid),
                ("port", &port.to_string()),
                ("agent_extension", &meta.agent_extension),
                ("agent_username", &meta.agent_username),
                ("agent_id", &meta.agent_id),
            ])
            .send()
            .await
            .context("framed gateway register request failed")?;

        if !response.status().is_success() {
            bail!("framed gateway register returned {}", response.status());
        }

        Ok(())
    }

    pub async fn framed_unregister(&self, port: u16) -> Result<()> {
        let base = self.framed_base()?;

        let response = self
            .http
            .get(format!("{base}/unregister"))
            .query(&[("port", &port.to_string())])
            .send()
            .await
            .context("framed gateway unregister request failed")?;

        if !response.status().is_success() {
            bail!("framed gateway unregister returned {}", response.status());
        }

        Ok(())
    }

    /// Announce the call context for one direction at the streaming
    /// gateway. Failures are logged by the caller and are non-fatal.
    pub async fn streaming_register(
        &self,
        uuid: &str,
        meta: &CallMeta,
        direction: TapDirection,
    ) -> Result<()> {
        let base = self.streaming_base()?;

        let response = self
            .http
            .get(format!("{base}/register"))
            .query(&[
                ("uuid", uuid),
                ("exten", &meta.extension),
                ("caller", &meta.caller),
                ("callername", &meta.caller_name),
                ("dir", direction.as_str()),
            ])
            .send()
            .await
            .context("streaming gateway register request failed")?;

        if !response.status().is_success() {
            bail!("streaming gateway register returned {}", response.status());
        }

        Ok(())
    }

    pub async fn streaming_unregister(&self, uuid: &str) -> Result<()> {
        let base = self.streaming_base()?;

        let response = self
            .http
            .get(format!("{base}/unregister"))
            .query(&[("uuid", uuid)])
            .send()
            .await
            .context("streaming gateway unregister request failed")?;

        if !response.status().is_success() {
            bail!("streaming gateway unregister returned {}", response.status());
        }

        Ok(())
    }

    fn framed_base(&self) -> Result<&str> {
        self.framed_base
            .as_deref()
            .context("framed backend is not configured")
    }

    fn streaming_base(&self) -> Result<&str> {
        self.streaming_base
            .as_deref()
            .context("streaming backend is not configured")
    }
}
