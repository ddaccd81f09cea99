// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Minimal client for the Asterisk REST Interface (ARI).
//!
//! Covers exactly the surface the tap orchestrator needs: snoop and
//! external-media channel creation, mixing bridges, hangup, and the
//! long-lived event stream of one stasis application. Everything else the
//! PBX offers is out of scope here.
//!
//! The REST base url may carry an extra path prefix (reverse proxy
//! deployments); the prefix is resolved once at construction and shared by
//! all REST paths and the event stream url.

use serde::Deserialize;

mod error;
mod events;
mod types;

pub use error::AriError;
pub use events::{AriEvent, AriEvents};
pub use types::{Bridge, CallerId, Channel, SpyDirection};

/// Which event stream endpoint layout the PBX deployment uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventsEndpoint {
    /// Derive from the base url: a path ending in `/ari` uses the older
    /// `/events` layout, anything else the newer `/ws`
    #[default]
    Auto,
    /// Always append `/events`
    Events,
    /// Always append `/ws`
    Ws,
}

/// Handle to one ARI endpoint
pub struct AriClient {
    http: reqwest::Client,
    /// Resolved REST base, scheme + authority + optional prefix, no
    /// trailing slash
    rest_base: String,
    username: String,
    password: String,
    events_endpoint: EventsEndpoint,
    events_url_override: Option<String>,
}

impl AriClient {
    /// Create a handle for `base_url`, resolving `path_prefix` into the
    /// REST base once. A base url that already ends with the prefix is left
    /// alone.
    pub fn connect(
        base_url: &str,
        path_prefix: Option<&str>,
        username: &str,
        password: &str,
    ) -> Result<Self, AriError> {
        // parse to validate, then keep working on the string form
        let _ = url::Url::parse(base_url)?;

        Ok(Self {
            http: reqwest::Client::new(),
            rest_base: resolve_base(base_url, path_prefix),
            username: username.to_owned(),
            password: password.to_owned(),
            events_endpoint: EventsEndpoint::Auto,
            events_url_override: None,
        })
    }

    /// Force a specific event stream endpoint layout
    pub fn with_events_endpoint(mut self, endpoint: EventsEndpoint) -> Self {
        self.events_endpoint = endpoint;
        self
    }

    /// Replace the derived event stream url entirely (test deployments)
    pub fn with_events_url(mut self, url: String) -> Self {
        self.events_url_override = Some(url);
        self
    }

    /// Open the event stream subscribed to the stasis application `app`
    /// with `subscribeAll` semantics.
    pub async fn start(&self, app: &str) -> Result<AriEvents, AriError> {
        let url = self.events_url(app);

        log::debug!("connecting event stream {url}");

        let (websocket, _) = tt::connect_async(url).await?;

        Ok(AriEvents::new(websocket))
    }

    fn events_url(&self, app: &str) -> String {
        if let Some(url) = &self.events_url_override {
            return url.clone();
        }

        let endpoint = match self.events_endpoint {
            EventsEndpoint::Events => "/events",
            EventsEndpoint::Ws => "/ws",
            EventsEndpoint::Auto => {
                if self.rest_base.ends_with("/ari") {
                    "/events"
                } else {
                    "/ws"
                }
            }
        };

        let base = if let Some(rest) = self.rest_base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.rest_base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.rest_base.clone()
        };

        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("app", app)
            .append_pair("subscribeAll", "true")
            .append_pair("api_key", &format!("{}:{}", self.username, self.password))
            .finish();

        format!("{base}{endpoint}?{query}")
    }

    /// Create a snoop channel on `channel` (id or name). A "not found"
    /// response against something that looks like a name triggers one id
    /// lookup via the channel list and a single retry.
    pub async fn snoop_channel(
        &self,
        channel: &str,
        app: &str,
        spy: SpyDirection,
        app_args: &str,
    ) -> Result<Channel, AriError> {
        match self.snoop_once(channel, app, spy, app_args).await {
            Err(e) if e.is_not_found() && channel.contains('/') => {
                let id = self
                    .list_channels()
                    .await?
                    .into_iter()
                    .find(|c| c.name == channel)
                    .map(|c| c.id)
                    .ok_or_else(|| AriError::ChannelNotFound(channel.to_owned()))?;

                log::debug!("resolved channel name '{channel}' to id '{id}'");

                self.snoop_once(&id, app, spy, app_args).await
            }
            other => other,
        }
    }

    async fn snoop_once(
        &self,
        channel: &str,
        app: &str,
        spy: SpyDirection,
        app_args: &str,
    ) -> Result<Channel, AriError> {
        let response = self
            .http
            .post(format!("{}/channels/{channel}/snoop", self.rest_base))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("app", app), ("spy", spy.as_str()), ("appArgs", app_args)])
            .send()
            .await?;

        Ok(expect_2xx(response).await?.json().await?)
    }

    /// Create an external-media channel emitting this application's bridge
    /// audio onto `external_host` (an `addr:port` endpoint).
    pub async fn external_media(
        &self,
        app: &str,
        app_args: &str,
        external_host: &str,
        format: &str,
        transport: &str,
        encapsulation: &str,
    ) -> Result<Channel, AriError> {
        let response = self
            .http
            .post(format!("{}/channels/externalMedia", self.rest_base))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[
                ("app", app),
                ("data", app_args),
                ("external_host", external_host),
                ("format", format),
                ("transport", transport),
                ("encapsulation", encapsulation),
            ])
            .send()
            .await?;

        Ok(expect_2xx(response).await?.json().await?)
    }

    pub async fn get_channel(&self, id: &str) -> Result<Channel, AriError> {
        let response = self
            .http
            .get(format!("{}/channels/{id}", self.rest_base))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        Ok(expect_2xx(response).await?.json().await?)
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>, AriError> {
        let response = self
            .http
            .get(format!("{}/channels", self.rest_base))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        Ok(expect_2xx(response).await?.json().await?)
    }

    pub async fn hangup(&self, id: &str) -> Result<(), AriError> {
        let response = self
            .http
            .delete(format!("{}/channels/{id}", self.rest_base))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        expect_2xx(response).await?;

        Ok(())
    }

    pub async fn create_bridge(&self, bridge_type: &str) -> Result<Bridge, AriError> {
        let response = self
            .http
            .post(format!("{}/bridges", self.rest_base))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("type", bridge_type)])
            .send()
            .await?;

        Ok(expect_2xx(response).await?.json().await?)
    }

    pub async fn bridge_add_channel(&self, bridge: &str, channel: &str) -> Result<(), AriError> {
        let response = self
            .http
            .post(format!("{}/bridges/{bridge}/addChannel", self.rest_base))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("channel", channel)])
            .send()
            .await?;

        expect_2xx(response).await?;

        Ok(())
    }

    pub async fn destroy_bridge(&self, bridge: &str) -> Result<(), AriError> {
        let response = self
            .http
            .delete(format!("{}/bridges/{bridge}", self.rest_base))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        expect_2xx(response).await?;

        Ok(())
    }
}

async fn expect_2xx(response: reqwest::Response) -> Result<reqwest::Response, AriError> {
    let status = response.status();

    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();

        Err(AriError::Status { status, body })
    }
}

fn resolve_base(base_url: &str, path_prefix: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');

    match path_prefix {
        None => base.to_owned(),
        Some(prefix) => {
            let prefix = format!("/{}", prefix.trim_matches('/'));

            if prefix == "/" || base.ends_with(&prefix) {
                base.to_owned()
            } else {
                format!("{base}{prefix}")
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn prefix_is_appended_once() {
        assert_eq!(
            resolve_base("http://pbx:8088", Some("ari")),
            "http://pbx:8088/ari"
        );
        assert_eq!(
            resolve_base("http://pbx:8088/ari", Some("ari")),
            "http://pbx:8088/ari"
        );
        assert_eq!(
            resolve_base("http://pbx:8088/ari/", Some("/ari")),
            "http://pbx:8088/ari"
        );
        assert_eq!(resolve_base("http://pbx:8088", None), "http://pbx:8088");
    }

    fn client(base: &str) -> AriClient {
        AriClient::connect(base, None, "user", "pass").unwrap()
    }

    #[test]
    fn events_url_uses_older_layout_for_ari_prefix() {
        let url = client("http://pbx:8088/ari").events_url("auricle");

        assert_eq!(
            url,
            "ws://pbx:8088/ari/events?app=auricle&subscribeAll=true&api_key=user%3Apass"
        );
    }

    #[test]
    fn events_url_uses_newer_layout_without_ari_prefix() {
        let url = client("https://pbx.example.com").events_url("auricle");

        assert_eq!(
            url,
            "wss://pbx.example.com/ws?app=auricle&subscribeAll=true&api_key=user%3Apass"
        );
    }

    #[test]
    fn events_layout_can_be_forced() {
        let url = client("http://pbx:8088/prefix")
            .with_events_endpoint(EventsEndpoint::Events)
            .events_url("auricle");

        assert!(url.starts_with("ws://pbx:8088/prefix/events?"));
    }
}
