// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! HTTP control surface: `/register`, `/unregister` and `/metrics`

use crate::metrics;
use crate::session::{RegisterError, SessionInfo, Sessions};
use anyhow::Result;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub async fn run(
    port: u16,
    sessions: Arc<Sessions>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;

    log::info!("control api listening on http://0.0.0.0:{port}");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let sessions = sessions.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req| {
                        let sessions = sessions.clone();

                        async move { handle(req, sessions).await }
                    });

                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        log::debug!("control connection error: {e}");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    sessions: Arc<Sessions>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let query = query_map(req.uri().query());

    let response = match req.uri().path() {
        "/register" => register(&query, &sessions).await,
        "/unregister" => unregister(&query, &sessions),
        "/metrics" => text(StatusCode::OK, metrics::render()),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn register(query: &HashMap<String, String>, sessions: &Arc<Sessions>) -> Response<Full<Bytes>> {
    let (Some(uuid), Some(port)) = (query.get("uuid"), query.get("port")) else {
        return text(StatusCode::BAD_REQUEST, "missing uuid or port");
    };

    let Ok(port) = port.parse::<u16>() else {
        return text(StatusCode::BAD_REQUEST, "invalid port");
    };

    if !sessions.port_in_range(port) {
        return text(StatusCode::BAD_REQUEST, "port outside rtp range");
    }

    let info = SessionInfo {
        call_uuid: uuid.clone(),
        agent_extension: query.get("agent_extension").cloned().unwrap_or_default(),
        agent_username: query.get("agent_username").cloned().unwrap_or_default(),
        agent_id: query.get("agent_id").cloned().unwrap_or_default(),
    };

    match sessions.register(port, info).await {
        Ok(()) => {
            metrics::REGISTERS.inc();
            text(StatusCode::OK, "OK")
        }
        Err(RegisterError::Occupied) => {
            metrics::REGISTER_CONFLICTS.inc();
            text(StatusCode::CONFLICT, "port already registered")
        }
        Err(RegisterError::Bind(e)) => {
            log::error!("failed to bind udp port {port}: {e}");
            text(StatusCode::INTERNAL_SERVER_ERROR, "ERROR")
        }
    }
}

fn unregister(query: &HashMap<String, String>, sessions: &Arc<Sessions>) -> Response<Full<Bytes>> {
    let Some(Ok(port)) = query.get("port").map(|p| p.parse::<u16>()) else {
        return text(StatusCode::BAD_REQUEST, "missing or invalid port");
    };

    // idempotent: unknown ports are already unregistered
    sessions.end(port, "unregister");

    text(StatusCode::OK, "OK")
}

fn query_map(query: Option<&str>) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .into_owned()
        .collect()
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
        .expect("valid response")
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn query_map_decodes_percent_escapes() {
        let query = query_map(Some("uuid=A1&caller=%2B34600000000&empty="));

        assert_eq!(query["uuid"], "A1");
        assert_eq!(query["caller"], "+34600000000");
        assert_eq!(query["empty"], "");
    }
}
