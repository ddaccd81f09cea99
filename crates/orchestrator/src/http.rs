// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! HTTP surface called from the PBX dialplan: `/start_tap` and `/metrics`.
//!
//! Whatever goes wrong on the tap side, the dialplan only ever sees a
//! status code; the live call continues regardless.

use crate::metrics;
use crate::tap::{Backend, CallMeta, Orchestrator, StartTapParams};
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
    orchestrator: Arc<Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;

    log::info!("start_tap api listening on http://0.0.0.0:{port}");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let orchestrator = orchestrator.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req| {
                        let orchestrator = orchestrator.clone();

                        async move { handle(req, orchestrator).await }
                    });

                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        log::debug!("api connection error: {e}");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    orchestrator: Arc<Orchestrator>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/start_tap" => start_tap(req.uri().query(), &orchestrator).await,
        "/metrics" => text(StatusCode::OK, metrics::render()),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn start_tap(query: Option<&str>, orchestrator: &Arc<Orchestrator>) -> Response<Full<Bytes>> {
    let query = query_map(query);

    let (Some(channel), Some(uuid)) = (query.get("chan"), query.get("uuid")) else {
        return text(StatusCode::BAD_REQUEST, "Missing chan or uuid");
    };

    let backend = match query.get("gw") {
        Some(gw) => match Backend::parse(gw) {
            Some(backend) => backend,
            None => return text(StatusCode::BAD_REQUEST, "Unknown gw"),
        },
        None => Backend::Framed,
    };

    let params = StartTapParams {
        channel: channel.clone(),
        uuid: uuid.clone(),
        backend,
        meta: CallMeta {
            extension: query.get("exten").cloned().unwrap_or_default(),
            caller: query.get("caller").cloned().unwrap_or_default(),
            caller_name: query.get("callername").cloned().unwrap_or_default(),
            agent_extension: query.get("agent_extension").cloned().unwrap_or_default(),
            agent_username: query.get("agent_username").cloned().unwrap_or_default(),
            agent_id: query.get("agent_id").cloned().unwrap_or_default(),
        },
    };

    match orchestrator.start_tap(params).await {
        Ok(()) => text(StatusCode::OK, "OK"),
        Err(e) => {
            log::error!("start_tap for call {uuid} failed: {e:#}");
            text(StatusCode::INTERNAL_SERVER_ERROR, "ERROR")
        }
    }
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
