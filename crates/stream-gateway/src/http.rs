// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! HTTP control surface: `/register`, `/unregister` and `/metrics`

use crate::gateway::Gateway;
use crate::metrics;
use crate::types::Direction;
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
    gateway: Arc<Gateway>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;

    log::info!("control api listening on http://0.0.0.0:{port}");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let gateway = gateway.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req| {
                        let gateway = gateway.clone();

                        async move { handle(req, gateway).await }
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
    gateway: Arc<Gateway>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let query = query_map(req.uri().query());

    let response = match req.uri().path() {
        "/register" => register(&query, &gateway),
        "/unregister" => unregister(&query, &gateway),
        "/metrics" => text(StatusCode::OK, metrics::render()),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn register(query: &HashMap<String, String>, gateway: &Gateway) -> Response<Full<Bytes>> {
    let Some(uuid) = query.get("uuid") else {
        return text(StatusCode::BAD_REQUEST, "missing uuid");
    };

    let direction = query.get("dir").and_then(|dir| Direction::parse(dir));
    let force_start = matches!(query.get("force_start").map(String::as_str), Some("1" | "true"));

    gateway.register(
        uuid,
        query.get("exten").map(String::as_str).unwrap_or_default(),
        query.get("caller").map(String::as_str).unwrap_or_default(),
        query.get("callername").map(String::as_str).unwrap_or_default(),
        direction,
        force_start,
    );

    text(StatusCode::OK, "OK")
}

fn unregister(query: &HashMap<String, String>, gateway: &Gateway) -> Response<Full<Bytes>> {
    let Some(uuid) = query.get("uuid") else {
        return text(StatusCode::BAD_REQUEST, "missing uuid");
    };

    gateway.unregister(uuid);

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
