// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! In-process mock peers: the PBX control api (REST + event stream) and
//! the gateways' control apis.

use auricle_orchestrator::settings::Settings;
use futures::SinkExt;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// One recorded request: method, path, query
pub type Recorded = (String, String, String);

pub struct MockAri {
    pub base_url: String,
    pub records: Arc<Mutex<Vec<Recorded>>>,
}

impl MockAri {
    /// Requests matching `method` whose path satisfies `matches`
    pub fn count(&self, method: &str, matches: impl Fn(&str) -> bool) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|(m, p, _)| m == method && matches(p))
            .count()
    }
}

pub async fn start_mock_ari() -> MockAri {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let records: Arc<Mutex<Vec<Recorded>>> = Arc::new(Mutex::new(Vec::new()));
    let counter = Arc::new(AtomicUsize::new(0));

    tokio::spawn({
        let records = records.clone();

        async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let records = records.clone();
                let counter = counter.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req| {
                        let records = records.clone();
                        let counter = counter.clone();

                        async move { handle_ari(req, records, counter) }
                    });

                    hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                        .ok();
                });
            }
        }
    });

    MockAri {
        base_url: format!("http://{addr}/ari"),
        records,
    }
}

fn handle_ari(
    req: Request<Incoming>,
    records: Arc<Mutex<Vec<Recorded>>>,
    counter: Arc<AtomicUsize>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let path = req.uri().path().to_owned();
    let query = req.uri().query().unwrap_or_default().to_owned();

    records.lock().push((method.clone(), path.clone(), query));

    let n = counter.fetch_add(1, Ordering::SeqCst);

    let response = if method == "POST" && path.ends_with("/snoop") {
        json(serde_json::json!({
            "id": format!("snoop-{n}"),
            "name": format!("Snoop/{n}"),
            "state": "Up"
        }))
    } else if method == "POST" && path == "/ari/channels/externalMedia" {
        json(serde_json::json!({
            "id": format!("em-{n}"),
            "name": format!("UnicastRTP/127.0.0.1-{n}"),
            "state": "Up"
        }))
    } else if method == "POST" && path == "/ari/bridges" {
        json(serde_json::json!({
            "id": format!("bridge-{n}"),
            "bridge_type": "mixing",
            "channels": []
        }))
    } else if method == "POST" && path.ends_with("/addChannel") {
        empty(StatusCode::NO_CONTENT)
    } else if method == "DELETE" {
        empty(StatusCode::NO_CONTENT)
    } else if method == "GET" && path == "/ari/channels" {
        json(serde_json::json!([]))
    } else {
        empty(StatusCode::NOT_FOUND)
    };

    Ok(response)
}

pub struct MockGateway {
    pub base_url: String,
    pub records: Arc<Mutex<Vec<Recorded>>>,
}

impl MockGateway {
    pub fn queries_of(&self, path: &str) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|(_, p, _)| p == path)
            .map(|(_, _, q)| q.clone())
            .collect()
    }
}

/// A gateway control api answering every request with `status`
pub async fn start_mock_gateway(status: StatusCode) -> MockGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let records: Arc<Mutex<Vec<Recorded>>> = Arc::new(Mutex::new(Vec::new()));

    tokio::spawn({
        let records = records.clone();

        async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let records = records.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let records = records.clone();

                        async move {
                            records.lock().push((
                                req.method().to_string(),
                                req.uri().path().to_owned(),
                                req.uri().query().unwrap_or_default().to_owned(),
                            ));

                            Ok::<_, Infallible>(
                                Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from("OK")))
                                    .unwrap(),
                            )
                        }
                    });

                    hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                        .ok();
                });
            }
        }
    });

    MockGateway {
        base_url: format!("http://{addr}"),
        records,
    }
}

pub struct MockEvents {
    pub url: String,
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

impl MockEvents {
    pub fn push(&self, event: serde_json::Value) {
        self.tx.send(event).expect("event stream consumer is gone");
    }
}

/// A stasis event stream accepting one websocket consumer
pub async fn start_mock_events() -> MockEvents {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<serde_json::Value>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("no event stream consumer");
        let mut websocket = tt::accept_async(stream)
            .await
            .expect("event stream handshake failed");

        while let Some(event) = rx.recv().await {
            websocket
                .send(tt::tungstenite::Message::Text(event.to_string()))
                .await
                .expect("failed to push event");
        }
    });

    MockEvents {
        url: format!("ws://{addr}/ari/events"),
        tx,
    }
}

pub fn test_settings(ari: &MockAri, events: &MockEvents, fgw: &MockGateway, sgw: &MockGateway) -> Arc<Settings> {
    let settings: Settings = serde_json::from_value(serde_json::json!({
        "ari": {
            "base_url": ari.base_url,
            "username": "auricle",
            "password": "secret",
            "app": "auricle",
            "events_url": events.url,
        },
        "framed": {
            "control_url": fgw.base_url,
            "rtp_host": "127.0.0.1",
            "port_range": { "start": 42000, "end": 42009 },
        },
        "streaming": {
            "control_url": sgw.base_url,
            "rtp_in": "127.0.0.1:5090",
            "rtp_out": "127.0.0.1:5091",
        },
    }))
    .expect("test settings deserialize");

    Arc::new(settings)
}

pub fn stasis_start(channel_id: &str, channel_name: &str, args: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "type": "StasisStart",
        "application": "auricle",
        "args": args,
        "channel": { "id": channel_id, "name": channel_name, "state": "Up" }
    })
}

pub fn hangup_request(channel_id: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "ChannelHangupRequest",
        "application": "auricle",
        "cause": 16,
        "channel": { "id": channel_id, "name": format!("chan-{channel_id}"), "state": "Up" }
    })
}

pub fn stasis_end(channel_id: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "StasisEnd",
        "application": "auricle",
        "channel": { "id": channel_id, "name": format!("chan-{channel_id}"), "state": "Up" }
    })
}

fn json(value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}
