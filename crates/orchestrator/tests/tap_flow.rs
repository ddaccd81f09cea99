// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

mod common;

use auricle_orchestrator::events;
use auricle_orchestrator::tap::{Backend, CallMeta, Orchestrator, StartTapParams};
use common::*;
use hyper::StatusCode;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

struct Stack {
    ari: MockAri,
    events: MockEvents,
    fgw: MockGateway,
    sgw: MockGateway,
    orchestrator: Arc<Orchestrator>,
    _shutdown: watch::Sender<bool>,
}

async fn start_stack(fgw_status: StatusCode) -> Stack {
    let ari = start_mock_ari().await;
    let events = start_mock_events().await;
    let fgw = start_mock_gateway(fgw_status).await;
    let sgw = start_mock_gateway(StatusCode::OK).await;

    let orchestrator = Orchestrator::new(test_settings(&ari, &events, &fgw, &sgw)).unwrap();

    let stasis_events = orchestrator.connect_events().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(events::run(orchestrator.clone(), stasis_events, shutdown_rx));

    Stack {
        ari,
        events,
        fgw,
        sgw,
        orchestrator,
        _shutdown: shutdown_tx,
    }
}

fn streaming_params(uuid: &str) -> StartTapParams {
    StartTapParams {
        channel: "SIP/100-000001".to_owned(),
        uuid: uuid.to_owned(),
        backend: Backend::Streaming,
        meta: CallMeta {
            extension: "200".to_owned(),
            caller: "+34600000000".to_owned(),
            caller_name: "Ana".to_owned(),
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn streaming_tap_builds_one_bridge_per_direction() {
    let stack = start_stack(StatusCode::OK).await;

    stack
        .orchestrator
        .start_tap(streaming_params("A1"))
        .await
        .unwrap();

    // two snoops were requested, one per direction
    assert_eq!(stack.ari.count("POST", |p| p.ends_with("/snoop")), 2);

    // their stasis-start events arrive, the in-direction one twice
    // (duplicate event delivery must not duplicate resources)
    stack.events.push(stasis_start(
        "snoop-0",
        "Snoop/0",
        &["role=snoop", "uuid=A1", "dir=in", "gw=streaming"],
    ));
    stack.events.push(stasis_start(
        "snoop-0",
        "Snoop/0",
        &["role=snoop", "uuid=A1", "dir=in", "gw=streaming"],
    ));
    stack.events.push(stasis_start(
        "snoop-1",
        "Snoop/1",
        &["role=snoop", "uuid=A1", "dir=out", "gw=streaming"],
    ));

    sleep(Duration::from_millis(500)).await;

    // exactly one bridge per direction, one external media per direction
    assert_eq!(stack.ari.count("POST", |p| p == "/ari/bridges"), 2);
    assert_eq!(
        stack.ari.count("POST", |p| p == "/ari/channels/externalMedia"),
        2
    );

    // each bridge got its snoop and its external media channel
    assert_eq!(stack.ari.count("POST", |p| p.ends_with("/addChannel")), 4);

    // context was registered once per direction, before external media
    let registers = stack.sgw.queries_of("/register");
    assert_eq!(registers.len(), 2);
    assert!(registers.iter().all(|q| q.contains("uuid=A1")));
    assert!(registers.iter().all(|q| q.contains("exten=200")));
    assert!(registers.iter().any(|q| q.contains("dir=in")));
    assert!(registers.iter().any(|q| q.contains("dir=out")));

    // the external media endpoints are the two fixed direction ports
    let em_queries: Vec<String> = stack
        .ari
        .records
        .lock()
        .iter()
        .filter(|(m, p, _)| m == "POST" && p == "/ari/channels/externalMedia")
        .map(|(_, _, q)| q.clone())
        .collect();

    assert!(em_queries.iter().any(|q| q.contains("127.0.0.1%3A5090")));
    assert!(em_queries.iter().any(|q| q.contains("127.0.0.1%3A5091")));
}

#[tokio::test]
async fn cleanup_tears_down_everything_exactly_once() {
    let stack = start_stack(StatusCode::OK).await;

    stack
        .orchestrator
        .start_tap(streaming_params("A2"))
        .await
        .unwrap();

    stack.events.push(stasis_start(
        "snoop-0",
        "Snoop/0",
        &["role=snoop", "uuid=A2", "dir=in", "gw=streaming"],
    ));
    stack.events.push(stasis_start(
        "snoop-1",
        "Snoop/1",
        &["role=snoop", "uuid=A2", "dir=out", "gw=streaming"],
    ));

    sleep(Duration::from_millis(500)).await;

    // the caller hangs up
    stack.events.push(hangup_request("snoop-0"));

    sleep(Duration::from_millis(500)).await;

    assert_eq!(stack.sgw.queries_of("/unregister"), vec!["uuid=A2"]);
    assert_eq!(
        stack.ari.count("DELETE", |p| p.starts_with("/ari/bridges/")),
        2
    );
    // both snoops and both external media channels are hung up
    assert_eq!(
        stack.ari.count("DELETE", |p| p.starts_with("/ari/channels/")),
        4
    );

    // a later terminal event for the same call is a no-op
    stack.events.push(stasis_end("snoop-1"));

    sleep(Duration::from_millis(300)).await;

    assert_eq!(stack.sgw.queries_of("/unregister").len(), 1);
    assert_eq!(
        stack.ari.count("DELETE", |p| p.starts_with("/ari/bridges/")),
        2
    );
    assert_eq!(
        stack.ari.count("DELETE", |p| p.starts_with("/ari/channels/")),
        4
    );

    assert!(stack.orchestrator.session_ids().is_empty());
}

#[tokio::test]
async fn framed_tap_leases_a_port_and_releases_it() {
    let stack = start_stack(StatusCode::OK).await;

    stack
        .orchestrator
        .start_tap(StartTapParams {
            channel: "SIP/100-000001".to_owned(),
            uuid: "B1".to_owned(),
            backend: Backend::Framed,
            meta: CallMeta {
                agent_extension: "100".to_owned(),
                ..Default::default()
            },
        })
        .await
        .unwrap();

    // the port was reserved at the gateway before anything else
    let registers = stack.fgw.queries_of("/register");
    assert_eq!(registers.len(), 1);
    assert!(registers[0].contains("uuid=B1"));
    assert!(registers[0].contains("agent_extension=100"));

    let port: u16 = registers[0]
        .split('&')
        .find_map(|pair| pair.strip_prefix("port="))
        .unwrap()
        .parse()
        .unwrap();

    assert!((42000..=42009).contains(&port));
    assert_eq!(stack.orchestrator.leased_ports(), 1);

    // a single spy=both snoop
    assert_eq!(stack.ari.count("POST", |p| p.ends_with("/snoop")), 1);

    stack.events.push(stasis_start(
        "snoop-0",
        "Snoop/0",
        &["role=snoop", "uuid=B1", "dir=both", "gw=framed"],
    ));

    sleep(Duration::from_millis(500)).await;

    assert_eq!(stack.ari.count("POST", |p| p == "/ari/bridges"), 1);

    let em_queries: Vec<String> = stack
        .ari
        .records
        .lock()
        .iter()
        .filter(|(m, p, _)| m == "POST" && p == "/ari/channels/externalMedia")
        .map(|(_, _, q)| q.clone())
        .collect();

    assert_eq!(em_queries.len(), 1);
    assert!(em_queries[0].contains(&format!("127.0.0.1%3A{port}")));

    stack.events.push(hangup_request("snoop-0"));

    sleep(Duration::from_millis(500)).await;

    let unregisters = stack.fgw.queries_of("/unregister");
    assert_eq!(unregisters, vec![format!("port={port}")]);
    assert_eq!(stack.orchestrator.leased_ports(), 0);
}

#[tokio::test]
async fn rejected_port_reservation_abandons_the_tap() {
    let stack = start_stack(StatusCode::INTERNAL_SERVER_ERROR).await;

    let result = stack
        .orchestrator
        .start_tap(StartTapParams {
            channel: "SIP/100-000001".to_owned(),
            uuid: "B2".to_owned(),
            backend: Backend::Framed,
            meta: CallMeta::default(),
        })
        .await;

    assert!(result.is_err());

    // the lease was returned and no snoop was requested
    assert_eq!(stack.orchestrator.leased_ports(), 0);
    assert_eq!(stack.ari.count("POST", |p| p.ends_with("/snoop")), 0);
    assert!(stack.orchestrator.session_ids().is_empty());
}
