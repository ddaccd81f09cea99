// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Direction-coded RTP intake.
//!
//! One task per listening port. Datagrams are keyed by their SSRC; the
//! first packet of an unknown SSRC binds it to the head of the direction's
//! pending FIFO (or to the unknown sentinel) and spawns the upstream
//! session. The binding never changes afterwards.

use crate::gateway::{Gateway, SessionHandle};
use crate::metrics;
use crate::session::{self, SessionContext};
use crate::types::{room_for, Direction};
use auricle_media::rtp::RtpPacket;
use auricle_media::swap_sample_bytes;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

pub async fn run(
    gateway: Arc<Gateway>,
    direction: Direction,
    socket: UdpSocket,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, _)) => handle_datagram(&gateway, direction, &buf[..len]),
                    Err(e) => {
                        log::error!("udp receive error on {} intake: {e}", direction.as_str());
                    }
                }
            }
        }
    }
}

pub(crate) fn handle_datagram(gateway: &Arc<Gateway>, direction: Direction, datagram: &[u8]) {
    let packet = match RtpPacket::parse(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            log::debug!("dropping datagram on {} intake: {e}", direction.as_str());
            metrics::RTP_INVALID.inc();
            return;
        }
    };

    metrics::RTP_PACKETS
        .with_label_values(&[direction.as_str()])
        .inc();

    if packet.payload.is_empty() {
        return;
    }

    let mut pcm = BytesMut::from(packet.payload);

    if gateway.settings.rtp.swap_bytes {
        swap_sample_bytes(&mut pcm);
    }

    let pcm = pcm.freeze();

    let audio_tx = gateway
        .sessions
        .lock()
        .get(&(direction, packet.ssrc))
        .map(|handle| handle.audio_tx.clone());

    match audio_tx {
        Some(tx) => {
            tx.send(pcm).ok();
        }
        None => create_session(gateway, direction, packet.ssrc, pcm),
    }
}

fn create_session(gateway: &Arc<Gateway>, direction: Direction, ssrc: u32, first_pcm: Bytes) {
    let max_sessions = gateway.settings.sessions.max_sessions;

    if gateway.sessions.lock().len() >= max_sessions {
        metrics::SESSIONS_DROPPED.inc();
        return;
    }

    let (call_uuid, registration) = gateway.adopt(direction);

    let room = room_for(&registration.extension);

    let (audio_tx, audio_rx) = mpsc::unbounded_channel();
    let (end_tx, end_rx) = mpsc::unbounded_channel();

    {
        let mut sessions = gateway.sessions.lock();

        if sessions.len() >= max_sessions {
            metrics::SESSIONS_DROPPED.inc();
            return;
        }

        sessions.insert(
            (direction, ssrc),
            SessionHandle {
                call_uuid: call_uuid.clone(),
                room: room.clone(),
                audio_tx: audio_tx.clone(),
                end_tx,
            },
        );
    }

    metrics::SESSIONS_ACTIVE.inc();

    let ctx = SessionContext {
        gateway: gateway.clone(),
        direction,
        ssrc,
        call_uuid,
        registration,
        room,
    };

    tokio::spawn(session::run(ctx, audio_rx, end_rx));

    audio_tx.send(first_pcm).ok();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::settings::Settings;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn gateway() -> Arc<Gateway> {
        let mut settings: Settings = serde_json::from_value(serde_json::json!({
            "speech": { "key": "secret" }
        }))
        .unwrap();

        // nothing listens here; sessions just cycle through reconnects
        settings.speech.url = "ws://127.0.0.1:9/listen".to_owned();
        settings.sessions.max_sessions = 2;

        Gateway::new(Arc::new(settings))
    }

    fn rtp(ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0x80, 0x60, 0x00, 0x01, 0, 0, 0, 0];
        datagram.extend_from_slice(&ssrc.to_be_bytes());
        datagram.extend_from_slice(payload);
        datagram
    }

    async fn end_all(gateway: &Arc<Gateway>) {
        gateway.drain("test");

        for _ in 0..50 {
            if gateway.session_count() == 0 {
                return;
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        panic!("sessions were not torn down");
    }

    #[tokio::test]
    async fn first_packet_adopts_the_pending_binding() {
        let gateway = gateway();

        gateway.register("X1", "200", "+34600000000", "Ana", Some(Direction::In), false);

        handle_datagram(&gateway, Direction::In, &rtp(0xCCCC, &[0, 0]));

        {
            let sessions = gateway.sessions.lock();
            let handle = sessions.get(&(Direction::In, 0xCCCC)).unwrap();

            assert_eq!(handle.call_uuid, "X1");
            assert_eq!(handle.room, "200");
        }

        end_all(&gateway).await;
    }

    #[tokio::test]
    async fn unknown_ssrc_binds_to_the_sentinel_and_never_rebinds() {
        let gateway = gateway();

        // no pending binding yet: the unknown sentinel is adopted
        handle_datagram(&gateway, Direction::In, &rtp(0xCCCC, &[0, 0]));

        // a register arriving after the fact must not rebind the SSRC
        gateway.register("X1", "200", "", "", Some(Direction::In), false);
        handle_datagram(&gateway, Direction::In, &rtp(0xCCCC, &[0, 0]));

        {
            let sessions = gateway.sessions.lock();
            let handle = sessions.get(&(Direction::In, 0xCCCC)).unwrap();

            assert_eq!(handle.call_uuid, "unknown");
            assert_eq!(handle.room, "mix");
            assert_eq!(sessions.len(), 1);
        }

        // the pending binding is still queued for the next new SSRC
        assert_eq!(gateway.adopt(Direction::In).0, "X1");

        end_all(&gateway).await;
    }

    #[tokio::test]
    async fn session_cap_drops_additional_ssrcs() {
        let gateway = gateway();

        handle_datagram(&gateway, Direction::In, &rtp(1, &[0, 0]));
        handle_datagram(&gateway, Direction::Out, &rtp(2, &[0, 0]));

        let dropped_before = metrics::SESSIONS_DROPPED.get();

        handle_datagram(&gateway, Direction::In, &rtp(3, &[0, 0]));

        assert_eq!(gateway.session_count(), 2);
        assert_eq!(metrics::SESSIONS_DROPPED.get(), dropped_before + 1);
        assert!(gateway.sessions.lock().get(&(Direction::In, 3)).is_none());

        end_all(&gateway).await;
    }

    #[tokio::test]
    async fn same_ssrc_on_both_ports_is_two_sessions() {
        let gateway = gateway();

        handle_datagram(&gateway, Direction::In, &rtp(7, &[0, 0]));
        handle_datagram(&gateway, Direction::Out, &rtp(7, &[0, 0]));

        assert_eq!(gateway.session_count(), 2);

        end_all(&gateway).await;
    }
}
