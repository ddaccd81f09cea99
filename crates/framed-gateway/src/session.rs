// SPDX-FileCopyrightText: OpenTalk GmbH <mail@opentalk.eu>
//
// SPDX-License-Identifier: EUPL-1.2

//! Per-call framed gateway sessions.
//!
//! A session owns one UDP socket (the per-call RTP intake), one TCP
//! connection to the downstream peer and the state between them: the
//! reassembly buffer, the pre-connect frame queue and the inactivity
//! watchdog. Every terminal cause funnels into the same end-and-close path,
//! which emits END at most once and releases the port slot.

use crate::framing::{frame, StartPayload, AUDIO_FRAME_BYTES, TYPE_AUDIO, TYPE_END, TYPE_START};
use crate::metrics;
use auricle_media::rtp::RtpPacket;
use auricle_media::wav::{WavDump, DEFAULT_DUMP_SECS};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Downstream framed-protocol peer as `host:port`
    pub downstream: String,
    /// Inclusive UDP port range accepted on register
    pub port_range: (u16, u16),
    /// Close a connected session after this long without RTP
    pub inactivity: Duration,
    /// Watchdog check period
    pub watchdog_period: Duration,
    /// Write a capped WAV dump of each session into this directory
    pub dump_dir: Option<PathBuf>,
}

/// Call metadata captured at register time, forwarded in START
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub call_uuid: String,
    pub agent_extension: String,
    pub agent_username: String,
    pub agent_id: String,
}

#[derive(Debug)]
pub enum RegisterError {
    /// The port is bound to a live session (or another process)
    Occupied,
    Bind(std::io::Error),
}

struct SessionHandle {
    end_tx: mpsc::UnboundedSender<&'static str>,
}

/// Table of live sessions keyed by their UDP port
pub struct Sessions {
    pub config: SessionConfig,
    active: Mutex<HashMap<u16, SessionHandle>>,
}

impl Sessions {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// True if `port` lies within the configured RTP range
    pub fn port_in_range(&self, port: u16) -> bool {
        let (start, end) = self.config.port_range;

        (start..=end).contains(&port)
    }

    /// Bind `port` and spawn the session task for it. The TCP connect to
    /// the downstream peer starts immediately, before any RTP arrives.
    pub async fn register(
        self: &Arc<Self>,
        port: u16,
        info: SessionInfo,
    ) -> Result<(), RegisterError> {
        if self.active.lock().contains_key(&port) {
            return Err(RegisterError::Occupied);
        }

        let socket = UdpSocket::bind(("0.0.0.0", port)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                RegisterError::Occupied
            } else {
                RegisterError::Bind(e)
            }
        })?;

        let (end_tx, end_rx) = mpsc::unbounded_channel();

        {
            let mut active = self.active.lock();

            if active.contains_key(&port) {
                return Err(RegisterError::Occupied);
            }

            active.insert(port, SessionHandle { end_tx });
        }

        metrics::SESSIONS_ACTIVE.inc();

        log::info!("registered call {} on udp port {}", info.call_uuid, port);

        tokio::spawn(run_session(self.clone(), port, socket, info, end_rx));

        Ok(())
    }

    /// Request the session on `port` to end. Returns false when no such
    /// session exists (unregister is idempotent).
    pub fn end(&self, port: u16, reason: &'static str) -> bool {
        match self.active.lock().get(&port) {
            Some(handle) => {
                handle.end_tx.send(reason).ok();
                true
            }
            None => false,
        }
    }

    /// Request every live session to end (process shutdown)
    pub fn drain(&self, reason: &'static str) {
        for handle in self.active.lock().values() {
            handle.end_tx.send(reason).ok();
        }
    }

    pub fn count(&self) -> usize {
        self.active.lock().len()
    }

    fn release(&self, port: u16) {
        if self.active.lock().remove(&port).is_some() {
            metrics::SESSIONS_ACTIVE.dec();
        }
    }
}

async fn run_session(
    sessions: Arc<Sessions>,
    port: u16,
    socket: UdpSocket,
    info: SessionInfo,
    mut end_rx: mpsc::UnboundedReceiver<&'static str>,
) {
    let reason = drive_session(&sessions.config, port, socket, &info, &mut end_rx).await;

    metrics::SESSION_ENDS.with_label_values(&[reason]).inc();

    log::info!(
        "session for call {} on port {} ended ({})",
        info.call_uuid,
        port,
        reason
    );

    sessions.release(port);
}

/// Session main loop, returns the terminal reason
async fn drive_session(
    config: &SessionConfig,
    port: u16,
    socket: UdpSocket,
    info: &SessionInfo,
    end_rx: &mut mpsc::UnboundedReceiver<&'static str>,
) -> &'static str {
    let mut connect = pin!(TcpStream::connect(config.downstream.clone()));

    let mut tcp_tx: Option<OwnedWriteHalf> = None;
    let mut tcp_rx: Option<OwnedReadHalf> = None;

    let mut queue: VecDeque<Bytes> = VecDeque::new();
    let mut assembly = BytesMut::new();
    let mut last_rtp = Instant::now();
    let mut watchdog = interval(config.watchdog_period);
    let mut recv_buf = vec![0u8; 2048];

    let mut dump = config.dump_dir.as_deref().and_then(|dir| {
        let path = dir.join(format!("{}-{port}.wav", info.call_uuid));

        WavDump::create(&path, DEFAULT_DUMP_SECS)
            .map_err(|e| log::warn!("cannot create wav dump {}: {e}", path.display()))
            .ok()
    });

    let reason = 'session: loop {
        tokio::select! {
            connected = &mut connect, if tcp_tx.is_none() => {
                match connected {
                    Ok(stream) => {
                        let (rx, mut tx) = stream.into_split();

                        if let Err(e) = send_start_and_queued(&mut tx, info, &mut queue).await {
                            log::error!("downstream write failed for call {}: {e}", info.call_uuid);
                            break 'session "tcp-error";
                        }

                        tcp_tx = Some(tx);
                        tcp_rx = Some(rx);
                    }
                    Err(e) => {
                        log::error!(
                            "connect to downstream {} failed for call {}: {e}",
                            config.downstream,
                            info.call_uuid
                        );
                        break 'session "tcp-connect-failed";
                    }
                }
            }
            received = socket.recv_from(&mut recv_buf) => {
                let len = match received {
                    Ok((len, _)) => len,
                    Err(e) => {
                        log::error!("udp receive error on port {port}: {e}");
                        break 'session "udp-error";
                    }
                };

                let packet = match RtpPacket::parse(&recv_buf[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        log::debug!("dropping datagram on port {port}: {e}");
                        metrics::RTP_INVALID.inc();
                        continue;
                    }
                };

                metrics::RTP_PACKETS.inc();
                metrics::RTP_BYTES.inc_by(packet.payload.len() as u64);
                last_rtp = Instant::now();

                if let Some(dump) = &mut dump {
                    if let Err(e) = dump.write(packet.payload) {
                        log::warn!("wav dump write failed: {e}");
                    }
                }

                assembly.extend_from_slice(packet.payload);

                while assembly.len() >= AUDIO_FRAME_BYTES {
                    let pcm = assembly.split_to(AUDIO_FRAME_BYTES);
                    let audio = frame(TYPE_AUDIO, &pcm);

                    metrics::AUDIO_FRAMES.inc();

                    match &mut tcp_tx {
                        Some(tx) => {
                            if let Err(e) = tx.write_all(&audio).await {
                                log::error!(
                                    "downstream write failed for call {}: {e}",
                                    info.call_uuid
                                );
                                break 'session "tcp-error";
                            }
                        }
                        None => queue.push_back(audio),
                    }
                }
            }
            closed = wait_peer_closed(&mut tcp_rx) => {
                break 'session closed;
            }
            _ = watchdog.tick(), if tcp_tx.is_some() => {
                if last_rtp.elapsed() > config.inactivity {
                    break 'session "inactivity";
                }
            }
            reason = end_rx.recv() => {
                break 'session reason.unwrap_or("unregister");
            }
        }
    };

    if let Some(dump) = &mut dump {
        dump.finalize().ok();
    }

    // END exactly once, then the gateway closes the connection
    if let Some(mut tx) = tcp_tx {
        if let Err(e) = tx.write_all(&frame(TYPE_END, &[])).await {
            log::debug!("could not send END for call {}: {e}", info.call_uuid);
        }

        tx.shutdown().await.ok();
    }

    reason
}

/// START, then the pre-connect queue in FIFO order
async fn send_start_and_queued(
    tx: &mut OwnedWriteHalf,
    info: &SessionInfo,
    queue: &mut VecDeque<Bytes>,
) -> std::io::Result<()> {
    let payload = serde_json::to_vec(&StartPayload {
        call_uuid: &info.call_uuid,
        agent_extension: &info.agent_extension,
        agent_username: &info.agent_username,
        agent_id: &info.agent_id,
    })
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    tx.write_all(&frame(TYPE_START, &payload)).await?;

    if !queue.is_empty() {
        metrics::QUEUE_FLUSHES.inc();
    }

    for audio in queue.drain(..) {
        tx.write_all(&audio).await?;
    }

    Ok(())
}

/// Resolves when the downstream peer closes or breaks the connection.
/// Pending forever while the connect has not completed yet.
async fn wait_peer_closed(tcp_rx: &mut Option<OwnedReadHalf>) -> &'static str {
    use tokio::io::AsyncReadExt;

    match tcp_rx {
        Some(rx) => {
            let mut buf = [0u8; 64];

            loop {
                match rx.read(&mut buf).await {
                    // the peer is not expected to talk; discard anything it sends
                    Ok(n) if n > 0 => {}
                    Ok(_) => return "tcp-closed",
                    Err(_) => return "tcp-error",
                }
            }
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    fn config(downstream: String) -> SessionConfig {
        SessionConfig {
            downstream,
            port_range: (47000, 47999),
            inactivity: Duration::from_millis(400),
            watchdog_period: Duration::from_millis(100),
            dump_dir: None,
        }
    }

    fn info(call_uuid: &str) -> SessionInfo {
        SessionInfo {
            call_uuid: call_uuid.into(),
            agent_extension: "100".into(),
            ..Default::default()
        }
    }

    fn rtp_datagram(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut datagram = vec![0x80, 0x60];
        datagram.extend_from_slice(&seq.to_be_bytes());
        datagram.extend_from_slice(&(u32::from(seq) * 320).to_be_bytes());
        datagram.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        datagram.extend_from_slice(payload);
        datagram
    }

    async fn read_frames(stream: &mut TcpStream) -> Vec<(u8, Vec<u8>)> {
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await.unwrap();

        let mut frames = Vec::new();
        let mut rest = &data[..];

        while !rest.is_empty() {
            assert!(rest.len() >= 3, "truncated frame header");
            let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
            assert!(rest.len() >= 3 + len, "truncated frame payload");
            frames.push((rest[0], rest[3..3 + len].to_vec()));
            rest = &rest[3 + len..];
        }

        frames
    }

    async fn wait_released(sessions: &Sessions) {
        for _ in 0..50 {
            if sessions.count() == 0 {
                return;
            }

            sleep(Duration::from_millis(20)).await;
        }

        panic!("session was not released");
    }

    #[tokio::test]
    async fn frames_audio_between_start_and_end() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sessions = Sessions::new(config(listener.local_addr().unwrap().to_string()));

        sessions.register(47101, info("A1")).await.unwrap();

        let (mut sink, _) = listener.accept().await.unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pcm: Vec<u8> = (0..AUDIO_FRAME_BYTES).map(|i| i as u8).collect();

        for seq in 0..5u16 {
            sender
                .send_to(&rtp_datagram(seq, &pcm), ("127.0.0.1", 47101))
                .await
                .unwrap();
        }

        sleep(Duration::from_millis(200)).await;
        assert!(sessions.end(47101, "unregister"));

        let frames = read_frames(&mut sink).await;

        assert_eq!(frames.len(), 7);
        assert_eq!(frames[0].0, TYPE_START);

        let start: serde_json::Value = serde_json::from_slice(&frames[0].1).unwrap();
        assert_eq!(start["call_uuid"], "A1");
        assert_eq!(start["agent_extension"], "100");
        assert_eq!(start["agent_username"], "");

        for audio in &frames[1..6] {
            assert_eq!(audio.0, TYPE_AUDIO);
            assert_eq!(audio.1, pcm);
        }

        assert_eq!(frames[6], (TYPE_END, vec![]));

        wait_released(&sessions).await;
    }

    #[tokio::test]
    async fn reassembles_across_packet_boundaries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sessions = Sessions::new(config(listener.local_addr().unwrap().to_string()));

        sessions.register(47102, info("A2")).await.unwrap();

        let (mut sink, _) = listener.accept().await.unwrap();

        // 1600 bytes in odd chunks -> exactly 2 frames and 320 leftover bytes
        let pcm: Vec<u8> = (0..1600u32).map(|i| i as u8).collect();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        for (seq, chunk) in pcm.chunks(100).enumerate() {
            sender
                .send_to(&rtp_datagram(seq as u16, chunk), ("127.0.0.1", 47102))
                .await
                .unwrap();
        }

        sleep(Duration::from_millis(200)).await;
        sessions.end(47102, "unregister");

        let frames = read_frames(&mut sink).await;

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1].1, pcm[..AUDIO_FRAME_BYTES].to_vec());
        assert_eq!(frames[2].1, pcm[AUDIO_FRAME_BYTES..2 * AUDIO_FRAME_BYTES].to_vec());
        assert_eq!(frames[3].0, TYPE_END);

        wait_released(&sessions).await;
    }

    #[tokio::test]
    async fn port_is_exclusive_and_reusable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sessions = Sessions::new(config(listener.local_addr().unwrap().to_string()));

        sessions.register(47103, info("A3")).await.unwrap();

        assert!(matches!(
            sessions.register(47103, info("A4")).await,
            Err(RegisterError::Occupied)
        ));

        let (mut sink, _) = listener.accept().await.unwrap();

        sessions.end(47103, "unregister");
        read_frames(&mut sink).await;
        wait_released(&sessions).await;

        // the slot is free again
        sessions.register(47103, info("A5")).await.unwrap();
        let (mut sink, _) = listener.accept().await.unwrap();
        sessions.end(47103, "unregister");
        read_frames(&mut sink).await;
        wait_released(&sessions).await;
    }

    #[tokio::test]
    async fn inactivity_ends_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sessions = Sessions::new(config(listener.local_addr().unwrap().to_string()));

        sessions.register(47104, info("A6")).await.unwrap();

        let (mut sink, _) = listener.accept().await.unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pcm = vec![0u8; AUDIO_FRAME_BYTES];

        for seq in 0..2u16 {
            sender
                .send_to(&rtp_datagram(seq, &pcm), ("127.0.0.1", 47104))
                .await
                .unwrap();
        }

        // no unregister: the watchdog must close the stream by itself
        let frames = read_frames(&mut sink).await;

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].0, TYPE_START);
        assert_eq!(frames[3].0, TYPE_END);

        wait_released(&sessions).await;
    }
}
