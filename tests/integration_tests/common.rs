// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use golioth_client_rs::{
    cfg::config::Config,
    client::{
        client::{Client, ConnState},
        transport::{Transport, TransportFactory},
    },
    coap::{
        Code, MsgType, OPTION_BLOCK2, OPTION_OBSERVE, OPTION_SIZE2, Packet,
        ParsedPacket,
    },
};
use once_cell::sync::Lazy;
use tokio::{sync::mpsc, task::JoinHandle};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

/// Test configuration with timers far enough out that only behavior under
/// test drives the clock.
pub fn test_config() -> Config {
    Config {
        server_host: "golioth.test".to_string(),
        randomize_ack_timeout: false,
        ping_interval_s: 100,
        receive_timeout_s: 120,
        ..Config::default()
    }
}

/// In-memory datagram pipe standing in for the DTLS socket.
pub struct MockTransport {
    from_server: mpsc::UnboundedReceiver<Vec<u8>>,
    to_server: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.to_server
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server gone"))
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.from_server.recv().await {
            // Sender dropped: the peer closed the connection.
            None => Ok(0),
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                // Report the true datagram length so truncation is visible.
                Ok(datagram.len())
            },
        }
    }

    async fn close(&mut self) {
        self.from_server.close();
    }
}

/// Server-side endpoints of one mock connection.
pub struct MockServer {
    pub from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    pub to_client: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockServer {
    /// Receives and parses the next datagram from the client.
    pub async fn next_packet(&mut self) -> Result<ParsedPacket> {
        let datagram = self
            .from_client
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("client closed the connection"))?;
        Ok(ParsedPacket::parse(Bytes::from(datagram))?)
    }

    /// Receives the next datagram, skipping retransmissions of already-seen
    /// message ids.
    pub async fn next_new_packet(
        &mut self,
        seen: &mut std::collections::HashSet<u16>,
    ) -> Result<ParsedPacket> {
        loop {
            let packet = self.next_packet().await?;
            if seen.insert(packet.id()) {
                return Ok(packet);
            }
        }
    }

    pub fn send_raw(&self, datagram: &[u8]) {
        let _ = self.to_client.send(datagram.to_vec());
    }

    /// Piggybacked response to `req` with the given code and payload.
    pub fn reply(&self, req: &ParsedPacket, code: Code, payload: &[u8]) -> Result<()> {
        let mut packet = Packet::new(MsgType::Ack, req.token(), code, req.id())?;
        if !payload.is_empty() {
            packet.append_payload(payload)?;
        }
        self.send_raw(packet.as_bytes());
        Ok(())
    }

    /// Piggybacked Block2 response carrying `payload` as the block at
    /// `num * (1 << (4 + szx))`.
    pub fn reply_block(
        &self,
        req: &ParsedPacket,
        num: u32,
        more: bool,
        szx: u32,
        total: Option<u32>,
        payload: &[u8],
    ) -> Result<()> {
        let mut packet = Packet::new(MsgType::Ack, req.token(), Code::CONTENT, req.id())?;
        let value = (num << 4) | (u32::from(more) << 3) | szx;
        packet.append_option_uint(OPTION_BLOCK2, value)?;
        if let Some(total) = total {
            packet.append_option_uint(OPTION_SIZE2, total)?;
        }
        packet.append_payload(payload)?;
        self.send_raw(packet.as_bytes());
        Ok(())
    }

    /// Non-confirmable observe notification for the observation registered
    /// with `token`.
    pub fn notify(&self, token: &[u8], seq: u32, payload: &[u8]) -> Result<()> {
        let mut packet = Packet::new(MsgType::Non, token, Code::CONTENT, rand_id())?;
        packet.append_option_uint(OPTION_OBSERVE, seq)?;
        packet.append_payload(payload)?;
        self.send_raw(packet.as_bytes());
        Ok(())
    }

    /// Registration reply to an observe request: piggybacked 2.05 with
    /// Observe seq 0.
    pub fn reply_observe_registered(&self, req: &ParsedPacket, payload: &[u8]) -> Result<()> {
        let mut packet =
            Packet::new(MsgType::Ack, req.token(), Code::CONTENT, req.id())?;
        packet.append_option_uint(OPTION_OBSERVE, 0)?;
        if !payload.is_empty() {
            packet.append_payload(payload)?;
        }
        self.send_raw(packet.as_bytes());
        Ok(())
    }
}

fn rand_id() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static NEXT: AtomicU16 = AtomicU16::new(0x7000);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Factory handing out pre-staged transports, one per connection attempt.
pub struct MockFactory {
    transports: Mutex<VecDeque<MockTransport>>,
}

impl MockFactory {
    pub fn new() -> (Arc<Self>, MockServer) {
        let (factory, mut servers) = Self::with_connections(1);
        let server = servers.pop_front().expect("one staged connection");
        (factory, server)
    }

    /// Stages `count` connections for tests exercising reconnects.
    pub fn with_connections(count: usize) -> (Arc<Self>, VecDeque<MockServer>) {
        let mut transports = VecDeque::new();
        let mut servers = VecDeque::new();

        for _ in 0..count {
            let (to_client, from_server) = mpsc::unbounded_channel();
            let (to_server, from_client) = mpsc::unbounded_channel();

            transports.push_back(MockTransport {
                from_server,
                to_server,
            });
            servers.push_back(MockServer {
                from_client,
                to_client,
            });
        }

        (
            Arc::new(Self {
                transports: Mutex::new(transports),
            }),
            servers,
        )
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(
        &self,
        _host: &str,
        _port: u16,
        _cfg: &Config,
    ) -> io::Result<Box<dyn Transport>> {
        self.transports
            .lock()
            .expect("factory lock poisoned")
            .pop_front()
            .map(|t| Box::new(t) as Box<dyn Transport>)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "no staged transport")
            })
    }
}

/// A started client wired to a mock server, with the DTLS-handshake
/// trigger already consumed.
pub struct Harness {
    pub client: Arc<Client>,
    pub server: MockServer,
    pub session: JoinHandle<()>,
}

pub async fn start_client(cfg: Config) -> Result<Harness> {
    let (factory, server) = MockFactory::new();
    start_client_with(cfg, factory, server).await
}

pub async fn start_client_with(
    cfg: Config,
    factory: Arc<MockFactory>,
    mut server: MockServer,
) -> Result<Harness> {
    Lazy::force(&TRACING);

    let client = Client::new(cfg);
    let session = client.spawn(factory);
    client.start();

    let mut state = client.state_changes();
    state
        .wait_for(|state| *state == ConnState::Connected)
        .await?;

    // Empty NON sent to force the DTLS handshake.
    let handshake = server.next_packet().await?;
    assert_eq!(handshake.code(), Code::EMPTY);
    assert_eq!(handshake.msg_type(), MsgType::Non);

    Ok(Harness {
        client,
        server,
        session,
    })
}
