// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io,
    net::SocketAddr,
};

use async_trait::async_trait;
use tokio::net::{UdpSocket, lookup_host};
use tracing::{debug, warn};

use crate::cfg::config::Config;

/// A connected datagram transport with security already negotiated.
///
/// The engine task is the only owner; it multiplexes reads and performs all
/// writes. `recv` returns the datagram length, which may exceed the buffer
/// length when the datagram was truncated by the implementation; a return of
/// 0 means the peer closed the connection.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, data: &[u8]) -> io::Result<()>;
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn close(&mut self);
}

/// Resolves and connects a [`Transport`] for the session loop.
///
/// A DTLS 1.2 implementation is expected to consume
/// `credentials_tag_list` (which credentials to pull from the store) and
/// `hostname_verification` (whether to pin the TLS hostname for SNI) from
/// the configuration.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        cfg: &Config,
    ) -> io::Result<Box<dyn Transport>>;
}

/// Plain UDP transport for development setups where DTLS terminates
/// elsewhere (or is absent).
pub struct UdpTransport {
    socket: UdpSocket,
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(data).await?;
        if sent < data.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short datagram write: {sent} < {}", data.len()),
            ));
        }
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }

    async fn close(&mut self) {}
}

/// Resolves the host and connects a UDP socket to the first working address.
pub struct UdpTransportFactory;

#[async_trait]
impl TransportFactory for UdpTransportFactory {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        cfg: &Config,
    ) -> io::Result<Box<dyn Transport>> {
        if !cfg.credentials_tag_list.is_empty() {
            debug!("credential tags are not used by the plain UDP transport");
        }

        let mut last_err =
            io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}"));

        for addr in lookup_host((host, port)).await? {
            match udp_connect(addr).await {
                Ok(socket) => {
                    debug!("connected UDP socket to {addr}");
                    return Ok(Box::new(UdpTransport { socket }));
                },
                Err(e) => {
                    warn!("failed to connect to {addr}: {e}");
                    last_err = e;
                },
            }
        }

        Err(last_err)
    }
}

async fn udp_connect(addr: SocketAddr) -> io::Result<UdpSocket> {
    let bind_addr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(addr).await?;
    Ok(socket)
}
