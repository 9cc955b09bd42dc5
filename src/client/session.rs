// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{
        client::{Client, ConnState, FLAG_RECONNECT, FLAG_STOP},
        error::GoliothError,
        transport::{Transport, TransportFactory},
    },
    coap::{self, MsgType, Packet, ParsedPacket, RxKind},
};

/// Pause between connection attempts after a failed connect.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

impl Client {
    /// Runs the session loop on a dedicated task.
    pub fn spawn(self: &Arc<Self>, factory: Arc<dyn TransportFactory>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move { run(client, factory).await })
    }
}

/// Runs the session loop until `cancel` fires. Callers that want a
/// deterministic teardown (instead of aborting the task) stop the client
/// first and then cancel the token.
pub async fn run_until_cancelled(
    client: Arc<Client>,
    factory: Arc<dyn TransportFactory>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {},
        _ = run(client, factory) => {},
    }
}

/// The session loop: waits for `start`, connects, then multiplexes the
/// transport with the wakeup channel and the engine/keepalive deadlines
/// until a stop, reconnect request, receive timeout or transport error
/// tears the connection down.
pub async fn run(client: Arc<Client>, factory: Arc<dyn TransportFactory>) {
    let mut rx_buf = vec![0u8; client.cfg.rx_buffer_size];
    let mut started = client.started.subscribe();

    loop {
        debug!("Waiting for client to be started");
        if started.wait_for(|started| *started).await.is_err() {
            return;
        }

        info!("Starting connect");
        let _ = client.conn_state.send(ConnState::Connecting);

        let mut transport = match connect(&client, factory.as_ref()).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Failed to connect: {e}");
                let _ = client.conn_state.send(ConnState::Disconnected);

                let flags = client.flags.swap(0, std::sync::atomic::Ordering::SeqCst);
                if flags & FLAG_STOP == 0 {
                    sleep(RECONNECT_BACKOFF).await;
                }
                continue;
            },
        };

        client.reqs_on_connect();
        let _ = client.conn_state.send(ConnState::Connected);
        info!("Client connected!");

        {
            let on_connect = client
                .on_connect
                .lock()
                .expect("on_connect lock poisoned");
            if let Some(cb) = on_connect.as_ref() {
                cb(&client);
            }
        }

        let recv_timeout_ms = client.cfg.receive_timeout_s as i64 * 1000;
        let ping_interval_ms = client.cfg.ping_interval_s as i64 * 1000;

        let mut recv_expiry = client.uptime_ms() + recv_timeout_ms;
        let mut ping_expiry = client.uptime_ms() + ping_interval_ms;

        'conn: loop {
            // Transmissions due now: fire-and-forget datagrams first, then
            // whatever the retransmission walk scheduled.
            let (engine_deadline, scheduled) = client.poll_prepare(client.uptime_ms());
            let queued: Vec<Bytes> = client
                .outbox
                .lock()
                .expect("outbox lock poisoned")
                .drain(..)
                .collect();

            let mut send_failed = false;
            for datagram in queued.into_iter().chain(scheduled) {
                if let Err(e) = transport.send(&datagram).await {
                    error!("Send error: {e}");
                    send_failed = true;
                    break;
                }
            }
            if send_failed {
                break 'conn;
            }

            let now = client.uptime_ms();
            let timeout = recv_expiry
                .min(ping_expiry)
                .min(engine_deadline)
                .saturating_sub(now)
                .max(0);

            debug!("Next timeout: {timeout}");

            let mut timeout_occurred = false;

            tokio::select! {
                received = transport.recv(&mut rx_buf) => {
                    match received {
                        Ok(0) => {
                            warn!("Peer closed connection");
                            break 'conn;
                        },
                        Ok(n) => {
                            recv_expiry = client.uptime_ms() + recv_timeout_ms;
                            ping_expiry = client.uptime_ms() + ping_interval_ms;

                            let len = if n > rx_buf.len() {
                                warn!("Truncated packet ({n} -> {})", rx_buf.len());
                                rx_buf.len()
                            } else {
                                n
                            };

                            if let Some(reply) = handle_rx(&client, &rx_buf[..len])
                                && let Err(e) = transport.send(&reply).await
                            {
                                error!("Send error: {e}");
                                break 'conn;
                            }
                        },
                        Err(e) => {
                            error!("Failed to receive: {e}");
                            break 'conn;
                        },
                    }
                },
                _ = client.wakeup.notified() => {
                    timeout_occurred = true;
                },
                _ = sleep(Duration::from_millis(timeout as u64)) => {
                    debug!("Timeout in poll");
                    timeout_occurred = true;
                },
            }

            if timeout_occurred {
                let flags = client.flags.swap(0, std::sync::atomic::Ordering::SeqCst);
                let stop_request = flags & FLAG_STOP != 0;
                let reconnect_request = flags & FLAG_RECONNECT != 0;
                let receive_timeout = recv_expiry <= client.uptime_ms();

                // Reconnect and stop requests are handled like a receive
                // timeout: tear the connection down.
                if stop_request || reconnect_request || receive_timeout {
                    if stop_request {
                        info!("Stop request");
                    } else if reconnect_request {
                        info!("Reconnect per request");
                    } else {
                        warn!("Receive timeout");
                    }
                    break 'conn;
                }

                if ping_expiry <= client.uptime_ms() {
                    debug!("Sending PING");
                    let ping = client.ping_packet();
                    if let Err(e) = transport.send(ping.as_bytes()).await {
                        error!("Send error: {e}");
                        break 'conn;
                    }
                    ping_expiry = client.uptime_ms() + ping_interval_ms;
                }
            }
        }

        transport.close().await;
        client.reqs_on_disconnect(GoliothError::Shutdown);
        let _ = client.conn_state.send(ConnState::Disconnected);
    }
}

/// Connects the transport and transmits one empty message (token 0, code
/// 0.00) to force the DTLS handshake.
async fn connect(
    client: &Arc<Client>,
    factory: &dyn TransportFactory,
) -> anyhow::Result<Box<dyn Transport>> {
    let mut transport = factory
        .connect(&client.cfg.server_host, client.cfg.server_port, &client.cfg)
        .await?;

    let handshake = client.handshake_packet();
    transport.send(handshake.as_bytes()).await?;

    Ok(transport)
}

/// Classifies and dispatches one received datagram. Returns a datagram to
/// send back, if the message calls for one (RST for pings, ACK for
/// confirmable data).
fn handle_rx(client: &Arc<Client>, data: &[u8]) -> Option<Bytes> {
    match coap::check_rx_packet_type(data) {
        Err(e) => {
            debug!("Invalid RX: {e}");
            None
        },
        Ok(RxKind::Ping) => {
            debug!("RX Empty");
            let parsed = ParsedPacket::parse(Bytes::copy_from_slice(data)).ok()?;
            Some(Packet::reset_for(&parsed).to_datagram())
        },
        Ok(RxKind::Data) => {
            debug!("RX Non-empty");
            let parsed = match ParsedPacket::parse(Bytes::copy_from_slice(data)) {
                Ok(parsed) => parsed,
                Err(e) => {
                    // Fatal to nothing but this datagram.
                    warn!("Failed to parse incoming packet: {e}");
                    return None;
                },
            };

            client.process_rx(&parsed, client.uptime_ms());

            (parsed.msg_type() == MsgType::Con)
                .then(|| Packet::ack_for(&parsed).to_datagram())
        },
    }
}
