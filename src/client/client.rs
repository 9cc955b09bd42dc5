// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU16, AtomicU32, Ordering},
    },
};

use bytes::Bytes;
use rand::RngExt;
use tokio::{
    sync::{Notify, watch},
    time::Instant,
};
use tracing::debug;

use crate::{
    cfg::config::Config,
    client::{
        error::GoliothError,
        req::{ReqFlags, RequestQueue},
    },
    coap::{Code, ContentFormat, MsgType, Packet, packet::Method},
    services::{rpc::RpcRegistry, settings::SettingsState},
};

/// Reconnect was requested (credentials changed, user request).
pub(crate) const FLAG_RECONNECT: u32 = 1 << 0;
/// The client should go back to the stopped state.
pub(crate) const FLAG_STOP: u32 = 1 << 1;

/// Connection state of the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// Callback invoked on the engine task right after a connection came up.
pub type OnConnectCb = Box<dyn Fn(&Arc<Client>) + Send + Sync>;

/// A Golioth client session.
///
/// One value per device connection; create it with [`Client::new`], hand it
/// to [`crate::client::session::run`] (usually via [`Client::spawn`]) and
/// interact with it through the service modules. All request state lives
/// here; the session loop multiplexes the transport, retransmissions and
/// keepalive around it.
pub struct Client {
    pub cfg: Config,

    epoch: Instant,
    msg_id: AtomicU16,

    pub(crate) flags: AtomicU32,
    pub(crate) wakeup: Arc<Notify>,
    pub(crate) reqs: RequestQueue,
    pub(crate) outbox: Mutex<VecDeque<Bytes>>,

    pub(crate) started: watch::Sender<bool>,
    pub(crate) conn_state: watch::Sender<ConnState>,

    pub(crate) rpc: RpcRegistry,
    pub(crate) settings: SettingsState,
    pub(crate) on_connect: Mutex<Option<OnConnectCb>>,
}

impl Client {
    pub fn new(cfg: Config) -> Arc<Self> {
        let rpc_cap = cfg.rpc_max_methods;

        Arc::new(Self {
            cfg,
            epoch: Instant::now(),
            msg_id: AtomicU16::new(rand::rng().random()),
            flags: AtomicU32::new(0),
            wakeup: Arc::new(Notify::new()),
            reqs: RequestQueue::new(),
            outbox: Mutex::new(VecDeque::new()),
            started: watch::Sender::new(false),
            conn_state: watch::Sender::new(ConnState::Disconnected),
            rpc: RpcRegistry::new(rpc_cap),
            settings: SettingsState::new(),
            on_connect: Mutex::new(None),
        })
    }

    /// Milliseconds since this client was created. All engine timestamps
    /// (retransmission deadlines, observe acceptance times) use this clock.
    pub(crate) fn uptime_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Next CoAP message id. Assigned on every transmission of a request
    /// and re-assigned on blockwise continuations.
    pub(crate) fn next_id(&self) -> u16 {
        self.msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fresh 8-byte random token, stable for the life of one request.
    pub(crate) fn next_token(&self) -> [u8; 8] {
        let mut token = [0u8; 8];
        rand::rng().fill(&mut token);
        token
    }

    /// Whether requests can currently be submitted.
    pub fn is_connected(&self) -> bool {
        self.reqs.is_connected()
    }

    /// Current session state as observed by the loop.
    pub fn state(&self) -> ConnState {
        *self.conn_state.borrow()
    }

    /// Subscribes to session state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnState> {
        self.conn_state.subscribe()
    }

    /// Registers the callback invoked each time a connection is
    /// established. Service observations are typically re-registered here.
    pub fn set_on_connect(&self, cb: OnConnectCb) {
        *self
            .on_connect
            .lock()
            .expect("on_connect lock poisoned") = Some(cb);
    }

    /// Releases the session loop to connect.
    pub fn start(&self) {
        let _ = self.started.send(true);
    }

    /// Stops the session loop and waits until the disconnect completed.
    ///
    /// Every in-flight request has received its `Shutdown` callback by the
    /// time this returns.
    pub async fn stop(&self) {
        let _ = self.started.send(false);

        // A stop flag raised while the loop already sits in the stopped
        // state would poison the next start.
        if *self.conn_state.borrow() == ConnState::Disconnected {
            return;
        }

        self.flags.fetch_or(FLAG_STOP, Ordering::SeqCst);
        self.wakeup.notify_one();

        let mut state = self.conn_state.subscribe();
        let _ = state
            .wait_for(|state| *state == ConnState::Disconnected)
            .await;
    }

    /// Asks the session loop to tear the connection down and reconnect.
    /// Also the hook for "credentials changed" notifications from the
    /// credential store.
    pub fn request_reconnect(&self) {
        self.flags.fetch_or(FLAG_RECONNECT, Ordering::SeqCst);
        self.wakeup.notify_one();
    }

    /// Enqueues a ready-made datagram for fire-and-forget transmission by
    /// the engine task. Never retried.
    pub(crate) fn enqueue_datagram(&self, datagram: Bytes) -> Result<(), GoliothError> {
        if !self.reqs.is_connected() {
            return Err(GoliothError::TransportUnavailable);
        }

        self.outbox
            .lock()
            .expect("outbox lock poisoned")
            .push_back(datagram);
        self.wakeup.notify_one();

        Ok(())
    }

    /// Empty CON used as keepalive ping.
    pub(crate) fn ping_packet(&self) -> Packet {
        // Infallible: empty token.
        Packet::new(MsgType::Con, &[], Code::EMPTY, self.next_id())
            .expect("empty packet construction cannot fail")
    }

    /// Empty NON transmitted right after connect to force the DTLS
    /// handshake.
    pub(crate) fn handshake_packet(&self) -> Packet {
        Packet::new(MsgType::Non, &[], Code::EMPTY, self.next_id())
            .expect("empty packet construction cannot fail")
    }

    /// Connectivity probe: GET `hello`, returning the response payload.
    pub async fn hello(self: &Arc<Self>) -> Result<Vec<u8>, GoliothError> {
        debug!("Send Hello");

        let body = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&body);

        crate::client::req::req_sync(
            self,
            Method::Get,
            &["hello"],
            ContentFormat::Text,
            &[],
            ReqFlags::empty(),
            Some(Box::new(move |data: &[u8], off: usize, _total: usize| {
                let mut body = sink.lock().expect("hello body lock poisoned");
                body.truncate(off);
                body.extend_from_slice(data);
                Ok(())
            })),
        )
        .await?;

        let body = body.lock().expect("hello body lock poisoned");
        Ok(body.clone())
    }
}
