// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use bitflags::bitflags;
use bytes::Bytes;
use rand::RngExt;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    cfg::config::Config,
    client::{client::Client, error::GoliothError},
    coap::{
        Code, ContentFormat, MsgType, OPTION_ACCEPT, OPTION_BLOCK2,
        OPTION_CONTENT_FORMAT, OPTION_OBSERVE, Packet, ParsedPacket,
        block::{BlockContext, BlockSize},
        packet::{Method, PacketSnapshot},
        pathv,
    },
};

/// Room for header, token and options of a request without its path and
/// payload.
pub(crate) const MAX_NON_PAYLOAD_LEN: usize = 128;

/// Notifications older than this are accepted regardless of sequence
/// numbers (RFC 7641 §3.4).
const OBSERVE_TS_DIFF_NEWER_MS: i64 = 128 * 1000;

const REQ_RETRIES: u8 = 3;

bitflags! {
    /// Behavior switches for [`req_cb`] / [`req_sync`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReqFlags: u32 {
        /// Register a CoAP observation.
        const OBSERVE = 1 << 0;
        /// Do not request a response body (omits the Accept option). The
        /// server may still send one; it is ignored by the shim.
        const NO_RESP_BODY = 1 << 1;
    }
}

/// One-shot handle resuming a blockwise transfer.
///
/// Delivered inside [`RspView`] for every intermediate block. Calling
/// [`GetNext::request_next`] re-arms retransmission and asks the engine to
/// send the request for the next block; dropping it without calling leaves
/// the request to retransmit the current block and eventually time out.
pub struct GetNext {
    flag: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
}

impl GetNext {
    pub fn request_next(self) {
        self.flag.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }
}

/// View of one response (or one block of it) passed to request callbacks.
pub struct RspView<'a> {
    pub data: &'a [u8],
    /// Byte offset of `data` within the overall resource.
    pub off: usize,
    /// Total resource size when known (0 otherwise).
    pub total: usize,
    /// Present on intermediate blocks of a blockwise transfer.
    pub get_next: Option<GetNext>,
}

/// Callback invoked on every response, timeout, or cancellation of a
/// request. Returning `Err` cancels the request.
pub type ReqCallback =
    Box<dyn FnMut(Result<RspView<'_>, GoliothError>) -> Result<(), GoliothError> + Send>;

/// Retransmission state of one request (modeled after `coap_pending`).
#[derive(Debug)]
struct Pending {
    t0: i64,
    /// 0 before the first transmission.
    timeout: i64,
    retries: u8,
}

impl Pending {
    fn new(now: i64) -> Self {
        Self {
            t0: now,
            timeout: 0,
            retries: REQ_RETRIES,
        }
    }

    /// Prepares the next (re)transmission. Returns false when retries are
    /// exhausted.
    fn cycle(&mut self, initial_timeout: i64) -> bool {
        if self.timeout == 0 {
            // Initial transmission.
            self.timeout = initial_timeout;
            return true;
        }

        if self.retries == 0 {
            return false;
        }

        self.t0 += self.timeout;
        self.timeout <<= 1;
        self.retries -= 1;

        true
    }
}

/// Observe ordering state of one request (modeled after `coap_reply`).
#[derive(Debug)]
struct ReplyState {
    seq: i64,
    ts: i64,
}

fn sequence_is_newer(v1: i64, v2: i64) -> bool {
    (v1 < v2 && v2 - v1 < (1 << 23)) || (v1 > v2 && v1 - v2 > (1 << 23))
}

fn reply_is_newer(reply: &ReplyState, seq: i64, uptime: i64) -> bool {
    uptime > reply.ts + OBSERVE_TS_DIFF_NEWER_MS || sequence_is_newer(reply.seq, seq)
}

/// One outstanding CoAP exchange, owned by the request queue.
pub(crate) struct CoapRequest {
    method: Method,
    request: Packet,
    /// Packet state before the Block2 option was first appended, so block
    /// continuations can rewrite just that option.
    snapshot_wo_block2: Option<PacketSnapshot>,
    block_ctx: BlockContext,
    pending: Pending,
    reply: ReplyState,
    is_observe: bool,
    /// True while a response/ack is awaited. For observations this drops to
    /// false once the registration reply arrived.
    is_pending: bool,
    continue_requested: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
    cb: ReqCallback,
}

impl CoapRequest {
    /// Rewrites the request to ask for the block at `block_ctx.current`,
    /// with a fresh message id and re-armed retransmission.
    fn prepare_next_block(&mut self, next_id: u16, now: i64) -> anyhow::Result<()> {
        self.request.set_id(next_id);

        match self.snapshot_wo_block2 {
            Some(snap) => self.request.restore(snap),
            None => self.snapshot_wo_block2 = Some(self.request.snapshot()),
        }

        self.block_ctx.append_block2_request(&mut self.request)?;
        self.pending = Pending::new(now);

        Ok(())
    }
}

struct QueueInner {
    reqs: Vec<CoapRequest>,
    connected: bool,
}

/// In-flight request records. One mutex protects insertion, removal and
/// iteration; requests are touched both by the session loop and by
/// service-call tasks.
pub(crate) struct RequestQueue {
    inner: Mutex<QueueInner>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                reqs: Vec::new(),
                connected: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("request queue lock poisoned")
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn submit(&self, req: CoapRequest) -> Result<(), GoliothError> {
        let mut inner = self.lock();

        if !inner.connected {
            return Err(GoliothError::TransportUnavailable);
        }

        inner.reqs.push(req);

        Ok(())
    }

    /// Marks the transport usable. Tracked separately from the socket so
    /// submissions never contend with an in-progress receive.
    pub(crate) fn on_connect(&self) {
        self.lock().connected = true;
    }

    /// Clears the transport-usable flag and takes every in-flight request
    /// for cancellation. Callbacks are invoked by the caller, outside the
    /// queue lock.
    fn take_all_disconnected(&self) -> Vec<CoapRequest> {
        let mut inner = self.lock();
        inner.connected = false;
        std::mem::take(&mut inner.reqs)
    }
}

fn initial_ack_timeout(cfg: &Config) -> i64 {
    let min = cfg.ack_timeout_ms as i64;

    if cfg.randomize_ack_timeout {
        // ACK_TIMEOUT <= t < ACK_TIMEOUT * ACK_RANDOM_FACTOR
        // Ref: https://tools.ietf.org/html/rfc7252#section-4.8
        let max = min * cfg.ack_random_factor_percent as i64 / 100;
        if max > min {
            return rand::rng().random_range(min..max);
        }
    }

    min
}

impl Client {
    /// Marks the engine connected; submissions are accepted from now on.
    pub(crate) fn reqs_on_connect(&self) {
        self.reqs.on_connect();
    }

    /// Fails every in-flight request with `reason` and empties the table.
    pub(crate) fn reqs_on_disconnect(&self, reason: GoliothError) {
        let cancelled = self.reqs.take_all_disconnected();

        for mut req in cancelled {
            let _ = (req.cb)(Err(reason));
        }
    }

    /// Walks the request table: transmits every request whose deadline has
    /// passed (including initial transmissions and blockwise
    /// continuations), fails requests out of retries, and returns the
    /// datagrams to send plus the timestamp of the earliest next deadline
    /// (`i64::MAX` when nothing is pending).
    pub(crate) fn poll_prepare(&self, now: i64) -> (i64, Vec<Bytes>) {
        let mut min_deadline = i64::MAX;
        let mut to_send = Vec::new();
        let mut timed_out = Vec::new();

        {
            let mut inner = self.reqs.lock();
            let mut i = 0;

            while i < inner.reqs.len() {
                let req = &mut inner.reqs[i];

                if req.is_observe && !req.is_pending {
                    i += 1;
                    continue;
                }

                if req.continue_requested.swap(false, Ordering::AcqRel)
                    && let Err(e) = req.prepare_next_block(self.next_id(), now)
                {
                    error!("Failed to prepare next block request: {e}");
                    let req = inner.reqs.remove(i);
                    timed_out.push((req, GoliothError::BadMessage));
                    continue;
                }

                let mut send = false;
                let resend = req.pending.timeout != 0;
                let mut deadline = None;

                loop {
                    let timeout = req.pending.t0 + req.pending.timeout - now;

                    if timeout > 0 {
                        // Packet still waits for a response or ack.
                        deadline = Some(now + timeout);
                        break;
                    }

                    if !req.pending.cycle(initial_ack_timeout(&self.cfg)) {
                        break;
                    }

                    send = true;
                }

                match deadline {
                    Some(deadline) => {
                        if send {
                            if resend {
                                warn!(
                                    "Resending request (token {}, retries left {})",
                                    hex::encode(req.request.token()),
                                    req.pending.retries
                                );
                            }
                            to_send.push(req.request.to_datagram());
                        }
                        min_deadline = min_deadline.min(deadline);
                        i += 1;
                    },
                    None => {
                        let req = inner.reqs.remove(i);
                        timed_out.push((req, GoliothError::Timeout));
                    },
                }
            }
        }

        for (mut req, reason) in timed_out {
            warn!(
                "{:?} request (token {}) was not replied to",
                req.method,
                hex::encode(req.request.token())
            );
            let _ = (req.cb)(Err(reason));
        }

        (min_deadline, to_send)
    }

    /// Matches an incoming packet against the request table and drives the
    /// owning request. At most one request consumes a packet.
    pub(crate) fn process_rx(&self, rx: &ParsedPacket, now: i64) {
        let rx_id = rx.id();
        let rx_token = rx.token();

        let req = {
            let mut inner = self.reqs.lock();

            let matched = inner.reqs.iter().position(|req| {
                let req_id = req.request.id();
                let req_token = req.request.token();

                if req_id == 0 && req_token.is_empty() {
                    return false;
                }

                if rx_token.is_empty() {
                    // Piggybacked responses must match by id when the
                    // incoming message carries no token.
                    return req_id == rx_id;
                }

                req_token == rx_token
            });

            let Some(i) = matched else {
                debug!("No request matches incoming packet (id {rx_id})");
                return;
            };

            if let Some(seq) = rx.option_uint(OPTION_OBSERVE) {
                // Deliver observed notifications only if received in order
                // (RFC 7641 §3.4).
                let req = &mut inner.reqs[i];
                if !reply_is_newer(&req.reply, seq as i64, now) {
                    debug!("Dropping stale observe notification (seq {seq})");
                    return;
                }
                req.reply.seq = seq as i64;
                req.reply.ts = now;
            }

            // The record leaves the table while its callback runs, so
            // callbacks are free to submit new requests.
            inner.reqs.remove(i)
        };

        if let Some(req) = reply_handler(req, rx) {
            self.reqs.lock().reqs.push(req);
        }
    }
}

/// Drives one matched request with its response. Returns the request when
/// it stays alive (observation, continued blockwise transfer), `None` when
/// it completed or failed.
fn reply_handler(mut req: CoapRequest, rx: &ParsedPacket) -> Option<CoapRequest> {
    let code = rx.code();

    debug!(
        "CoAP response code: {} (class {} detail {})",
        code,
        code.class(),
        code.detail()
    );

    if code == Code::BAD_REQUEST {
        warn!("Server reports CoAP Bad Request. (Check payload formatting)");
    }

    if let Some(err) = GoliothError::from_response_code(code) {
        let _ = (req.cb)(Err(err));
        info!("cancel request (token {})", hex::encode(req.request.token()));
        return None;
    }

    let payload = rx.payload();

    if rx.option(OPTION_BLOCK2).is_none() {
        let status = (req.cb)(Ok(RspView {
            data: payload,
            off: 0,
            total: payload.len(),
            get_next: None,
        }));

        if req.is_observe {
            if let Err(e) = status {
                warn!("Received error ({e}) from callback, cancelling");
                return None;
            }
            req.is_pending = false;
            return Some(req);
        }

        return None;
    }

    let want_offset = req.block_ctx.current;

    if let Err(e) = req.block_ctx.update_from_response(rx) {
        error!("Failed to parse block response: {e}");
        let _ = (req.cb)(Err(GoliothError::BadMessage));
        return None;
    }

    let cur_offset = req.block_ctx.current;
    if cur_offset < want_offset {
        warn!("Block at {cur_offset} already received, ignoring");
        req.block_ctx.current = want_offset;
        return Some(req);
    }

    let new_offset = req.block_ctx.advance(rx);

    if new_offset == 0 {
        debug!("Blockwise transfer is finished!");

        let status = (req.cb)(Ok(RspView {
            data: payload,
            off: cur_offset,
            total: req.block_ctx.total_size,
            get_next: None,
        }));

        if req.is_observe {
            if let Err(e) = status {
                warn!("Received error ({e}) from callback, cancelling");
                return None;
            }
            req.is_pending = false;
            return Some(req);
        }

        return None;
    }

    if req.is_observe {
        error!("blockwise observe is not supported");
        let _ = (req.cb)(Err(GoliothError::Unsupported));
        return None;
    }

    let get_next = GetNext {
        flag: Arc::clone(&req.continue_requested),
        wakeup: Arc::clone(&req.wakeup),
    };

    let status = (req.cb)(Ok(RspView {
        data: payload,
        off: cur_offset,
        total: req.block_ctx.total_size,
        get_next: Some(get_next),
    }));

    if let Err(e) = status {
        warn!("Received error ({e}) from callback, cancelling");
        return None;
    }

    Some(req)
}

/// Builds a request packet with the common Golioth options and wraps it in
/// a queue record.
fn build_request(
    client: &Client,
    method: Method,
    pathv: &[&str],
    format: ContentFormat,
    data: &[u8],
    flags: ReqFlags,
    cb: ReqCallback,
) -> Result<CoapRequest, GoliothError> {
    let build = || -> anyhow::Result<Packet> {
        let token = client.next_token();
        let mut packet = Packet::new(MsgType::Con, &token, method.code(), client.next_id())?;
        packet.reserve(MAX_NON_PAYLOAD_LEN + pathv::estimate_alloc_len(pathv) + data.len());

        if method == Method::Get && flags.contains(ReqFlags::OBSERVE) {
            packet.append_option_uint(OPTION_OBSERVE, 0 /* register */)?;
        }

        pathv::append_uri_pathv(&mut packet, pathv)?;

        if method != Method::Get && method != Method::Delete {
            packet.append_option_uint(OPTION_CONTENT_FORMAT, format.value())?;
        }

        if !flags.contains(ReqFlags::NO_RESP_BODY) {
            packet.append_option_uint(OPTION_ACCEPT, format.value())?;
        }

        if !data.is_empty() {
            packet.append_payload(data)?;
        }

        Ok(packet)
    };

    let request = build().map_err(|e| {
        error!("Failed to build CoAP request: {e}");
        GoliothError::BadMessage
    })?;

    let now = client.uptime_ms();
    let is_observe = method == Method::Get && flags.contains(ReqFlags::OBSERVE);

    Ok(CoapRequest {
        method,
        request,
        snapshot_wo_block2: None,
        block_ctx: BlockContext::new(BlockSize::max_for_buffer(client.cfg.rx_buffer_size)),
        pending: Pending::new(now),
        reply: ReplyState {
            seq: 0,
            ts: -OBSERVE_TS_DIFF_NEWER_MS,
        },
        is_observe,
        is_pending: true,
        continue_requested: Arc::new(AtomicBool::new(false)),
        wakeup: Arc::clone(&client.wakeup),
        cb,
    })
}

/// Creates and schedules a request; `cb` is invoked on the engine task for
/// every response, timeout or cancellation.
pub(crate) fn req_cb(
    client: &Arc<Client>,
    method: Method,
    pathv: &[&str],
    format: ContentFormat,
    data: &[u8],
    flags: ReqFlags,
    cb: ReqCallback,
) -> Result<(), GoliothError> {
    let req = build_request(client, method, pathv, format, data, flags, cb)?;

    client.reqs.submit(req)?;
    client.wakeup.notify_one();

    Ok(())
}

/// Per-block data callback of the awaitable request form.
pub type SyncDataCb =
    Box<dyn FnMut(&[u8], usize, usize) -> Result<(), GoliothError> + Send>;

/// Schedules a request and waits for its terminal outcome.
///
/// The shim callback forwards every received block to `data_cb` and chains
/// blockwise continuations automatically; the call resolves with the final
/// status of the exchange.
pub(crate) async fn req_sync(
    client: &Arc<Client>,
    method: Method,
    pathv: &[&str],
    format: ContentFormat,
    data: &[u8],
    flags: ReqFlags,
    mut data_cb: Option<SyncDataCb>,
) -> Result<(), GoliothError> {
    let (tx, rx) = oneshot::channel::<Result<(), GoliothError>>();
    let mut tx = Some(tx);

    let shim: ReqCallback = Box::new(move |rsp| {
        let rsp = match rsp {
            Ok(rsp) => rsp,
            Err(e) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Err(e));
                }
                return Ok(());
            },
        };

        if let Some(data_cb) = data_cb.as_mut()
            && let Err(e) = data_cb(rsp.data, rsp.off, rsp.total)
        {
            if let Some(tx) = tx.take() {
                let _ = tx.send(Err(e));
            }
            return Err(e);
        }

        if let Some(get_next) = rsp.get_next {
            get_next.request_next();
            return Ok(());
        }

        if let Some(tx) = tx.take() {
            let _ = tx.send(Ok(()));
        }

        Ok(())
    });

    req_cb(client, method, pathv, format, data, flags, shim)?;

    match rx.await {
        Ok(result) => result,
        // The request record was dropped without a terminal callback; only
        // possible when the client itself is torn down.
        Err(_) => Err(GoliothError::Shutdown),
    }
}
