// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Remote procedure calls.
//!
//! Request pushed by the cloud on `.rpc`:
//! `{ "id": "...", "method": "...", "params": [...] }`
//!
//! Response POSTed by the device to `.rpc/status`:
//! `{ "id": "...", "statusCode": integer, "detail": {...} }`

use std::sync::{Arc, Mutex};

use ciborium::Value;
use tracing::{debug, error, warn};

use crate::{
    client::{
        client::Client,
        error::GoliothError,
        req::{ReqFlags, req_cb},
    },
    coap::{ContentFormat, packet::Method},
    services::{cbor, default_rsp_handler},
};

pub const RPC_PATH: &str = ".rpc";
pub const RPC_STATUS_PATH: &str = ".rpc/status";

/// RPC status codes carried in the `statusCode` response field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    Ok = 0,
    Canceled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

/// Typed cursor over the decoded `params` array of an RPC request.
pub struct ParamsReader<'a> {
    iter: std::slice::Iter<'a, Value>,
}

impl<'a> ParamsReader<'a> {
    pub fn new(params: &'a [Value]) -> Self {
        Self {
            iter: params.iter(),
        }
    }

    pub fn next_value(&mut self) -> Option<&'a Value> {
        self.iter.next()
    }

    /// Next parameter as f64; integers are widened.
    pub fn next_f64(&mut self) -> Option<f64> {
        match self.iter.next()? {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => i64::try_from(*i).ok().map(|i| i as f64),
            _ => None,
        }
    }

    pub fn next_i64(&mut self) -> Option<i64> {
        self.iter.next().and_then(cbor::as_i64)
    }

    pub fn next_bool(&mut self) -> Option<bool> {
        self.iter.next().and_then(Value::as_bool)
    }

    pub fn next_str(&mut self) -> Option<&'a str> {
        self.iter.next().and_then(Value::as_text)
    }
}

/// Typed writer building the `detail` map of an RPC response.
#[derive(Default)]
pub struct DetailWriter {
    entries: Vec<(Value, Value)>,
}

impl DetailWriter {
    pub fn put_f64(&mut self, key: &str, value: f64) {
        self.put_value(key, Value::Float(value));
    }

    pub fn put_i64(&mut self, key: &str, value: i64) {
        self.put_value(key, Value::Integer(value.into()));
    }

    pub fn put_bool(&mut self, key: &str, value: bool) {
        self.put_value(key, Value::Bool(value));
    }

    pub fn put_str(&mut self, key: &str, value: &str) {
        self.put_value(key, Value::Text(value.to_string()));
    }

    pub fn put_value(&mut self, key: &str, value: Value) {
        self.entries.push((Value::Text(key.to_string()), value));
    }

    pub fn into_map(self) -> Value {
        Value::Map(self.entries)
    }
}

/// Handler of one registered method. Reads its parameters from the params
/// cursor and writes response fields into the detail map.
pub type RpcHandler =
    Box<dyn Fn(&mut ParamsReader<'_>, &mut DetailWriter) -> RpcStatus + Send + Sync>;

struct RpcMethod {
    name: String,
    handler: RpcHandler,
}

/// Bounded, mutex-guarded table of registered methods.
pub(crate) struct RpcRegistry {
    methods: Mutex<Vec<RpcMethod>>,
    capacity: usize,
}

impl RpcRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            methods: Mutex::new(Vec::new()),
            capacity,
        }
    }
}

/// Registers `name` so the cloud can invoke it. Fails with `NoSpace` once
/// `rpc_max_methods` methods are registered.
pub fn register(
    client: &Client,
    name: &str,
    handler: RpcHandler,
) -> Result<(), GoliothError> {
    let mut methods = client
        .rpc
        .methods
        .lock()
        .expect("rpc registry lock poisoned");

    if methods.len() >= client.rpc.capacity {
        error!(
            "Unable to register, can't register more than {} methods",
            client.rpc.capacity
        );
        return Err(GoliothError::NoSpace);
    }

    methods.push(RpcMethod {
        name: name.to_string(),
        handler,
    });

    Ok(())
}

/// Establishes the `.rpc` observation. Call from `on_connect` to (re)arm
/// RPC delivery.
pub fn observe(client: &Arc<Client>) -> Result<(), GoliothError> {
    let weak = Arc::downgrade(client);

    req_cb(
        client,
        Method::Get,
        &[RPC_PATH],
        ContentFormat::Cbor,
        &[],
        ReqFlags::OBSERVE,
        Box::new(move |rsp| {
            let Some(client) = weak.upgrade() else {
                return Ok(());
            };

            match rsp {
                Err(e) => {
                    error!("Error on RPC observation: {e}");
                    Err(e)
                },
                Ok(view) => {
                    // A malformed push must not cancel the observation.
                    if let Err(e) = on_rpc(&client, view.data) {
                        warn!("Failed to handle RPC request: {e}");
                    }
                    Ok(())
                },
            }
        }),
    )
}

fn on_rpc(client: &Arc<Client>, payload: &[u8]) -> Result<(), GoliothError> {
    if payload.len() == 3 && payload[1] == b'O' && payload[2] == b'K' {
        // Ignore "OK" response received after observing.
        return Ok(());
    }

    let decoded = cbor::decode(payload)?;
    let Some(request) = decoded.as_map() else {
        warn!("RPC request is not a CBOR map");
        return Err(GoliothError::BadMessage);
    };

    let (Some(id), Some(method), Some(params)) = (
        cbor::map_get(request, "id").and_then(Value::as_text),
        cbor::map_get(request, "method").and_then(Value::as_text),
        cbor::map_get(request, "params").and_then(Value::as_array),
    ) else {
        warn!("Failed to parse RPC request map");
        return Err(GoliothError::BadMessage);
    };

    let mut detail = DetailWriter::default();

    let (status_code, known_method) = {
        let methods = client
            .rpc
            .methods
            .lock()
            .expect("rpc registry lock poisoned");

        match methods.iter().find(|m| m.name == method) {
            Some(m) => {
                debug!("Calling registered RPC method: {}", m.name);
                let mut reader = ParamsReader::new(params);
                ((m.handler)(&mut reader, &mut detail), true)
            },
            None => (RpcStatus::Unknown, false),
        }
    };

    let mut response = vec![
        (
            Value::Text("id".to_string()),
            Value::Text(id.to_string()),
        ),
        (
            Value::Text("statusCode".to_string()),
            Value::Integer((status_code as u64).into()),
        ),
    ];

    if known_method {
        response.push((Value::Text("detail".to_string()), detail.into_map()));
    }

    let body = cbor::encode(&Value::Map(response))?;

    send_response(client, &body)
}

fn send_response(client: &Arc<Client>, body: &[u8]) -> Result<(), GoliothError> {
    req_cb(
        client,
        Method::Post,
        &[RPC_STATUS_PATH],
        ContentFormat::Cbor,
        body,
        ReqFlags::NO_RESP_BODY,
        default_rsp_handler("RPC response ACK"),
    )
}
