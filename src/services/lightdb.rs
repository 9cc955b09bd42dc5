// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex};

use ciborium::Value;

use crate::{
    client::{
        client::Client,
        error::GoliothError,
        req::{ReqCallback, ReqFlags, SyncDataCb, req_cb, req_sync},
    },
    coap::{ContentFormat, packet::Method},
    services::{cbor, default_rsp_handler},
};

/// Path prefix of the LightDB State service.
pub const LIGHTDB_PATH: &str = ".d";

/// GET the value stored under `path`, delivering the response (blockwise
/// responses block by block) to `cb`.
pub fn get_cb(
    client: &Arc<Client>,
    path: &str,
    format: ContentFormat,
    cb: ReqCallback,
) -> Result<(), GoliothError> {
    req_cb(
        client,
        Method::Get,
        &[LIGHTDB_PATH, path],
        format,
        &[],
        ReqFlags::empty(),
        cb,
    )
}

/// GET the value stored under `path` and return the reassembled body.
pub async fn get(
    client: &Arc<Client>,
    path: &str,
    format: ContentFormat,
) -> Result<Vec<u8>, GoliothError> {
    let body = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&body);

    req_sync(
        client,
        Method::Get,
        &[LIGHTDB_PATH, path],
        format,
        &[],
        ReqFlags::empty(),
        Some(collect_into(sink)),
    )
    .await?;

    let body = body.lock().expect("lightdb body lock poisoned");
    Ok(body.clone())
}

/// POST `data` to `path`. `no_resp_body` omits the Accept option when only
/// the acknowledgment matters; the server may still answer with a body,
/// which is then ignored.
pub fn set_cb(
    client: &Arc<Client>,
    path: &str,
    format: ContentFormat,
    data: &[u8],
    no_resp_body: bool,
    cb: ReqCallback,
) -> Result<(), GoliothError> {
    let flags = if no_resp_body {
        ReqFlags::NO_RESP_BODY
    } else {
        ReqFlags::empty()
    };

    req_cb(
        client,
        Method::Post,
        &[LIGHTDB_PATH, path],
        format,
        data,
        flags,
        cb,
    )
}

/// POST `data` to `path` and wait for the acknowledgment.
pub async fn set(
    client: &Arc<Client>,
    path: &str,
    format: ContentFormat,
    data: &[u8],
) -> Result<(), GoliothError> {
    req_sync(
        client,
        Method::Post,
        &[LIGHTDB_PATH, path],
        format,
        data,
        ReqFlags::NO_RESP_BODY,
        None,
    )
    .await
}

/// Observe the value stored under `path`; `cb` is invoked for the current
/// value and every accepted change notification.
pub fn observe_cb(
    client: &Arc<Client>,
    path: &str,
    format: ContentFormat,
    cb: ReqCallback,
) -> Result<(), GoliothError> {
    req_cb(
        client,
        Method::Get,
        &[LIGHTDB_PATH, path],
        format,
        &[],
        ReqFlags::OBSERVE,
        cb,
    )
}

/// DELETE the value stored under `path`, reporting the outcome to `cb`.
pub fn delete_cb(
    client: &Arc<Client>,
    path: &str,
    cb: ReqCallback,
) -> Result<(), GoliothError> {
    req_cb(
        client,
        Method::Delete,
        &[LIGHTDB_PATH, path],
        ContentFormat::Text,
        &[],
        ReqFlags::empty(),
        cb,
    )
}

/// DELETE the value stored under `path` and wait for the acknowledgment.
pub async fn delete(client: &Arc<Client>, path: &str) -> Result<(), GoliothError> {
    req_sync(
        client,
        Method::Delete,
        &[LIGHTDB_PATH, path],
        ContentFormat::Text,
        &[],
        ReqFlags::empty(),
        None,
    )
    .await
}

/// Scalar types that can be stored directly through [`set_value`].
pub trait LightDbValue {
    fn to_cbor(&self) -> Value;
}

impl LightDbValue for bool {
    fn to_cbor(&self) -> Value {
        Value::Bool(*self)
    }
}

impl LightDbValue for i64 {
    fn to_cbor(&self) -> Value {
        Value::Integer((*self).into())
    }
}

impl LightDbValue for u64 {
    fn to_cbor(&self) -> Value {
        Value::Integer((*self).into())
    }
}

impl LightDbValue for f32 {
    fn to_cbor(&self) -> Value {
        Value::Float(f64::from(*self))
    }
}

impl LightDbValue for f64 {
    fn to_cbor(&self) -> Value {
        Value::Float(*self)
    }
}

impl LightDbValue for &str {
    fn to_cbor(&self) -> Value {
        Value::Text((*self).to_string())
    }
}

/// CBOR-encodes a single scalar and stores it under `path`.
pub async fn set_value<T: LightDbValue>(
    client: &Arc<Client>,
    path: &str,
    value: &T,
) -> Result<(), GoliothError> {
    let encoded = cbor::encode(&value.to_cbor())?;
    set(client, path, ContentFormat::Cbor, &encoded).await
}

/// Fire-and-forget variant of [`set_value`]; errors are only logged.
pub fn set_value_cb<T: LightDbValue>(
    client: &Arc<Client>,
    path: &str,
    value: &T,
) -> Result<(), GoliothError> {
    let encoded = cbor::encode(&value.to_cbor())?;
    set_cb(
        client,
        path,
        ContentFormat::Cbor,
        &encoded,
        true,
        default_rsp_handler("LightDB set"),
    )
}

/// Accumulates response blocks into a shared buffer, block offsets kept
/// in order by the engine.
pub(crate) fn collect_into(sink: Arc<Mutex<Vec<u8>>>) -> SyncDataCb {
    Box::new(move |data: &[u8], off: usize, _total: usize| {
        let mut body = sink.lock().expect("body lock poisoned");
        body.truncate(off);
        body.extend_from_slice(data);
        Ok(())
    })
}
