// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use crate::{
    client::{
        client::Client,
        error::GoliothError,
        req::{ReqCallback, ReqFlags, req_cb, req_sync},
    },
    coap::{ContentFormat, packet::Method},
};

/// Path prefix of the LightDB Stream service.
pub const STREAM_PATH: &str = ".s";

/// Appends `data` to the stream under `path`, reporting the acknowledgment
/// to `cb`.
pub fn push_cb(
    client: &Arc<Client>,
    path: &str,
    format: ContentFormat,
    data: &[u8],
    cb: ReqCallback,
) -> Result<(), GoliothError> {
    req_cb(
        client,
        Method::Post,
        &[STREAM_PATH, path],
        format,
        data,
        ReqFlags::NO_RESP_BODY,
        cb,
    )
}

/// Appends `data` to the stream under `path` and waits for the
/// acknowledgment.
pub async fn push(
    client: &Arc<Client>,
    path: &str,
    format: ContentFormat,
    data: &[u8],
) -> Result<(), GoliothError> {
    req_sync(
        client,
        Method::Post,
        &[STREAM_PATH, path],
        format,
        data,
        ReqFlags::NO_RESP_BODY,
        None,
    )
    .await
}
