// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Golioth cloud services built on top of the CoAP request engine.

/// CBOR value helpers shared by the CBOR-speaking services.
pub mod cbor;
/// Firmware desired-image observer and state reporting.
pub mod fw;
/// LightDB State key/value store.
pub mod lightdb;
/// Device log forwarding to the cloud.
pub mod logs;
/// Remote procedure calls.
pub mod rpc;
/// Remotely pushed device settings.
pub mod settings;
/// LightDB Stream telemetry.
pub mod stream;

use tracing::{debug, error};

use crate::client::req::ReqCallback;

/// Callback for requests whose response only needs to be logged (status
/// POSTs, fire-and-forget sets).
pub(crate) fn default_rsp_handler(label: &'static str) -> ReqCallback {
    Box::new(move |rsp| {
        match rsp {
            Err(e) => error!("Error response ({label}): {e}"),
            Ok(view) => debug!("({label}): {} bytes", view.data.len()),
        }
        Ok(())
    })
}
