// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Firmware update plumbing: desired-image observation, image download and
//! lifecycle state reporting. Flash handling and the update itself live in
//! the application.

use std::sync::Arc;

use ciborium::Value;
use tracing::{debug, error};

use crate::{
    client::{
        client::Client,
        error::GoliothError,
        req::{ReqCallback, ReqFlags, SyncDataCb, req_cb, req_sync},
    },
    coap::{ContentFormat, packet::Method},
    services::cbor,
};

pub const FW_DESIRED_PATH: &str = ".u/desired";
pub const FW_REPORT_STATE_PATH: &str = ".u/c";

const MANIFEST_KEY_SEQUENCE_NUMBER: u64 = 1;
const MANIFEST_KEY_COMPONENTS: u64 = 3;

const COMPONENT_KEY_VERSION: u64 = 2;
const COMPONENT_KEY_URI: u64 = 5;

/// Firmware lifecycle state reported to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwState {
    Idle = 0,
    Downloading = 1,
    Downloaded = 2,
    Updating = 3,
}

/// Result of downloading or updating the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuResult {
    Initial = 0,
    FirmwareUpdatedSuccessfully = 1,
    NotEnoughFlashMemory = 2,
    OutOfRam = 3,
    ConnectionLost = 4,
    IntegrityCheckFailure = 5,
    UnsupportedPackageType = 6,
    InvalidUri = 7,
    FirmwareUpdateFailed = 8,
    UnsupportedProtocol = 9,
}

/// Desired image description, extracted from the first manifest component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredManifest {
    pub sequence_number: i64,
    pub version: String,
    pub uri: String,
}

/// Parses a desired-image manifest payload.
pub fn desired_parse(payload: &[u8]) -> Result<DesiredManifest, GoliothError> {
    let decoded = cbor::decode(payload)?;
    let Some(manifest) = decoded.as_map() else {
        return Err(GoliothError::BadMessage);
    };

    let Some(sequence_number) =
        cbor::map_get_int(manifest, MANIFEST_KEY_SEQUENCE_NUMBER).and_then(cbor::as_i64)
    else {
        return Err(GoliothError::BadMessage);
    };

    let Some(component) = cbor::map_get_int(manifest, MANIFEST_KEY_COMPONENTS)
        .and_then(Value::as_array)
        .and_then(|components| components.first())
        .and_then(Value::as_map)
    else {
        return Err(GoliothError::BadMessage);
    };

    let (Some(version), Some(uri)) = (
        cbor::map_get_int(component, COMPONENT_KEY_VERSION).and_then(Value::as_text),
        cbor::map_get_int(component, COMPONENT_KEY_URI).and_then(Value::as_text),
    ) else {
        return Err(GoliothError::BadMessage);
    };

    Ok(DesiredManifest {
        sequence_number,
        version: version.to_string(),
        uri: uri.to_string(),
    })
}

/// Callback invoked with each accepted desired-image notification.
pub type DesiredCb = Box<dyn FnMut(Result<DesiredManifest, GoliothError>) + Send>;

/// Establishes the `.u/desired` observation. Call from `on_connect`.
///
/// Unparseable notifications (including the registration echo) are logged
/// and skipped; observation errors are forwarded.
pub fn observe_desired(client: &Arc<Client>, mut cb: DesiredCb) -> Result<(), GoliothError> {
    req_cb(
        client,
        Method::Get,
        &[FW_DESIRED_PATH],
        ContentFormat::Cbor,
        &[],
        ReqFlags::OBSERVE,
        Box::new(move |rsp| {
            match rsp {
                Err(e) => {
                    error!("Error on desired-image observation: {e}");
                    cb(Err(e));
                },
                Ok(view) => match desired_parse(view.data) {
                    Ok(manifest) => cb(Ok(manifest)),
                    Err(e) => debug!("Ignoring undecodable desired manifest: {e}"),
                },
            }
            Ok(())
        }),
    )
}

/// Blockwise GET of a firmware image by its manifest URI; `data_cb`
/// receives each block in offset order.
pub async fn download(
    client: &Arc<Client>,
    uri: &str,
    data_cb: SyncDataCb,
) -> Result<(), GoliothError> {
    req_sync(
        client,
        Method::Get,
        &[uri],
        ContentFormat::OctetStream,
        &[],
        ReqFlags::NO_RESP_BODY,
        Some(data_cb),
    )
    .await
}

fn report_state_encode(
    state: FwState,
    result: DfuResult,
    current_version: Option<&str>,
    target_version: Option<&str>,
) -> Result<Vec<u8>, GoliothError> {
    let mut report = vec![
        (
            Value::Text("s".to_string()),
            Value::Integer((state as u64).into()),
        ),
        (
            Value::Text("r".to_string()),
            Value::Integer((result as u64).into()),
        ),
    ];

    if let Some(version) = current_version.filter(|version| !version.is_empty()) {
        report.push((
            Value::Text("v".to_string()),
            Value::Text(version.to_string()),
        ));
    }

    if let Some(version) = target_version.filter(|version| !version.is_empty()) {
        report.push((
            Value::Text("t".to_string()),
            Value::Text(version.to_string()),
        ));
    }

    cbor::encode(&Value::Map(report))
}

/// Reports firmware lifecycle state for `package_name`, invoking `cb` with
/// the acknowledgment.
#[allow(clippy::too_many_arguments)]
pub fn report_state_cb(
    client: &Arc<Client>,
    package_name: &str,
    current_version: Option<&str>,
    target_version: Option<&str>,
    state: FwState,
    result: DfuResult,
    cb: ReqCallback,
) -> Result<(), GoliothError> {
    let body = report_state_encode(state, result, current_version, target_version)?;

    req_cb(
        client,
        Method::Post,
        &[FW_REPORT_STATE_PATH, package_name],
        ContentFormat::Cbor,
        &body,
        ReqFlags::empty(),
        cb,
    )
}

/// Reports firmware lifecycle state and waits for the acknowledgment.
pub async fn report_state(
    client: &Arc<Client>,
    package_name: &str,
    current_version: Option<&str>,
    target_version: Option<&str>,
    state: FwState,
    result: DfuResult,
) -> Result<(), GoliothError> {
    let body = report_state_encode(state, result, current_version, target_version)?;

    req_sync(
        client,
        Method::Post,
        &[FW_REPORT_STATE_PATH, package_name],
        ContentFormat::Cbor,
        &body,
        ReqFlags::empty(),
        None,
    )
    .await
}
