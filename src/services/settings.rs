// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Remotely pushed device settings.
//!
//! Settings request pushed by the cloud on `.c`:
//! `{ "settings": { "KEY": value, ... }, "version": 1652109801583 }`
//!
//! Status response POSTed by the device to `.c/status`:
//! `{ "errors": [ { "setting_key": "...", "error_code": integer }, ... ],
//!    "version": 1652109801583 }`
//! with `errors` omitted when every setting applied cleanly.

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

pub const SETTINGS_PATH: &str = ".c";
pub const SETTINGS_STATUS_PATH: &str = ".c/status";

/// Longest accepted setting key, not counting the terminator of the wire
/// representation.
pub const SETTINGS_MAX_NAME_LEN: usize = 63;

/// Per-key status reported back to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsStatus {
    Success = 0,
    KeyNotRecognized = 1,
    KeyNotValid = 2,
    ValueFormatNotValid = 3,
    ValueOutsideRange = 4,
    ValueStringTooLong = 5,
    GeneralError = 6,
}

/// One decoded setting value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingsValue<'a> {
    Bool(bool),
    Float(f32),
    Int64(i64),
    String(&'a str),
}

/// Callback applying one setting; returns the per-key status.
pub type SettingsCallback =
    Box<dyn Fn(&str, &SettingsValue<'_>) -> SettingsStatus + Send + Sync>;

/// Settings side state stored in the client.
pub(crate) struct SettingsState {
    callback: Mutex<Option<Arc<SettingsCallback>>>,
}

impl Default for SettingsState {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsState {
    pub(crate) fn new() -> Self {
        Self {
            callback: Mutex::new(None),
        }
    }
}

/// Registers the settings callback.
///
/// One-time registration: a second call (e.g. from a reconnect path) keeps
/// the first callback.
pub fn register_callback(client: &Client, callback: SettingsCallback) {
    let mut slot = client
        .settings
        .callback
        .lock()
        .expect("settings callback lock poisoned");

    if slot.is_none() {
        *slot = Some(Arc::new(callback));
    }
}

/// Establishes the `.c` observation. Call from `on_connect`.
pub fn observe(client: &Arc<Client>) -> Result<(), GoliothError> {
    let weak = Arc::downgrade(client);

    req_cb(
        client,
        Method::Get,
        &[SETTINGS_PATH],
        ContentFormat::Cbor,
        &[],
        ReqFlags::OBSERVE,
        Box::new(move |rsp| {
            let Some(client) = weak.upgrade() else {
                return Ok(());
            };

            match rsp {
                Err(e) => {
                    error!("Error on Settings observation: {e}");
                    Err(e)
                },
                Ok(view) => {
                    // A malformed push must not cancel the observation.
                    if let Err(e) = on_settings(&client, view.data) {
                        warn!("Failed to handle settings push: {e}");
                    }
                    Ok(())
                },
            }
        }),
    )
}

/// Clamps a key to [`SETTINGS_MAX_NAME_LEN`] bytes on a character boundary.
fn clamp_key(key: &str) -> &str {
    if key.len() <= SETTINGS_MAX_NAME_LEN {
        return key;
    }

    let mut end = SETTINGS_MAX_NAME_LEN;
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    &key[..end]
}

fn decode_value(value: &Value) -> Option<SettingsValue<'_>> {
    match value {
        Value::Text(s) => Some(SettingsValue::String(s)),
        Value::Integer(_) => cbor::as_i64(value).map(SettingsValue::Int64),
        Value::Float(f) => Some(SettingsValue::Float(*f as f32)),
        Value::Bool(b) => Some(SettingsValue::Bool(*b)),
        _ => None,
    }
}

fn on_settings(client: &Arc<Client>, payload: &[u8]) -> Result<(), GoliothError> {
    if payload.len() == 3 && payload[1] == b'O' && payload[2] == b'K' {
        // Ignore "OK" response received after observing.
        return Ok(());
    }

    let callback = {
        let slot = client
            .settings
            .callback
            .lock()
            .expect("settings callback lock poisoned");
        slot.clone()
    };

    let Some(callback) = callback else {
        warn!("Settings received but no callback registered");
        return Ok(());
    };

    let decoded = cbor::decode(payload)?;
    let Some(request) = decoded.as_map() else {
        warn!("Settings request is not a CBOR map");
        return Err(GoliothError::BadMessage);
    };

    let (Some(settings), Some(version)) = (
        cbor::map_get(request, "settings").and_then(Value::as_map),
        cbor::map_get(request, "version").and_then(cbor::as_i64),
    ) else {
        warn!("Failed to parse settings request map");
        return Err(GoliothError::BadMessage);
    };

    let mut errors: Vec<(Value, Value)> = Vec::new();
    let mut push_error = |key: &str, code: SettingsStatus| {
        errors.push((
            Value::Text(key.to_string()),
            Value::Integer((code as u64).into()),
        ));
    };

    for (key, value) in settings {
        let Some(key) = key.as_text() else {
            warn!("Setting key is not a text string");
            return Err(GoliothError::BadMessage);
        };
        let key = clamp_key(key);

        match decode_value(value) {
            Some(value) => {
                debug!("key = {key}, value = {value:?}");

                let status = (*callback)(key, &value);
                if status != SettingsStatus::Success {
                    push_error(key, status);
                }
            },
            None => {
                error!("Unrecognized data type for key {key}");
                push_error(key, SettingsStatus::ValueFormatNotValid);
            },
        }
    }

    let mut response: Vec<(Value, Value)> = Vec::new();

    if !errors.is_empty() {
        let entries = errors
            .into_iter()
            .map(|(key, code)| {
                Value::Map(vec![
                    (Value::Text("setting_key".to_string()), key),
                    (Value::Text("error_code".to_string()), code),
                ])
            })
            .collect();
        response.push((
            Value::Text("errors".to_string()),
            Value::Array(entries),
        ));
    }

    response.push((
        Value::Text("version".to_string()),
        Value::Integer(version.into()),
    ));

    let body = cbor::encode(&Value::Map(response))?;

    if body.len() > client.cfg.settings_max_response_len {
        warn!(
            "Settings response too large ({} > {}), dropping",
            body.len(),
            client.cfg.settings_max_response_len
        );
        return Ok(());
    }

    send_response(client, &body)
}

fn send_response(client: &Arc<Client>, body: &[u8]) -> Result<(), GoliothError> {
    req_cb(
        client,
        Method::Post,
        &[SETTINGS_STATUS_PATH],
        ContentFormat::Cbor,
        body,
        ReqFlags::NO_RESP_BODY,
        default_rsp_handler("Settings response ACK"),
    )
}
