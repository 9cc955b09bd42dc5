// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use ciborium::Value;
use tracing::warn;

use crate::client::error::GoliothError;

/// Decodes a CBOR payload into a value tree.
pub fn decode(payload: &[u8]) -> Result<Value, GoliothError> {
    ciborium::de::from_reader(payload).map_err(|e| {
        warn!("Failed to decode CBOR payload: {e}");
        GoliothError::BadMessage
    })
}

/// Encodes a value tree into CBOR bytes.
pub fn encode(value: &Value) -> Result<Vec<u8>, GoliothError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| {
        warn!("Failed to encode CBOR payload: {e}");
        GoliothError::BadMessage
    })?;
    Ok(buf)
}

/// Looks up a text key in a CBOR map.
pub fn map_get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

/// Looks up an integer key in a CBOR map (used by the firmware manifest).
pub fn map_get_int<'a>(map: &'a [(Value, Value)], key: u64) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_integer() == Some(key.into()))
        .map(|(_, v)| v)
}

/// Integer value coerced to i64, if it fits.
pub fn as_i64(value: &Value) -> Option<i64> {
    value.as_integer().and_then(|i| i64::try_from(i).ok())
}
