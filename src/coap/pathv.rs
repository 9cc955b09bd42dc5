// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;

use crate::coap::{OPTION_URI_PATH, Packet};

/// Appends one logical path segment as Uri-Path options.
///
/// A segment containing `/` is split at every `/` and each non-empty piece
/// becomes its own option; a leading `/` is stripped.
pub fn append_uri_path(packet: &mut Packet, segment: &str) -> Result<()> {
    for piece in segment.split('/') {
        if piece.is_empty() {
            continue;
        }
        packet.append_option(OPTION_URI_PATH, piece.as_bytes())?;
    }

    Ok(())
}

/// Appends every segment of a path vector as Uri-Path options.
pub fn append_uri_pathv(packet: &mut Packet, pathv: &[&str]) -> Result<()> {
    for segment in pathv {
        append_uri_path(packet, segment)?;
    }

    Ok(())
}

/// Upper bound for the encoded length of a path vector.
///
/// The worst case is segments of 13 characters, which take 1 byte of delta
/// and 1 byte of length each (see RFC 7252 "3.1 Option Format"). A `/`
/// inside a segment already counts 1 byte towards the bound, so an extra
/// byte per 13 characters plus one per segment is always enough.
pub fn estimate_alloc_len(pathv: &[&str]) -> usize {
    pathv
        .iter()
        .map(|segment| segment.len() + segment.len() / 13 + 1)
        .sum()
}
