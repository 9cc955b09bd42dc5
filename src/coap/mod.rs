// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Block2 transfer state tracking.
pub mod block;
/// CoAP message building and parsing.
pub mod packet;
/// Uri-Path encoding from logical path vectors.
pub mod pathv;

use anyhow::{Result, bail};

pub use crate::coap::packet::{Code, ContentFormat, MsgType, Packet, ParsedPacket};

/// CoAP version carried in every message header.
pub const COAP_VERSION: u8 = 1;
/// Fixed header length; the shortest parseable message.
pub const BASIC_HEADER_LEN: usize = 4;
/// Maximum token length; lengths 9-15 are reserved by RFC 7252.
pub const TOKEN_MAX_LEN: usize = 8;
/// Byte separating options from payload.
pub const PAYLOAD_MARKER: u8 = 0xff;

pub const OPTION_OBSERVE: u16 = 6;
pub const OPTION_URI_PATH: u16 = 11;
pub const OPTION_CONTENT_FORMAT: u16 = 12;
pub const OPTION_ACCEPT: u16 = 17;
pub const OPTION_BLOCK2: u16 = 23;
pub const OPTION_SIZE2: u16 = 28;

/// Coarse classification of a received datagram, done on the raw bytes
/// before a full parse is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxKind {
    /// Empty CON with token length 0 and code 0.00, i.e. a CoAP ping.
    Ping,
    /// Anything else that at least has a valid basic header.
    Data,
}

/// Checks the raw header of an incoming datagram.
///
/// Rejects messages shorter than the basic header and reserved token
/// lengths, and recognizes the empty-CON ping that must be answered with an
/// empty RST instead of being dispatched.
pub fn check_rx_packet_type(data: &[u8]) -> Result<RxKind> {
    if data.len() < BASIC_HEADER_LEN {
        bail!("message shorter than CoAP basic header: {}", data.len());
    }

    let tkl = data[0] & 0x0f;
    if tkl as usize > TOKEN_MAX_LEN {
        bail!("reserved token length {tkl}");
    }

    let msg_type = (data[0] & 0x30) >> 4;
    let code = data[1];

    if tkl == 0
        && data.len() == BASIC_HEADER_LEN
        && msg_type == MsgType::Con as u8
        && code == Code::EMPTY.0
    {
        return Ok(RxKind::Ping);
    }

    Ok(RxKind::Data)
}
