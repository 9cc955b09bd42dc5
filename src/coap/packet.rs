// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, ops::Range};

use anyhow::{Result, bail};
use bytes::Bytes;

use crate::coap::{BASIC_HEADER_LEN, COAP_VERSION, PAYLOAD_MARKER, TOKEN_MAX_LEN};

/// CoAP message type, bits 4-5 of the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Con = 0,
    Non = 1,
    Ack = 2,
    Reset = 3,
}

impl MsgType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => MsgType::Con,
            1 => MsgType::Non,
            2 => MsgType::Ack,
            _ => MsgType::Reset,
        }
    }
}

/// CoAP code: 3-bit class and 5-bit detail, printed as `c.dd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);

    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    pub const DELETE: Code = Code(0x04);

    pub const CONTENT: Code = Code(0x45);
    pub const BAD_REQUEST: Code = Code(0x80);
    pub const NOT_FOUND: Code = Code(0x84);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1f))
    }

    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    pub const fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    pub const fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// Request method of a CoAP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn code(self) -> Code {
        match self {
            Method::Get => Code::GET,
            Method::Post => Code::POST,
            Method::Put => Code::PUT,
            Method::Delete => Code::DELETE,
        }
    }
}

/// IANA content format codes used by the Golioth services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    Text = 0,
    OctetStream = 42,
    Json = 50,
    Cbor = 60,
}

impl ContentFormat {
    pub fn value(self) -> u32 {
        self as u32
    }
}

/// Byte-length snapshot of a [`Packet`] under construction, taken before an
/// option is appended so the packet can later be rolled back to this state.
#[derive(Debug, Clone, Copy)]
pub struct PacketSnapshot {
    len: usize,
    last_option: u16,
}

/// An outgoing CoAP message under construction.
///
/// Options must be appended in non-decreasing option-number order; the
/// encoder tracks the running delta. The encoded bytes are owned by the
/// packet, so a pending request keeps its own retransmission buffer.
#[derive(Debug)]
pub struct Packet {
    buf: Vec<u8>,
    last_option: u16,
    has_payload: bool,
}

fn split_option_field(value: u16) -> (u8, Option<Vec<u8>>) {
    match value {
        0..=12 => (value as u8, None),
        13..=268 => (13, Some(vec![(value - 13) as u8])),
        _ => (14, Some((value - 269).to_be_bytes().to_vec())),
    }
}

impl Packet {
    /// Starts a new message with the given type, token, code and message id.
    pub fn new(msg_type: MsgType, token: &[u8], code: Code, id: u16) -> Result<Self> {
        if token.len() > TOKEN_MAX_LEN {
            bail!("token too long: {}", token.len());
        }

        let mut buf = Vec::with_capacity(BASIC_HEADER_LEN + token.len());
        buf.push((COAP_VERSION << 6) | ((msg_type as u8) << 4) | token.len() as u8);
        buf.push(code.0);
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(token);

        Ok(Self {
            buf,
            last_option: 0,
            has_payload: false,
        })
    }

    /// Empty ACK acknowledging a received confirmable message.
    pub fn ack_for(rx: &ParsedPacket) -> Self {
        // Infallible: empty token always fits.
        let mut buf = Vec::with_capacity(BASIC_HEADER_LEN);
        buf.push((COAP_VERSION << 6) | ((MsgType::Ack as u8) << 4));
        buf.push(Code::EMPTY.0);
        buf.extend_from_slice(&rx.id().to_be_bytes());
        Self {
            buf,
            last_option: 0,
            has_payload: false,
        }
    }

    /// Empty RST rejecting (or, for a ping, answering) a received message.
    pub fn reset_for(rx: &ParsedPacket) -> Self {
        let mut buf = Vec::with_capacity(BASIC_HEADER_LEN);
        buf.push((COAP_VERSION << 6) | ((MsgType::Reset as u8) << 4));
        buf.push(Code::EMPTY.0);
        buf.extend_from_slice(&rx.id().to_be_bytes());
        Self {
            buf,
            last_option: 0,
            has_payload: false,
        }
    }

    /// Grows the encode buffer ahead of time; the estimate usually comes
    /// from [`crate::coap::pathv::estimate_alloc_len`].
    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }

    pub fn msg_type(&self) -> MsgType {
        MsgType::from_bits((self.buf[0] & 0x30) >> 4)
    }

    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    /// Rewrites the message id in place. Used for retransmission-free id
    /// reassignment on blockwise continuations.
    pub fn set_id(&mut self, id: u16) {
        self.buf[2..4].copy_from_slice(&id.to_be_bytes());
    }

    pub fn token(&self) -> &[u8] {
        let tkl = (self.buf[0] & 0x0f) as usize;
        &self.buf[BASIC_HEADER_LEN..BASIC_HEADER_LEN + tkl]
    }

    /// Appends one option. `number` must not be smaller than the last
    /// appended option number and no payload may have been appended yet.
    pub fn append_option(&mut self, number: u16, value: &[u8]) -> Result<()> {
        if self.has_payload {
            bail!("cannot append option {number} after payload");
        }
        if number < self.last_option {
            bail!(
                "option {number} out of order (last appended {})",
                self.last_option
            );
        }

        let delta = number - self.last_option;
        let (delta_nibble, delta_ext) = split_option_field(delta);
        let (len_nibble, len_ext) = split_option_field(value.len() as u16);

        self.buf.push((delta_nibble << 4) | len_nibble);
        if let Some(ext) = delta_ext {
            self.buf.extend_from_slice(&ext);
        }
        if let Some(ext) = len_ext {
            self.buf.extend_from_slice(&ext);
        }
        self.buf.extend_from_slice(value);

        self.last_option = number;

        Ok(())
    }

    /// Appends an unsigned-integer option in the minimal big-endian
    /// encoding (a zero value encodes as an empty option).
    pub fn append_option_uint(&mut self, number: u16, value: u32) -> Result<()> {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        self.append_option(number, &bytes[skip..])
    }

    /// Appends the payload marker followed by `data`.
    pub fn append_payload(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            bail!("payload must not be empty");
        }
        if !self.has_payload {
            self.buf.push(PAYLOAD_MARKER);
            self.has_payload = true;
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Remembers the current encoder state, so later appended options can be
    /// rolled back with [`Packet::restore`].
    pub fn snapshot(&self) -> PacketSnapshot {
        PacketSnapshot {
            len: self.buf.len(),
            last_option: self.last_option,
        }
    }

    /// Rolls the packet back to a previously taken snapshot.
    pub fn restore(&mut self, snap: PacketSnapshot) {
        self.buf.truncate(snap.len);
        self.last_option = snap.last_option;
        self.has_payload = false;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Copies the encoded message into a [`Bytes`] for transmission.
    pub fn to_datagram(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }
}

/// A received CoAP message, parsed into header fields, an option index and
/// a payload range over the original datagram bytes.
#[derive(Debug)]
pub struct ParsedPacket {
    data: Bytes,
    msg_type: MsgType,
    code: Code,
    id: u16,
    token_len: usize,
    options: Vec<(u16, Range<usize>)>,
    payload_off: usize,
}

fn read_option_field(nibble: u8, data: &[u8], pos: &mut usize) -> Result<u16> {
    match nibble {
        0..=12 => Ok(nibble as u16),
        13 => {
            let Some(b) = data.get(*pos) else {
                bail!("truncated option extended field");
            };
            *pos += 1;
            Ok(*b as u16 + 13)
        },
        14 => {
            let Some(b) = data.get(*pos..*pos + 2) else {
                bail!("truncated option extended field");
            };
            *pos += 2;
            Ok(u16::from_be_bytes([b[0], b[1]]) + 269)
        },
        _ => bail!("reserved option nibble 15"),
    }
}

impl ParsedPacket {
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < BASIC_HEADER_LEN {
            bail!("message shorter than CoAP basic header: {}", data.len());
        }

        let version = data[0] >> 6;
        if version != COAP_VERSION {
            bail!("unsupported CoAP version {version}");
        }

        let msg_type = MsgType::from_bits((data[0] & 0x30) >> 4);
        let token_len = (data[0] & 0x0f) as usize;
        if token_len > TOKEN_MAX_LEN {
            bail!("reserved token length {token_len}");
        }

        let code = Code(data[1]);
        let id = u16::from_be_bytes([data[2], data[3]]);

        let mut pos = BASIC_HEADER_LEN + token_len;
        if pos > data.len() {
            bail!("token truncated");
        }

        let mut options = Vec::new();
        let mut option_number: u16 = 0;
        let mut payload_off = data.len();

        while pos < data.len() {
            let byte = data[pos];
            pos += 1;

            if byte == PAYLOAD_MARKER {
                if pos == data.len() {
                    bail!("payload marker not followed by payload");
                }
                payload_off = pos;
                break;
            }

            let delta = read_option_field(byte >> 4, &data, &mut pos)?;
            let len = read_option_field(byte & 0x0f, &data, &mut pos)? as usize;

            if pos + len > data.len() {
                bail!("option value truncated");
            }

            option_number += delta;
            options.push((option_number, pos..pos + len));
            pos += len;
        }

        Ok(Self {
            data,
            msg_type,
            code,
            id,
            token_len,
            options,
            payload_off,
        })
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn token(&self) -> &[u8] {
        &self.data[BASIC_HEADER_LEN..BASIC_HEADER_LEN + self.token_len]
    }

    /// First occurrence of the given option, if present.
    pub fn option(&self, number: u16) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(num, _)| *num == number)
            .map(|(_, range)| &self.data[range.clone()])
    }

    /// All occurrences of the given option, in order.
    pub fn options(&self, number: u16) -> Vec<&[u8]> {
        self.options
            .iter()
            .filter(|(num, _)| *num == number)
            .map(|(_, range)| &self.data[range.clone()])
            .collect()
    }

    /// First occurrence of the given option decoded as an unsigned integer.
    /// Returns `None` when the option is absent or wider than 4 bytes.
    pub fn option_uint(&self, number: u16) -> Option<u32> {
        let value = self.option(number)?;
        if value.len() > 4 {
            return None;
        }
        Some(
            value
                .iter()
                .fold(0u32, |acc, byte| (acc << 8) | *byte as u32),
        )
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_off..]
    }
}
