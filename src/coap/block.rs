// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};

use crate::coap::{OPTION_BLOCK2, OPTION_SIZE2, Packet, ParsedPacket};

/// CoAP block sizes as the SZX exponent of RFC 7959.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockSize {
    B16 = 0,
    B32 = 1,
    B64 = 2,
    B128 = 3,
    B256 = 4,
    B512 = 5,
    B1024 = 6,
}

impl BlockSize {
    pub fn bytes(self) -> usize {
        16usize << (self as usize)
    }

    pub fn szx(self) -> u32 {
        self as u32
    }

    pub fn from_szx(szx: u32) -> Option<Self> {
        match szx {
            0 => Some(BlockSize::B16),
            1 => Some(BlockSize::B32),
            2 => Some(BlockSize::B64),
            3 => Some(BlockSize::B128),
            4 => Some(BlockSize::B256),
            5 => Some(BlockSize::B512),
            6 => Some(BlockSize::B1024),
            _ => None,
        }
    }

    /// Largest block size whose payload fits into a buffer of `len` bytes.
    pub fn max_for_buffer(len: usize) -> Self {
        let mut size = BlockSize::B16;
        let mut len = len / 16;

        while len > 1 && size < BlockSize::B1024 {
            size = BlockSize::from_szx(size.szx() + 1).unwrap_or(BlockSize::B1024);
            len /= 2;
        }

        size
    }
}

/// Byte-offset bookkeeping for a Block2 (server-to-client) transfer.
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub block_size: BlockSize,
    /// Byte offset of the block currently requested / received.
    pub current: usize,
    /// Total resource size as reported by the Size2 option, 0 when unknown.
    pub total_size: usize,
}

impl BlockContext {
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            block_size,
            current: 0,
            total_size: 0,
        }
    }

    /// Updates size and offset from the Block2 (and optional Size2) options
    /// of a response. Fails when the response carries no valid Block2.
    pub fn update_from_response(&mut self, rx: &ParsedPacket) -> Result<()> {
        let Some(raw) = rx.option_uint(OPTION_BLOCK2) else {
            bail!("response carries no Block2 option");
        };

        let Some(size) = BlockSize::from_szx(raw & 0x7) else {
            bail!("reserved block size in Block2 option");
        };

        // The server may lower the negotiated block size mid-transfer.
        self.block_size = size;
        self.current = (raw >> 4) as usize * size.bytes();

        if let Some(total) = rx.option_uint(OPTION_SIZE2) {
            self.total_size = total as usize;
        }

        Ok(())
    }

    /// Advances past the block carried by `rx`. Returns the offset of the
    /// next block to request, or 0 when the transfer is complete.
    pub fn advance(&mut self, rx: &ParsedPacket) -> usize {
        let Some(raw) = rx.option_uint(OPTION_BLOCK2) else {
            return 0;
        };

        let more = raw & 0x8 != 0;
        if !more {
            return 0;
        }

        self.current += self.block_size.bytes();
        self.current
    }

    /// Appends a Block2 request option asking for the block at `current`.
    pub fn append_block2_request(&self, packet: &mut Packet) -> Result<()> {
        let num = (self.current / self.block_size.bytes()) as u32;
        packet.append_option_uint(OPTION_BLOCK2, (num << 4) | self.block_size.szx())
    }
}
