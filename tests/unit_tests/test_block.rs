// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use golioth_client_rs::coap::{
    Code, MsgType, OPTION_BLOCK2, OPTION_SIZE2, Packet, ParsedPacket,
    block::{BlockContext, BlockSize},
};

const TOKEN: [u8; 8] = [9, 8, 7, 6, 5, 4, 3, 2];

/// Builds a parsed 2.05 response carrying a Block2 option (and optionally
/// Size2).
fn block_response(num: u32, more: bool, szx: u32, total: Option<u32>) -> Result<ParsedPacket> {
    let mut packet = Packet::new(MsgType::Ack, &TOKEN, Code::CONTENT, 0x42)?;

    let value = (num << 4) | (u32::from(more) << 3) | szx;
    packet.append_option_uint(OPTION_BLOCK2, value)?;
    if let Some(total) = total {
        packet.append_option_uint(OPTION_SIZE2, total)?;
    }
    packet.append_payload(b"block-data")?;

    Ok(ParsedPacket::parse(Bytes::copy_from_slice(packet.as_bytes()))?)
}

#[test]
fn test_update_tracks_offset_and_total() -> Result<()> {
    let mut ctx = BlockContext::new(BlockSize::B512);

    let rx = block_response(0, true, 5, Some(1200))?;
    ctx.update_from_response(&rx)?;

    assert_eq!(ctx.current, 0);
    assert_eq!(ctx.total_size, 1200);
    assert_eq!(ctx.block_size, BlockSize::B512);

    assert_eq!(ctx.advance(&rx), 512);

    let rx = block_response(1, true, 5, None)?;
    ctx.update_from_response(&rx)?;
    assert_eq!(ctx.current, 512);
    assert_eq!(ctx.total_size, 1200, "Size2 absence keeps known total");

    assert_eq!(ctx.advance(&rx), 1024);

    Ok(())
}

#[test]
fn test_advance_returns_zero_on_last_block() -> Result<()> {
    let mut ctx = BlockContext::new(BlockSize::B512);

    let rx = block_response(2, false, 5, None)?;
    ctx.update_from_response(&rx)?;
    assert_eq!(ctx.current, 1024);

    assert_eq!(ctx.advance(&rx), 0);
    assert_eq!(ctx.current, 1024);

    Ok(())
}

#[test]
fn test_server_may_shrink_block_size() -> Result<()> {
    let mut ctx = BlockContext::new(BlockSize::B1024);

    // Server answers block 4 at 128-byte granularity.
    let rx = block_response(4, true, 3, None)?;
    ctx.update_from_response(&rx)?;

    assert_eq!(ctx.block_size, BlockSize::B128);
    assert_eq!(ctx.current, 4 * 128);

    Ok(())
}

#[test]
fn test_missing_block2_is_an_error() -> Result<()> {
    let mut packet = Packet::new(MsgType::Ack, &TOKEN, Code::CONTENT, 0x42)?;
    packet.append_payload(b"plain")?;
    let rx = ParsedPacket::parse(Bytes::copy_from_slice(packet.as_bytes()))?;

    let mut ctx = BlockContext::new(BlockSize::B512);
    assert!(ctx.update_from_response(&rx).is_err());

    Ok(())
}

#[test]
fn test_request_option_follows_context() -> Result<()> {
    let mut ctx = BlockContext::new(BlockSize::B256);
    ctx.current = 768;

    let mut packet = Packet::new(MsgType::Con, &TOKEN, Code::GET, 1)?;
    ctx.append_block2_request(&mut packet)?;

    let parsed = ParsedPacket::parse(Bytes::copy_from_slice(packet.as_bytes()))?;
    // num = 3, more = 0, szx = 4
    assert_eq!(parsed.option_uint(OPTION_BLOCK2), Some((3 << 4) | 4));

    Ok(())
}
