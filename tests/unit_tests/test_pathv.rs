// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use golioth_client_rs::coap::{Code, MsgType, Packet, pathv};

const TOKEN: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

/// Bytes occupied by the Uri-Path options of a packet holding nothing else.
fn encoded_options_len(pathv_segments: &[&str]) -> Result<usize> {
    let mut packet = Packet::new(MsgType::Con, &TOKEN, Code::GET, 1)?;
    let empty_len = packet.as_bytes().len();

    pathv::append_uri_pathv(&mut packet, pathv_segments)?;

    Ok(packet.as_bytes().len() - empty_len)
}

#[test]
fn test_estimate_covers_service_paths() -> Result<()> {
    for segments in [
        vec![".d", "counter"],
        vec![".s", "sensor/temp"],
        vec![".rpc"],
        vec![".rpc/status"],
        vec![".c/status"],
        vec![".u/desired"],
        vec![".u/c", "main"],
        vec!["hello"],
        vec!["logs"],
    ] {
        let actual = encoded_options_len(&segments)?;
        let estimate = pathv::estimate_alloc_len(&segments);

        assert!(
            estimate >= actual,
            "estimate {estimate} < actual {actual} for {segments:?}"
        );
    }

    Ok(())
}

#[test]
fn test_estimate_covers_all_segment_lengths() -> Result<()> {
    // Worst case segments are around 13 characters, where delta+length
    // take 2 bytes per option.
    for len in 1..=99usize {
        let segment = "x".repeat(len);
        let segments = [segment.as_str()];

        let actual = encoded_options_len(&segments)?;
        let estimate = pathv::estimate_alloc_len(&segments);

        assert!(
            estimate >= actual,
            "estimate {estimate} < actual {actual} for segment length {len}"
        );
    }

    Ok(())
}

#[test]
fn test_slash_segments_split() -> Result<()> {
    let mut split = Packet::new(MsgType::Con, &TOKEN, Code::GET, 1)?;
    pathv::append_uri_pathv(&mut split, &["a/b"])?;

    let mut explicit = Packet::new(MsgType::Con, &TOKEN, Code::GET, 1)?;
    pathv::append_uri_pathv(&mut explicit, &["a", "b"])?;

    assert_eq!(split.as_bytes(), explicit.as_bytes());

    Ok(())
}

#[test]
fn test_leading_slash_and_empty_pieces_skipped() -> Result<()> {
    let mut noisy = Packet::new(MsgType::Con, &TOKEN, Code::GET, 1)?;
    pathv::append_uri_pathv(&mut noisy, &["/a//b/"])?;

    let mut clean = Packet::new(MsgType::Con, &TOKEN, Code::GET, 1)?;
    pathv::append_uri_pathv(&mut clean, &["a", "b"])?;

    assert_eq!(noisy.as_bytes(), clean.as_bytes());

    Ok(())
}
