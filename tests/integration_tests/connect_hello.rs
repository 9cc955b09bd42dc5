// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use golioth_client_rs::coap::{
    Code, ContentFormat, MsgType, OPTION_ACCEPT, OPTION_URI_PATH,
};

use crate::integration_tests::common::{start_client, test_config};

#[tokio::test(start_paused = true)]
async fn test_hello_roundtrip() -> Result<()> {
    let mut h = start_client(test_config()).await?;

    let client = h.client.clone();
    let hello = tokio::spawn(async move { client.hello().await });

    let req = h.server.next_packet().await?;
    assert_eq!(req.msg_type(), MsgType::Con);
    assert_eq!(req.code(), Code::GET);
    assert_eq!(req.option(OPTION_URI_PATH), Some(&b"hello"[..]));
    assert_eq!(
        req.option_uint(OPTION_ACCEPT),
        Some(ContentFormat::Text.value())
    );
    assert_eq!(req.token().len(), 8);

    h.server.reply(&req, Code::CONTENT, b"hi")?;

    assert_eq!(hello.await??, b"hi");

    h.client.stop().await;
    h.session.abort();

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_server_error_reported_to_caller() -> Result<()> {
    let mut h = start_client(test_config()).await?;

    let client = h.client.clone();
    let hello = tokio::spawn(async move { client.hello().await });

    let req = h.server.next_packet().await?;
    h.server.reply(&req, Code::new(5, 3), b"")?;

    assert!(hello.await?.is_err(), "5.03 must surface as an error");

    h.client.stop().await;
    h.session.abort();

    Ok(())
}
