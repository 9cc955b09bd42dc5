// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use golioth_client_rs::{
    client::error::{GoliothError, StatusKind},
    coap::{
        Code, ContentFormat, OPTION_ACCEPT, OPTION_CONTENT_FORMAT, OPTION_URI_PATH,
        ParsedPacket,
    },
    services::lightdb,
};

use crate::integration_tests::common::{start_client, test_config};

fn uri_path(packet: &ParsedPacket) -> String {
    packet
        .options(OPTION_URI_PATH)
        .into_iter()
        .map(|seg| String::from_utf8_lossy(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[tokio::test(start_paused = true)]
async fn test_set_get_delete_roundtrip() -> Result<()> {
    let mut h = start_client(test_config()).await?;

    // set(p, fmt, bytes)
    let client = h.client.clone();
    let set =
        tokio::spawn(
            async move { lightdb::set(&client, "counter", ContentFormat::Json, b"42").await },
        );

    let req = h.server.next_packet().await?;
    assert_eq!(req.code(), Code::POST);
    assert_eq!(uri_path(&req), ".d/counter");
    assert_eq!(
        req.option_uint(OPTION_CONTENT_FORMAT),
        Some(ContentFormat::Json.value())
    );
    // Response body suppressed: Accept omitted, only the ACK matters.
    assert_eq!(req.option(OPTION_ACCEPT), None);
    assert_eq!(req.payload(), b"42");

    h.server.reply(&req, Code::new(2, 4), b"")?;
    set.await??;

    // get(p, fmt) == bytes
    let client = h.client.clone();
    let get =
        tokio::spawn(async move { lightdb::get(&client, "counter", ContentFormat::Json).await });

    let req = h.server.next_packet().await?;
    assert_eq!(req.code(), Code::GET);
    assert_eq!(uri_path(&req), ".d/counter");
    assert_eq!(
        req.option_uint(OPTION_ACCEPT),
        Some(ContentFormat::Json.value())
    );

    h.server.reply(&req, Code::CONTENT, b"42")?;
    assert_eq!(get.await??, b"42");

    // delete(p)
    let client = h.client.clone();
    let delete = tokio::spawn(async move { lightdb::delete(&client, "counter").await });

    let req = h.server.next_packet().await?;
    assert_eq!(req.code(), Code::DELETE);
    assert_eq!(uri_path(&req), ".d/counter");

    h.server.reply(&req, Code::new(2, 2), b"")?;
    delete.await??;

    // get(p) == ERR_NotFound afterwards
    let client = h.client.clone();
    let get =
        tokio::spawn(async move { lightdb::get(&client, "counter", ContentFormat::Json).await });

    let req = h.server.next_packet().await?;
    h.server.reply(&req, Code::NOT_FOUND, b"")?;

    let err = get.await?.expect_err("deleted path must report NotFound");
    assert_eq!(err.status_kind(), Some(StatusKind::NotFound));
    assert!(matches!(err, GoliothError::Status { .. }));

    h.client.stop().await;
    h.session.abort();

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_submit_while_disconnected_fails_fast() -> Result<()> {
    let h = start_client(test_config()).await?;

    h.client.stop().await;

    let err = lightdb::get(&h.client, "counter", ContentFormat::Json)
        .await
        .expect_err("submit on stopped client must fail");
    assert_eq!(err, GoliothError::TransportUnavailable);

    h.session.abort();

    Ok(())
}
