// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use golioth_client_rs::{
    coap::{Code, ContentFormat, OPTION_OBSERVE},
    services::lightdb,
};
use tokio::time::sleep;

use crate::integration_tests::common::{start_client, test_config};

#[tokio::test(start_paused = true)]
async fn test_notifications_filtered_by_freshness() -> Result<()> {
    let mut cfg = test_config();
    // The scenario spans 200 s of silence; keep the session alive that long.
    cfg.ping_interval_s = 900;
    cfg.receive_timeout_s = 1000;

    let mut h = start_client(cfg).await?;

    let accepted: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&accepted);

    lightdb::observe_cb(
        &h.client,
        "led",
        ContentFormat::Json,
        Box::new(move |rsp| {
            if let Ok(view) = rsp {
                sink.lock().expect("sink").push(view.data.to_vec());
            }
            Ok(())
        }),
    )?;

    let req = h.server.next_packet().await?;
    assert_eq!(req.code(), Code::GET);
    assert_eq!(req.option_uint(OPTION_OBSERVE), Some(0), "registration");
    let token = req.token().to_vec();

    // Registration reply, seq 0.
    sleep(Duration::from_millis(10)).await;
    h.server.reply_observe_registered(&req, b"n0")?;
    sleep(Duration::from_secs(1)).await;

    // seq 1 at ~1 s: accepted.
    h.server.notify(&token, 1, b"n1")?;
    sleep(Duration::from_secs(1)).await;

    // seq 0 again at ~2 s: stale, dropped.
    h.server.notify(&token, 0, b"stale")?;
    sleep(Duration::from_secs(1)).await;

    // seq 2 at ~3 s: accepted.
    h.server.notify(&token, 2, b"n2")?;

    // seq 0 after 200 s of silence: older than the 128 s rule, accepted.
    sleep(Duration::from_secs(200)).await;
    h.server.notify(&token, 0, b"ancient")?;
    sleep(Duration::from_millis(10)).await;

    let accepted = accepted.lock().expect("sink").clone();
    assert_eq!(
        accepted,
        vec![
            b"n0".to_vec(),
            b"n1".to_vec(),
            b"n2".to_vec(),
            b"ancient".to_vec(),
        ]
    );

    h.client.stop().await;
    h.session.abort();

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_observe_survives_notifications() -> Result<()> {
    let mut h = start_client(test_config()).await?;

    let count = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&count);

    lightdb::observe_cb(
        &h.client,
        "led",
        ContentFormat::Json,
        Box::new(move |rsp| {
            if rsp.is_ok() {
                *sink.lock().expect("count") += 1;
            }
            Ok(())
        }),
    )?;

    let req = h.server.next_packet().await?;
    let token = req.token().to_vec();

    sleep(Duration::from_millis(10)).await;
    h.server.reply_observe_registered(&req, b"v1")?;

    for seq in 1..=5u32 {
        sleep(Duration::from_secs(1)).await;
        h.server.notify(&token, seq, format!("v{seq}").as_bytes())?;
    }
    sleep(Duration::from_millis(10)).await;

    assert_eq!(*count.lock().expect("count"), 6);

    h.client.stop().await;
    h.session.abort();

    Ok(())
}
