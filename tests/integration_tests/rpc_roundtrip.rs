// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use ciborium::Value;
use golioth_client_rs::{
    coap::{
        Code, ContentFormat, OPTION_ACCEPT, OPTION_CONTENT_FORMAT, OPTION_OBSERVE,
        OPTION_URI_PATH, ParsedPacket,
    },
    services::rpc,
};
use tokio::time::sleep;

use crate::integration_tests::common::{start_client, test_config};

fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)?;
    Ok(buf)
}

fn decode(payload: &[u8]) -> Result<Value> {
    Ok(ciborium::de::from_reader(payload)?)
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn rpc_request(id: &str, method: &str, params: Vec<Value>) -> Result<Vec<u8>> {
    encode(&Value::Map(vec![
        (text("id"), text(id)),
        (text("method"), text(method)),
        (text("params"), Value::Array(params)),
    ]))
}

fn uri_path(packet: &ParsedPacket) -> String {
    packet
        .options(OPTION_URI_PATH)
        .into_iter()
        .map(|seg| String::from_utf8_lossy(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[tokio::test(start_paused = true)]
async fn test_rpc_mul_roundtrip() -> Result<()> {
    let mut h = start_client(test_config()).await?;

    rpc::register(
        &h.client,
        "mul",
        Box::new(|params, detail| {
            let (Some(a), Some(b)) = (params.next_f64(), params.next_f64()) else {
                return rpc::RpcStatus::InvalidArgument;
            };
            detail.put_f64("value", a * b);
            rpc::RpcStatus::Ok
        }),
    )?;

    rpc::observe(&h.client)?;

    let req = h.server.next_packet().await?;
    assert_eq!(req.code(), Code::GET);
    assert_eq!(uri_path(&req), ".rpc");
    assert_eq!(req.option_uint(OPTION_OBSERVE), Some(0));
    assert_eq!(
        req.option_uint(OPTION_ACCEPT),
        Some(ContentFormat::Cbor.value())
    );
    let token = req.token().to_vec();

    // Registration echo is a CBOR "OK" and must not produce a response.
    sleep(Duration::from_millis(10)).await;
    h.server.reply_observe_registered(&req, &encode(&text("OK"))?)?;

    // {id:"x", method:"mul", params:[3.0, 4.0]}
    let body = rpc_request(
        "x",
        "mul",
        vec![Value::Float(3.0), Value::Float(4.0)],
    )?;
    h.server.notify(&token, 1, &body)?;

    let status = h.server.next_packet().await?;
    assert_eq!(status.code(), Code::POST);
    assert_eq!(uri_path(&status), ".rpc/status");
    assert_eq!(
        status.option_uint(OPTION_CONTENT_FORMAT),
        Some(ContentFormat::Cbor.value())
    );
    assert_eq!(status.option(OPTION_ACCEPT), None);

    let expected = Value::Map(vec![
        (text("id"), text("x")),
        (text("statusCode"), Value::Integer(0.into())),
        (
            text("detail"),
            Value::Map(vec![(text("value"), Value::Float(12.0))]),
        ),
    ]);
    assert_eq!(decode(status.payload())?, expected);

    h.server.reply(&status, Code::new(2, 4), b"")?;

    h.client.stop().await;
    h.session.abort();

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unknown_method_reports_status() -> Result<()> {
    let mut h = start_client(test_config()).await?;

    rpc::observe(&h.client)?;

    let req = h.server.next_packet().await?;
    let token = req.token().to_vec();

    sleep(Duration::from_millis(10)).await;
    h.server.reply_observe_registered(&req, &encode(&text("OK"))?)?;

    let body = rpc_request("y", "does_not_exist", vec![])?;
    h.server.notify(&token, 1, &body)?;

    let status = h.server.next_packet().await?;
    let expected = Value::Map(vec![
        (text("id"), text("y")),
        (
            text("statusCode"),
            Value::Integer((rpc::RpcStatus::Unknown as u64).into()),
        ),
    ]);
    assert_eq!(
        decode(status.payload())?,
        expected,
        "unknown methods answer without a detail map"
    );

    h.client.stop().await;
    h.session.abort();

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_registry_capacity_bounded() -> Result<()> {
    let mut cfg = test_config();
    cfg.rpc_max_methods = 2;

    let h = start_client(cfg).await?;

    let noop =
        || Box::new(|_: &mut rpc::ParamsReader<'_>, _: &mut rpc::DetailWriter| rpc::RpcStatus::Ok);

    rpc::register(&h.client, "one", noop())?;
    rpc::register(&h.client, "two", noop())?;
    assert!(rpc::register(&h.client, "three", noop()).is_err());

    h.client.stop().await;
    h.session.abort();

    Ok(())
}
