// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use golioth_client_rs::{
    cfg::{cli::config_path_from_args, config::Config, logger::init_logger_with_cloud},
    client::{client::Client, session, transport::UdpTransportFactory},
    coap::ContentFormat,
    services::{lightdb, rpc, settings, stream},
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load config
    let cfg = config_path_from_args("config.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let client = Client::new(cfg);

    let _logger = init_logger_with_cloud("config_logger.yaml", &client)?;

    // Answer `mul` invocations from the cloud with the product of the two
    // parameters.
    rpc::register(
        &client,
        "mul",
        Box::new(|params, detail| {
            let (Some(a), Some(b)) = (params.next_f64(), params.next_f64()) else {
                return rpc::RpcStatus::InvalidArgument;
            };
            detail.put_f64("value", a * b);
            rpc::RpcStatus::Ok
        }),
    )?;

    settings::register_callback(
        &client,
        Box::new(|key, value| {
            info!("setting {key} = {value:?}");
            settings::SettingsStatus::Success
        }),
    );

    // Observations do not survive a reconnect, so they are re-registered
    // from the on_connect hook.
    client.set_on_connect(Box::new(|client| {
        if let Err(e) = rpc::observe(client) {
            warn!("failed to observe RPC: {e}");
        }
        if let Err(e) = settings::observe(client) {
            warn!("failed to observe settings: {e}");
        }
    }));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(session::run_until_cancelled(
        Arc::clone(&client),
        Arc::new(UdpTransportFactory),
        cancel.clone(),
    ));
    client.start();

    let mut state = client.state_changes();
    state
        .wait_for(|state| {
            *state == golioth_client_rs::client::client::ConnState::Connected
        })
        .await
        .context("session loop terminated before connecting")?;

    let reply = client.hello().await?;
    info!("hello reply: {}", String::from_utf8_lossy(&reply));

    // Counter demo: mirror a value into LightDB State and stream it.
    for counter in 0..3i64 {
        lightdb::set_value(&client, "counter", &counter).await?;

        let stored = lightdb::get(&client, "counter", ContentFormat::Json).await?;
        info!("counter now: {}", String::from_utf8_lossy(&stored));

        stream::push(
            &client,
            "counter",
            ContentFormat::Json,
            format!("{{\"value\":{counter}}}").as_bytes(),
        )
        .await?;

        sleep(Duration::from_secs(5)).await;
    }

    client.stop().await;
    cancel.cancel();
    handle.await?;

    Ok(())
}
