// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Forwards `tracing` events to the Golioth `logs` endpoint.
//!
//! Each event becomes one CBOR map `{level, module, msg, uptime}` POSTed as
//! a non-confirmable message: device logs are fire-and-forget and never
//! retried.

use std::{
    fmt::Debug,
    sync::{Arc, Weak},
};

use ciborium::Value;
use tracing::{Event, Level, Subscriber, field::Field};
use tracing_subscriber::layer::{Context, Layer};

use crate::{
    client::client::Client,
    coap::{Code, ContentFormat, MsgType, OPTION_CONTENT_FORMAT, Packet, pathv},
    services::cbor,
};

pub const LOGS_URI_PATH: &str = "logs";

/// Subscriber layer shipping log events to the cloud through `client`.
pub struct GoliothLogLayer {
    client: Weak<Client>,
}

/// Builds a layer bound to `client`. The binding is weak, so the layer
/// never keeps a dropped client alive.
pub fn layer(client: &Arc<Client>) -> GoliothLogLayer {
    GoliothLogLayer {
        client: Arc::downgrade(client),
    }
}

fn level_str(level: &Level) -> &'static str {
    if *level == Level::ERROR {
        "error"
    } else if *level == Level::WARN {
        "warn"
    } else if *level == Level::INFO {
        "info"
    } else {
        "debug"
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }
}

fn build_log_packet(client: &Client, body: &[u8]) -> anyhow::Result<Packet> {
    let token = client.next_token();
    let mut packet = Packet::new(MsgType::Non, &token, Code::POST, client.next_id())?;

    pathv::append_uri_path(&mut packet, LOGS_URI_PATH)?;
    packet.append_option_uint(OPTION_CONTENT_FORMAT, ContentFormat::Cbor.value())?;
    packet.append_payload(body)?;

    Ok(packet)
}

impl<S: Subscriber> Layer<S> for GoliothLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // The engine logs through tracing as well; forwarding those events
        // would feed the transport its own diagnostics.
        if event.metadata().target().starts_with("golioth_client_rs") {
            return;
        }

        let Some(client) = self.client.upgrade() else {
            return;
        };
        if !client.is_connected() {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let entry = Value::Map(vec![
            (
                Value::Text("level".to_string()),
                Value::Text(level_str(event.metadata().level()).to_string()),
            ),
            (
                Value::Text("module".to_string()),
                Value::Text(event.metadata().target().to_string()),
            ),
            (
                Value::Text("msg".to_string()),
                Value::Text(visitor.message.unwrap_or_default()),
            ),
            (
                Value::Text("uptime".to_string()),
                Value::Integer(client.uptime_ms().into()),
            ),
        ]);

        let Ok(body) = cbor::encode(&entry) else {
            return;
        };
        let Ok(packet) = build_log_packet(&client, &body) else {
            return;
        };

        let _ = client.enqueue_datagram(packet.to_datagram());
    }
}
