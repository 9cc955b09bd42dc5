// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt::Debug, fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{
        self, FmtContext, FormatEvent, FormatFields,
        format::{JsonFields, Writer},
        writer::BoxMakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
};

use crate::{client::client::Client, services::logs};

#[derive(Debug, Deserialize, Clone)]
struct LoggerYaml {
    logger: LogOptions,
}

/// Local logging knobs. Cloud forwarding is not configured here; it is
/// enabled by initializing through [`init_logger_with_cloud`].
#[derive(Debug, Deserialize, Clone)]
struct LogOptions {
    /// EnvFilter directive, e.g. `info` or `golioth_client_rs=debug`.
    level: String,
    output: LogOutput,
    /// Destination file, required for `output: file`.
    #[serde(default)]
    file_path: Option<String>,
    /// Append a `location` (`file:line`) field to every entry.
    #[serde(default)]
    include_location: bool,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum LogOutput {
    Stdout,
    Stderr,
    File,
}

impl LogOptions {
    fn writer(&self) -> Result<(BoxMakeWriter, WorkerGuard)> {
        Ok(match self.output {
            LogOutput::Stdout => {
                let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
                (BoxMakeWriter::new(writer), guard)
            },
            LogOutput::Stderr => {
                let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
                (BoxMakeWriter::new(writer), guard)
            },
            LogOutput::File => {
                let path = self
                    .file_path
                    .as_deref()
                    .context("logger.file_path is required for output: file")?;
                let path = Path::new(path);

                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let name = path
                    .file_name()
                    .context("logger.file_path has no file name")?;

                let (writer, guard) = tracing_appender::non_blocking(
                    tracing_appender::rolling::never(dir, name),
                );
                (BoxMakeWriter::new(writer), guard)
            },
        })
    }
}

/// Routes the `message` field apart from the structured ones, so the entry
/// can lead with `msg` like the device-log payload does.
#[derive(Default)]
struct EventFields {
    msg: Option<String>,
    rest: serde_json::Map<String, serde_json::Value>,
}

impl EventFields {
    fn put(&mut self, name: &str, value: serde_json::Value) {
        if name == "message" {
            self.msg = Some(match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.rest.insert(name.to_string(), value);
        }
    }
}

impl tracing::field::Visit for EventFields {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn Debug) {
        self.put(field.name(), json!(format!("{value:?}")));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.put(field.name(), json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.put(field.name(), json!(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.put(field.name(), json!(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.put(field.name(), json!(value));
    }
}

/// One JSON object per event, shaped like the device-log entries shipped by
/// [`crate::services::logs`] (`level`, `module`, `msg`) with a timestamp up
/// front and the remaining event fields flattened behind.
struct ConsoleJson {
    include_location: bool,
}

impl<S, N> FormatEvent<S, N> for ConsoleJson
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();

        let mut fields = EventFields::default();
        event.record(&mut fields);

        let mut entry = serde_json::Map::new();
        entry.insert("ts".to_string(), json!(Utc::now().to_rfc3339()));
        entry.insert(
            "level".to_string(),
            json!(meta.level().to_string().to_ascii_lowercase()),
        );
        entry.insert("module".to_string(), json!(meta.target()));
        entry.insert(
            "msg".to_string(),
            json!(fields.msg.unwrap_or_default()),
        );

        if self.include_location
            && let (Some(file), Some(line)) = (meta.file(), meta.line())
        {
            entry.insert("location".to_string(), json!(format!("{file}:{line}")));
        }

        for (name, value) in fields.rest {
            entry.insert(name, value);
        }

        writeln!(writer, "{}", serde_json::Value::Object(entry))
    }
}

fn init_with_cloud(config_path: &str, client: Option<&Arc<Client>>) -> Result<WorkerGuard> {
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read logger config: {config_path}"))?;
    let yaml: LoggerYaml = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse logger config: {config_path}"))?;
    let opts = yaml.logger;

    let (writer, guard) = opts.writer()?;

    let env_filter = EnvFilter::try_new(&opts.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("Failed to parse log level from config or env")?;

    let console = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .event_format(ConsoleJson {
            include_location: opts.include_location,
        })
        .fmt_fields(JsonFields::default());

    let cloud = client.map(logs::layer);

    let subscriber = Registry::default()
        .with(env_filter)
        .with(cloud)
        .with(console);

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    Ok(guard)
}

/// Initializes the process-wide logger from a YAML logger config.
pub fn init_logger(config_path: &str) -> Result<WorkerGuard> {
    init_with_cloud(config_path, None)
}

/// Like [`init_logger`], but additionally forwards application log events
/// to the Golioth `logs` endpoint through `client`.
pub fn init_logger_with_cloud(
    config_path: &str,
    client: &Arc<Client>,
) -> Result<WorkerGuard> {
    init_with_cloud(config_path, Some(client))
}
