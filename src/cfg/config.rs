// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Client configuration, usually loaded from YAML.
///
/// Timers are validated by [`Config::validate_and_normalize`]; in
/// particular the keepalive interval must stay below the receive timeout,
/// otherwise the session would disconnect between its own pings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    #[serde(rename = "ServerHost")]
    /// Hostname of the Golioth CoAP gateway.
    pub server_host: String,

    #[serde(default = "default_server_port", rename = "ServerPort")]
    /// UDP/DTLS port of the gateway.
    pub server_port: u16,

    #[serde(default = "default_rx_buffer_size", rename = "RxBufferSize")]
    /// Receive buffer capacity; also drives the preferred Block2 size.
    pub rx_buffer_size: usize,

    #[serde(default = "default_ack_timeout_ms", rename = "AckTimeoutMs")]
    /// Base ACK timeout before the first retransmission.
    pub ack_timeout_ms: u32,

    #[serde(
        default = "default_ack_random_factor_percent",
        rename = "AckRandomFactorPercent"
    )]
    /// ACK_RANDOM_FACTOR expressed in percent (150 = 1.5).
    pub ack_random_factor_percent: u32,

    #[serde(default = "default_true", rename = "RandomizeAckTimeout")]
    /// Whether the initial ACK timeout is randomized within
    /// `[AckTimeoutMs, AckTimeoutMs * AckRandomFactorPercent / 100)`.
    pub randomize_ack_timeout: bool,

    #[serde(default = "default_ping_interval_s", rename = "PingIntervalS")]
    /// Keepalive ping interval in seconds.
    pub ping_interval_s: u32,

    #[serde(default = "default_receive_timeout_s", rename = "ReceiveTimeoutS")]
    /// Seconds of receive silence after which the session reconnects.
    pub receive_timeout_s: u32,

    #[serde(default = "default_rpc_max_methods", rename = "RpcMaxMethods")]
    /// Capacity of the RPC method registry.
    pub rpc_max_methods: usize,

    #[serde(
        default = "default_settings_max_response_len",
        rename = "SettingsMaxResponseLen"
    )]
    /// Upper bound for the encoded settings status response.
    pub settings_max_response_len: usize,

    #[serde(default, rename = "CredentialsTagList")]
    /// Credential-store tags handed to the DTLS transport factory.
    pub credentials_tag_list: Vec<u32>,

    #[serde(default = "default_true", rename = "HostnameVerification")]
    /// Whether the DTLS layer should pin the TLS hostname for SNI.
    pub hostname_verification: bool,
}

fn default_server_port() -> u16 {
    5684
}

fn default_rx_buffer_size() -> usize {
    1280
}

fn default_ack_timeout_ms() -> u32 {
    2000
}

fn default_ack_random_factor_percent() -> u32 {
    150
}

fn default_ping_interval_s() -> u32 {
    9
}

fn default_receive_timeout_s() -> u32 {
    30
}

fn default_rpc_max_methods() -> usize {
    8
}

fn default_settings_max_response_len() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: default_server_port(),
            rx_buffer_size: default_rx_buffer_size(),
            ack_timeout_ms: default_ack_timeout_ms(),
            ack_random_factor_percent: default_ack_random_factor_percent(),
            randomize_ack_timeout: true,
            ping_interval_s: default_ping_interval_s(),
            receive_timeout_s: default_receive_timeout_s(),
            rpc_max_methods: default_rpc_max_methods(),
            settings_max_response_len: default_settings_max_response_len(),
            credentials_tag_list: Vec::new(),
            hostname_verification: true,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.server_host.is_empty(), "ServerHost must not be empty");
        ensure!(self.server_port != 0, "ServerPort must not be 0");

        // The smallest CoAP block must fit, with room for header and options.
        ensure!(
            self.rx_buffer_size >= 64,
            "RxBufferSize must be at least 64 bytes"
        );

        ensure!(self.ack_timeout_ms >= 1, "AckTimeoutMs must be >= 1");
        ensure!(
            self.ack_random_factor_percent >= 100,
            "AckRandomFactorPercent must be >= 100"
        );

        ensure!(
            self.ping_interval_s < self.receive_timeout_s,
            "PingIntervalS must be smaller than ReceiveTimeoutS"
        );

        ensure!(self.rpc_max_methods >= 1, "RpcMaxMethods must be >= 1");

        Ok(())
    }
}
