// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Picks the client configuration file: the first CLI argument, the
/// `GOLIOTH_CONFIG` environment variable, or `default`, in that order.
///
/// Relative paths are anchored at the current working directory; the
/// resolved file must exist.
pub fn config_path_from_args(default: &str) -> Result<PathBuf> {
    let picked = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GOLIOTH_CONFIG").ok())
        .unwrap_or_else(|| default.to_string());

    let path = PathBuf::from(&picked);
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(path)
    };

    path.canonicalize()
        .with_context(|| format!("config file {picked:?} does not resolve"))
}
