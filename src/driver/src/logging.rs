// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Log configuration.
//!
//! The driver logs to stderr only. When serving a client over stdio, stdout
//! carries the client protocol and must never see a log line.

use std::io::{self, IsTerminal};

use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

/// Configures the stderr log.
#[derive(Debug, Clone)]
pub struct StderrLogConfig {
    /// A filter which determines which events are emitted to the log.
    pub filter: Targets,
}

/// Installs the global `tracing` subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn configure(config: StderrLogConfig) -> Result<(), anyhow::Error> {
    let stderr_log_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_filter(config.filter);
    tracing_subscriber::registry()
        .with(stderr_log_layer)
        .try_init()?;
    Ok(())
}
