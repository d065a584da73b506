// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::process;

use alchemist_driver::Config;
use alchemist_driver::logging::{self, StderrLogConfig};
use alchemist_driver::pool::TcpWorkerChannel;
use alchemist_driver::registry::DEFAULT_FIRST_HANDLE;
use alchemist_protocol::codec::ClientConn;
use anyhow::{Context, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::filter::Targets;

/// Coordinator of an Alchemist matrix-computation cluster.
#[derive(Parser)]
#[clap(name = "alchemist-driver", version)]
struct Args {
    // === Worker options. ===
    /// The number of workers to wait for before serving the client.
    #[clap(long, env = "ALCHEMIST_WORKERS", value_name = "N")]
    workers: usize,
    /// The address on which to listen for worker connections.
    #[clap(
        long,
        env = "ALCHEMIST_WORKER_LISTEN_ADDR",
        value_name = "HOST:PORT",
        default_value = "127.0.0.1:24960"
    )]
    worker_listen_addr: String,

    // === Client options. ===
    /// The address on which to accept the client connection.
    ///
    /// If unset, the client protocol is spoken over stdin and stdout.
    #[clap(long, env = "ALCHEMIST_CLIENT_LISTEN_ADDR", value_name = "HOST:PORT")]
    client_listen_addr: Option<String>,
    /// The first matrix handle to hand out.
    #[clap(long, env = "ALCHEMIST_FIRST_HANDLE", value_name = "ID", default_value_t = DEFAULT_FIRST_HANDLE)]
    first_handle: u32,

    // === Tracing options. ===
    /// Which events to log to stderr, e.g. `info,alchemist_protocol=trace`.
    #[clap(
        long,
        env = "ALCHEMIST_LOG_FILTER",
        value_name = "FILTER",
        default_value = "info"
    )]
    log_filter: Targets,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("alchemist-driver: fatal: {:#}", err);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    logging::configure(StderrLogConfig {
        filter: args.log_filter,
    })?;

    if args.workers == 0 {
        bail!("--workers must be greater than 0");
    }
    let channel = TcpWorkerChannel::listen(&args.worker_listen_addr, args.workers)
        .await
        .context("accepting workers")?;
    let config = Config {
        first_handle: args.first_handle,
    };

    match args.client_listen_addr {
        None => {
            info!("serving client on stdio");
            let conn = ClientConn::new(tokio::io::stdin(), tokio::io::stdout());
            alchemist_driver::serve(config, channel, conn).await?;
        }
        Some(addr) => {
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding client listener on {addr}"))?;
            info!(%addr, "listening for client connection");
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true)?;
            info!(%peer, "accepted client connection");
            let (reader, writer) = stream.into_split();
            alchemist_driver::serve(config, channel, ClientConn::new(reader, writer)).await?;
        }
    }

    Ok(())
}
