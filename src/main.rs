use std::os::unix::net::UnixStream;

use anyhow::Context;
use bupview::protocol;
use bupview::{Slave, SlaveConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Protocol worker serving bup archives over the application socket.
#[derive(Parser, Debug)]
#[command(name = "bupview", version, about)]
struct Args {
    /// Protocol name the worker was started for
    protocol: String,
    /// Socket of the worker pool (unused by this worker)
    pool_socket: String,
    /// Socket of the application to serve
    app_socket: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = SlaveConfig::from_env();
    tracing::info!(protocol = %args.protocol, app_socket = %args.app_socket, ?config, "starting worker");

    let stream = UnixStream::connect(&args.app_socket)
        .with_context(|| format!("Failed to connect to {}", args.app_socket))?;
    let reader = stream.try_clone().context("Failed to clone socket")?;

    let mut slave = Slave::new(config);
    let handled = protocol::serve(reader, stream, &mut slave)?;

    tracing::info!(handled, "worker done");
    Ok(())
}
