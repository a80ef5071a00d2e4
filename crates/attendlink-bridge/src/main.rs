//! attendlink-bridge: dashboard-facing serial bridge

mod cli;
mod ipc;

use anyhow::{Context, Result};
use attendlink_core::prelude::*;
use attendlink_core::protocol::{list_ports, DeviceLink, TargetMatcher};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use ipc::Message;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn print_ports(pinned: Option<String>) {
    let matcher = TargetMatcher::default().pinned(pinned);
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return;
    }
    for port in ports {
        let mark = if matcher.matches(&port) { "*" } else { " " };
        println!("{} {}  {}", mark, port.describe(), port.hardware_id());
    }
}

/// Write every outgoing message as one JSON line
async fn write_messages(mut rx: mpsc::UnboundedReceiver<Message>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        stdout
            .write_all(line.as_bytes())
            .await
            .context("failed to write to stdout")?;
        stdout.flush().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if cli.list_ports {
        print_ports(cli.port.clone());
        return Ok(());
    }

    let config = cli.bridge_config()?;
    tracing::info!(
        "attendlink-bridge {} (core {}), {} baud",
        env!("CARGO_PKG_VERSION"),
        attendlink_core::VERSION,
        config.baud_rate
    );

    let (link, simulator): (Box<dyn DeviceLink>, Option<SimulatorHandle>) = if cli.simulate {
        let handle = SimulatorHandle::new();
        tracing::info!("Using simulated controller");
        (
            Box::new(SimulatedLink::new(cli.simulator_config(), handle.clone())),
            Some(handle),
        )
    } else {
        (Box::new(SerialLink::new()), None)
    };

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_messages(out_rx));

    let bridge = Bridge::new(config, link);
    let status_tx = out_tx.clone();
    let status_sub = bridge.subscribe_status(move |status| {
        let _ = status_tx.send(Message::Status(status.clone()));
    });
    let response_tx = out_tx.clone();
    let response_sub = bridge.subscribe_responses(move |response| {
        let _ = response_tx.send(Message::Response(response.clone()));
    });
    let handle = bridge.spawn();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let line = tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else {
            tracing::info!("stdin closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match ipc::parse_request(line) {
            Ok(request) => {
                tracing::debug!("Request: {:?}", request);
                ipc::dispatch(&handle, simulator.as_ref(), request).await
            }
            Err(e) => Some(Message::error(format!("invalid request: {}", e))),
        };
        if let Some(reply) = reply {
            let _ = out_tx.send(reply);
        }
    }

    handle.shutdown().await;
    drop(status_sub);
    drop(response_sub);
    drop(out_tx);
    writer.await.context("stdout writer panicked")??;
    Ok(())
}
