//! Keystead - stdio host
//!
//! Reads one JSON envelope per line from stdin:
//!
//! ```text
//! {"id": 1, "method": "unlock", "payload": {"password": "..."}, "meta": {"origin": "https://app"}}
//! ```
//!
//! and writes one line per reply plus one line per consent surface event:
//!
//! ```text
//! {"id": 1, "response": [null, true]}
//! {"event": {"kind": "open"}}
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keystead::{
    config::Args,
    requests::{ChannelConsentSurface, SurfaceEvent},
    Keeper, RpcChannel, RpcRequest, RpcResponse,
};

/// How long in-flight calls may run after stdin closes
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// One inbound line
#[derive(Deserialize)]
struct HostFrame {
    #[serde(default)]
    id: Value,
    #[serde(flatten)]
    request: RpcRequest,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // stdout carries the RPC stream, so logs go to stderr
    let log_level = args.log_level.clone();
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| format!("keystead={},info", log_level).into()),
    );
    if args.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Keystead - identity wallet core");
    info!("======================================");
    match &args.data_dir {
        Some(dir) => info!("Data dir: {}", dir.display()),
        None => warn!("No DATA_DIR set, state is kept in memory only"),
    }
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Auto-lock: {} min", args.auto_lock_minutes);
    info!("======================================");

    let (surface, mut surface_events) = ChannelConsentSurface::new();
    let keeper = Arc::new(Keeper::start(args.keeper_config(), Arc::new(surface)).await?);

    let (client, server) = RpcChannel::new(args.channel_capacity, None);
    let server_task = server.spawn(Arc::clone(&keeper));

    // Single writer for stdout so lines never interleave
    let (out_tx, mut out_rx) = mpsc::channel::<String>(args.channel_capacity);
    let writer_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let (stop_events, mut stop_rx) = oneshot::channel::<()>();
    let events_task = {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = surface_events.recv() => match event {
                        Some(event) => forward_event(&out_tx, event).await,
                        None => return,
                    },
                    _ = &mut stop_rx => break,
                }
            }
            // flush what was emitted before shutdown
            while let Ok(event) = surface_events.try_recv() {
                forward_event(&out_tx, event).await;
            }
        })
    };

    let mut calls = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        while calls.try_join_next().is_some() {}
        if line.trim().is_empty() {
            continue;
        }

        let frame: HostFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Malformed envelope");
                let response = RpcResponse::error(format!("Malformed envelope: {e}"));
                let _ = out_tx
                    .send(json!({ "id": Value::Null, "response": response }).to_string())
                    .await;
                continue;
            }
        };

        let client = client.clone();
        let out_tx = out_tx.clone();
        calls.spawn(async move {
            let reply = client.call(frame.request).await;
            let line = json!({ "id": frame.id, "response": reply.response }).to_string();
            let _ = out_tx.send(line).await;
        });
    }

    // Nobody is left to answer a consent prompt
    let rejected = keeper.services().broker.shut_down();
    info!(in_flight = calls.len(), rejected, "stdin closed, finishing in-flight calls");
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(joined) = calls.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Call task failed");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(abandoned = calls.len(), "In-flight calls did not finish in time");
        calls.shutdown().await;
    }

    keeper.shutdown().await;
    drop(client);
    if let Err(e) = server_task.await {
        warn!(error = %e, "RPC server task failed");
    }

    let _ = stop_events.send(());
    if let Err(e) = events_task.await {
        warn!(error = %e, "Surface event task failed");
    }

    // the writer ends once every sender is gone and the queue is drained
    drop(out_tx);
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Failed writing to stdout"),
        Err(e) => warn!(error = %e, "Writer task failed"),
    }
    Ok(())
}

async fn forward_event(out_tx: &mpsc::Sender<String>, event: SurfaceEvent) {
    let _ = out_tx.send(json!({ "event": event }).to_string()).await;
}
