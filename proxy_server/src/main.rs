//! Standalone proxy binary.
//!
//! Usage:
//!   cargo run -p proxy_server -- --config proxy.json [--log info] [--capture]
//!
//! Reads a JSON proxy configuration, starts the MITM listener, prints
//! the rewritten endpoint the game client should be redirected to, and
//! runs until Ctrl-C.

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use proxy_server::{HostHooks, ProxyServer};
use proxy_shared::config::ProxyConfig;
use proxy_shared::packet::CaptureRecord;
use tracing::info;

struct Args {
    config: String,
    log: String,
    capture: bool,
}

fn parse_args() -> Args {
    let mut out = Args {
        config: "proxy.json".to_string(),
        log: "info".to_string(),
        capture: false,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                out.config = args[i + 1].clone();
                i += 2;
            }
            "--log" if i + 1 < args.len() => {
                out.log = args[i + 1].clone();
                i += 2;
            }
            "--capture" => {
                out.capture = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    out
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log.clone().into()),
        )
        .init();

    // An invariant violation anywhere in the relay is unrecoverable.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        eprintln!("fatal: panic in proxy runtime");
        process::exit(2);
    }));

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("read config {}", args.config))?;
    let conf = ProxyConfig::from_json_str(&raw).context("parse config")?;

    info!(
        upstream = %conf.server_addr,
        ping = %conf.ping_addr,
        "Setting up proxy server"
    );

    let hooks = HostHooks {
        on_connect: Some(Arc::new(|addr| info!(%addr, "Client connected"))),
        on_disconnect: Some(Arc::new(|| info!("Client connection closed"))),
        on_capture: Some(Arc::new(|rec: CaptureRecord| {
            info!(
                src = %rec.src_addr,
                dst = %rec.dst_addr,
                is_send = rec.is_send,
                name = %rec.name,
                len = rec.payload.len(),
                "Captured packet"
            );
        })),
        ..Default::default()
    };

    let server = ProxyServer::new(conf, hooks);
    server.set_capturing(args.capture);

    let mitm = server.start().await.context("start proxy")?;
    info!(
        listen = %mitm.server_addr,
        ping = %mitm.ping_addr,
        "Proxy ready, redirect the client here"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("Shutting down");
    server.stop().await;

    Ok(())
}
