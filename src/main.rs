//! Edge router for the trip-planner service mesh.
//!
//! Terminates client HTTP, classifies each request into a route class,
//! enforces per-class token-bucket rate limits, and proxies to the
//! least-loaded healthy replica with failure-based ejection. Built on
//! Pingora; a hyper sidecar serves Kubernetes probes.

mod config;
mod error;
mod health;
mod proxy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use proxy::EdgeProxy;

/// Buckets idle longer than this are swept.
const BUCKET_IDLE_EVICTION: Duration = Duration::from_secs(600);
const BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = Config::from_env().context("loading configuration")?;
    tracing::info!(listen = %cfg.listen_addr, probe = %cfg.probe_addr, "edge-router starting");

    let edge = EdgeProxy::new(&cfg);

    // Sweep idle rate-limit buckets so one-off clients do not pile up.
    let limiters = edge.rate_limiters();
    std::thread::spawn(move || loop {
        std::thread::sleep(BUCKET_SWEEP_INTERVAL);
        for limiter in &limiters {
            limiter.evict_idle(BUCKET_IDLE_EVICTION);
        }
    });

    // Probe sidecar on its own runtime; readiness flips once the proxy
    // listener is registered.
    let ready = Arc::new(AtomicBool::new(false));
    let probe_ready = Arc::clone(&ready);
    let probe_addr = cfg.probe_addr;
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(error = %e, "probe runtime failed to start");
                return;
            }
        };
        if let Err(e) = runtime.block_on(health::start_probe_server(probe_addr, probe_ready)) {
            tracing::error!(error = %e, "probe server exited");
        }
    });

    let mut server =
        pingora_core::server::Server::new(None).context("initializing proxy server")?;
    server.bootstrap();

    let mut service = pingora_proxy::http_proxy_service(&server.configuration, edge);
    service.add_tcp(&cfg.listen_addr);
    server.add_service(service);

    // Flipped as late as the API allows: run_forever() never returns,
    // and the listener binds inside it, so /readyz can lead the first
    // accept by the bind duration.
    ready.store(true, Ordering::Release);
    server.run_forever();
}
