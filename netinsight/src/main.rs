use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netinsight::loader::KernelProbe;
use netinsight::snapshot::TableSnapshot;

mod api;
mod config;

use config::{CliArgs, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── eBPF setup ────────────────────────────────────────────────────
    let mut probe = KernelProbe::load(Path::new(&config.ebpf_object))?;
    let iface = config.interface().to_string();
    probe.attach(&iface, config.xdp_mode)?;

    // ── Table Reader Task ─────────────────────────────────────────────
    let (tx, rx) = watch::channel(TableSnapshot::default());
    let poll_every = Duration::from_secs(config.poll_interval_seconds.max(1));
    let drain = config.drain_on_read;
    if drain {
        tracing::info!("Draining kernel tables every {:?}", poll_every);
    }

    let reader = tokio::spawn(async move {
        poll_tables(|| probe.read(drain), poll_every, tx).await;
        probe
    });

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        interface: iface,
        snapshots: rx,
        start_time: std::time::Instant::now(),
    });

    let app = api::router(app_state, &config.allowed_ips);

    let listener =
        tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Dropping the probe detaches it; abort the reader so that happens now.
    reader.abort();
    match reader.await {
        Ok(mut probe) => probe.detach()?,
        Err(e) if e.is_cancelled() => {}
        Err(e) => return Err(e.into()),
    }
    tracing::info!("Shut down");

    Ok(())
}

/// Publish a fresh snapshot every `every` until all receivers are gone.
/// Must run on the multi-threaded runtime.
async fn poll_tables<F>(mut read: F, every: Duration, tx: watch::Sender<TableSnapshot>)
where
    F: FnMut() -> anyhow::Result<TableSnapshot>,
{
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        // Map iteration is a syscall per row; keep it off the async workers.
        match tokio::task::block_in_place(&mut read) {
            Ok(snapshot) => {
                let lost = snapshot.total_overflows();
                if lost > 0 {
                    tracing::debug!("{} table inserts lost to capacity so far", lost);
                }
                tracing::debug!(
                    "Read {} flows, {} connections",
                    snapshot.flows.len(),
                    snapshot.connections.len()
                );
                if tx.send(snapshot).is_err() {
                    break;
                }
            }
            Err(e) => tracing::error!("Failed to read kernel tables: {:#}", e),
        }
    }
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, detaching probe");
}
