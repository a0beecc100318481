use anyhow::Context;
use axum::{response::IntoResponse, routing::get, Router};
use clap::{Parser, Subcommand};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use rdtctl::common::{CacheLevel, MOUNTS_PATH};
use rdtctl::{RdtControl, RdtMetricExporter, ResctrlGroup};

#[derive(Parser, Debug)]
#[command(name = "rdtctl")]
#[command(about = "Hierarchical Intel RDT cache and memory bandwidth allocation")]
struct Args {
    #[arg(
        long,
        global = true,
        default_value = "",
        help = "Prefix of the resctrl group directories managed by rdtctl"
    )]
    group_prefix: String,

    #[arg(
        long,
        global = true,
        default_value = MOUNTS_PATH,
        help = "Mount table used to locate the resctrl filesystem"
    )]
    mounts: PathBuf,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the RDT capabilities of the system and the existing classes
    Info,

    /// Apply a partition and class configuration
    Configure {
        #[arg(long, help = "YAML configuration file")]
        config_file: PathBuf,

        #[arg(long, help = "Remove stale groups even if they have processes")]
        force: bool,
    },

    /// Export the monitoring counters of all classes to Prometheus
    Monitor {
        #[arg(long, default_value_t = 8080, help = "HTTP port of the /metrics endpoint")]
        port: u16,

        #[arg(
            long,
            default_value_t = 1,
            value_parser = clap::value_parser!(u64).range(1..),
            help = "Refresh interval in seconds"
        )]
        interval: u64,
    },
}

struct AppState {
    rdt_exporter: Option<Arc<RdtMetricExporter>>,
}

async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    rdtctl::gather_metrics!(buffer, encoder, state.rdt_exporter, "RDT");

    let content_type = encoder.format_type().to_string();
    (
        [("Content-Type", content_type)],
        String::from_utf8(buffer).unwrap_or_default(),
    )
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    tracing::debug!("Installing signal handlers...");

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("Ctrl+C received!"),
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                tracing::info!("SIGTERM received!");
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::warn!("Shutdown signal received, initiating graceful shutdown...");
    cancel_token.cancel();
}

fn print_info(control: &RdtControl) {
    let info = control.info();
    println!("resctrl filesystem: {}", info.resctrl_path.display());
    println!("closids: {}", info.num_closids);

    for lvl in CacheLevel::all() {
        let cat = info.cat(lvl);
        if !cat.supported() {
            println!("{lvl} allocation: not supported");
            continue;
        }
        println!(
            "{lvl} allocation: cbm_mask={:#x} min_cbm_bits={} cdp={} cache_ids={:?}",
            cat.cbm_mask(),
            cat.min_cbm_bits(),
            cat.cdp_enabled(),
            cat.cache_ids
        );
    }

    if info.mb.supported() {
        println!(
            "MB allocation: min_bandwidth={} bandwidth_gran={} mbps={} cache_ids={:?}",
            info.mb.min_bandwidth, info.mb.bandwidth_gran, info.mb.mbps_enabled, info.mb.cache_ids
        );
    } else {
        println!("MB allocation: not supported");
    }

    if control.mon_supported() {
        println!(
            "L3 monitoring: rmids={} features={}",
            info.l3mon.num_rmids,
            control.mon_features().join(",")
        );
    } else {
        println!("L3 monitoring: not supported");
    }

    println!("classes (prefix {:?}):", control.prefix());
    for class in control.classes() {
        let mon_groups: Vec<_> = class.mon_groups().map(|mg| mg.name()).collect();
        println!("  {:?} mon_groups={:?}", class.name(), mon_groups);
    }
}

async fn run_monitor(control: RdtControl, port: u16, interval: u64) -> anyhow::Result<()> {
    let control = Arc::new(parking_lot::Mutex::new(control));
    let exporter = Arc::new(RdtMetricExporter::new(control)?);

    let cancel_token = CancellationToken::new();
    let collection_handle = exporter.start(Duration::from_secs(interval), cancel_token.clone());

    let app_state = Arc::new(AppState {
        rdt_exporter: Some(exporter),
    });
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_token))
        .await?;

    tracing::info!("Server shutdown complete, waiting for collection loop to finish...");
    let _ = collection_handle.await;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut control = RdtControl::discover(&args.mounts, &args.group_prefix)
        .context("failed to initialize RDT control")?;

    match args.command {
        Command::Info => {
            print_info(&control);
        }
        Command::Configure { config_file, force } => {
            control
                .set_config_from_file(&config_file, force)
                .with_context(|| format!("failed to apply {}", config_file.display()))?;
            tracing::info!("Configuration applied");
        }
        Command::Monitor { port, interval } => {
            run_monitor(control, port, interval).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_interval() {
        let args = Args::try_parse_from(["rdtctl", "monitor", "--interval", "5"]).unwrap();
        assert!(matches!(args.command, Command::Monitor { interval: 5, port: 8080 }));

        let args = Args::try_parse_from(["rdtctl", "monitor"]).unwrap();
        assert!(matches!(args.command, Command::Monitor { interval: 1, .. }));

        assert!(Args::try_parse_from(["rdtctl", "monitor", "--interval", "0"]).is_err());
    }
}
