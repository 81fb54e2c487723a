//! mTLS layer-4 reverse proxy.

pub mod auth;
pub mod balancer;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod proxy;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use chrono::Local;
use rolling_file::{RollingConditionBasic, RollingFileAppender};

use auth::AuthRegistry;
use balancer::Balancer;
use proxy::listener::ListenerConfig;

struct LocalTimer;
impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Parser, Debug)]
#[command(name = "mtls-proxy")]
#[command(about = "Mutually-authenticated TLS layer-4 reverse proxy", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

fn main() -> Result<()> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cores)
        .thread_name("mtls-proxy-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cores))
}

async fn async_main(cores: usize) -> Result<()> {
    std::fs::create_dir_all("logs").unwrap_or_default();

    let file_appender = RollingFileAppender::new(
        "logs/mtls-proxy.log",
        RollingConditionBasic::new().daily(),
        30,
    )?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).with_timer(LocalTimer))
        .with(fmt::layer().with_writer(std::io::stdout).with_timer(LocalTimer))
        .init();

    let args = Args::parse();
    info!("starting mtls-proxy version {}", env!("CARGO_PKG_VERSION"));
    info!(workers = cores, "multi-core runtime initialized");

    let cfg = config::Config::load(&args.config).context("loading configuration")?;

    let auth = std::sync::Arc::new(AuthRegistry::new(cfg.auth.clients));
    let balancer = Balancer::new(cfg.proxy.upstream_addrs, auth.all_clients_perms())
        .context("constructing balancer")?;

    let listener_config = ListenerConfig {
        addr: cfg.proxy.addr,
        client_ca_cert_path: cfg.proxy.client_ca_cert_path,
        server_cert_path: cfg.proxy.server_cert_path,
        server_key_path: cfg.proxy.server_key_path,
        heartbeat_timeout: Duration::from_secs(cfg.proxy.heartbeat_timeout),
        forward_buff_size: cfg.proxy.forward_buff_size,
    };

    proxy::listener::run(listener_config, auth, balancer)
        .await
        .context("running accept loop")?;

    Ok(())
}
