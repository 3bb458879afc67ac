use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use common::metrics::process_unix::ProcessRecorder;
use common::ShutdownMessage;
use router::config::RouterConfig;
use router::metrics::RouterMetrics;
use router::server::auth::authenticator::RouterAuthenticator;
use router::server::haentgl_server::HaentglServer;
use router::topology::{Server, Topology, TopologyHandle};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::sync::watch::Receiver;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

async fn shutdown_await(mut shutdown_rx: Box<Receiver<ShutdownMessage>>) {
    let changed_rs = &shutdown_rx.changed().await;
    if changed_rs.is_ok() {
        let canceled = shutdown_rx.borrow_and_update().clone();
        if let ShutdownMessage::Cancel(msg) = canceled {
            info!("router process received shutdown msg {msg}");
        }
    }
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("router received ctrl_c signal {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg = format!("router received terminate signal {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

fn start_metrics_and_rest(
    config: &RouterConfig,
    runtime: &Runtime,
    shutdown_rx: &Receiver<ShutdownMessage>,
    metrics: RouterMetrics,
) {
    let http_port = config.http_port;
    if config.enable_metrics {
        common::metrics::init_metrics_context();
        let mut process_recorder = ProcessRecorder::new(
            common::metrics::common_labels().clone(),
            shutdown_rx.clone(),
        );
        runtime.spawn(async move {
            process_recorder.start_auto_collect().await;
        });
    }
    if config.enable_rest {
        let shutdown_rx_clone = Box::new(shutdown_rx.clone());
        let metrics_clone = metrics.clone();
        runtime.spawn(async move {
            web_service::http_server::MonoProxyRest::start_server(
                "0.0.0.0".to_string(),
                http_port,
                false,
                shutdown_await(shutdown_rx_clone),
                metrics_clone,
            )
            .await
        });
    }
}

/// `name@host:port` entries from `--backend`, first one taken as primary.
fn topology_from_config(config: &RouterConfig) -> Topology {
    let servers = config
        .backend
        .iter()
        .enumerate()
        .filter_map(|(idx, entry)| {
            let (name, addr) = entry.split_once('@')?;
            let role = if idx == 0 {
                router::topology::ServerRole::Primary
            } else {
                router::topology::ServerRole::Replica
            };
            Some(Server {
                name: name.to_string(),
                addr: addr.to_string(),
                role,
                lag_ms: Some(0),
            })
        })
        .collect();
    Topology::new(servers)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = RouterConfig::parse();
    let log_level_string = config.log_level.clone().unwrap_or_else(|| "INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse().unwrap())
        .add_directive("h2=INFO".parse().unwrap())
        .add_directive("tower=INFO".parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let works = config.works;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("rwsplit-proxy")
        .worker_threads(works)
        .build()?;

    info!("router starting with config={:?}", config);

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);
    let metrics = RouterMetrics::default();
    start_metrics_and_rest(&config, &runtime, &shutdown_rx, metrics.clone());

    runtime.block_on(async {
        let topology = TopologyHandle::new(topology_from_config(&config));
        let config_arc = Arc::new(config);

        let server = Arc::new(HaentglServer::new(
            Arc::clone(&config_arc),
            topology,
            metrics,
            RouterAuthenticator,
        ));

        tokio::select! {
            shutdown_msg = shutdown_signal() => {
                shutdown_tx.send(shutdown_msg.clone()).ok();
            }
            run_result = server.run(std::future::pending::<()>()) => {
                if let Err(e) = run_result {
                    tracing::error!("router accept loop ended: {e}");
                }
            }
        }
        Ok(())
    })
}
