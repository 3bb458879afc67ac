//! TCP accept loop: binds the router's listen port and spawns one
//! [`crate::server::driver::serve_connection`] task per accepted client,
//! each pinned to the session's owning task for its whole lifetime per
//! §5's one-worker-per-session scheduling model.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::RouterConfig;
use crate::errors::{RouterError, RouterResult};
use crate::metrics::RouterMetrics;
use crate::server::auth::Authenticator;
use crate::server::driver;
use crate::topology::TopologyHandle;

pub struct HaentglServer<A> {
    config: Arc<RouterConfig>,
    topology: TopologyHandle,
    metrics: RouterMetrics,
    authenticator: Arc<A>,
    next_conn_id: AtomicU64,
}

impl<A: Authenticator + 'static> HaentglServer<A> {
    pub fn new(
        config: Arc<RouterConfig>,
        topology: TopologyHandle,
        metrics: RouterMetrics,
        authenticator: A,
    ) -> Self {
        Self {
            config,
            topology,
            metrics,
            authenticator: Arc::new(authenticator),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Binds the listener and accepts connections until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) -> RouterResult<()> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| RouterError::ConfigurationContradiction {
                reason: format!("cannot bind {addr}: {e}"),
            })?;
        info!("router listening on {addr}");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("router shutting down accept loop");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                            let authenticator = Arc::clone(&self.authenticator);
                            let config = Arc::clone(&self.config);
                            let topology = self.topology.clone();
                            let metrics = self.metrics.clone();
                            tokio::spawn(async move {
                                driver::serve_connection(
                                    stream,
                                    conn_id,
                                    authenticator.as_ref(),
                                    config,
                                    topology,
                                    metrics,
                                )
                                .await;
                            });
                            let _ = peer;
                        }
                        Err(e) => {
                            warn!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }
}
