use crate::dashboard::SessionMap;
use crate::journal::Journal;
use crate::pusher::Pusher;
use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use portico_docid::DocIdCodec;
use portico_repo::Repository;
use portico_server_common::Config;
use std::net::{IpAddr, SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError};
use tower_http::trace::TraceLayer;

/// The callers allowed to pull documents: the appliance itself plus
/// any extra addresses from `server.fullAccessHosts`. Loopback is
/// always trusted so an operator can poke the adaptor from its own
/// box.
pub struct TrustedHosts {
    addrs: Vec<IpAddr>,
}

impl TrustedHosts {
    pub fn resolve(gsa_hostname: &str, full_access_hosts: &str) -> Self {
        let mut addrs: Vec<IpAddr> = vec!["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()];
        let mut add = |host: &str| {
            if host.is_empty() {
                return;
            }
            if let Ok(ip) = host.parse::<IpAddr>() {
                addrs.push(ip);
                return;
            }
            // Resolve once at startup; a renumbered appliance needs a
            // restart, which is also what re-reads the config.
            match (host, 0u16).to_socket_addrs() {
                Ok(resolved) => addrs.extend(resolved.map(|sa| sa.ip())),
                Err(err) => {
                    tracing::warn!("cannot resolve trusted host {host:?}: {err}");
                }
            }
        };
        add(gsa_hostname);
        for host in full_access_hosts.split(',') {
            add(host.trim());
        }
        Self { addrs }
    }

    pub fn of(addrs: Vec<IpAddr>) -> Self {
        Self { addrs }
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.addrs.contains(&ip)
    }
}

/// Bounds concurrent document requests: `max_workers` run at once and
/// at most `queue_capacity` wait; beyond that the request is answered
/// 503 without touching the repository.
pub struct RequestLimiter {
    semaphore: Arc<Semaphore>,
    queue_capacity: usize,
    waiting: AtomicUsize,
}

impl RequestLimiter {
    pub fn new(max_workers: usize, queue_capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            queue_capacity,
            waiting: AtomicUsize::new(0),
        }
    }

    pub async fn acquire(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(TryAcquireError::NoPermits) => {
                if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.queue_capacity {
                    self.waiting.fetch_sub(1, Ordering::SeqCst);
                    return None;
                }
                let permit = self.semaphore.clone().acquire_owned().await.ok();
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                permit
            }
            Err(TryAcquireError::Closed) => None,
        }
    }
}

/// Everything the HTTP handlers share.
pub struct ServerState {
    pub config: Arc<Config>,
    pub codec: Arc<DocIdCodec>,
    pub repo: Arc<dyn Repository>,
    pub journal: Arc<Journal>,
    pub pusher: Arc<Pusher>,
    pub trusted: TrustedHosts,
    pub mark_all_docs_public: bool,
    pub watchdog: Duration,
    pub limiter: RequestLimiter,
    pub sessions: SessionMap,
}

pub type AppState = Arc<ServerState>;

/// The document listener: `/doc/`, `/heartbeat/` and `/authz`.
pub fn doc_router(state: AppState) -> Router {
    let doc_path = state.config.str_value("server.docIdPath").to_string();
    let heartbeat_path = state.config.str_value("server.heartbeatPath").to_string();
    Router::new()
        .route(
            &format!("{doc_path}{{*id}}"),
            get(crate::doc_handler::handle_doc),
        )
        .route(
            &format!("{heartbeat_path}{{*id}}"),
            get(crate::doc_handler::handle_heartbeat),
        )
        .route("/authz", post(crate::authz::handle_authz))
        .with_state(state)
}

/// The dashboard listener: metrics, the status feed and the RPC
/// endpoint. Runs on its own port and its own worker pool so operator
/// diagnostics are not starved by repository load.
pub fn dashboard_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(crate::dashboard::handle_metrics))
        .route(
            "/dashboard/status.json",
            get(crate::dashboard::handle_status),
        )
        .route("/rpc", post(crate::dashboard::handle_rpc))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind a listener socket. Separate from serving so that
/// daemon-init can fail fast on a taken port.
pub fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).with_context(|| format!("listen on {addr}"))
}

/// Serve `router` on an already-bound socket until the handle is shut
/// down.
pub fn serve(
    listener: TcpListener,
    router: Router,
    handle: axum_server::Handle,
) -> anyhow::Result<()> {
    let server = axum_server::from_tcp(listener);
    tokio::spawn(async move {
        if let Err(err) = server
            .handle(handle)
            .serve(router.into_make_service_with_connect_info::<SocketAddr>())
            .await
        {
            tracing::error!("http listener failed: {err}");
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_always_trusted() {
        let trusted = TrustedHosts::resolve("", "");
        assert!(trusted.is_trusted("127.0.0.1".parse().unwrap()));
        assert!(trusted.is_trusted("::1".parse().unwrap()));
        assert!(!trusted.is_trusted("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn literal_addresses_are_trusted_without_dns() {
        let trusted = TrustedHosts::resolve("10.0.0.7", "192.168.1.1, 10.9.9.9");
        for ip in ["10.0.0.7", "192.168.1.1", "10.9.9.9"] {
            assert!(trusted.is_trusted(ip.parse().unwrap()), "{ip}");
        }
    }

    #[tokio::test]
    async fn limiter_rejects_when_saturated() {
        let limiter = Arc::new(RequestLimiter::new(1, 1));
        let held = limiter.acquire().await.unwrap();
        // One request may wait in the queue.
        let queued = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The queue slot is taken; the next caller bounces.
        assert!(limiter.acquire().await.is_none());
        drop(held);
        assert!(queued.await.unwrap());
    }
}
