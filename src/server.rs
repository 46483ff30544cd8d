//! The accept loop: one independent tunnel task per client connection.

use crate::config::Config;
use crate::proxy;
use crate::router::Router;
use crate::stats::{self, Registry};
use crate::tunnel;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Tunnels currently alive. Shown in every log line prefix.
pub static ACTIVE_TUNNELS: AtomicI64 = AtomicI64::new(0);

pub struct Proxy {
    listener: TcpListener,
    router: Arc<Router>,
    registry: Arc<Registry>,
}

impl Proxy {
    /// Bind the listening socket and compile the routing table.
    pub async fn bind(addr: &str, config: &Config) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let router = Arc::new(Router::new(config)?);

        Ok(Self {
            listener,
            router,
            registry: Arc::new(Registry::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept forever. A dying tunnel never takes the acceptor with it,
    /// and transient accept errors are logged and swallowed.
    pub async fn run(self) {
        tokio::spawn(stats::run_reporter(Arc::clone(&self.registry)));

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("accept failed: {e}");
                    continue;
                }
            };
            ACTIVE_TUNNELS.fetch_add(1, Ordering::Relaxed);
            info!("connected from {peer}");

            let router = Arc::clone(&self.router);
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, &router, &registry).await {
                    info!("{e}");
                }
                ACTIVE_TUNNELS.fetch_sub(1, Ordering::Relaxed);
                debug!("closed client");
            });
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    router: &Router,
    registry: &Registry,
) -> crate::Result<()> {
    let ingress = proxy::accept(&mut stream).await?;
    info!("server {}", ingress.destination);

    let upstream = router.route(&ingress.destination.host);
    tunnel::run(stream, ingress, upstream, registry).await
}
