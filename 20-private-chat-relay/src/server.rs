use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{error::ServerError, registry::Registry, router::Router};

pub const DEFAULT_PORT: u16 = 8080;

pub struct RelayServer {
    listener: TcpListener,
    router: Arc<Router>,
}

impl RelayServer {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            router: Arc::new(Router::new(Arc::new(Registry::new()))),
        }
    }

    pub async fn bind(addr: SocketAddr) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self::new(listener))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.router.registry())
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer { listener, router } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&router).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &router);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(router: &Router) {
    let closed = router.registry().close_all().await;
    info!(sessions = closed, "relay shutting down");
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, router: &Arc<Router>) {
    match result {
        Ok((stream, peer)) => spawn_connection(stream, peer, router),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, router: &Arc<Router>) {
    let router = Arc::clone(router);
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        if let Err(err) = router.serve(BufReader::new(reader), writer).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}
