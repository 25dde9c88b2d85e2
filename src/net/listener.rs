//! TCP listeners with backpressure.
//!
//! # Responsibilities
//! - Bind a `TcpListener` per endpoint on behalf of the registry
//! - Accept connections, bounded by a proxy-wide connection semaphore
//! - Hand each accepted stream to a [`ConnectionAcceptor`]
//! - Stop accepting and release the port when the handle is closed

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::net::endpoint::Endpoint;
use crate::observability::metrics;
use crate::registry::{SocketBinder, SocketHandle};

/// Delay before accepting again after an accept error (e.g. fd exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Takes ownership of accepted client connections.
pub trait ConnectionAcceptor: Send + Sync + 'static {
    fn accept(&self, stream: TcpStream, peer: SocketAddr, endpoint: Endpoint, permit: ConnectionPermit);
}

/// A connection slot; released back to the pool when dropped.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Binds real TCP listeners for the registry.
pub struct TcpSocketBinder {
    acceptor: Arc<dyn ConnectionAcceptor>,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl TcpSocketBinder {
    pub fn new(acceptor: Arc<dyn ConnectionAcceptor>, max_connections: usize) -> Self {
        Self {
            acceptor,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl SocketBinder for TcpSocketBinder {
    fn bind(&self, endpoint: &Endpoint) -> BoxFuture<'static, io::Result<Box<dyn SocketHandle>>> {
        let endpoint = endpoint.clone();
        let acceptor = Arc::clone(&self.acceptor);
        let connection_limit = Arc::clone(&self.connection_limit);
        async move {
            let listener = TcpListener::bind(endpoint.socket_addr_string()).await?;
            let local_addr = listener.local_addr()?;
            let (stop, stopped) = oneshot::channel();
            let task = tokio::spawn(accept_loop(listener, endpoint, acceptor, connection_limit, stopped));
            Ok(Box::new(TcpSocketHandle {
                local_addr,
                stop,
                task,
            }) as Box<dyn SocketHandle>)
        }
        .boxed()
    }
}

async fn accept_loop(
    listener: TcpListener,
    endpoint: Endpoint,
    acceptor: Arc<dyn ConnectionAcceptor>,
    connection_limit: Arc<Semaphore>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        // acquire first so a full proxy stops accepting rather than dropping
        let permit = tokio::select! {
            _ = &mut stop => break,
            permit = Arc::clone(&connection_limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                metrics::record_connection_accepted();
                tracing::debug!(
                    endpoint = %endpoint,
                    peer_addr = %peer,
                    available_permits = connection_limit.available_permits(),
                    "Connection accepted"
                );
                acceptor.accept(stream, peer, endpoint.clone(), ConnectionPermit { _permit: permit });
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
    tracing::debug!(endpoint = %endpoint, "Accept loop stopped");
}

struct TcpSocketHandle {
    local_addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SocketHandle for TcpSocketHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let TcpSocketHandle { stop, task, .. } = *self;
        async move {
            let _ = stop.send(());
            // the listener is dropped, and the port released, when the loop ends
            let _ = task.await;
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct Collecting {
        accepted: mpsc::UnboundedSender<(SocketAddr, Endpoint)>,
        permits: Mutex<Vec<ConnectionPermit>>,
    }

    impl ConnectionAcceptor for Collecting {
        fn accept(&self, _stream: TcpStream, peer: SocketAddr, endpoint: Endpoint, permit: ConnectionPermit) {
            self.permits.lock().unwrap().push(permit);
            let _ = self.accepted.send((peer, endpoint));
        }
    }

    #[tokio::test]
    async fn accepts_until_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let acceptor = Arc::new(Collecting {
            accepted: tx,
            permits: Mutex::new(Vec::new()),
        });
        let binder = TcpSocketBinder::new(acceptor, 4);
        let endpoint = Endpoint::new(Some("127.0.0.1".to_string()), 0, false);

        let handle = binder.bind(&endpoint).await.unwrap();
        let addr = handle.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_, seen) = rx.recv().await.unwrap();
        assert_eq!(seen, endpoint);
        assert!(binder.available_permits() < binder.max_connections());

        handle.close().await;
        assert!(TcpListener::bind(addr).await.is_ok());
    }
}
