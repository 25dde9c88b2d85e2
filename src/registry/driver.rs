//! The single network-owning task behind the registry.
//!
//! Every physical bind and unbind is a [`NetworkBindingOperation`] on one
//! queue, executed in order by one [`BindingDriver`]. The "is this socket
//! still needed" check for an unbind runs here too, so it cannot race a
//! registration that re-uses the socket.

use futures_util::future::BoxFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::net::endpoint::Endpoint;
use crate::observability::metrics;
use crate::registry::socket::ListeningSocket;
use crate::registry::RegistryError;

/// Opens listening sockets for endpoints.
pub trait SocketBinder: Send + Sync + 'static {
    fn bind(&self, endpoint: &Endpoint) -> BoxFuture<'static, io::Result<Box<dyn SocketHandle>>>;
}

/// An open listening socket.
pub trait SocketHandle: Send + Sync {
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop accepting and release the port.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

pub(crate) enum NetworkBindingOperation {
    Bind {
        endpoint: Endpoint,
        reply: oneshot::Sender<Result<Arc<ListeningSocket>, RegistryError>>,
    },
    /// Close the socket unless a binding was added since the request was queued.
    /// Replies whether the socket was closed.
    Unbind {
        socket: Arc<ListeningSocket>,
        reply: oneshot::Sender<bool>,
    },
}

pub(crate) struct BindingDriver {
    binder: Arc<dyn SocketBinder>,
    operations: mpsc::UnboundedReceiver<NetworkBindingOperation>,
}

impl BindingDriver {
    pub(crate) fn new(
        binder: Arc<dyn SocketBinder>,
        operations: mpsc::UnboundedReceiver<NetworkBindingOperation>,
    ) -> Self {
        Self { binder, operations }
    }

    /// Runs until every registry handle is gone.
    pub(crate) async fn run(mut self) {
        while let Some(operation) = self.operations.recv().await {
            match operation {
                NetworkBindingOperation::Bind { endpoint, reply } => {
                    let result = self.bind(endpoint).await;
                    let _ = reply.send(result);
                }
                NetworkBindingOperation::Unbind { socket, reply } => {
                    let closed = self.unbind(&socket).await;
                    let _ = reply.send(closed);
                }
            }
        }
        tracing::debug!("Binding driver stopped");
    }

    async fn bind(&self, endpoint: Endpoint) -> Result<Arc<ListeningSocket>, RegistryError> {
        match self.binder.bind(&endpoint).await {
            Ok(handle) => {
                metrics::record_socket_bind();
                tracing::info!(
                    endpoint = %endpoint,
                    local_address = ?handle.local_addr(),
                    "Listener bound"
                );
                Ok(Arc::new(ListeningSocket::new(endpoint, handle)))
            }
            Err(e) => {
                tracing::error!(endpoint = %endpoint, error = %e, "Failed to bind listener");
                Err(RegistryError::Bind {
                    endpoint,
                    source: Arc::new(e),
                })
            }
        }
    }

    async fn unbind(&self, socket: &ListeningSocket) -> bool {
        let Some(handle) = socket.close_if_unused() else {
            tracing::debug!(endpoint = %socket.endpoint(), "Listener re-used before unbind, keeping it");
            return false;
        };
        handle.close().await;
        metrics::record_socket_unbind();
        tracing::info!(endpoint = %socket.endpoint(), "Listener unbound");
        true
    }
}
