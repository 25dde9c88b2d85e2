//! One client connection, from accept to close.
//!
//! # Responsibilities
//! - Resolve the connection to a virtual cluster binding (SNI on TLS endpoints)
//! - Terminate TLS with the cluster's certificate
//! - Connect to the upstream node or bootstrap target
//! - Run the codec pumps and the filter chain until either side closes
//! - Feed upstream metadata back into the registry (discovery.rs)
//!
//! # Design Decisions
//! - Resolution failures close the connection without a protocol response;
//!   no cluster context exists to build one
//! - Four pumps (client/upstream × read/write) decouple socket I/O from the
//!   dispatcher; bounded channels carry the backpressure

use arc_swap::ArcSwap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::cluster::{HostPort, VirtualClusterBinding};
use crate::config::schema::{NetworkConfig, ProxyConfig};
use crate::dispatch::{CloseReason, DispatchError, DispatchSettings, FilterHandler, FrameChannels};
use crate::filter::{ConnectionInfo, FilterError};
use crate::frame::codec;
use crate::frame::{RawResponse, RequestFrame, ResponseFrame};
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::endpoint::Endpoint;
use crate::net::listener::{ConnectionAcceptor, ConnectionPermit};
use crate::net::sni::{peek_sni, ClientHello};
use crate::proxy::discovery::discovery_filter;
use crate::registry::{EndpointResolutionError, WeakEndpointRegistry};

/// Error type for a client session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Resolution(#[from] EndpointResolutionError),

    #[error("client did not start a TLS handshake on a TLS endpoint")]
    NotTls,

    #[error("virtual cluster '{0}' has no TLS material")]
    NoTlsMaterial(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("failed to connect to upstream {target}: {source}")]
    UpstreamConnect {
        target: HostPort,
        #[source]
        source: io::Error,
    },

    #[error("failed to create filter chain: {0}")]
    FilterChain(#[source] FilterError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("endpoint registry is gone")]
    RegistryGone,
}

/// Accepts client connections on behalf of every registry socket.
pub(crate) struct SessionAcceptor {
    registry: OnceLock<WeakEndpointRegistry>,
    config: Arc<ArcSwap<ProxyConfig>>,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
}

impl SessionAcceptor {
    pub(crate) fn new(config: Arc<ArcSwap<ProxyConfig>>, tracker: ConnectionTracker, shutdown: Shutdown) -> Self {
        Self {
            registry: OnceLock::new(),
            config,
            tracker,
            shutdown,
        }
    }

    /// Attach the registry; the registry owns the sockets that call back into us.
    pub(crate) fn attach(&self, registry: WeakEndpointRegistry) {
        let _ = self.registry.set(registry);
    }
}

impl ConnectionAcceptor for SessionAcceptor {
    fn accept(&self, stream: TcpStream, peer: SocketAddr, endpoint: Endpoint, permit: ConnectionPermit) {
        let session = Session {
            registry: self.registry.get().cloned(),
            network: self.config.load().network.clone(),
            tracker: self.tracker.clone(),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(async move {
            let _permit = permit;
            match session.run(stream, peer, endpoint.clone()).await {
                Ok(reason) => tracing::debug!(peer_addr = %peer, endpoint = %endpoint, reason = ?reason, "Session closed"),
                Err(SessionError::Resolution(e)) => {
                    tracing::warn!(peer_addr = %peer, endpoint = %endpoint, error = %e, "Rejected connection")
                }
                Err(e) => tracing::warn!(peer_addr = %peer, endpoint = %endpoint, error = %e, "Session failed"),
            }
        });
    }
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Closed(CloseReason),
    Shutdown,
}

struct Session {
    registry: Option<WeakEndpointRegistry>,
    network: NetworkConfig,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
}

impl Session {
    async fn run(self, stream: TcpStream, peer: SocketAddr, endpoint: Endpoint) -> Result<SessionEnd, SessionError> {
        let sni = if endpoint.tls {
            match peek_sni(&stream, self.network.tls_handshake_timeout()).await? {
                ClientHello::Hello { sni } => sni,
                ClientHello::NotTls | ClientHello::Incomplete => return Err(SessionError::NotTls),
            }
        } else {
            None
        };

        let registry = self
            .registry
            .as_ref()
            .and_then(WeakEndpointRegistry::upgrade)
            .ok_or(SessionError::RegistryGone)?;
        let binding = registry
            .resolve(endpoint.bind_address.as_deref(), endpoint.port, endpoint.tls, sni.as_deref())
            .await?;
        drop(registry);

        let mut info = ConnectionInfo::new(binding.cluster.name.clone())
            .with_peer(peer)
            .with_node_id(binding.node_id);
        if endpoint.tls {
            info = info.with_tls(sni);
        }
        let info = Arc::new(info);
        let _guard = self.tracker.track(info.id);
        tracing::debug!(channel = %info, binding = %binding, "Connection resolved");

        if !endpoint.tls {
            return self.serve(stream, binding, info).await;
        }
        let acceptor = binding
            .cluster
            .tls_acceptor()
            .cloned()
            .ok_or_else(|| SessionError::NoTlsMaterial(binding.cluster.name.clone()))?;
        let tls = tokio::time::timeout(self.network.tls_handshake_timeout(), acceptor.accept(stream))
            .await
            .map_err(|_| SessionError::Handshake(io::ErrorKind::TimedOut.into()))?
            .map_err(SessionError::Handshake)?;
        self.serve(tls, binding, info).await
    }

    async fn serve<S>(
        &self,
        client: S,
        binding: VirtualClusterBinding,
        info: Arc<ConnectionInfo>,
    ) -> Result<SessionEnd, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut filters = binding.cluster.create_filter_chain().map_err(SessionError::FilterChain)?;
        // last in the chain, so it sees metadata exactly as the upstream sent it
        if let Some(registry) = &self.registry {
            filters.push(discovery_filter(registry.clone(), Arc::clone(&binding.cluster)));
        }
        let upstream = connect_upstream(binding.upstream_target(), &self.network).await?;
        tracing::debug!(channel = %info, upstream = %binding.upstream_target(), "Upstream connected");

        let max_frame_size = self.network.max_frame_size;
        let capacity = self.network.max_in_flight_frames.max(1);
        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = upstream.into_split();

        let (from_client_tx, from_client) = mpsc::channel(capacity);
        let (to_client, to_client_rx) = mpsc::channel(capacity);
        let (to_upstream, to_upstream_rx) = mpsc::channel(capacity);
        let (from_upstream_tx, from_upstream) = mpsc::channel(capacity);

        let readers = [
            tokio::spawn(pump_requests(client_read, from_client_tx, max_frame_size)),
            tokio::spawn(pump_responses(upstream_read, from_upstream_tx, max_frame_size)),
        ];
        let client_writer = tokio::spawn(write_responses(client_write, to_client_rx));
        let upstream_writer = tokio::spawn(write_requests(upstream_write, to_upstream_rx));

        let settings = DispatchSettings {
            max_in_flight_frames: capacity,
        };
        let handler = FilterHandler::new(filters, Arc::clone(&info), settings).run(FrameChannels {
            from_client,
            to_client,
            to_upstream,
            from_upstream,
        });

        let mut shutdown = self.shutdown.subscribe();
        let outcome = tokio::select! {
            result = handler => result.map(SessionEnd::Closed).map_err(SessionError::from),
            _ = shutdown.recv() => Ok(SessionEnd::Shutdown),
        };

        // the dispatcher is gone, so the writers drain what is queued and stop
        for reader in readers {
            reader.abort();
        }
        let _ = client_writer.await;
        let _ = upstream_writer.await;
        outcome
    }
}

async fn connect_upstream(target: &HostPort, network: &NetworkConfig) -> Result<TcpStream, SessionError> {
    let connect = TcpStream::connect((target.host.as_str(), target.port));
    let stream = match tokio::time::timeout(network.connect_timeout(), connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(SessionError::UpstreamConnect {
                target: target.clone(),
                source,
            })
        }
        Err(_) => {
            return Err(SessionError::UpstreamConnect {
                target: target.clone(),
                source: io::ErrorKind::TimedOut.into(),
            })
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn pump_requests<R>(mut reader: R, sink: mpsc::Sender<RequestFrame>, max_frame_size: usize)
where
    R: AsyncRead + Unpin,
{
    loop {
        match codec::read_request(&mut reader, max_frame_size).await {
            Ok(Some(frame)) => {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Client frame decoding stopped");
                break;
            }
        }
    }
}

async fn pump_responses<R>(mut reader: R, sink: mpsc::Sender<RawResponse>, max_frame_size: usize)
where
    R: AsyncRead + Unpin,
{
    loop {
        match codec::read_response(&mut reader, max_frame_size).await {
            Ok(Some(frame)) => {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Upstream frame decoding stopped");
                break;
            }
        }
    }
}

async fn write_responses<W>(mut writer: W, mut source: mpsc::Receiver<ResponseFrame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = source.recv().await {
        if let Err(e) = codec::write_response(&mut writer, &frame).await {
            tracing::debug!(error = %e, "Client frame encoding stopped");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_requests<W>(mut writer: W, mut source: mpsc::Receiver<RequestFrame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = source.recv().await {
        if let Err(e) = codec::write_request(&mut writer, &frame).await {
            tracing::debug!(error = %e, "Upstream frame encoding stopped");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
