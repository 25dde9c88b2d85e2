//! The capability object handed to every filter invocation.
//!
//! # Responsibilities
//! - Build filter results (forward, short-circuit, drop, close)
//! - Send self-sent requests upstream and hand back their responses
//! - Expose connection metadata (TLS/SNI identity, SASL identity)

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::filter::result::{
    RequestFilterResult, RequestFilterResultBuilder, ResponseFilterResult, ResponseFilterResultBuilder,
};
use crate::filter::FilterError;
use crate::frame::{RequestFrame, RequestHeader, ResponseHeader};
use crate::net::connection::ConnectionId;

/// Identity established by a SASL exchange on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslIdentity {
    pub mechanism: String,
    pub authorized_id: String,
}

/// Metadata about the client connection a filter chain serves.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub virtual_cluster: String,
    pub node_id: Option<u32>,
    /// Whether the client connection is TLS.
    pub tls: bool,
    /// SNI hostname presented in the TLS ClientHello.
    pub sni_hostname: Option<String>,
    sasl: ArcSwapOption<SaslIdentity>,
}

impl ConnectionInfo {
    pub fn new(virtual_cluster: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer: None,
            virtual_cluster: virtual_cluster.into(),
            node_id: None,
            tls: false,
            sni_hostname: None,
            sasl: ArcSwapOption::empty(),
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_node_id(mut self, node_id: Option<u32>) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_tls(mut self, sni_hostname: Option<String>) -> Self {
        self.tls = true;
        self.sni_hostname = sni_hostname;
        self
    }

    pub fn sasl_identity(&self) -> Option<Arc<SaslIdentity>> {
        self.sasl.load_full()
    }

    fn set_sasl_identity(&self, identity: SaslIdentity) {
        self.sasl.store(Some(Arc::new(identity)));
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}", self.id, self.virtual_cluster)?;
        if let Some(node_id) = self.node_id {
            write!(f, " node={}", node_id)?;
        }
        if let Some(peer) = self.peer {
            write!(f, " peer={}", peer)?;
        }
        f.write_str("]")
    }
}

/// A request a filter sends upstream on its own behalf.
pub(crate) struct OutOfBandRequest {
    /// Chain index of the issuing filter.
    pub(crate) issuer: usize,
    pub(crate) frame: RequestFrame,
    pub(crate) promise: oneshot::Sender<Result<Bytes, FilterError>>,
}

/// Per-filter, per-connection context.
#[derive(Clone)]
pub struct FilterContext {
    index: usize,
    filter_name: Arc<str>,
    connection: Arc<ConnectionInfo>,
    out_of_band: mpsc::UnboundedSender<OutOfBandRequest>,
}

impl FilterContext {
    pub(crate) fn new(
        index: usize,
        filter_name: Arc<str>,
        connection: Arc<ConnectionInfo>,
        out_of_band: mpsc::UnboundedSender<OutOfBandRequest>,
    ) -> Self {
        Self {
            index,
            filter_name,
            connection,
            out_of_band,
        }
    }

    /// Position of this filter in its chain, 0 being closest to the client.
    pub fn filter_index(&self) -> usize {
        self.index
    }

    pub fn filter_name(&self) -> &str {
        &self.filter_name
    }

    /// Short human-readable description of the connection, for logs.
    pub fn channel_descriptor(&self) -> String {
        self.connection.to_string()
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn sni_hostname(&self) -> Option<&str> {
        self.connection.sni_hostname.as_deref()
    }

    /// Authorized id of a successful SASL exchange, if one happened.
    pub fn authorized_id(&self) -> Option<String> {
        self.connection.sasl_identity().map(|id| id.authorized_id.clone())
    }

    /// Record that the client authenticated; later filters observe the identity.
    pub fn client_sasl_authentication_success(&self, mechanism: impl Into<String>, authorized_id: impl Into<String>) {
        let identity = SaslIdentity {
            mechanism: mechanism.into(),
            authorized_id: authorized_id.into(),
        };
        tracing::debug!(
            channel = %self.connection,
            filter = %self.filter_name,
            mechanism = %identity.mechanism,
            authorized_id = %identity.authorized_id,
            "SASL authentication recorded"
        );
        self.connection.set_sasl_identity(identity);
    }

    pub fn forward_request(&self, header: RequestHeader, body: Bytes) -> Result<RequestFilterResult, FilterError> {
        Ok(RequestFilterResult::forward(header, body))
    }

    pub fn forward_response(&self, header: ResponseHeader, body: Bytes) -> Result<ResponseFilterResult, FilterError> {
        Ok(ResponseFilterResult::forward(header, body))
    }

    pub fn short_circuit_response(&self, body: Bytes) -> Result<RequestFilterResult, FilterError> {
        Ok(RequestFilterResult::short_circuit(body))
    }

    /// Drop the frame and close the connection.
    pub fn close_connection(&self) -> Result<RequestFilterResult, FilterError> {
        Ok(RequestFilterResult::drop_request().with_close_connection())
    }

    pub fn request_filter_result_builder(&self) -> RequestFilterResultBuilder {
        RequestFilterResultBuilder::default()
    }

    pub fn response_filter_result_builder(&self) -> ResponseFilterResultBuilder {
        ResponseFilterResultBuilder::default()
    }

    /// Send a request upstream independently of client traffic.
    ///
    /// The request passes through the filters between this one and the
    /// upstream; its response comes back through the same filters and then
    /// resolves the returned future instead of reaching the client.
    pub fn send_request(
        &self,
        header: RequestHeader,
        body: Bytes,
    ) -> impl Future<Output = Result<Bytes, FilterError>> + Send + 'static {
        let (promise, response) = oneshot::channel();
        let request = OutOfBandRequest {
            issuer: self.index,
            frame: RequestFrame {
                header,
                body,
                has_response: true,
            },
            promise,
        };
        let submitted = self.out_of_band.send(request).is_ok();
        async move {
            if !submitted {
                return Err(FilterError::ConnectionClosed);
            }
            response.await.map_err(|_| FilterError::ConnectionClosed)?
        }
    }
}

impl fmt::Debug for FilterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterContext")
            .field("index", &self.index)
            .field("filter_name", &self.filter_name)
            .field("connection", &self.connection.id)
            .finish()
    }
}
