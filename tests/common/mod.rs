//! Shared utilities for integration tests.

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

use vcluster_proxy::cluster::{AddressingStrategy, HostPort, VirtualCluster};
use vcluster_proxy::frame::codec;
use vcluster_proxy::frame::{ApiKey, ResponseFrame, ResponseHeader};
use vcluster_proxy::net::endpoint::Endpoint;
use vcluster_proxy::registry::{SocketBinder, SocketHandle};

/// Socket binder that records binds and unbinds instead of touching the network.
#[derive(Default)]
pub struct RecordingBinder {
    events: Arc<Mutex<Vec<BindEvent>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindEvent {
    Bind(Endpoint),
    Unbind(Endpoint),
}

impl RecordingBinder {
    pub fn events(&self) -> Vec<BindEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn bind_count(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, BindEvent::Bind(_))).count()
    }

    pub fn unbind_count(&self) -> usize {
        self.events().iter().filter(|e| matches!(e, BindEvent::Unbind(_))).count()
    }
}

struct RecordedHandle {
    endpoint: Endpoint,
    events: Arc<Mutex<Vec<BindEvent>>>,
}

impl SocketHandle for RecordedHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        self.events.lock().unwrap().push(BindEvent::Unbind(self.endpoint.clone()));
        futures_util::future::ready(()).boxed()
    }
}

impl SocketBinder for RecordingBinder {
    fn bind(&self, endpoint: &Endpoint) -> BoxFuture<'static, io::Result<Box<dyn SocketHandle>>> {
        self.events.lock().unwrap().push(BindEvent::Bind(endpoint.clone()));
        let handle = RecordedHandle {
            endpoint: endpoint.clone(),
            events: Arc::clone(&self.events),
        };
        futures_util::future::ready(Ok(Box::new(handle) as Box<dyn SocketHandle>)).boxed()
    }
}

pub fn port_per_node_cluster(name: &str, port: u16, node_count: u32) -> Arc<VirtualCluster> {
    Arc::new(
        VirtualCluster::new(
            name,
            HostPort::new("upstream.internal", 9092),
            AddressingStrategy::PortPerNode {
                bootstrap: HostPort::new("localhost", port),
                bind_address: None,
                node_start_port: port + 1,
                lowest_node_id: 0,
                node_count,
            },
        )
        .unwrap(),
    )
}

/// SNI-routed cluster with bootstrap `domain` and nodes `broker-N.domain`.
pub fn sni_cluster(name: &str, domain: &str, port: u16) -> Arc<VirtualCluster> {
    Arc::new(
        VirtualCluster::new(
            name,
            HostPort::new("upstream.internal", 9092),
            AddressingStrategy::SniRouting {
                bootstrap: HostPort::new(domain, port),
                bind_address: None,
                node_host_pattern: format!("broker-$(nodeId).{domain}"),
                pre_bound_node_ids: vec![0],
            },
        )
        .unwrap(),
    )
}

/// Start a mock broker that answers every request with
/// `"<api name>:<client id>"` and returns its address.
pub async fn start_mock_broker() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.into_split();
                while let Ok(Some(request)) = codec::read_request(&mut reader, 1 << 20).await {
                    if !request.has_response {
                        continue;
                    }
                    let body = format!(
                        "{}:{}",
                        request.header.api_key.name(),
                        request.header.client_id.as_deref().unwrap_or("")
                    );
                    let response = ResponseFrame {
                        api_key: request.header.api_key,
                        api_version: request.header.api_version,
                        header: ResponseHeader {
                            correlation_id: request.correlation_id(),
                        },
                        body: Bytes::from(body),
                    };
                    if codec::write_response(&mut writer, &response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// Metadata v1 response body listing `nodes`, with no controller and no topics.
pub fn metadata_v1_body(nodes: &[(i32, SocketAddr)]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_i32(nodes.len() as i32);
    for (node_id, addr) in nodes {
        let host = addr.ip().to_string();
        body.put_i32(*node_id);
        body.put_i16(host.len() as i16);
        body.put_slice(host.as_bytes());
        body.put_i32(i32::from(addr.port()));
        body.put_i16(-1);
    }
    body.put_i32(-1);
    body.put_i32(0);
    body.freeze()
}

/// Start a bootstrap broker that answers metadata with `nodes` and every
/// other request with `"bootstrap:<api name>"`.
pub async fn start_metadata_broker(nodes: Vec<(i32, SocketAddr)>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let metadata = metadata_v1_body(&nodes);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let metadata = metadata.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.into_split();
                while let Ok(Some(request)) = codec::read_request(&mut reader, 1 << 20).await {
                    let body = match request.header.api_key {
                        ApiKey::Metadata => metadata.clone(),
                        other => Bytes::from(format!("bootstrap:{}", other.name())),
                    };
                    let response = ResponseFrame {
                        api_key: request.header.api_key,
                        api_version: request.header.api_version,
                        header: ResponseHeader {
                            correlation_id: request.correlation_id(),
                        },
                        body,
                    };
                    if codec::write_response(&mut writer, &response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}
