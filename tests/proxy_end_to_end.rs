//! Full path: client → listener → filter chain → mock broker and back.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use vcluster_proxy::config::loader::parse_config;
use vcluster_proxy::frame::codec;
use vcluster_proxy::frame::{ApiKey, RequestFrame, RequestHeader};
use vcluster_proxy::{FilterFactoryRegistry, ProxyConfig, ProxyServer};

fn config(broker: std::net::SocketAddr, bootstrap_port: u16) -> ProxyConfig {
    let text = format!(
        r#"
        [network]
        connect_timeout_ms = 2000
        shutdown_grace_period_secs = 1

        [[virtual_clusters]]
        name = "tenant-a"
        target_bootstrap = "{broker}"
        filters = [{{ type = "client-id-prefix", config = {{ prefix = "a." }} }}]

        [virtual_clusters.addressing]
        type = "port-per-node"
        bootstrap = "127.0.0.1:{bootstrap_port}"
        bind_address = "127.0.0.1"
        node_start_port = {node_port}
        node_count = 1
        "#,
        node_port = bootstrap_port + 1,
    );
    parse_config(&text, &FilterFactoryRegistry::with_builtins()).unwrap()
}

fn request(api_key: ApiKey, correlation_id: u32) -> RequestFrame {
    RequestFrame::new(RequestHeader::new(api_key, 1, correlation_id).with_client_id("app"), Vec::new())
}

#[tokio::test]
async fn requests_flow_through_the_filter_chain_in_order() {
    let broker = common::start_mock_broker().await;
    let server = ProxyServer::start(config(broker, 29192), Arc::new(FilterFactoryRegistry::with_builtins()))
        .await
        .unwrap();
    assert_eq!(server.listening_endpoints().len(), 2);

    let client = TcpStream::connect("127.0.0.1:29192").await.unwrap();
    let (mut reader, mut writer) = client.into_split();
    codec::write_request(&mut writer, &request(ApiKey::Metadata, 7)).await.unwrap();
    codec::write_request(&mut writer, &request(ApiKey::ApiVersions, 8)).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), codec::read_response(&mut reader, 1 << 20))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let second = codec::read_response(&mut reader, 1 << 20).await.unwrap().unwrap();

    assert_eq!(first.correlation_id, 7);
    assert_eq!(&first.body[..], b"metadata:a.app");
    assert_eq!(second.correlation_id, 8);
    assert_eq!(&second.body[..], b"api_versions:a.app");

    drop(writer);
    drop(reader);
    assert!(server.shutdown(Duration::from_secs(2)).await);
    assert!(server.listening_endpoints().is_empty());
}

#[tokio::test]
async fn unlisted_api_keys_pass_through_the_proxy() {
    let broker = common::start_mock_broker().await;
    let server = ProxyServer::start(config(broker, 29492), Arc::new(FilterFactoryRegistry::with_builtins()))
        .await
        .unwrap();

    let client = TcpStream::connect("127.0.0.1:29492").await.unwrap();
    let (mut reader, mut writer) = client.into_split();
    codec::write_request(&mut writer, &request(ApiKey::Other(23), 9)).await.unwrap();
    codec::write_request(&mut writer, &request(ApiKey::Metadata, 10)).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), codec::read_response(&mut reader, 1 << 20))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let second = codec::read_response(&mut reader, 1 << 20).await.unwrap().unwrap();

    // the connection survives the unlisted key and keeps serving
    assert_eq!(first.correlation_id, 9);
    assert_eq!(&first.body[..], b"other:a.app");
    assert_eq!(second.correlation_id, 10);
    assert_eq!(&second.body[..], b"metadata:a.app");

    drop(writer);
    drop(reader);
    assert!(server.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn node_endpoints_forward_to_the_node_named_in_metadata() {
    let node = common::start_mock_broker().await;
    let bootstrap = common::start_metadata_broker(vec![(0, node)]).await;
    let server = ProxyServer::start(config(bootstrap, 29592), Arc::new(FilterFactoryRegistry::with_builtins()))
        .await
        .unwrap();

    // before discovery the node port falls back to the bootstrap target
    let before = TcpStream::connect("127.0.0.1:29593").await.unwrap();
    let (mut before_reader, mut before_writer) = before.into_split();
    codec::write_request(&mut before_writer, &request(ApiKey::ApiVersions, 1)).await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), codec::read_response(&mut before_reader, 1 << 20))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(&response.body[..], b"bootstrap:api_versions");

    let client = TcpStream::connect("127.0.0.1:29592").await.unwrap();
    let (mut reader, mut writer) = client.into_split();
    codec::write_request(&mut writer, &request(ApiKey::Metadata, 2)).await.unwrap();
    let metadata = tokio::time::timeout(Duration::from_secs(5), codec::read_response(&mut reader, 1 << 20))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(metadata.correlation_id, 2);
    assert_eq!(metadata.body, common::metadata_v1_body(&[(0, node)]));

    let after = TcpStream::connect("127.0.0.1:29593").await.unwrap();
    let (mut after_reader, mut after_writer) = after.into_split();
    codec::write_request(&mut after_writer, &request(ApiKey::ApiVersions, 3)).await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), codec::read_response(&mut after_reader, 1 << 20))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(&response.body[..], b"api_versions:a.app");

    drop((before_reader, before_writer, reader, writer, after_reader, after_writer));
    assert!(server.shutdown(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn reload_removes_clusters_and_their_listeners() {
    let broker = common::start_mock_broker().await;
    let server = ProxyServer::start(config(broker, 29292), Arc::new(FilterFactoryRegistry::with_builtins()))
        .await
        .unwrap();
    assert_eq!(server.cluster_names().await, vec!["tenant-a".to_string()]);

    server.apply_config(ProxyConfig::default()).await.unwrap();
    assert!(server.cluster_names().await.is_empty());
    assert!(server.listening_endpoints().is_empty());

    server.apply_config(config(broker, 29292)).await.unwrap();
    assert_eq!(server.listening_endpoints().len(), 2);
    assert!(server.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn startup_fails_when_a_port_is_taken() {
    let _occupied = std::net::TcpListener::bind("127.0.0.1:29392").unwrap();
    let broker = common::start_mock_broker().await;

    let result = ProxyServer::start(config(broker, 29392), Arc::new(FilterFactoryRegistry::with_builtins())).await;
    assert!(result.is_err());
}
