//! Registration lifecycle of virtual clusters against shared endpoints.

mod common;

use std::sync::Arc;

use common::{port_per_node_cluster, sni_cluster, BindEvent, RecordingBinder};
use vcluster_proxy::net::endpoint::Endpoint;
use vcluster_proxy::registry::{EndpointRegistry, EndpointResolutionError, RegistryError};

#[tokio::test]
async fn registering_twice_binds_once() {
    let binder = Arc::new(RecordingBinder::default());
    let registry = EndpointRegistry::new(binder.clone());
    let cluster = port_per_node_cluster("orders", 19192, 2);

    let first = registry.register(&cluster);
    let second = registry.register(&cluster);
    let (first, second) = tokio::join!(first, second);

    assert_eq!(first.unwrap(), Endpoint::any(19192, false));
    assert_eq!(second.unwrap(), Endpoint::any(19192, false));
    // bootstrap plus two node ports
    assert_eq!(binder.bind_count(), 3);
    assert!(registry.is_registered(&cluster));
}

#[tokio::test]
async fn sni_clusters_share_one_tls_port() {
    let binder = Arc::new(RecordingBinder::default());
    let registry = EndpointRegistry::new(binder.clone());
    let c1 = sni_cluster("c1", "a.example.com", 9192);
    let c2 = sni_cluster("c2", "b.example.com", 9192);

    registry.register(&c1).await.unwrap();
    registry.register(&c2).await.unwrap();
    assert_eq!(binder.events(), vec![BindEvent::Bind(Endpoint::any(9192, true))]);

    let a = registry.resolve(None, 9192, true, Some("A.Example.com")).await.unwrap();
    assert_eq!(a.cluster.name, "c1");
    assert!(a.is_bootstrap());
    let b = registry.resolve(None, 9192, true, Some("broker-0.b.example.com")).await.unwrap();
    assert_eq!(b.cluster.name, "c2");
    assert_eq!(b.node_id, Some(0));

    let unknown = registry.resolve(None, 9192, true, Some("c.example.com")).await;
    assert!(matches!(unknown, Err(EndpointResolutionError::UnknownRoutingKey { .. })));

    registry.deregister(&c1).await.unwrap();
    assert_eq!(binder.unbind_count(), 0);
    assert!(registry.resolve(None, 9192, true, Some("a.example.com")).await.is_err());

    registry.deregister(&c2).await.unwrap();
    assert_eq!(binder.unbind_count(), 1);
    assert!(registry.listening_endpoints().is_empty());
}

#[tokio::test]
async fn unknown_port_does_not_resolve() {
    let registry = EndpointRegistry::new(Arc::new(RecordingBinder::default()));
    registry.register(&port_per_node_cluster("orders", 19292, 1)).await.unwrap();

    let result = registry.resolve(None, 9999, false, None).await;
    assert!(matches!(result, Err(EndpointResolutionError::UnknownEndpoint(e)) if e.port == 9999));
}

#[tokio::test]
async fn plain_endpoints_are_not_shareable() {
    let binder = Arc::new(RecordingBinder::default());
    let registry = EndpointRegistry::new(binder.clone());
    let first = port_per_node_cluster("first", 19392, 1);
    let second = port_per_node_cluster("second", 19392, 1);

    registry.register(&first).await.unwrap();
    let err = registry.register(&second).await.unwrap_err();
    assert!(matches!(err, RegistryError::NonShareableEndpoint { .. }), "{err}");

    let binding = registry.resolve(None, 19392, false, None).await.unwrap();
    assert_eq!(binding.cluster.name, "first");
    assert_eq!(binder.bind_count(), 2);
}

#[tokio::test]
async fn reregistering_after_deregistration_binds_again() {
    let binder = Arc::new(RecordingBinder::default());
    let registry = EndpointRegistry::new(binder.clone());
    let cluster = port_per_node_cluster("orders", 19492, 1);

    registry.register(&cluster).await.unwrap();
    registry.deregister(&cluster).await.unwrap();
    assert!(!registry.is_registered(&cluster));
    assert_eq!(binder.unbind_count(), 2);

    registry.register(&cluster).await.unwrap();
    assert_eq!(binder.bind_count(), 4);
    assert_eq!(
        registry.listening_endpoints(),
        vec![Endpoint::any(19492, false), Endpoint::any(19493, false)]
    );
}

#[tokio::test]
async fn concurrent_deregistrations_unbind_once() {
    let binder = Arc::new(RecordingBinder::default());
    let registry = EndpointRegistry::new(binder.clone());
    let cluster = port_per_node_cluster("orders", 19792, 2);
    registry.register(&cluster).await.unwrap();

    let (first, second) = tokio::join!(registry.deregister(&cluster), registry.deregister(&cluster));
    first.unwrap();
    second.unwrap();

    // bootstrap plus two node ports, each closed exactly once
    assert_eq!(binder.unbind_count(), 3);
    let mut unbound: Vec<Endpoint> = binder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            BindEvent::Unbind(endpoint) => Some(endpoint),
            BindEvent::Bind(_) => None,
        })
        .collect();
    unbound.sort();
    unbound.dedup();
    assert_eq!(unbound.len(), 3);
    assert!(!registry.is_registered(&cluster));
}

#[tokio::test]
async fn registering_during_deregistration_ends_registered() {
    let binder = Arc::new(RecordingBinder::default());
    let registry = EndpointRegistry::new(binder.clone());
    let cluster = port_per_node_cluster("orders", 19892, 1);
    registry.register(&cluster).await.unwrap();

    let deregistration = registry.deregister(&cluster);
    let registration = registry.register(&cluster);
    let (deregistered, registered) = tokio::join!(deregistration, registration);
    deregistered.unwrap();
    assert_eq!(registered.unwrap(), Endpoint::any(19892, false));

    assert!(registry.is_registered(&cluster));
    assert_eq!(
        registry.listening_endpoints(),
        vec![Endpoint::any(19892, false), Endpoint::any(19893, false)]
    );
    assert_eq!(binder.unbind_count(), 2);
    assert_eq!(binder.bind_count(), 4);
    assert!(registry.resolve(None, 19893, false, None).await.is_ok());
}

#[tokio::test]
async fn shutdown_releases_every_endpoint() {
    let binder = Arc::new(RecordingBinder::default());
    let registry = EndpointRegistry::new(binder.clone());
    registry.register(&port_per_node_cluster("one", 19592, 1)).await.unwrap();
    registry.register(&sni_cluster("two", "two.example.com", 19692)).await.unwrap();

    registry.shutdown().await.unwrap();
    assert_eq!(binder.unbind_count(), binder.bind_count());
    assert!(registry.listening_endpoints().is_empty());
}
