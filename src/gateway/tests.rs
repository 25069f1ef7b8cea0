//! Gateway Module Tests
//!
//! Validates routing and the gateway's HTTP surface without a running store.
//!
//! ## Test Scopes
//! - **Partitioner**: Deterministic hashing and the single-partition default.
//! - **Resolvers**: Static resolution and failure reporting.
//! - **Router**: Status mapping for unreachable stores, the file allow-list and the request counter.

#[cfg(test)]
mod tests {
    use crate::gateway::error::GatewayError;
    use crate::gateway::handlers::{GatewayState, HealthResponse, router};
    use crate::gateway::partitioner::Partitioner;
    use crate::gateway::proxy::PartitionGateway;
    use crate::gateway::resolver::{PartitionResolver, ReplicaSetResolver, StaticResolver};
    use crate::storage::types::PartitionId;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    // Nothing listens on port 1, so connections are refused immediately.
    const UNREACHABLE: &str = "http://127.0.0.1:1";

    /// Resolves to a fixed endpoint and counts invalidations.
    struct RecordingResolver {
        endpoint: String,
        invalidated: AtomicUsize,
    }

    #[async_trait]
    impl PartitionResolver for RecordingResolver {
        async fn resolve(&self, _partition: PartitionId) -> Result<String, GatewayError> {
            Ok(self.endpoint.clone())
        }

        fn invalidate(&self, _partition: PartitionId, endpoint: &str) {
            assert_eq!(endpoint, self.endpoint);
            self.invalidated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unreachable_gateway() -> Arc<PartitionGateway> {
        Arc::new(
            PartitionGateway::new(
                Partitioner::default(),
                Arc::new(StaticResolver::new(UNREACHABLE)),
            )
            .with_read_attempts(1),
        )
    }

    fn app(gateway: Arc<PartitionGateway>, static_dir: PathBuf) -> axum::Router {
        router(GatewayState {
            gateway,
            static_dir,
        })
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    // ============================================================
    // PARTITIONER TESTS
    // ============================================================

    #[test]
    fn test_default_partitioner_routes_everything_to_zero() {
        let partitioner = Partitioner::default();
        assert_eq!(partitioner.num_partitions(), 1);
        for key in ["cats", "dogs", "", "a/b"] {
            assert_eq!(partitioner.get_partition(key), 0);
        }
        assert_eq!(partitioner.partitions().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_partition_is_deterministic_and_in_range() {
        let partitioner = Partitioner::new(16);
        assert_eq!(
            partitioner.get_partition("cats"),
            partitioner.get_partition("cats")
        );

        let mut used = std::collections::HashSet::new();
        for i in 0..1000 {
            let partition = partitioner.get_partition(&format!("key_{}", i));
            assert!(partition < 16);
            used.insert(partition);
        }
        assert!(used.len() > 8, "Keys should spread over partitions");
    }

    #[test]
    fn test_zero_partitions_means_one() {
        assert_eq!(Partitioner::new(0).num_partitions(), 1);
    }

    // ============================================================
    // RESOLVER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_static_resolver_normalizes_address() {
        let resolver = StaticResolver::new("127.0.0.1:7000/");
        assert_eq!(resolver.resolve(0).await.unwrap(), "http://127.0.0.1:7000");
        resolver.invalidate(0, "http://127.0.0.1:7000");
        assert_eq!(resolver.resolve(3).await.unwrap(), "http://127.0.0.1:7000");
    }

    #[tokio::test]
    async fn test_replica_set_without_primary_reports_no_primary() {
        let resolver = ReplicaSetResolver::new(vec![UNREACHABLE.to_string()]);
        let result = resolver.resolve(0).await;
        assert!(matches!(result, Err(GatewayError::NoPrimary { partition: 0 })));
        assert!(resolver.cached(0).is_none());
    }

    #[tokio::test]
    async fn test_route_uses_partitioner_and_resolver() {
        let gateway = PartitionGateway::new(
            Partitioner::default(),
            Arc::new(StaticResolver::new("store:7000")),
        );
        let endpoint = gateway.route("cats").await.unwrap();
        assert_eq!(endpoint.partition, 0);
        assert_eq!(endpoint.address, "http://store:7000");
    }

    // ============================================================
    // FORWARDING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_failed_write_invalidates_route_once() {
        let resolver = Arc::new(RecordingResolver {
            endpoint: UNREACHABLE.to_string(),
            invalidated: AtomicUsize::new(0),
        });
        let gateway = PartitionGateway::new(Partitioner::default(), resolver.clone());

        let result = gateway.forward_increment("cats", "activity").await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
        assert_eq!(resolver.invalidated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_read_is_retried_and_re_resolved() {
        let resolver = Arc::new(RecordingResolver {
            endpoint: UNREACHABLE.to_string(),
            invalidated: AtomicUsize::new(0),
        });
        let gateway =
            PartitionGateway::new(Partitioner::default(), resolver.clone()).with_read_attempts(2);

        let result = gateway.forward_get("activity").await;
        assert!(matches!(result, Err(GatewayError::Transport(_))));
        assert_eq!(resolver.invalidated.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            GatewayError::NoPrimary { partition: 0 }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Decode("bad".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Upstream {
                status: StatusCode::CONFLICT
            }
            .status(),
            StatusCode::CONFLICT
        );
    }

    // ============================================================
    // ROUTER TESTS
    // ============================================================

    #[tokio::test]
    async fn test_router_unreachable_store_is_bad_gateway() {
        let app = app(unreachable_gateway(), PathBuf::from("."));

        let response = app
            .clone()
            .oneshot(request("POST", "/api/cats"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = app.oneshot(request("GET", "/api/votes")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_router_delete_is_not_found() {
        let app = app(unreachable_gateway(), PathBuf::from("."));

        let response = app.oneshot(request("DELETE", "/api/cats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_router_serves_only_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>Votes</h1>").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "hidden").unwrap();
        let app = app(unreachable_gateway(), dir.path().to_path_buf());

        let response = app
            .clone()
            .oneshot(request("GET", "/api/index.html"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/html")
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<h1>Votes</h1>");

        for uri in ["/api/secret.txt", "/api/..%2Fsecret.txt", "/api/index.htm"] {
            let response = app.clone().oneshot(request("GET", uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_router_missing_index_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(unreachable_gateway(), dir.path().to_path_buf());

        let response = app.oneshot(request("GET", "/api/index.html")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_router_counts_requests() {
        let gateway = unreachable_gateway();
        let app = app(gateway.clone(), PathBuf::from("."));

        for uri in ["/api/cats", "/api/dogs"] {
            app.clone().oneshot(request("DELETE", uri)).await.unwrap();
        }
        app.clone()
            .oneshot(request("GET", "/api/nothing.txt"))
            .await
            .unwrap();
        assert_eq!(gateway.request_count(), 3);

        let response = app.oneshot(request("GET", "/health")).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.requests, 3);
    }
}
