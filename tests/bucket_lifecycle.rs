//! Bucket lifecycle integration tests.
//!
//! Seeding, opening buckets and disconnecting through the public request interface.

#[allow(dead_code)]
mod common;

use common::*;
use kvcore::config::CoreConfig;
use kvcore::testing::{partitioned_bucket, InMemoryCluster};
use kvcore::{ClusterRequest, ConfigurationError, CoreError, CoreRequest, ResponseStatus};

fn open(bucket: &str, password: Option<&str>) -> ClusterRequest {
    ClusterRequest::OpenBucket {
        bucket: bucket.to_string(),
        password: password.map(str::to_string),
    }
}

fn seed(hosts: &[&str]) -> ClusterRequest {
    ClusterRequest::SeedNodes(hosts.iter().map(|h| h.to_string()).collect())
}

// =============================================================================
// Open Bucket Tests
// =============================================================================

#[tokio::test]
async fn test_open_bucket() {
    let test = TestCore::new(CoreConfig::development(), cluster_with(&["10.0.0.1"], 16));

    let response = test.core.send(seed(&["10.0.0.1"])).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Success);

    let response = test.core.send(open("default", None)).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Success);

    assert!(test.core.handler().nodes().contains("10.0.0.1"));
    assert!(test
        .core
        .handler()
        .configuration()
        .unwrap()
        .has_bucket("default"));
}

#[tokio::test]
async fn test_open_bucket_with_password() {
    let cluster = InMemoryCluster::new()
        .with_host("10.0.0.1")
        .with_bucket(partitioned_bucket("secure", &["10.0.0.1"], 16), Some("s3cret"));
    let test = TestCore::new(CoreConfig::development(), cluster);

    test.core.send(seed(&["10.0.0.1"])).await.unwrap();
    let response = test.core.send(open("secure", Some("s3cret"))).await.unwrap();
    assert!(response.is_success());
}

#[tokio::test]
async fn test_open_bucket_twice_is_noop() {
    let test = TestCore::new(CoreConfig::development(), cluster_with(&["10.0.0.1"], 16));
    test.open(&["10.0.0.1"], "default").await;
    let created = test.factory.created().len();

    let response = test.core.send(open("default", None)).await.unwrap();
    assert!(response.is_success());
    assert_eq!(test.factory.created().len(), created);
}

#[tokio::test]
async fn test_open_bucket_without_seed_nodes() {
    let test = TestCore::new(CoreConfig::development(), cluster_with(&["10.0.0.1"], 16));

    let result = test.core.send(open("default", None)).await;
    assert!(matches!(
        result,
        Err(CoreError::Configuration(ConfigurationError::NoSeedHosts))
    ));
}

#[tokio::test]
async fn test_open_bucket_with_empty_seed_list() {
    let test = TestCore::new(CoreConfig::development(), cluster_with(&["10.0.0.1"], 16));

    test.core.send(seed(&[])).await.unwrap();
    let result = test.core.send(open("default", None)).await;
    assert!(matches!(
        result,
        Err(CoreError::Configuration(ConfigurationError::EmptySeedList))
    ));
}

#[tokio::test]
async fn test_open_nonexistent_bucket() {
    let test = TestCore::new(CoreConfig::development(), cluster_with(&["10.0.0.1"], 16));

    test.core.send(seed(&["10.0.0.1"])).await.unwrap();
    let result = test.core.send(open("travel", None)).await;
    assert!(matches!(
        result,
        Err(CoreError::Configuration(ConfigurationError::BucketNotFound(ref b))) if b == "travel"
    ));
    assert!(test.core.handler().nodes().is_empty());
}

#[tokio::test]
async fn test_open_bucket_with_wrong_password() {
    let cluster = InMemoryCluster::new()
        .with_host("10.0.0.1")
        .with_bucket(partitioned_bucket("secure", &["10.0.0.1"], 16), Some("s3cret"));
    let test = TestCore::new(CoreConfig::development(), cluster);

    test.core.send(seed(&["10.0.0.1"])).await.unwrap();
    let result = test.core.send(open("secure", Some("wrong"))).await;
    assert!(matches!(
        result,
        Err(CoreError::Configuration(
            ConfigurationError::AuthenticationFailure(_)
        ))
    ));
}

#[tokio::test]
async fn test_open_bucket_with_unreachable_seeds() {
    let test = TestCore::new(CoreConfig::development(), cluster_with(&["10.0.0.1"], 16));

    test.core.send(seed(&["10.9.9.9", "10.9.9.8"])).await.unwrap();
    let result = test.core.send(open("default", None)).await;
    match result {
        Err(CoreError::Configuration(ConfigurationError::SeedsUnreachable(seeds))) => {
            assert_eq!(seeds, vec!["10.9.9.9".to_string(), "10.9.9.8".to_string()])
        }
        other => panic!("expected unreachable seeds, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_seed_falls_through_to_next() {
    let test = TestCore::new(CoreConfig::development(), cluster_with(&["10.0.0.1"], 16));

    test.core.send(seed(&["10.9.9.9", "10.0.0.1"])).await.unwrap();
    let response = test.core.send(open("default", None)).await.unwrap();
    assert!(response.is_success());
    assert_eq!(test.provider.loader().load_count(), 2);
}

// =============================================================================
// Data Requests Across The Lifecycle
// =============================================================================

#[tokio::test]
async fn test_request_before_open_is_bucket_not_open() {
    let test = TestCore::new(CoreConfig::development(), cluster_with(&["10.0.0.1"], 16));

    let response = test
        .core
        .send(CoreRequest::get("default", "key"))
        .await
        .unwrap();
    assert_eq!(response.status, ResponseStatus::BucketNotOpen);
}

#[tokio::test]
async fn test_disconnect_closes_everything() {
    let test = TestCore::new(
        CoreConfig::development(),
        cluster_with(&["10.0.0.1", "10.0.0.2"], 16),
    );
    test.open(&["10.0.0.1"], "default").await;
    assert_eq!(test.core.handler().nodes().len(), 2);

    let response = test.core.send(ClusterRequest::Disconnect).await.unwrap();
    assert!(response.is_success());
    assert!(test.core.is_shut_down());
    assert!(test.core.handler().nodes().is_empty());

    let factory = test.factory.clone();
    assert_eventually!(
        factory.created().iter().all(|s| s.disconnect_count() == 1),
        1000
    );

    let result = test.core.send(CoreRequest::get("default", "key")).await;
    assert!(matches!(result, Err(CoreError::Shutdown)));
}
