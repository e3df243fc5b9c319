//! HTTP resolver against a mock registry.

mod common;

use std::time::Duration;

use chartstash_core::{RegistryErrorKind, StashConfig, StashError};
use chartstash_registry::manifest::{
    CHART_CONFIG_MEDIA_TYPE, LEGACY_CHART_CONTENT_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use chartstash_registry::{
    Client, Descriptor, Digest, HttpResolver, Manifest, Metadata, Reference,
    RegistryAuth, Resolver,
};
use common::archive;
use tempfile::TempDir;
use wiremock::matchers::{body_bytes, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(dir: &TempDir) -> StashConfig {
    StashConfig {
        cache_root: dir.path().join("cache"),
        credentials_file: dir.path().join("registry.json"),
        plain_http: true,
        timeout_secs: 5,
        ..Default::default()
    }
}

fn reference(server: &MockServer, name: &str) -> Reference {
    Reference::parse(&format!("{}/charts/{}", server.address(), name)).unwrap()
}

async fn status_kind(status: u16) -> RegistryErrorKind {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/charts/mychart/manifests/1.0.0"))
        .respond_with(ResponseTemplate::new(status).set_body_string("{\"errors\":[]}"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let resolver = HttpResolver::new(&config(&dir)).unwrap();
    resolver
        .fetch_manifest(&reference(&server, "mychart:1.0.0"))
        .await
        .unwrap_err()
        .registry_kind()
        .unwrap()
}

#[tokio::test]
async fn test_status_mapping() {
    assert_eq!(status_kind(404).await, RegistryErrorKind::NotFound);
    assert_eq!(status_kind(401).await, RegistryErrorKind::Auth);
    assert_eq!(status_kind(403).await, RegistryErrorKind::Auth);
    assert_eq!(status_kind(500).await, RegistryErrorKind::Protocol);
    assert_eq!(status_kind(400).await, RegistryErrorKind::Protocol);
}

#[tokio::test]
async fn test_connection_refused_is_network() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let dir = TempDir::new().unwrap();
    let resolver = HttpResolver::new(&config(&dir)).unwrap();
    let reference = Reference::parse(&format!("127.0.0.1:{}/charts/mychart:1", port)).unwrap();

    let err = resolver.fetch_manifest(&reference).await.unwrap_err();
    assert_eq!(err.registry_kind(), Some(RegistryErrorKind::Network));
}

#[tokio::test]
async fn test_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.timeout_secs = 1;
    let resolver = HttpResolver::new(&config).unwrap();

    let err = resolver
        .fetch_manifest(&reference(&server, "mychart:1"))
        .await
        .unwrap_err();
    let kind = err.registry_kind().unwrap();
    assert_eq!(kind, RegistryErrorKind::Timeout);
    assert!(kind.is_network());
}

#[tokio::test]
async fn test_fetch_manifest_sends_accept_and_returns_media_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/charts/mychart/manifests/1.0.0"))
        .and(header_exists("accept"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"{}".to_vec())
                .insert_header("content-type", "application/vnd.oci.image.manifest.v1+json; charset=utf-8"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let resolver = HttpResolver::new(&config(&dir)).unwrap();
    let (body, media_type) = resolver
        .fetch_manifest(&reference(&server, "mychart:1.0.0"))
        .await
        .unwrap();
    assert_eq!(body, b"{}");
    assert_eq!(media_type, OCI_MANIFEST_MEDIA_TYPE);
}

#[tokio::test]
async fn test_blob_over_limit_is_protocol_error() {
    let server = MockServer::start().await;
    let digest = Digest::from_bytes(&[1u8; 100]);
    Mock::given(method("GET"))
        .and(path(format!("/v2/charts/mychart/blobs/{}", digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 100]))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.max_blob_size = 10;
    let resolver = HttpResolver::new(&config).unwrap();

    let err = resolver
        .fetch_blob(&reference(&server, "mychart:1"), &digest)
        .await
        .unwrap_err();
    assert_eq!(err.registry_kind(), Some(RegistryErrorKind::Protocol));
}

#[tokio::test]
async fn test_blob_exists() {
    let server = MockServer::start().await;
    let present = Digest::from_bytes(b"present");
    let absent = Digest::from_bytes(b"absent");
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/charts/mychart/blobs/{}", present)))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/charts/mychart/blobs/{}", absent)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let resolver = HttpResolver::new(&config(&dir)).unwrap();
    let reference = reference(&server, "mychart:1");
    assert!(resolver.blob_exists(&reference, &present).await.unwrap());
    assert!(!resolver.blob_exists(&reference, &absent).await.unwrap());
}

#[tokio::test]
async fn test_push_blob_skips_existing() {
    let server = MockServer::start().await;
    let data = b"already there";
    let digest = Digest::from_bytes(data);
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/charts/mychart/blobs/{}", digest)))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let resolver = HttpResolver::new(&config(&dir)).unwrap();
    let descriptor = resolver
        .push_blob(&reference(&server, "mychart:1"), data, CHART_CONFIG_MEDIA_TYPE)
        .await
        .unwrap();
    assert_eq!(descriptor, Descriptor::for_bytes(CHART_CONFIG_MEDIA_TYPE, data));
}

#[tokio::test]
async fn test_push_blob_upload_flow() {
    let server = MockServer::start().await;
    let data = b"new blob".to_vec();
    let digest = Digest::from_bytes(&data);
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/charts/mychart/blobs/{}", digest)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/charts/mychart/blobs/uploads/"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("location", "/v2/charts/mychart/blobs/uploads/session-1"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/charts/mychart/blobs/uploads/session-1"))
        .and(query_param("digest", digest.to_string()))
        .and(body_bytes(data.clone()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let resolver = HttpResolver::new(&config(&dir)).unwrap();
    let descriptor = resolver
        .push_blob(&reference(&server, "mychart:1"), &data, CHART_CONFIG_MEDIA_TYPE)
        .await
        .unwrap();
    assert_eq!(descriptor.digest, digest);
}

#[tokio::test]
async fn test_upload_without_location_is_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let resolver = HttpResolver::new(&config(&dir)).unwrap();
    let err = resolver
        .push_blob(&reference(&server, "mychart:1"), b"x", CHART_CONFIG_MEDIA_TYPE)
        .await
        .unwrap_err();
    assert_eq!(err.registry_kind(), Some(RegistryErrorKind::Protocol));
}

#[tokio::test]
async fn test_push_manifest() {
    let server = MockServer::start().await;
    let data = b"{\"schemaVersion\":2}".to_vec();
    Mock::given(method("PUT"))
        .and(path("/v2/charts/mychart/manifests/1.0.0"))
        .and(header("content-type", OCI_MANIFEST_MEDIA_TYPE))
        .and(body_bytes(data.clone()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let resolver = HttpResolver::new(&config(&dir)).unwrap();
    let descriptor = resolver
        .push_manifest(&reference(&server, "mychart:1.0.0"), &data, OCI_MANIFEST_MEDIA_TYPE)
        .await
        .unwrap();
    assert_eq!(descriptor.digest, Digest::from_bytes(&data));
}

#[tokio::test]
async fn test_stored_basic_credentials_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/charts/mychart/manifests/1"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{}".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let credentials = format!(
        r#"{{"registries": {{"{}": {{"username": "user", "password": "pass"}}}}}}"#,
        server.address()
    );
    std::fs::write(&config.credentials_file, credentials).unwrap();
    let resolver = HttpResolver::new(&config).unwrap();

    resolver
        .fetch_manifest(&reference(&server, "mychart:1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_fixed_bearer_token_is_sent() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let resolver = HttpResolver::new(&config(&dir))
        .unwrap()
        .with_auth(RegistryAuth::bearer("tok"));
    assert!(resolver
        .blob_exists(&reference(&server, "mychart:1"), &Digest::from_bytes(b"x"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_client_pull_over_http() {
    let server = MockServer::start().await;

    let metadata = Metadata::new("chart0", "0.1.0");
    let config_blob = serde_json::to_vec(&metadata).unwrap();
    let content = archive(&[
        ("chart0/Chart.yaml", serde_yaml::to_string(&metadata).unwrap().as_bytes()),
        ("chart0/values.yaml", b"replicas: 1\n"),
        ("chart0/templates/deployment.yaml", b"kind: Deployment\n"),
    ]);
    let manifest = Manifest::new(
        Descriptor::for_bytes(CHART_CONFIG_MEDIA_TYPE, &config_blob),
        vec![Descriptor::for_bytes(LEGACY_CHART_CONTENT_MEDIA_TYPE, &content)],
    );
    let manifest_bytes = manifest.to_vec().unwrap();

    Mock::given(method("GET"))
        .and(path("/v2/chart0/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(manifest_bytes.clone())
                .insert_header("content-type", OCI_MANIFEST_MEDIA_TYPE),
        )
        .expect(1)
        .mount(&server)
        .await;
    for (descriptor, data) in [(&manifest.config, &config_blob), (&manifest.layers[0], &content)] {
        Mock::given(method("GET"))
            .and(path(format!("/v2/chart0/blobs/{}", descriptor.digest)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let client = Client::new(&config(&dir)).unwrap();
    let locator = format!("{}/chart0:latest", server.address());

    let chart = client.pull(&locator).await.unwrap();
    assert_eq!(chart.metadata, metadata);
    assert_eq!(chart.files[0].name, "values.yaml");
    assert_eq!(chart.templates[0].name, "templates/deployment.yaml");

    let reference = Reference::parse(&locator).unwrap();
    let (_, descriptor) = client.cache().get_manifest(&reference).unwrap();
    assert_eq!(descriptor.digest, Digest::from_bytes(&manifest_bytes));

    // Cached charts load without the network.
    assert_eq!(client.load(&locator).unwrap(), chart);
}

#[tokio::test]
async fn test_client_pull_rejects_tampered_blob() {
    let server = MockServer::start().await;
    let config_blob = serde_json::to_vec(&Metadata::new("chart0", "0.1.0")).unwrap();
    let content = archive(&[("chart0/values.yaml", b"a: 1\n")]);
    let manifest = Manifest::new(
        Descriptor::for_bytes(CHART_CONFIG_MEDIA_TYPE, &config_blob),
        vec![Descriptor::for_bytes(LEGACY_CHART_CONTENT_MEDIA_TYPE, &content)],
    );

    Mock::given(method("GET"))
        .and(path("/v2/chart0/manifests/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(manifest.to_vec().unwrap()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/chart0/blobs/{}", manifest.config.digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(config_blob.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/chart0/blobs/{}", manifest.layers[0].digest)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not the archive".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = Client::new(&config(&dir)).unwrap();
    let locator = format!("{}/chart0:latest", server.address());

    assert!(matches!(
        client.pull(&locator).await,
        Err(StashError::Integrity { .. })
    ));
    assert!(client.load(&locator).unwrap_err().is_not_found());
}
