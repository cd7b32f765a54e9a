//! End-to-end tests: signed CloudKit queries, Firestore writes and Storage
//! uploads, all against local mock servers.

#![allow(clippy::pedantic)]

use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;
use tempfile::{NamedTempFile, TempDir};
use wiremock::matchers::{
    body_partial_json, header, header_exists, method, path, path_regex, query_param,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cloudkit_migrate::{Error, MigrationConfig, Pipeline};

const EC_KEY: &str = include_str!("fixtures/test_ec_key.pem");
const QUERY_PATH: &str = "/database/1/iCloud.com.example.App/production/public/records/query";
const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

fn key_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(EC_KEY.as_bytes()).unwrap();
    file
}

fn cloudkit_config(server: &str, key: &Path, dry_run: bool) -> MigrationConfig {
    let yaml = format!(
        r#"
source:
  type: cloudkit
  container: iCloud.com.example.App
  base_url: {server}
  key_id: test-key
  key_file: {key}
destination:
  project_id: demo
  bucket: bucket
  credentials:
    access_token: test-token
  firestore_url: {server}
  storage_url: {server}
  public_url: {server}
record_types:
  - record_type: Products
    collection: products
    asset_fields: [imageURL1]
  - record_type: Orders
options:
  dry_run: {dry_run}
"#,
        server = server,
        key = key.display(),
        dry_run = dry_run
    );
    let config = MigrationConfig::from_yaml(&yaml).unwrap();
    config.validate().unwrap();
    config
}

async fn mount_cloudkit(server: &MockServer) {
    let products = json!({
        "records": [
            {
                "recordName": "P-1",
                "recordType": "Products",
                "fields": {
                    "name": {"type": "STRING", "value": "Chair"},
                    "price": {"type": "DOUBLE", "value": 49.5},
                    "imageURL1": {"type": "ASSETID", "value": {
                        "downloadURL": format!("{}/download/p1", server.uri()),
                        "size": 8
                    }}
                }
            },
            {
                "recordName": "P-2",
                "recordType": "Products",
                "fields": {
                    "name": {"type": "STRING", "value": "Lamp"},
                    "createdAt": {"type": "TIMESTAMP", "value": 1_700_000_000_123_i64}
                }
            }
        ]
    });
    let orders = json!({
        "records": [
            {
                "recordName": "O-1",
                "recordType": "Orders",
                "fields": {
                    "product": {"type": "REFERENCE", "value": {"recordName": "P-1"}},
                    "quantity": {"type": "INT64", "value": 2}
                }
            }
        ]
    });

    Mock::given(method("POST"))
        .and(path(QUERY_PATH))
        .and(header("X-Apple-CloudKit-Request-KeyID", "test-key"))
        .and(header_exists("X-Apple-CloudKit-Request-ISO8601Date"))
        .and(header_exists("X-Apple-CloudKit-Request-SignatureV1"))
        .and(body_partial_json(json!({"query": {"recordType": "Products"}, "resultsLimit": 200})))
        .respond_with(ResponseTemplate::new(200).set_body_json(products))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(QUERY_PATH))
        .and(body_partial_json(json!({"query": {"recordType": "Orders"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(orders))
        .mount(server)
        .await;
}

async fn mount_destination(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/download/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/upload/storage/v1/b/bucket/o"))
        .and(query_param("name", "migrated/P-1/imageURL1.png"))
        .and(header("Content-Type", "image/png"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/storage/v1/b/bucket/o/.+/acl$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;

    Mock::given(method("PATCH"))
        .and(path_regex(r"^/v1/projects/demo/databases/\(default\)/documents/"))
        .and(header("Authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
}

async fn written_documents(server: &MockServer) -> Vec<(String, Value)> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "PATCH")
        .map(|r| {
            let body: Value = serde_json::from_slice(&r.body).unwrap();
            (r.url.path().to_string(), body)
        })
        .collect()
}

fn document<'a>(docs: &'a [(String, Value)], suffix: &str) -> &'a Value {
    &docs
        .iter()
        .find(|(path, _)| path.ends_with(suffix))
        .unwrap_or_else(|| panic!("no write for {}", suffix))
        .1
}

#[tokio::test]
async fn test_cloudkit_to_firestore_end_to_end() {
    let server = MockServer::start().await;
    mount_cloudkit(&server).await;
    mount_destination(&server).await;
    let key = key_file();

    let pipeline = Pipeline::from_config(cloudkit_config(&server.uri(), key.path(), false))
        .await
        .unwrap();
    let stats = pipeline.run().await.unwrap();

    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.migrated, 3);
    assert!(stats.is_clean());

    let docs = written_documents(&server).await;
    assert_eq!(docs.len(), 3);

    let chair = document(&docs, "/documents/products/P-1");
    assert_eq!(chair["fields"]["id"], json!({"stringValue": "P-1"}));
    assert_eq!(chair["fields"]["price"], json!({"doubleValue": 49.5}));
    assert_eq!(
        chair["fields"]["imageURL1"],
        json!({"stringValue": format!("{}/bucket/migrated/P-1/imageURL1.png", server.uri())})
    );

    let lamp = document(&docs, "/documents/products/P-2");
    assert_eq!(
        lamp["fields"]["createdAt"],
        json!({"timestampValue": "2023-11-14T22:13:20Z"})
    );

    let order = document(&docs, "/documents/orders/O-1");
    assert_eq!(order["fields"]["product"], json!({"stringValue": "P-1"}));
    assert_eq!(order["fields"]["quantity"], json!({"integerValue": "2"}));
}

#[tokio::test]
async fn test_dry_run_performs_no_writes() {
    let server = MockServer::start().await;
    mount_cloudkit(&server).await;
    mount_destination(&server).await;
    let key = key_file();

    let pipeline = Pipeline::from_config(cloudkit_config(&server.uri(), key.path(), true))
        .await
        .unwrap();
    let stats = pipeline.run().await.unwrap();

    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.skipped, 3);

    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() == QUERY_PATH));
}

#[tokio::test]
async fn test_rerun_writes_same_document_ids() {
    let server = MockServer::start().await;
    mount_cloudkit(&server).await;
    mount_destination(&server).await;
    let key = key_file();
    let config = cloudkit_config(&server.uri(), key.path(), false);

    for _ in 0..2 {
        let pipeline = Pipeline::from_config(config.clone()).await.unwrap();
        pipeline.run().await.unwrap();
    }

    let mut paths: Vec<String> = written_documents(&server)
        .await
        .into_iter()
        .map(|(path, _)| path)
        .collect();
    assert_eq!(paths.len(), 6);
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 3);
}

#[tokio::test]
async fn test_asset_mode_updates_only_asset_fields() {
    let server = MockServer::start().await;
    mount_cloudkit(&server).await;
    mount_destination(&server).await;
    let key = key_file();

    let pipeline = Pipeline::from_config(cloudkit_config(&server.uri(), key.path(), false))
        .await
        .unwrap();
    let stats = pipeline.run_assets().await.unwrap();

    assert_eq!(stats.total, 1);
    assert_eq!(stats.uploaded, 1);
    assert_eq!(stats.documents_updated, 1);

    let requests = server.received_requests().await.unwrap();
    let patch = requests
        .iter()
        .find(|r| r.method.as_str() == "PATCH")
        .unwrap();
    assert!(patch.url.path().ends_with("/documents/products/P-1"));
    assert_eq!(
        patch.url.query(),
        Some("updateMask.fieldPaths=imageURL1")
    );
    let body: Value = serde_json::from_slice(&patch.body).unwrap();
    assert_eq!(body["fields"].as_object().unwrap().len(), 1);
}

#[tokio::test]
async fn test_source_failure_skips_only_that_type() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(QUERY_PATH))
        .and(body_partial_json(json!({"query": {"recordType": "Products"}})))
        .respond_with(ResponseTemplate::new(401).set_body_string("AUTHENTICATION_FAILED"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(QUERY_PATH))
        .and(body_partial_json(json!({"query": {"recordType": "Orders"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "records": [{"recordName": "O-1", "fields": {}}]
        })))
        .mount(&server)
        .await;
    mount_destination(&server).await;
    let key = key_file();

    let pipeline = Pipeline::from_config(cloudkit_config(&server.uri(), key.path(), false))
        .await
        .unwrap();
    let stats = pipeline.run().await.unwrap();

    assert_eq!(stats.failed_types, vec!["Products".to_string()]);
    assert_eq!(stats.migrated, 1);
}

#[tokio::test]
async fn test_missing_signing_key_is_fatal() {
    let config = cloudkit_config(
        "http://localhost:9",
        Path::new("/nonexistent/eckey.pem"),
        false,
    );
    let err = Pipeline::from_config(config).await.unwrap_err();
    assert!(matches!(err, Error::AuthSetup(_)));
}

#[tokio::test]
async fn test_export_source_dry_run_without_credentials() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("products.json"),
        json!({"records": [
            {"recordName": "P-1", "recordType": "Products",
             "fields": {"name": {"type": "STRING", "value": "Chair"}}},
            {"recordName": "O-1", "recordType": "Orders", "fields": {}}
        ]})
        .to_string(),
    )
    .unwrap();

    let yaml = format!(
        r#"
source:
  type: export
  path: {}
destination:
  project_id: demo
  bucket: bucket
record_types:
  - record_type: Products
options:
  dry_run: true
"#,
        dir.path().display()
    );
    let config = MigrationConfig::from_yaml(&yaml).unwrap();
    config.validate().unwrap();

    let stats = Pipeline::from_config(config)
        .await
        .unwrap()
        .run().await.unwrap();
    assert_eq!(stats.fetched, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.per_type["Products"].fetched, 1);
}
