//! Registry client behavior against a stub HTTP server.

use arca_ingest::models::{GenericFile, WorkItem};
use arca_ingest::registry::{RegistryClient, WorkItemQuery};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> RegistryClient {
    RegistryClient::with_credentials(&server.uri(), "v2", "ops@arca.org", "secret-key").unwrap()
}

fn work_item_json(id: i64) -> serde_json::Value {
    json!({
        "id": id,
        "name": "inst.edu.photos.tar",
        "bucket": "arca.receiving.inst.edu",
        "etag": "abc123",
        "size": 1024,
        "institution": "inst.edu",
        "action": "Ingest",
        "stage": "Receive",
        "status": "Pending",
        "retry": true
    })
}

#[tokio::test]
async fn test_credentials_ride_as_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/items"))
        .and(header("X-Registry-User", "ops@arca.org"))
        .and(header("X-Registry-Key", "secret-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 1,
            "results": [work_item_json(5)]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let items = client(&server)
        .work_items(&WorkItemQuery::default())
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, 5);
    assert_eq!(items[0].name, "inst.edu.photos.tar");
}

#[tokio::test]
async fn test_work_item_query_params() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/items"))
        .and(query_param("name", "inst.edu.photos.tar"))
        .and(query_param("etag", "abc123"))
        .and(query_param("item_action", "Ingest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 0,
            "results": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let query = WorkItemQuery {
        name: Some("inst.edu.photos.tar".to_string()),
        etag: Some("abc123".to_string()),
        item_action: Some("Ingest".to_string()),
        ..Default::default()
    };
    let items = client(&server).work_items(&query).await.unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn test_object_get_returns_none_on_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/objects/inst.edu%2Fbag"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let object = client(&server)
        .intellectual_object_get("inst.edu/bag")
        .await
        .unwrap();
    assert!(object.is_none());
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/objects/inst.edu%2Fbag"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client(&server)
        .intellectual_object_get("inst.edu/bag")
        .await
        .unwrap_err();
    assert!(err.is_transient(), "5xx should classify as transient: {}", err);
}

#[tokio::test]
async fn test_work_item_create_and_update() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/items"))
        .respond_with(ResponseTemplate::new(201).set_body_json(work_item_json(42)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v2/items/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(work_item_json(42)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let item = WorkItem::new_ingest(
        "inst.edu.photos.tar",
        "arca.receiving.inst.edu",
        "abc123",
        1024,
        "inst.edu",
        None,
    );
    let created = client.work_item_create(&item).await.unwrap();
    assert_eq!(created.id, 42);

    // A non-zero id routes through PUT.
    client.work_item_save(&created).await.unwrap();
}

#[tokio::test]
async fn test_checksum_list_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/checksums"))
        .and(query_param(
            "generic_file_identifier",
            "inst.edu/bag/data/hello.txt",
        ))
        .and(query_param("algorithm", "sha256"))
        .and(query_param("sort", "datetime DESC"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 1,
            "results": [{
                "id": 9,
                "generic_file_id": 77,
                "algorithm": "sha256",
                "digest": "abc",
                "datetime": "2025-06-01T00:00:00Z"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let checksums = client(&server)
        .checksum_list("inst.edu/bag/data/hello.txt", "sha256")
        .await
        .unwrap();
    assert_eq!(checksums.len(), 1);
    assert_eq!(checksums[0].generic_file_id, 77);
    assert_eq!(checksums[0].digest, "abc");
}

fn generic_file_json(id: i64, identifier: &str) -> serde_json::Value {
    json!({
        "id": id,
        "identifier": identifier,
        "intellectual_object_identifier": "inst.edu/bag",
        "intellectual_object_id": 3,
        "size": 6,
        "file_format": "text/plain",
        "uri": format!("https://s3.us-east-1.amazonaws.com/arca-preservation/{}", id),
        "checksums": [],
        "premis_events": []
    })
}

#[tokio::test]
async fn test_batch_create_returns_created_files() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/files/batch"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "count": 2,
            "results": [
                generic_file_json(1, "inst.edu/bag/data/a.txt"),
                generic_file_json(2, "inst.edu/bag/data/b.txt")
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let files = vec![
        GenericFile::new("inst.edu/bag", "data/a.txt"),
        GenericFile::new("inst.edu/bag", "data/b.txt"),
    ];
    let saved = client(&server).generic_file_save_batch(&files).await.unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0].id, 1);
}

#[tokio::test]
async fn test_batch_create_partial_success_surfaces_created_rows() {
    let server = MockServer::start().await;
    // The registry failed midway but reports the row it did create.
    Mock::given(method("POST"))
        .and(path("/api/v2/files/batch"))
        .respond_with(ResponseTemplate::new(502).set_body_json(json!({
            "count": 1,
            "results": [generic_file_json(1, "inst.edu/bag/data/a.txt")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let files = vec![
        GenericFile::new("inst.edu/bag", "data/a.txt"),
        GenericFile::new("inst.edu/bag", "data/b.txt"),
    ];
    let saved = client(&server).generic_file_save_batch(&files).await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].identifier, "inst.edu/bag/data/a.txt");
}

#[tokio::test]
async fn test_batch_create_total_failure_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/files/batch"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let files = vec![GenericFile::new("inst.edu/bag", "data/a.txt")];
    assert!(client(&server).generic_file_save_batch(&files).await.is_err());
}

#[tokio::test]
async fn test_premis_event_save() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/events"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 11,
            "identifier": "e8b2b9d0-1111-2222-3333-444455556666",
            "type": "ingest",
            "date_time": "2025-06-01T00:00:00Z",
            "detail": "Copied all files to preservation bucket",
            "outcome": "Success",
            "outcome_detail": "2 files copied",
            "object": "arca store worker + S3 client",
            "agent": "https://github.com/arca-preservation/arca"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let event = arca_ingest::models::PremisEvent::object_ingest(2);
    let saved = client(&server).premis_event_save(&event).await.unwrap();
    assert_eq!(saved.id, 11);
}
