use cryptsync_lib::storage::{RemoteStore, WebDavStorage};
use cryptsync_lib::SyncError;
use wiremock::matchers::{basic_auth, body_bytes, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/cryptsync/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/cryptsync/abc</d:href>
    <d:propstat><d:prop>
      <d:resourcetype/>
      <d:getcontentlength>40</d:getcontentlength>
      <d:getlastmodified>Tue, 02 Jan 2024 10:00:00 GMT</d:getlastmodified>
    </d:prop></d:propstat>
  </d:response>
</d:multistatus>"#;

fn storage(server: &MockServer) -> WebDavStorage {
    WebDavStorage::new(&server.uri(), "alice", "dav-pass", None).unwrap()
}

async fn base_exists(server: &MockServer) {
    Mock::given(method("PROPFIND"))
        .and(path("/cryptsync/"))
        .and(header("Depth", "0"))
        .respond_with(ResponseTemplate::new(207).set_body_string(LISTING))
        .mount(server)
        .await;
}

#[tokio::test]
async fn missing_base_directory_is_created_once() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/cryptsync/"))
        .and(header("Depth", "0"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("MKCOL"))
        .and(path("/cryptsync/"))
        .and(basic_auth("alice", "dav-pass"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .expect(2)
        .mount(&server)
        .await;

    let dav = storage(&server);
    assert!(dav.test_connection().await);
    dav.upload_file("a.md", b"1".to_vec(), "one").await.unwrap();
    dav.upload_file("b.md", b"2".to_vec(), "two").await.unwrap();
}

#[tokio::test]
async fn listing_skips_collections() {
    let server = MockServer::start().await;
    base_exists(&server).await;
    Mock::given(method("PROPFIND"))
        .and(path("/cryptsync/"))
        .and(header("Depth", "1"))
        .respond_with(ResponseTemplate::new(207).set_body_string(LISTING))
        .expect(1)
        .mount(&server)
        .await;

    let objects = storage(&server).list_files().await.unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].name, "abc");
    assert_eq!(objects[0].size, 40);
    assert_eq!(objects[0].last_modified, 1_704_189_600_000);
}

#[tokio::test]
async fn put_get_delete() {
    let server = MockServer::start().await;
    base_exists(&server).await;
    Mock::given(method("PUT"))
        .and(path("/cryptsync/abc"))
        .and(body_bytes(b"sealed".to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/cryptsync/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"sealed".to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/cryptsync/abc"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let dav = storage(&server);
    dav.upload_file("a.md", b"sealed".to_vec(), "abc").await.unwrap();
    assert_eq!(dav.download_file("abc").await.unwrap(), b"sealed");
    dav.delete_file("abc").await.unwrap();
}

#[tokio::test]
async fn not_found_semantics() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dav = storage(&server);
    let err = dav.download_file("gone").await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(ref name) if name == "gone"));
    dav.delete_file("gone").await.unwrap();
}

#[tokio::test]
async fn single_attempt_on_server_error() {
    let server = MockServer::start().await;
    base_exists(&server).await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let err = storage(&server)
        .upload_file("a.md", b"x".to_vec(), "abc")
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(503));
}

#[tokio::test]
async fn diagnose_reports_unreachable_root() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let report = storage(&server).diagnose().await;
    assert!(report.contains("401"), "{}", report);
}
