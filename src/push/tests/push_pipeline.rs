//! End-to-end push tests: an in-memory runtime and a mock kraud API.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kra_core::{ContentId, KraError, PushConfig};
use kra_push::hashing::sha256_of;
use kra_push::source::ArchiveStream;
use kra_push::{
    default_architecture, LocalImage, LocalImageSource, PushRequest, PushStatus, Pusher,
    RemoteClient, RenamedImage,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LAYERS: &str = "/apis/kraudcloud.com/v1/layers";
const IMAGES: &str = "/apis/kraudcloud.com/v1/images";

struct TestImage {
    local: LocalImage,
    archive: Vec<u8>,
    diff_ids: Vec<ContentId>,
}

/// Build a `docker save`-style archive. `declared` overrides the config's diff ids.
fn build_image(layers: &[&[u8]], declared: Option<Vec<ContentId>>) -> TestImage {
    let diff_ids: Vec<ContentId> = layers.iter().map(|l| sha256_of(l)).collect();
    let config = serde_json::to_vec(&json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {"Cmd": ["/app"]},
        "rootfs": {"type": "layers", "diff_ids": declared.unwrap_or_else(|| diff_ids.clone())},
    }))
    .unwrap();
    let config_id = sha256_of(&config);
    let config_name = format!("{}.json", config_id.hex());
    let layer_names: Vec<String> = (0..layers.len()).map(|i| format!("{i:02}/layer.tar")).collect();
    let manifest = serde_json::to_vec(&json!([{
        "Config": config_name,
        "RepoTags": ["svc:v2"],
        "Layers": layer_names,
    }]))
    .unwrap();

    let mut files: Vec<(String, Vec<u8>)> = vec![
        (config_name, config),
        ("manifest.json".to_string(), manifest),
    ];
    for (name, content) in layer_names.iter().zip(layers) {
        files.push((name.clone(), content.to_vec()));
    }

    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in &files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, &content[..]).unwrap();
    }
    let archive = builder.into_inner().unwrap();

    TestImage {
        local: LocalImage {
            id: config_id.to_string(),
            size: archive.len() as u64,
        },
        archive,
        diff_ids,
    }
}

#[derive(Default)]
struct FakeRuntime {
    images: HashMap<String, (LocalImage, Vec<u8>)>,
    exports: AtomicUsize,
}

impl FakeRuntime {
    fn with_image(reference: &str, image: &TestImage) -> Self {
        let mut runtime = Self::default();
        runtime.images.insert(
            reference.to_string(),
            (image.local.clone(), image.archive.clone()),
        );
        runtime
    }
}

#[async_trait]
impl LocalImageSource for FakeRuntime {
    async fn inspect(&self, reference: &str) -> kra_core::Result<Option<LocalImage>> {
        Ok(self.images.get(reference).map(|(image, _)| image.clone()))
    }

    async fn export(&self, image_id: &str) -> kra_core::Result<ArchiveStream> {
        self.exports.fetch_add(1, Ordering::SeqCst);
        let archive = self
            .images
            .values()
            .find(|(image, _)| image.id == image_id)
            .map(|(_, archive)| archive.clone())
            .ok_or_else(|| KraError::Runtime(format!("no such image {image_id}")))?;
        Ok(Box::new(Cursor::new(archive)))
    }
}

fn pusher(server: &MockServer, runtime: Arc<FakeRuntime>, work: &TempDir) -> Pusher {
    let config = PushConfig {
        api_url: server.uri(),
        token: Some("test-token".to_string()),
        work_dir: Some(work.path().to_path_buf()),
        max_concurrent_uploads: 2,
        ..Default::default()
    };
    let client = Arc::new(RemoteClient::new(&config).unwrap());
    Pusher::new(config, runtime, client.clone(), client).unwrap()
}

fn remote_record(aid: &str, oci_id: &str) -> Value {
    let mut record = json!({"aid": aid, "ref": "svc:v2"});
    record[default_architecture()] = json!({"ociID": oci_id, "size": 1024});
    record
}

async fn mount_remote_missing(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(format!("{IMAGES}/svc:v2")))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
}

async fn mount_created(server: &MockServer, aid: &str, renamed: &[&str]) {
    let renamed: Vec<Value> = renamed.iter().map(|r| json!({"ref": r})).collect();
    Mock::given(method("POST"))
        .and(path(IMAGES))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"created": {"aid": aid}, "renamed": renamed})),
        )
        .mount(server)
        .await;
}

async fn requests_with(server: &MockServer, verb: &str) -> Vec<wiremock::Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == verb)
        .collect()
}

fn is_empty_dir(dir: &TempDir) -> bool {
    std::fs::read_dir(dir.path()).unwrap().next().is_none()
}

#[tokio::test]
async fn pushes_only_missing_layers_and_registers_in_order() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    let image = build_image(&[b"layer d1", b"layer d2", b"layer d3"], None);
    let [d1, d2, d3] = [&image.diff_ids[0], &image.diff_ids[1], &image.diff_ids[2]];

    mount_remote_missing(&server).await;
    for present in [d1, d2] {
        Mock::given(method("PUT"))
            .and(path(LAYERS))
            .and(query_param("oid", present.as_str()))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("PUT"))
        .and(path(LAYERS))
        .and(query_param("oid", d3.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "lay-3"})))
        .expect(1)
        .mount(&server)
        .await;
    mount_created(&server, "img-2", &[]).await;

    let runtime = Arc::new(FakeRuntime::with_image("svc:v2", &image));
    let outcome = pusher(&server, runtime.clone(), &work)
        .push_image("svc:v2", "web", false)
        .await
        .unwrap();

    assert_eq!(outcome.aid, "img-2");
    assert_eq!(outcome.status, PushStatus::Created { renamed: vec![] });
    assert_eq!(runtime.exports.load(Ordering::SeqCst), 1);

    let posts = requests_with(&server, "POST").await;
    assert_eq!(posts.len(), 1);
    let body: Value = serde_json::from_slice(&posts[0].body).unwrap();
    assert_eq!(body["ref"], "svc:v2");
    assert_eq!(body["ociID"], image.local.id.as_str());
    assert_eq!(body["architecture"], "amd64");
    assert_eq!(body["config"], r#"{"Cmd":["/app"]}"#);
    assert_eq!(
        body["layers"],
        json!([
            {"ociID": d1.as_str()},
            {"ociID": d2.as_str()},
            {"ociID": d3.as_str()}
        ])
    );

    assert!(is_empty_dir(&work));
}

#[tokio::test]
async fn registers_layers_in_config_order_when_uploads_finish_out_of_order() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    let image = build_image(&[b"layer d1", b"layer d2", b"layer d3", b"layer d4"], None);

    mount_remote_missing(&server).await;
    for (i, diff_id) in image.diff_ids.iter().enumerate() {
        // the first layer answers last
        let delay = std::time::Duration::from_millis(300 - 70 * i as u64);
        Mock::given(method("PUT"))
            .and(path(LAYERS))
            .and(query_param("oid", diff_id.as_str()))
            .respond_with(ResponseTemplate::new(409).set_delay(delay))
            .expect(1)
            .mount(&server)
            .await;
    }
    mount_created(&server, "img-4", &[]).await;

    let config = PushConfig {
        api_url: server.uri(),
        work_dir: Some(work.path().to_path_buf()),
        max_concurrent_uploads: 4,
        ..Default::default()
    };
    let client = Arc::new(RemoteClient::new(&config).unwrap());
    let runtime = Arc::new(FakeRuntime::with_image("svc:v2", &image));
    let outcome = Pusher::new(config, runtime, client.clone(), client)
        .unwrap()
        .push_image("svc:v2", "web", false)
        .await
        .unwrap();
    assert_eq!(outcome.aid, "img-4");

    let posts = requests_with(&server, "POST").await;
    assert_eq!(posts.len(), 1);
    let body: Value = serde_json::from_slice(&posts[0].body).unwrap();
    let expected: Vec<Value> = image
        .diff_ids
        .iter()
        .map(|d| json!({"ociID": d.as_str()}))
        .collect();
    assert_eq!(body["layers"], Value::Array(expected));
    assert!(is_empty_dir(&work));
}

#[tokio::test]
async fn skips_image_when_remote_is_up_to_date() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    let image = build_image(&[b"only layer"], None);

    Mock::given(method("GET"))
        .and(path(format!("{IMAGES}/svc:v2")))
        .respond_with(ResponseTemplate::new(200).set_body_json(remote_record("img-1", &image.local.id)))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let runtime = Arc::new(FakeRuntime::with_image("svc:v2", &image));
    let outcome = pusher(&server, runtime.clone(), &work)
        .push_image("svc:v2", "web", false)
        .await
        .unwrap();

    assert_eq!(outcome.aid, "img-1");
    assert_eq!(outcome.status, PushStatus::UpToDate);
    assert_eq!(runtime.exports.load(Ordering::SeqCst), 0);
    assert!(is_empty_dir(&work));
}

#[tokio::test]
async fn force_push_ignores_matching_remote() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    let image = build_image(&[b"only layer"], None);

    Mock::given(method("GET"))
        .and(path(format!("{IMAGES}/svc:v2")))
        .respond_with(ResponseTemplate::new(200).set_body_json(remote_record("img-1", &image.local.id)))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(LAYERS))
        .respond_with(ResponseTemplate::new(409))
        .expect(1)
        .mount(&server)
        .await;
    mount_created(&server, "img-3", &[]).await;

    let runtime = Arc::new(FakeRuntime::with_image("svc:v2", &image));
    let outcome = pusher(&server, runtime.clone(), &work)
        .push_image("svc:v2", "web", true)
        .await
        .unwrap();

    assert_eq!(outcome.aid, "img-3");
    assert!(matches!(outcome.status, PushStatus::Created { .. }));
    assert_eq!(runtime.exports.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_remote_is_replaced() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    let image = build_image(&[b"new layer"], None);

    Mock::given(method("GET"))
        .and(path(format!("{IMAGES}/svc:v2")))
        .respond_with(ResponseTemplate::new(200).set_body_json(remote_record("img-1", "sha256:old")))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(LAYERS))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    mount_created(&server, "img-4", &[]).await;

    let runtime = Arc::new(FakeRuntime::with_image("svc:v2", &image));
    let outcome = pusher(&server, runtime, &work)
        .push_image("svc:v2", "web", false)
        .await
        .unwrap();
    assert_eq!(outcome.aid, "img-4");
}

#[tokio::test]
async fn remote_only_image_is_not_available_locally() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path(format!("{IMAGES}/svc:v2")))
        .respond_with(ResponseTemplate::new(200).set_body_json(remote_record("img-1", "sha256:aa")))
        .mount(&server)
        .await;

    let runtime = Arc::new(FakeRuntime::default());
    let outcome = pusher(&server, runtime, &work)
        .push_image("svc:v2", "web", true)
        .await
        .unwrap();

    assert_eq!(outcome.aid, "img-1");
    assert_eq!(outcome.status, PushStatus::NotAvailableLocally);
}

#[tokio::test]
async fn missing_everywhere_is_not_found_locally() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    mount_remote_missing(&server).await;

    let err = pusher(&server, Arc::new(FakeRuntime::default()), &work)
        .push_image("svc:v2", "web", false)
        .await
        .unwrap_err();
    assert!(matches!(err, KraError::NotFoundLocally { ref reference } if reference == "svc:v2"));
}

#[tokio::test]
async fn failed_layer_fails_image_and_cleans_up() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    let image = build_image(&[b"good layer", b"bad layer"], None);

    mount_remote_missing(&server).await;
    Mock::given(method("PUT"))
        .and(path(LAYERS))
        .and(query_param("oid", image.diff_ids[1].as_str()))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({"message": "storage backend unavailable"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(LAYERS))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let runtime = Arc::new(FakeRuntime::with_image("svc:v2", &image));
    let err = pusher(&server, runtime, &work)
        .push_image("svc:v2", "web", false)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("storage backend unavailable"), "{err}");
    assert_eq!(requests_with(&server, "PUT").await.len(), 2);
    assert!(is_empty_dir(&work));
}

#[tokio::test]
async fn mismatched_layer_count_uploads_nothing() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    let image = build_image(
        &[b"one"],
        Some(vec![sha256_of(b"one"), sha256_of(b"two")]),
    );

    mount_remote_missing(&server).await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let runtime = Arc::new(FakeRuntime::with_image("svc:v2", &image));
    let err = pusher(&server, runtime, &work)
        .push_image("svc:v2", "web", false)
        .await
        .unwrap_err();

    assert!(matches!(err, KraError::ArchiveDecode(_)), "{err}");
    assert!(is_empty_dir(&work));
}

#[tokio::test]
async fn renamed_images_are_reported() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    let image = build_image(&[b"layer"], None);

    mount_remote_missing(&server).await;
    Mock::given(method("PUT"))
        .and(path(LAYERS))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    mount_created(&server, "img-5", &["svc:v2-old"]).await;

    let runtime = Arc::new(FakeRuntime::with_image("svc:v2", &image));
    let outcome = pusher(&server, runtime, &work)
        .push_image("svc:v2", "web", false)
        .await
        .unwrap();

    assert_eq!(outcome.aid, "img-5");
    assert_eq!(
        outcome.status,
        PushStatus::Created {
            renamed: vec![RenamedImage {
                old_ref: "svc:v2-old".to_string()
            }]
        }
    );
}

#[tokio::test]
async fn repeated_push_resolves_layers_as_present() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    let image = build_image(&[b"layer a", b"layer b"], None);

    mount_remote_missing(&server).await;
    for diff_id in &image.diff_ids {
        Mock::given(method("PUT"))
            .and(path(LAYERS))
            .and(query_param("oid", diff_id.as_str()))
            .respond_with(ResponseTemplate::new(201))
            .up_to_n_times(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("PUT"))
        .and(path(LAYERS))
        .respond_with(ResponseTemplate::new(409))
        .expect(2)
        .mount(&server)
        .await;
    mount_created(&server, "img-6", &[]).await;

    let runtime = Arc::new(FakeRuntime::with_image("svc:v2", &image));
    let pusher = pusher(&server, runtime, &work);
    let first = pusher.push_image("svc:v2", "web", false).await.unwrap();
    let second = pusher.push_image("svc:v2", "web", false).await.unwrap();

    assert_eq!(first.aid, second.aid);
    assert_eq!(requests_with(&server, "PUT").await.len(), 4);
}

#[tokio::test]
async fn push_images_continues_after_failure() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    let image = build_image(&[b"layer"], None);

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;
    mount_created(&server, "img-7", &[]).await;

    let runtime = Arc::new(FakeRuntime::with_image("svc:v2", &image));
    let reports = pusher(&server, runtime, &work)
        .push_images(&[
            PushRequest::new("missing:v1", "db"),
            PushRequest::new("svc:v2", "web"),
        ])
        .await;

    assert_eq!(reports.len(), 2);
    assert!(matches!(
        reports[0].result,
        Err(KraError::NotFoundLocally { .. })
    ));
    assert_eq!(reports[1].request.label, "web");
    assert_eq!(reports[1].result.as_ref().unwrap().aid, "img-7");
}

#[tokio::test]
async fn cancelled_pusher_does_nothing() {
    let server = MockServer::start().await;
    let work = TempDir::new().unwrap();
    let image = build_image(&[b"layer"], None);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let runtime = Arc::new(FakeRuntime::with_image("svc:v2", &image));
    let reports = pusher(&server, runtime.clone(), &work)
        .with_cancellation(cancel)
        .push_images(&[PushRequest::new("svc:v2", "web")])
        .await;

    assert!(matches!(reports[0].result, Err(KraError::Cancelled)));
    assert_eq!(runtime.exports.load(Ordering::SeqCst), 0);
    assert!(requests_with(&server, "GET").await.is_empty());
}
