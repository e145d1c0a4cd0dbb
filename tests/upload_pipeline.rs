use bytes::Bytes;
use parking_lot::Mutex;
use screenlink::upload::{ApiClient, UploadError, UploadPipeline, UploadSettings};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings() -> UploadSettings {
    UploadSettings {
        part_size: 4,
        max_parts: 100,
        max_attempts: 3,
        retry_base_delay: Duration::from_millis(5),
        part_timeout: Duration::from_secs(5),
    }
}

async fn mount_init(server: &MockServer, recording_id: Uuid, parts: usize) {
    let urls: Vec<String> = (1..=parts)
        .map(|n| format!("{}/parts/{n}?sig=abc", server.uri()))
        .collect();
    Mock::given(method("POST"))
        .and(path("/api/recordings/upload/init"))
        .and(header("authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "recordingId": recording_id,
            "uploadId": "upload-1",
            "uploadUrls": urls,
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_part_ok(server: &MockServer, part: u32) {
    Mock::given(method("PUT"))
        .and(path(format!("/parts/{part}")))
        .and(header("content-type", "video/webm"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", format!("\"etag-{part}\"")))
        .mount(server)
        .await;
}

fn pipeline(server: &MockServer) -> UploadPipeline {
    pipeline_with(server, settings())
}

fn pipeline_with(server: &MockServer, settings: UploadSettings) -> UploadPipeline {
    let api = ApiClient::new(&server.uri(), Some("secret-token")).unwrap();
    UploadPipeline::new(api, settings)
}

async fn mount_complete(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/recordings/upload/complete"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "shareUrl": "https://screen.link/watch/AbCdEf123456",
            "shareToken": "AbCdEf123456",
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn retries_a_failing_part_then_completes() {
    let server = MockServer::start().await;
    let recording_id = Uuid::new_v4();
    mount_init(&server, recording_id, 3).await;
    mount_part_ok(&server, 1).await;
    mount_part_ok(&server, 3).await;

    // Part 2 fails twice before succeeding
    Mock::given(method("PUT"))
        .and(path("/parts/2"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_part_ok(&server, 2).await;

    Mock::given(method("POST"))
        .and(path("/api/recordings/upload/complete"))
        .and(body_partial_json(json!({
            "recordingId": recording_id,
            "parts": [
                {"partNumber": 1, "etag": "\"etag-1\""},
                {"partNumber": 2, "etag": "\"etag-2\""},
                {"partNumber": 3, "etag": "\"etag-3\""},
            ],
            "duration": 4.5,
            "title": "Demo",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "shareUrl": "https://screen.link/watch/AbCdEf123456",
            "shareToken": "AbCdEf123456",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = progress.clone();
    let outcome = pipeline(&server)
        .upload(
            Bytes::from_static(b"0123456789"),
            4.5,
            Some("Demo".to_string()),
            Arc::new(move |percent: f64| seen.lock().push(percent)),
        )
        .await
        .unwrap();

    assert_eq!(outcome.recording_id, recording_id);
    assert_eq!(outcome.share_token, "AbCdEf123456");
    assert_eq!(outcome.part_attempts, vec![1, 3, 1]);

    let progress = progress.lock().clone();
    assert_eq!(progress.len(), 3);
    assert!((progress[0] - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(progress[2], 100.0);

    // Parts go out in order, with exact byte ranges and no credentials
    let puts: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "PUT")
        .collect();
    assert_eq!(puts.len(), 5);
    assert!(puts.iter().all(|r| r.headers.get("authorization").is_none()));
    let bodies: Vec<&[u8]> = puts.iter().map(|r| r.body.as_slice()).collect();
    assert_eq!(bodies[0], b"0123");
    assert_eq!(bodies[1], b"4567");
    assert_eq!(bodies[4], b"89");
}

#[tokio::test]
async fn missing_etag_exhausts_retries() {
    let server = MockServer::start().await;
    mount_init(&server, Uuid::new_v4(), 1).await;
    Mock::given(method("PUT"))
        .and(path("/parts/1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/recordings/upload/complete"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = pipeline(&server)
        .upload(Bytes::from_static(b"abc"), 1.0, None, Arc::new(|_: f64| {}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        UploadError::PartUploadFailed { part_number: 1, attempts: 3, .. }
    ));
}

#[tokio::test]
async fn quota_rejection_surfaces_before_any_part() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/recordings/upload/init"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": "Recording quota of 25 reached",
            "status": 403,
            "code": "QUOTA_EXCEEDED",
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = pipeline(&server)
        .upload(Bytes::from_static(b"abc"), 1.0, None, Arc::new(|_: f64| {}))
        .await
        .unwrap_err();
    match err {
        UploadError::Api { status, code, .. } => {
            assert_eq!(status, 403);
            assert_eq!(code.as_deref(), Some("QUOTA_EXCEEDED"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn empty_artifact_is_rejected_locally() {
    let server = MockServer::start().await;
    let err = pipeline(&server)
        .upload(Bytes::new(), 0.0, None, Arc::new(|_: f64| {}))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::Empty));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn stalled_part_times_out_and_is_retried() {
    let server = MockServer::start().await;
    mount_init(&server, Uuid::new_v4(), 1).await;
    Mock::given(method("PUT"))
        .and(path("/parts/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"late\"")
                .set_delay(Duration::from_secs(2)),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_part_ok(&server, 1).await;
    mount_complete(&server).await;

    let outcome = pipeline_with(
        &server,
        UploadSettings {
            part_timeout: Duration::from_millis(200),
            ..settings()
        },
    )
    .upload(Bytes::from_static(b"abc"), 1.0, None, Arc::new(|_: f64| {}))
    .await
    .unwrap();
    assert_eq!(outcome.part_attempts, vec![2]);
}

#[tokio::test]
async fn retries_back_off_exponentially() {
    let server = MockServer::start().await;
    mount_init(&server, Uuid::new_v4(), 1).await;
    Mock::given(method("PUT"))
        .and(path("/parts/1"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_part_ok(&server, 1).await;
    mount_complete(&server).await;

    // Waits of base*2 then base*4 between the three attempts
    let started = std::time::Instant::now();
    let outcome = pipeline_with(
        &server,
        UploadSettings {
            retry_base_delay: Duration::from_millis(50),
            ..settings()
        },
    )
    .upload(Bytes::from_static(b"abc"), 1.0, None, Arc::new(|_: f64| {}))
    .await
    .unwrap();
    assert_eq!(outcome.part_attempts, vec![3]);
    assert!(started.elapsed() >= Duration::from_millis(300));
}
