use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use screenlink::server::models::{Principal, Recording, Tier, UploadSessionStatus};
use screenlink::server::repository::{MemoryRepository, Repository};
use screenlink::server::storage::LocalStorage;
use screenlink::server::{OrchestratorSettings, ServiceError, UploadOrchestrator};
use screenlink::upload::types::{CompleteUploadRequest, CompletedPart, InitUploadRequest, InitUploadResponse};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

struct Fixture {
    orchestrator: Arc<UploadOrchestrator>,
    repository: Arc<MemoryRepository>,
    storage: Arc<LocalStorage>,
    app: Router,
    now: Arc<Mutex<DateTime<Utc>>>,
}

fn fixture_with(settings: OrchestratorSettings) -> Fixture {
    let repository = Arc::new(MemoryRepository::new());
    let storage = Arc::new(LocalStorage::new("http://localhost:8080", "secret").unwrap());
    let now = Arc::new(Mutex::new(Utc::now()));
    let clock = now.clone();
    let orchestrator = UploadOrchestrator::new(repository.clone(), storage.clone(), settings)
        .with_clock(Arc::new(move || *clock.lock()));
    Fixture {
        orchestrator: Arc::new(orchestrator),
        repository,
        app: storage.routes(),
        storage,
        now,
    }
}

fn fixture() -> Fixture {
    fixture_with(OrchestratorSettings::default())
}

fn alice() -> Principal {
    Principal {
        owner_id: "alice".to_string(),
        tier: Tier::Free,
    }
}

fn init_request(part_count: u32) -> InitUploadRequest {
    InitUploadRequest {
        estimated_size: part_count as u64 * 4,
        part_count,
    }
}

/// PUT `data` to a presigned part URL through the local storage routes
async fn put_part(app: &Router, url: &str, data: &'static [u8]) -> String {
    let path = &url[url.find("/storage/").unwrap()..];
    let response = app
        .clone()
        .oneshot(Request::put(path).body(Body::from(data)).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response.headers()[header::ETAG].to_str().unwrap().to_string()
}

async fn upload_parts(fx: &Fixture, init: &InitUploadResponse, chunks: &[&'static [u8]]) -> Vec<CompletedPart> {
    let mut parts = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let etag = put_part(&fx.app, &init.upload_urls[i], chunk).await;
        parts.push(CompletedPart {
            part_number: i as u32 + 1,
            etag,
        });
    }
    parts
}

fn complete_request(recording_id: Uuid, parts: Vec<CompletedPart>) -> CompleteUploadRequest {
    CompleteUploadRequest {
        recording_id,
        parts,
        duration: 12.5,
        title: Some("Bug report".to_string()),
    }
}

async fn session_status(fx: &Fixture, recording_id: Uuid) -> UploadSessionStatus {
    fx.repository
        .get_session_by_recording(recording_id)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn completes_exactly_once_and_serves_the_recording() {
    let fx = fixture();
    let init = fx.orchestrator.init(&alice(), &init_request(2)).await.unwrap();
    assert_eq!(init.upload_urls.len(), 2);

    let parts = upload_parts(&fx, &init, &[b"abcd", b"ef"]).await;
    let done = fx
        .orchestrator
        .complete(&alice(), &complete_request(init.recording_id, parts.clone()))
        .await
        .unwrap();

    assert_eq!(done.share_token.len(), 12);
    assert!(done.share_token.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_eq!(done.share_url, format!("http://localhost:8080/watch/{}", done.share_token));
    assert_eq!(session_status(&fx, init.recording_id).await, UploadSessionStatus::Completed);

    let recording = fx.repository.recording(init.recording_id).unwrap();
    assert_eq!(recording.byte_size, 6);
    assert_eq!(recording.owner_id, "alice");
    assert_eq!(recording.object_key, format!("recordings/alice/{}.webm", init.recording_id));
    assert_eq!(recording.expires_at, Some(recording.created_at + ChronoDuration::days(30)));
    assert_eq!(fx.storage.object(&recording.object_key).unwrap().as_ref(), b"abcdef");

    // A second completion must not create another recording
    let err = fx
        .orchestrator
        .complete(&alice(), &complete_request(init.recording_id, parts))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SessionInactive));
    assert_eq!(fx.repository.recording_count(), 1);

    let watch = fx.orchestrator.watch(&done.share_token).await.unwrap();
    assert_eq!(watch.title.as_deref(), Some("Bug report"));
    assert_eq!(watch.duration, 12.5);
    assert!(watch.video_url.contains("/storage/objects/"));

    let path = &watch.video_url[watch.video_url.find("/storage/").unwrap()..];
    let response = fx
        .app
        .clone()
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The view is counted off the request path
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(fx.repository.recording(init.recording_id).unwrap().view_count, 1);
}

#[tokio::test]
async fn pro_recordings_never_expire() {
    let fx = fixture();
    let pro = Principal {
        owner_id: "bob".to_string(),
        tier: Tier::Pro,
    };
    let init = fx.orchestrator.init(&pro, &init_request(1)).await.unwrap();
    let parts = upload_parts(&fx, &init, &[b"x"]).await;
    fx.orchestrator
        .complete(&pro, &complete_request(init.recording_id, parts))
        .await
        .unwrap();
    assert_eq!(fx.repository.recording(init.recording_id).unwrap().expires_at, None);
}

#[tokio::test]
async fn unknown_recording_is_not_found() {
    let fx = fixture();
    let err = fx
        .orchestrator
        .complete(&alice(), &complete_request(Uuid::new_v4(), vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SessionNotFound));
}

#[tokio::test]
async fn other_owner_is_forbidden_without_side_effects() {
    let fx = fixture();
    let init = fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap();
    let parts = upload_parts(&fx, &init, &[b"data"]).await;

    let mallory = Principal {
        owner_id: "mallory".to_string(),
        tier: Tier::Pro,
    };
    let err = fx
        .orchestrator
        .complete(&mallory, &complete_request(init.recording_id, parts.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SessionForbidden));
    assert_eq!(session_status(&fx, init.recording_id).await, UploadSessionStatus::Uploading);
    assert_eq!(fx.repository.recording_count(), 0);
    assert_eq!(fx.storage.pending_uploads(), 1);

    // The owner can still finish
    fx.orchestrator
        .complete(&alice(), &complete_request(init.recording_id, parts))
        .await
        .unwrap();
}

#[tokio::test]
async fn expired_session_is_rejected_and_swept() {
    let fx = fixture();
    let init = fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap();
    let parts = upload_parts(&fx, &init, &[b"data"]).await;

    *fx.now.lock() += ChronoDuration::minutes(16);
    let err = fx
        .orchestrator
        .complete(&alice(), &complete_request(init.recording_id, parts))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SessionExpired));
    assert_eq!(fx.repository.recording_count(), 0);

    assert_eq!(fx.orchestrator.sweep_expired().await.unwrap(), 1);
    assert_eq!(session_status(&fx, init.recording_id).await, UploadSessionStatus::Expired);
    assert_eq!(fx.storage.pending_uploads(), 0);
    // Already expired sessions are left alone
    assert_eq!(fx.orchestrator.sweep_expired().await.unwrap(), 0);
}

#[tokio::test]
async fn completion_after_sweep_still_reports_expiry() {
    let fx = fixture();
    let init = fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap();
    let parts = upload_parts(&fx, &init, &[b"data"]).await;

    *fx.now.lock() += ChronoDuration::minutes(16);
    assert_eq!(fx.orchestrator.sweep_expired().await.unwrap(), 1);

    let err = fx
        .orchestrator
        .complete(&alice(), &complete_request(init.recording_id, parts))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SessionExpired));
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(fx.repository.recording_count(), 0);
    assert_eq!(session_status(&fx, init.recording_id).await, UploadSessionStatus::Expired);
}

#[tokio::test]
async fn sweep_spares_live_sessions() {
    let fx = fixture();
    let init = fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap();
    *fx.now.lock() += ChronoDuration::minutes(14);
    assert_eq!(fx.orchestrator.sweep_expired().await.unwrap(), 0);
    assert_eq!(session_status(&fx, init.recording_id).await, UploadSessionStatus::Uploading);
}

#[tokio::test]
async fn too_many_parts_fail_before_a_session_exists() {
    let fx = fixture();
    for part_count in [0, 101] {
        let err = fx
            .orchestrator
            .init(&alice(), &init_request(part_count))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }
    assert_eq!(fx.repository.session_count(), 0);
    assert_eq!(fx.storage.pending_uploads(), 0);

    assert_eq!(
        fx.orchestrator.init(&alice(), &init_request(100)).await.unwrap().upload_urls.len(),
        100
    );
}

fn seeded_recording(owner: &str, token: &str) -> Recording {
    let id = Uuid::new_v4();
    Recording {
        id,
        owner_id: owner.to_string(),
        title: None,
        duration_seconds: 1.0,
        object_key: format!("recordings/{owner}/{id}.webm"),
        byte_size: 1,
        share_token: token.to_string(),
        is_public: true,
        view_count: 0,
        created_at: Utc::now(),
        expires_at: None,
    }
}

#[tokio::test]
async fn quota_is_enforced_before_anything_is_created() {
    let fx = fixture_with(OrchestratorSettings {
        free_max_recordings: Some(2),
        ..OrchestratorSettings::default()
    });
    fx.repository.insert_recording(seeded_recording("alice", "AAAAAAAAAAA1"));
    fx.repository.insert_recording(seeded_recording("alice", "AAAAAAAAAAA2"));

    let err = fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap_err();
    assert!(matches!(err, ServiceError::QuotaExceeded { limit: 2 }));
    assert_eq!(err.code(), "QUOTA_EXCEEDED");
    assert_eq!(fx.repository.session_count(), 0);
    assert_eq!(fx.storage.pending_uploads(), 0);

    // Other users and the paid tier are unaffected
    let pro_alice = Principal {
        owner_id: "alice".to_string(),
        tier: Tier::Pro,
    };
    fx.orchestrator.init(&pro_alice, &init_request(1)).await.unwrap();
    let carol = Principal {
        owner_id: "carol".to_string(),
        tier: Tier::Free,
    };
    fx.orchestrator.init(&carol, &init_request(1)).await.unwrap();
}

#[tokio::test]
async fn open_sessions_count_against_the_quota() {
    let fx = fixture_with(OrchestratorSettings {
        free_max_recordings: Some(2),
        ..OrchestratorSettings::default()
    });
    fx.repository.insert_recording(seeded_recording("alice", "AAAAAAAAAAA1"));

    // One stored recording plus one upload in flight fills the quota
    let open = fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap();
    let err = fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap_err();
    assert!(matches!(err, ServiceError::QuotaExceeded { limit: 2 }));
    assert_eq!(fx.repository.session_count(), 1);
    assert_eq!(fx.storage.pending_uploads(), 1);

    // Completing it keeps the slot taken, now as a stored recording
    let parts = upload_parts(&fx, &open, &[b"data"]).await;
    fx.orchestrator
        .complete(&alice(), &complete_request(open.recording_id, parts))
        .await
        .unwrap();
    assert!(matches!(
        fx.orchestrator.init(&alice(), &init_request(1)).await,
        Err(ServiceError::QuotaExceeded { .. })
    ));
}

#[tokio::test]
async fn lapsed_sessions_release_their_quota_slot() {
    let fx = fixture_with(OrchestratorSettings {
        free_max_recordings: Some(1),
        ..OrchestratorSettings::default()
    });
    fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap();
    assert!(matches!(
        fx.orchestrator.init(&alice(), &init_request(1)).await,
        Err(ServiceError::QuotaExceeded { limit: 1 })
    ));

    *fx.now.lock() += ChronoDuration::minutes(16);
    fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap();
}

#[tokio::test]
async fn gap_in_parts_fails_assembly() {
    let fx = fixture();
    let init = fx.orchestrator.init(&alice(), &init_request(3)).await.unwrap();
    let mut parts = upload_parts(&fx, &init, &[b"aaaa", b"bbbb", b"cc"]).await;
    parts.remove(1);

    let err = fx
        .orchestrator
        .complete(&alice(), &complete_request(init.recording_id, parts))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AssemblyFailed(_)));
    assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(fx.repository.recording_count(), 0);
    assert_eq!(session_status(&fx, init.recording_id).await, UploadSessionStatus::Failed);
    assert_eq!(fx.storage.pending_uploads(), 0);
}

#[tokio::test]
async fn unknown_etag_fails_assembly() {
    let fx = fixture();
    let init = fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap();
    upload_parts(&fx, &init, &[b"aaaa"]).await;

    let parts = vec![CompletedPart {
        part_number: 1,
        etag: "\"not-the-etag\"".to_string(),
    }];
    let err = fx
        .orchestrator
        .complete(&alice(), &complete_request(init.recording_id, parts))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::AssemblyFailed(_)));
    assert_eq!(fx.repository.recording_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_publish_one_recording() {
    let fx = fixture();
    let init = fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap();
    let parts = upload_parts(&fx, &init, &[b"data"]).await;

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = fx.orchestrator.clone();
            let request = complete_request(init.recording_id, parts.clone());
            tokio::spawn(async move { orchestrator.complete(&alice(), &request).await })
        })
        .collect();

    let mut published = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => published += 1,
            Err(ServiceError::SessionInactive) => {}
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(published, 1);
    assert_eq!(fx.repository.recording_count(), 1);
}

#[tokio::test]
async fn share_token_collisions_are_retried() {
    let tokens = Arc::new(Mutex::new(vec![
        "SAMESAMESAME".to_string(),
        "SAMESAMESAME".to_string(),
        "FRESHFRESH12".to_string(),
    ]));
    let fx = fixture();
    let queue = tokens.clone();
    let orchestrator = UploadOrchestrator::new(
        fx.repository.clone(),
        fx.storage.clone(),
        OrchestratorSettings::default(),
    )
    .with_token_generator(Arc::new(move || queue.lock().remove(0)));

    let mut issued = Vec::new();
    for _ in 0..2 {
        let init = orchestrator.init(&alice(), &init_request(1)).await.unwrap();
        let parts = upload_parts(&fx, &init, &[b"data"]).await;
        let done = orchestrator
            .complete(&alice(), &complete_request(init.recording_id, parts))
            .await
            .unwrap();
        issued.push(done.share_token);
    }
    assert_eq!(issued, vec!["SAMESAMESAME", "FRESHFRESH12"]);
    assert!(tokens.lock().is_empty());
}

#[tokio::test]
async fn expired_recordings_are_not_watchable() {
    let fx = fixture();
    let init = fx.orchestrator.init(&alice(), &init_request(1)).await.unwrap();
    let parts = upload_parts(&fx, &init, &[b"data"]).await;
    let done = fx
        .orchestrator
        .complete(&alice(), &complete_request(init.recording_id, parts))
        .await
        .unwrap();

    *fx.now.lock() += ChronoDuration::days(31);
    let err = fx.orchestrator.watch(&done.share_token).await.unwrap_err();
    assert!(matches!(err, ServiceError::RecordingNotFound));
    assert_eq!(err.status(), StatusCode::NOT_FOUND);
}
