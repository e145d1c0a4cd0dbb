use super::{validate_part_sequence, ObjectStorage, StorageError, StorageResult, RECORDING_CONTENT_TYPE};
use crate::upload::types::CompletedPart;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

struct PendingUpload {
    key: String,
    /// part number -> (etag, data)
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct Store {
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<String, Bytes>,
}

/// In-process object store for development and tests. Presigned URLs point
/// back at this server's `/storage` routes and carry an HMAC over the
/// method, resource and expiry.
pub struct LocalStorage {
    base_url: String,
    signer: HmacSha256,
    store: Mutex<Store>,
}

impl LocalStorage {
    pub fn new(base_url: &str, secret: &str) -> StorageResult<Self> {
        let signer = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| StorageError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
            store: Mutex::new(Store::default()),
        })
    }

    /// Routes serving the URLs this store signs
    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/storage/parts/{upload_id}/{part_number}", put(put_part))
            .route("/storage/objects/{key}", get(get_object))
            .with_state(Arc::clone(self))
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.store.lock().objects.get(key).cloned()
    }

    pub fn pending_uploads(&self) -> usize {
        self.store.lock().uploads.len()
    }

    fn mac(&self, method: &str, resource: &str, expires: i64) -> HmacSha256 {
        let mut mac = self.signer.clone();
        mac.update(method.as_bytes());
        mac.update(b"\n");
        mac.update(resource.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }

    fn sign(&self, method: &str, resource: &str, ttl: Duration) -> (i64, String) {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let sig = hex::encode(self.mac(method, resource, expires).finalize().into_bytes());
        (expires, sig)
    }

    fn verify(&self, method: &str, resource: &str, signed: &Signed) -> bool {
        if signed.expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(sig) = hex::decode(&signed.sig) else {
            return false;
        };
        self.mac(method, resource, signed.expires)
            .verify_slice(&sig)
            .is_ok()
    }

    fn store_part(&self, upload_id: &str, part_number: u32, data: Bytes) -> StorageResult<String> {
        let etag = format!("\"{}\"", hex::encode(Sha256::digest(&data)));
        let mut store = self.store.lock();
        let upload = store
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::UnknownUpload(upload_id.to_string()))?;
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }
}

fn part_resource(upload_id: &str, part_number: u32) -> String {
    format!("parts/{upload_id}/{part_number}")
}

fn object_resource(key: &str) -> String {
    format!("objects/{key}")
}

fn normalize_etag(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        let upload_id = Uuid::new_v4().simple().to_string();
        self.store.lock().uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    fn presign_upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> StorageResult<String> {
        let (expires, sig) = self.sign("PUT", &part_resource(upload_id, part_number), ttl);
        Ok(format!(
            "{}/storage/parts/{upload_id}/{part_number}?expires={expires}&sig={sig}",
            self.base_url
        ))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        validate_part_sequence(parts)?;

        let mut store = self.store.lock();
        let upload = store
            .uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StorageError::UnknownUpload(upload_id.to_string()))?;

        let mut object = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, data)) if normalize_etag(etag) == normalize_etag(&part.etag) => {
                    object.extend_from_slice(data);
                }
                _ => {
                    return Err(StorageError::PartMismatch {
                        part_number: part.part_number,
                    })
                }
            }
        }

        store.uploads.remove(upload_id);
        store.objects.insert(key.to_string(), Bytes::from(object));
        debug!("Assembled {} from {} parts", key, parts.len());
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> StorageResult<()> {
        match self.store.lock().uploads.remove(upload_id) {
            Some(_) => Ok(()),
            None => Err(StorageError::UnknownUpload(upload_id.to_string())),
        }
    }

    fn presign_get(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        let (expires, sig) = self.sign("GET", &object_resource(key), ttl);
        Ok(format!(
            "{}/storage/objects/{}?expires={expires}&sig={sig}",
            self.base_url,
            urlencoding::encode(key)
        ))
    }

    async fn head(&self, key: &str) -> StorageResult<u64> {
        self.store
            .lock()
            .objects
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct Signed {
    expires: i64,
    sig: String,
}

async fn put_part(
    State(storage): State<Arc<LocalStorage>>,
    Path((upload_id, part_number)): Path<(String, u32)>,
    Query(signed): Query<Signed>,
    body: Bytes,
) -> Response {
    if !storage.verify("PUT", &part_resource(&upload_id, part_number), &signed) {
        return (StatusCode::FORBIDDEN, "invalid or expired signature").into_response();
    }

    match storage.store_part(&upload_id, part_number, body) {
        Ok(etag) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&etag) {
                headers.insert(header::ETAG, value);
            }
            (StatusCode::OK, headers).into_response()
        }
        Err(e) => {
            warn!("Rejected part {} for {}: {}", part_number, upload_id, e);
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
    }
}

async fn get_object(
    State(storage): State<Arc<LocalStorage>>,
    Path(key): Path<String>,
    Query(signed): Query<Signed>,
) -> Response {
    if !storage.verify("GET", &object_resource(&key), &signed) {
        return (StatusCode::FORBIDDEN, "invalid or expired signature").into_response();
    }

    match storage.object(&key) {
        Some(data) => ([(header::CONTENT_TYPE, RECORDING_CONTENT_TYPE)], data).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
