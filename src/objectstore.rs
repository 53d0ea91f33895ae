//! Thin interface onto the object store. Presigned-PUT issuance (the
//! upload side a client hits directly) is a front-door collaborator,
//! out of scope here; presigned-GET issuance for a finished file is
//! in-core, since the completion sink needs one for every `T_res`
//! message it handles.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload failed with status {0}")]
    UploadFailed(reqwest::StatusCode),
}

pub type Result<T> = std::result::Result<T, ObjectStoreError>;

#[derive(Debug, Clone)]
pub struct PresignedPut {
    pub url: String,
    pub key: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_presigned_put(&self, count: usize) -> Result<Vec<PresignedPut>>;

    async fn get_presigned_get(&self, key: &str) -> Result<String>;

    async fn download_to_temp(&self, url: &str, ext: &str) -> Result<std::path::PathBuf>;

    async fn upload(&self, url: &str, path: &std::path::Path) -> Result<()>;
}

type HmacSha256 = Hmac<Sha256>;

/// How long a freshly-issued presigned GET stays valid for.
const PRESIGNED_GET_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Talks to presigned S3-style URLs directly over HTTP, and signs its
/// own presigned GETs against the configured bucket credentials.
/// Presigned-PUT issuance is handled upstream of this crate, by the
/// front door the client uploads through.
pub struct HttpObjectStore {
    client: reqwest::Client,
    access_key_id: String,
    secret_access_key: String,
    bucket: String,
}

impl HttpObjectStore {
    pub fn new(access_key_id: String, secret_access_key: String, bucket: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_key_id,
            secret_access_key,
            bucket,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get_presigned_put(&self, _count: usize) -> Result<Vec<PresignedPut>> {
        unimplemented!("presigned PUT issuance is the front door's job")
    }

    async fn get_presigned_get(&self, key: &str) -> Result<String> {
        let expires = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + PRESIGNED_GET_TTL_SECS;

        let to_sign = format!("GET\n{}\n{}\n{}", self.bucket, key, expires);
        let mut mac = HmacSha256::new_from_slice(self.secret_access_key.as_bytes())
            .expect("HMAC accepts a key of any length");
        mac.update(to_sign.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!(
            "https://{}.s3.amazonaws.com/{}?AWSAccessKeyId={}&Expires={}&Signature={}",
            self.bucket, key, self.access_key_id, expires, signature
        ))
    }

    async fn download_to_temp(&self, url: &str, ext: &str) -> Result<std::path::PathBuf> {
        let bytes = self.client.get(url).send().await?.bytes().await?;
        let mut path = std::env::temp_dir();
        path.push(format!("upscaler-src-{}{}", uuid::Uuid::new_v4(), ext));
        tokio::fs::write(&path, &bytes).await?;
        Ok(path)
    }

    async fn upload(&self, url: &str, path: &std::path::Path) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        let resp = self.client.put(url).body(bytes).send().await?;
        if !resp.status().is_success() {
            return Err(ObjectStoreError::UploadFailed(resp.status()));
        }
        Ok(())
    }
}
