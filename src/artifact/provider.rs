//! Storage provider abstraction.
//!
//! The artifact store talks to a capability-set trait with two
//! implementations selected at construction time: a local filesystem
//! provider with HMAC-signed URLs, and an S3-compatible provider using
//! presigned (SigV4 query) URLs for all operations.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::artifact::sign;
use crate::config::S3Section;
use crate::error::EngineError;

/// Upload / download / sign / delete capability set.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), EngineError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, EngineError>;
    /// Deleting a missing object is not an error; cleanup must be
    /// idempotent.
    async fn delete(&self, key: &str) -> Result<(), EngineError>;
    fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, EngineError>;
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Local filesystem
// ---------------------------------------------------------------------------

/// Path-based storage under a base directory, with HMAC-signed URL tokens.
pub struct LocalFsProvider {
    base: PathBuf,
    public_base_url: String,
    secret: Vec<u8>,
}

impl LocalFsProvider {
    pub fn new(base: impl Into<PathBuf>, public_base_url: &str, secret: &str) -> Self {
        Self {
            base: base.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base.join(key)
    }

    /// Validate a `token`/`expires` pair produced by [`signed_url`].
    pub fn verify_url_token(&self, key: &str, token: &str, expires_epoch: i64) -> bool {
        sign::verify_token(&self.secret, key, expires_epoch, token, Utc::now().timestamp())
    }
}

#[async_trait]
impl StorageProvider for LocalFsProvider {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::ArtifactStore(format!("mkdir {key}: {e}")))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| EngineError::ArtifactStore(format!("write {key}: {e}")))?;
        debug!(key, bytes = bytes.len(), "stored artifact locally");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, EngineError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::NotFound(format!("artifact object {key}")))
            }
            Err(e) => Err(EngineError::ArtifactStore(format!("read {key}: {e}"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::ArtifactStore(format!("delete {key}: {e}"))),
        }
    }

    fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, EngineError> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let token = sign::sign_token(&self.secret, key, expires);
        Ok(format!(
            "{}/{key}?token={token}&expires={expires}",
            self.public_base_url
        ))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

// ---------------------------------------------------------------------------
// S3-compatible
// ---------------------------------------------------------------------------

/// Bucket-based object storage over the S3 REST API. Every request is made
/// through a presigned URL (SigV4 query signing, UNSIGNED-PAYLOAD), which
/// keeps the provider compatible with MinIO and other S3 work-alikes.
pub struct S3Provider {
    client: reqwest::Client,
    endpoint: String,
    host: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
}

impl S3Provider {
    pub fn new(cfg: &S3Section) -> Result<Self, EngineError> {
        if cfg.endpoint.is_empty() || cfg.bucket.is_empty() {
            return Err(EngineError::ArtifactStore(
                "s3 provider requires endpoint and bucket".to_string(),
            ));
        }
        let endpoint = cfg.endpoint.trim_end_matches('/').to_string();
        let host = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            host,
            bucket: cfg.bucket.clone(),
            region: cfg.region.clone(),
            access_key: cfg.access_key.clone(),
            secret_key: cfg.secret_key.clone(),
        })
    }

    /// Build a presigned URL for `method` on `key`, valid for `expires`
    /// seconds from `now`.
    pub fn presign(
        &self,
        method: &str,
        key: &str,
        expires_secs: u64,
        now: DateTime<Utc>,
    ) -> String {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();
        let scope = format!("{datestamp}/{}/s3/aws4_request", self.region);
        let credential = format!("{}/{scope}", self.access_key);

        let canonical_uri = format!(
            "/{}/{}",
            uri_encode(&self.bucket, false),
            uri_encode(key, false)
        );

        // Already in sorted (canonical) order.
        let canonical_query = format!(
            "X-Amz-Algorithm=AWS4-HMAC-SHA256\
             &X-Amz-Credential={}\
             &X-Amz-Date={amz_date}\
             &X-Amz-Expires={expires_secs}\
             &X-Amz-SignedHeaders=host",
            uri_encode(&credential, true)
        );

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            self.host
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = sign::hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            datestamp.as_bytes(),
        );
        let k_region = sign::hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = sign::hmac_sha256(&k_region, b"s3");
        let k_signing = sign::hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(sign::hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        format!(
            "{}{canonical_uri}?{canonical_query}&X-Amz-Signature={signature}",
            self.endpoint
        )
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let url = self.presign("PUT", key, 300, Utc::now());
        let resp = self
            .client
            .put(&url)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| EngineError::ArtifactStore(format!("s3 put {key}: {e}")))?;
        if !resp.status().is_success() {
            return Err(EngineError::ArtifactStore(format!(
                "s3 put {key}: status {}",
                resp.status()
            )));
        }
        debug!(key, bytes = bytes.len(), "stored artifact in s3");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, EngineError> {
        let url = self.presign("GET", key, 300, Utc::now());
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::ArtifactStore(format!("s3 get {key}: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound(format!("artifact object {key}")));
        }
        if !resp.status().is_success() {
            return Err(EngineError::ArtifactStore(format!(
                "s3 get {key}: status {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EngineError::ArtifactStore(format!("s3 get {key}: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        let url = self.presign("DELETE", key, 300, Utc::now());
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| EngineError::ArtifactStore(format!("s3 delete {key}: {e}")))?;
        // 404 means already gone; cleanup is idempotent.
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::ArtifactStore(format!(
                "s3 delete {key}: status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    fn signed_url(&self, key: &str, ttl: Duration) -> Result<String, EngineError> {
        Ok(self.presign("GET", key, ttl.as_secs(), Utc::now()))
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

/// Percent-encode per the SigV4 rules: unreserved characters pass through,
/// everything else (optionally including `/`) is `%XX`-encoded.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let p = LocalFsProvider::new(dir.path(), "http://localhost/artifacts", "secret");

        p.put("executions/a/b/shot.png", b"pixels").await.unwrap();
        let back = p.get("executions/a/b/shot.png").await.unwrap();
        assert_eq!(back, b"pixels");

        p.delete("executions/a/b/shot.png").await.unwrap();
        assert!(matches!(
            p.get("executions/a/b/shot.png").await,
            Err(EngineError::NotFound(_))
        ));
        // Deleting again stays Ok.
        p.delete("executions/a/b/shot.png").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_signed_url_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let p = LocalFsProvider::new(dir.path(), "http://localhost/artifacts/", "secret");
        let url = p
            .signed_url("executions/a/shot.png", Duration::from_secs(3600))
            .unwrap();

        assert!(url.starts_with("http://localhost/artifacts/executions/a/shot.png?token="));
        let (token, expires) = parse_signed(&url);
        assert!(p.verify_url_token("executions/a/shot.png", &token, expires));
        assert!(!p.verify_url_token("executions/a/other.png", &token, expires));
    }

    fn parse_signed(url: &str) -> (String, i64) {
        let query = url.split_once('?').unwrap().1;
        let mut token = String::new();
        let mut expires = 0i64;
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "token" => token = v.to_string(),
                "expires" => expires = v.parse().unwrap(),
                _ => {}
            }
        }
        (token, expires)
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("a b/c", false), "a%20b/c");
        assert_eq!(uri_encode("a b/c", true), "a%20b%2Fc");
        assert_eq!(uri_encode("AZaz09-._~", true), "AZaz09-._~");
    }

    #[test]
    fn test_presign_shape() {
        let cfg = S3Section {
            endpoint: "https://s3.example.com".into(),
            bucket: "artifacts".into(),
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "secret".into(),
            region: "us-east-1".into(),
        };
        let p = S3Provider::new(&cfg).unwrap();
        let now = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let url = p.presign("GET", "executions/a/shot.png", 3600, now);

        assert!(url.starts_with("https://s3.example.com/artifacts/executions/a/shot.png?"));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Date=20260102T030405Z"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(url.contains("X-Amz-Credential=AKIDEXAMPLE%2F20260102%2Fus-east-1%2Fs3%2Faws4_request"));
        assert!(url.contains("&X-Amz-Signature="));
        // Same inputs, same signature.
        assert_eq!(url, p.presign("GET", "executions/a/shot.png", 3600, now));
    }

    #[test]
    fn test_s3_requires_endpoint_and_bucket() {
        let cfg = S3Section::default();
        assert!(S3Provider::new(&cfg).is_err());
    }
}
