//! Object-store client (§4.C, §6.6). Deterministic key construction, upload with metadata,
//! optional presign/delete admin paths. Redesigned from the original per-transform-bucket
//! layout (`original_source/.../storage.py`) to the spec's single-bucket architecture: the
//! bucket name is injected by environment and this client never auto-creates it.

use crate::error::UploadError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;

pub struct ObjectStoreClient {
    client: S3Client,
    bucket: String,
}

fn key_prefix(transform_id: i64) -> String {
    format!("visualizations/{transform_id}/")
}

/// Deterministic key: `visualizations/{transform_id}/visualization-{ISO8601-UTC-Z}.html`.
pub fn build_key(transform_id: i64, now: chrono::DateTime<Utc>) -> String {
    format!(
        "{}visualization-{}.html",
        key_prefix(transform_id),
        now.format("%Y-%m-%dT%H:%M:%SZ")
    )
}

impl ObjectStoreClient {
    pub async fn connect(bucket: &str, region: &str, endpoint_override: Option<&str>) -> Self {
        let retry_config = aws_config::retry::RetryConfig::adaptive().with_max_attempts(MAX_ATTEMPTS);
        let timeout_config = aws_config::timeout::TimeoutConfig::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .retry_config(retry_config)
            .timeout_config(timeout_config);
        if let Some(endpoint) = endpoint_override.filter(|e| !e.is_empty()) {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;

        Self {
            client: S3Client::new(&config),
            bucket: bucket.to_string(),
        }
    }

    /// Upload HTML bytes, returning the full key on success. Does not create the bucket
    /// (single-bucket production topology, §4.C).
    pub async fn upload_visualization(
        &self,
        transform_id: i64,
        visualization_id: i64,
        owner_id: &str,
        html: Vec<u8>,
    ) -> Result<String, UploadError> {
        let now = Utc::now();
        let key = build_key(transform_id, now);
        let timestamp = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(html))
            .content_type("text/html; charset=utf-8")
            .metadata("owner", owner_id)
            .metadata("transform-id", transform_id.to_string())
            .metadata("visualization-id", visualization_id.to_string())
            .metadata("timestamp", timestamp)
            .send()
            .await
            .map_err(|e| UploadError::Failed(e.to_string()))?;

        Ok(key)
    }

    /// Presign a GET URL for `key`. Optional admin path, not on the job hot path.
    pub async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, UploadError> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| UploadError::Failed(e.to_string()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| UploadError::Failed(e.to_string()))?;
        Ok(presigned.uri().to_string())
    }

    /// Delete `key`, refusing anything outside the transform's own key prefix. Optional admin
    /// path.
    pub async fn delete(&self, transform_id: i64, key: &str) -> Result<(), UploadError> {
        let prefix = key_prefix(transform_id);
        if !key.starts_with(&prefix) {
            return Err(UploadError::Failed(format!(
                "refusing to delete key outside scope: {key}"
            )));
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| UploadError::Failed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_matches_documented_scheme() {
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 12, 30, 0).unwrap();
        let key = build_key(42, now);
        assert_eq!(key, "visualizations/42/visualization-2026-03-05T12:30:00Z.html");
        let re = regex::Regex::new(
            r"^visualizations/\d+/visualization-\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z\.html$",
        )
        .unwrap();
        assert!(re.is_match(&key));
    }

    #[test]
    fn key_prefix_scopes_to_transform() {
        assert_eq!(key_prefix(7), "visualizations/7/");
    }
}
