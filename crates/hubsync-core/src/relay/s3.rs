//! S3-compatible relay (Cloudflare R2 or any endpoint speaking the S3 API).

use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::{primitives::ByteStream, Client};
use aws_types::region::Region;

use super::{
    join_root, normalize_object_path, split_prefix, Relay, RelayError, RelayOperation,
    RelayResult,
};
use crate::config::RelayCredential;
use crate::util::{is_http_url, normalize_root_path, normalize_text_option};
use crate::{Error, Result};

/// Bucket-backed relay.
#[derive(Clone)]
pub struct S3Relay {
    client: Client,
    bucket: String,
    endpoint: String,
    root: String,
}

impl std::fmt::Debug for S3Relay {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("S3Relay")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Endpoint for an S3 credential: explicit endpoint first, then the R2
/// endpoint derived from the account id.
pub fn endpoint_url(account_id: Option<&str>, endpoint: Option<&str>) -> Result<String> {
    if let Some(endpoint) = normalize_text_option(endpoint.map(ToOwned::to_owned)) {
        if !is_http_url(&endpoint) {
            return Err(Error::InvalidInput(format!(
                "S3 endpoint '{endpoint}' must start with http:// or https://"
            )));
        }
        return Ok(endpoint.trim_end_matches('/').to_string());
    }
    normalize_text_option(account_id.map(ToOwned::to_owned))
        .map(|account_id| format!("https://{account_id}.r2.cloudflarestorage.com"))
        .ok_or_else(|| {
            Error::InvalidInput("S3 relay needs either an endpoint or an R2 account id".to_string())
        })
}

impl S3Relay {
    pub fn new(root: &str, credential: &RelayCredential) -> Result<Self> {
        let RelayCredential::S3 {
            bucket,
            access_key_id,
            secret_access_key,
            account_id,
            endpoint,
        } = credential
        else {
            return Err(Error::InvalidInput(format!(
                "S3 relay cannot use {} credentials",
                credential.provider()
            )));
        };

        let bucket = normalize_text_option(Some(bucket.clone()))
            .ok_or_else(|| Error::InvalidInput("S3 bucket cannot be empty".to_string()))?;
        let endpoint = endpoint_url(account_id.as_deref(), endpoint.as_deref())?;

        let credentials = Credentials::new(
            access_key_id.trim(),
            secret_access_key.trim(),
            None,
            None,
            "hubsync-s3-relay",
        );
        let sdk_config = aws_sdk_s3::config::Builder::new()
            .region(Region::new("auto"))
            .credentials_provider(credentials)
            .endpoint_url(&endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(sdk_config),
            bucket,
            endpoint,
            root: normalize_root_path(root),
        })
    }

    fn object_key(&self, path: &str) -> RelayResult<String> {
        let path = normalize_object_path(path)?;
        Ok(join_root(&self.root, &path))
    }

    fn relative_path<'k>(&self, key: &'k str) -> Option<&'k str> {
        if self.root.is_empty() {
            Some(key)
        } else {
            key.strip_prefix(&self.root)?.strip_prefix('/')
        }
    }
}

/// Classify an SDK failure by what happened on the wire.
fn storage_error<E>(
    operation: RelayOperation,
    bucket: &str,
    key: &str,
    error: &SdkError<E, HttpResponse>,
) -> RelayError
where
    E: std::error::Error + 'static,
{
    let message = format!(
        "S3 {operation} failed for {bucket}/{key}: {}",
        DisplayErrorContext(error)
    );
    match error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => RelayError::Transient(message),
        SdkError::ResponseError(_) | SdkError::ServiceError(_) => error
            .raw_response()
            .map_or(RelayError::Unknown(message.clone()), |response| {
                RelayError::from_status(response.status().as_u16(), message.clone())
            }),
        _ => RelayError::Unknown(message),
    }
}

impl Relay for S3Relay {
    async fn put(&self, path: &str, blob: Vec<u8>) -> RelayResult<()> {
        let key = self.object_key(path)?;
        tracing::debug!("S3 put_object {}/{key} ({} bytes)", self.bucket, blob.len());
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/octet-stream")
            .body(ByteStream::from(blob))
            .send()
            .await
            .map_err(|error| storage_error(RelayOperation::Put, &self.bucket, &key, &error))?;
        Ok(())
    }

    async fn get(&self, path: &str) -> RelayResult<Vec<u8>> {
        let key = self.object_key(path)?;
        tracing::debug!("S3 get_object {}/{key}", self.bucket);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|error| {
                if error
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::get_object::GetObjectError::is_no_such_key)
                {
                    RelayError::NotFound(format!("{}/{key}", self.bucket))
                } else {
                    storage_error(RelayOperation::Get, &self.bucket, &key, &error)
                }
            })?;

        let payload = response.body.collect().await.map_err(|error| {
            RelayError::Transient(format!(
                "S3 get failed while reading {}/{key}: {error}",
                self.bucket
            ))
        })?;
        Ok(payload.into_bytes().to_vec())
    }

    async fn list(&self, prefix: &str) -> RelayResult<Vec<String>> {
        let (dir, name_prefix) = split_prefix(prefix);
        let dir = if dir.is_empty() {
            String::new()
        } else {
            normalize_object_path(dir)?
        };
        let folder = join_root(&self.root, &dir);
        let key_prefix = if folder.is_empty() {
            name_prefix.to_string()
        } else {
            format!("{folder}/{name_prefix}")
        };
        tracing::debug!("S3 list_objects_v2 {}/{key_prefix}", self.bucket);

        let mut paths = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&key_prefix)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|error| {
                    storage_error(RelayOperation::List, &self.bucket, &key_prefix, &error)
                })?;

            paths.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter_map(|key| self.relative_path(key))
                    .map(ToOwned::to_owned),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        paths.sort();
        Ok(paths)
    }

    async fn delete(&self, path: &str) -> RelayResult<()> {
        let key = self.object_key(path)?;
        tracing::debug!("S3 delete_object {}/{key}", self.bucket);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|error| storage_error(RelayOperation::Delete, &self.bucket, &key, &error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(account_id: Option<&str>, endpoint: Option<&str>) -> RelayCredential {
        RelayCredential::S3 {
            bucket: "school-sync".to_string(),
            access_key_id: "AKID123".to_string(),
            secret_access_key: "SECRET123".to_string(),
            account_id: account_id.map(ToOwned::to_owned),
            endpoint: endpoint.map(ToOwned::to_owned),
        }
    }

    #[test]
    fn endpoint_prefers_explicit_url() {
        assert_eq!(
            endpoint_url(Some("acct"), Some(" http://localhost:9000/ ")).unwrap(),
            "http://localhost:9000"
        );
        assert_eq!(
            endpoint_url(Some("acct"), None).unwrap(),
            "https://acct.r2.cloudflarestorage.com"
        );
        assert!(endpoint_url(None, None).is_err());
        assert!(endpoint_url(None, Some("localhost:9000")).is_err());
    }

    #[test]
    fn keys_are_rooted_and_relative_paths_strip_root() {
        let relay = S3Relay::new("/school/", &credential(Some("acct"), None)).unwrap();
        assert_eq!(relay.object_key("inbox/a-1.json").unwrap(), "school/inbox/a-1.json");
        assert_eq!(relay.relative_path("school/inbox/a-1.json"), Some("inbox/a-1.json"));
        assert_eq!(relay.relative_path("schoolx/inbox/a-1.json"), None);
        assert!(!format!("{relay:?}").contains("SECRET123"));
    }

    #[tokio::test]
    #[ignore = "Requires HUBSYNC_S3_* env vars in process environment or .env"]
    async fn round_trip_against_real_bucket() {
        let _ = dotenvy::dotenv();
        let config = crate::config::RelayConfig::from_env()
            .expect("relay env parsing should not error")
            .expect("relay config should be present");
        let relay = S3Relay::new(&config.root_path, &config.credential).unwrap();

        let path = format!("inbox/test-{}.json", crate::util::now_millis());
        relay.put(&path, b"{}".to_vec()).await.unwrap();
        assert_eq!(relay.get(&path).await.unwrap(), b"{}");
        assert!(relay.list("inbox/").await.unwrap().contains(&path));
        relay.delete(&path).await.unwrap();
        relay.delete(&path).await.unwrap();
        assert!(relay.get(&path).await.unwrap_err().is_not_found());
    }
}
