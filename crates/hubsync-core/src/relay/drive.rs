//! Cloud-drive relay speaking the Dropbox v2 HTTP API.

use std::fmt::Write as _;

use reqwest::header::CONTENT_TYPE;
use reqwest::Response;
use serde::Deserialize;
use serde_json::{json, Value};

use super::http::{build_client, read_bytes, transport_error, ApiFailure};
use super::{
    join_root, normalize_object_path, split_prefix, Relay, RelayError, RelayOperation,
    RelayResult,
};
use crate::config::RelayCredential;
use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.dropboxapi.com";
pub const DEFAULT_CONTENT_URL: &str = "https://content.dropboxapi.com";

/// Token-authenticated cloud-drive relay.
#[derive(Clone)]
pub struct DriveRelay {
    client: reqwest::Client,
    access_token: String,
    api_url: String,
    content_url: String,
    root: String,
}

impl std::fmt::Debug for DriveRelay {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DriveRelay")
            .field("access_token", &"[REDACTED]")
            .field("api_url", &self.api_url)
            .field("content_url", &self.content_url)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ListFolderPage {
    entries: Vec<ListFolderEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ListFolderEntry {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
}

impl DriveRelay {
    pub fn new(root: &str, credential: &RelayCredential) -> Result<Self> {
        let RelayCredential::Drive {
            access_token,
            api_url,
            content_url,
        } = credential
        else {
            return Err(Error::InvalidInput(format!(
                "Drive relay cannot use {} credentials",
                credential.provider()
            )));
        };

        let access_token = normalize_text_option(Some(access_token.clone())).ok_or_else(|| {
            Error::InvalidInput("Drive access token cannot be empty".to_string())
        })?;

        Ok(Self {
            client: build_client()?,
            access_token,
            api_url: normalize_base_url(api_url.as_deref(), DEFAULT_API_URL)?,
            content_url: normalize_base_url(content_url.as_deref(), DEFAULT_CONTENT_URL)?,
            root: crate::util::normalize_root_path(root),
        })
    }

    fn remote_path(&self, path: &str) -> RelayResult<String> {
        let path = normalize_object_path(path)?;
        Ok(format!("/{}", join_root(&self.root, &path)))
    }

    /// Folder path in Dropbox notation; the account root is the empty string.
    fn folder_path(&self, dir: &str) -> RelayResult<String> {
        let dir = if dir.is_empty() {
            String::new()
        } else {
            normalize_object_path(dir)?
        };
        let joined = [self.root.as_str(), dir.as_str()]
            .into_iter()
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Ok(if joined.is_empty() {
            joined
        } else {
            format!("/{joined}")
        })
    }

    /// Map a failed response; a 409 naming `not_found` is a missing object.
    fn failure(operation: RelayOperation, target: &str, failure: ApiFailure) -> RelayError {
        if failure.status.as_u16() == 409 && failure.body.contains("not_found") {
            return RelayError::NotFound(format!("{operation} {target}: {}", failure.summary()));
        }
        failure.into_error(operation, target)
    }

    async fn checked(
        operation: RelayOperation,
        target: &str,
        response: std::result::Result<Response, reqwest::Error>,
    ) -> RelayResult<Response> {
        let response = response.map_err(|error| transport_error(operation, target, &error))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::failure(operation, target, ApiFailure::read(response).await))
        }
    }

    async fn rpc(
        &self,
        operation: RelayOperation,
        endpoint: &str,
        target: &str,
        body: &Value,
    ) -> RelayResult<Response> {
        let response = self
            .client
            .post(format!("{}/2/{endpoint}", self.api_url))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await;
        Self::checked(operation, target, response).await
    }

    async fn list_page(target: &str, response: Response) -> RelayResult<ListFolderPage> {
        response.json::<ListFolderPage>().await.map_err(|error| {
            RelayError::Unknown(format!("list {target}: unexpected list_folder payload: {error}"))
        })
    }
}

impl Relay for DriveRelay {
    async fn put(&self, path: &str, blob: Vec<u8>) -> RelayResult<()> {
        let remote = self.remote_path(path)?;
        tracing::debug!("Drive upload {remote} ({} bytes)", blob.len());
        let arg = api_arg(&json!({"path": remote, "mode": "overwrite", "mute": true}));
        let response = self
            .client
            .post(format!("{}/2/files/upload", self.content_url))
            .bearer_auth(&self.access_token)
            .header("Dropbox-API-Arg", arg)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(blob)
            .send()
            .await;
        Self::checked(RelayOperation::Put, &remote, response).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> RelayResult<Vec<u8>> {
        let remote = self.remote_path(path)?;
        tracing::debug!("Drive download {remote}");
        let response = self
            .client
            .post(format!("{}/2/files/download", self.content_url))
            .bearer_auth(&self.access_token)
            .header("Dropbox-API-Arg", api_arg(&json!({"path": remote})))
            .send()
            .await;
        let response = Self::checked(RelayOperation::Get, &remote, response).await?;
        read_bytes(RelayOperation::Get, &remote, response).await
    }

    async fn list(&self, prefix: &str) -> RelayResult<Vec<String>> {
        let (dir, name_prefix) = split_prefix(prefix);
        let folder = self.folder_path(dir)?;
        tracing::debug!("Drive list {folder}");

        let first = self
            .rpc(
                RelayOperation::List,
                "files/list_folder",
                &folder,
                &json!({"path": folder, "recursive": false}),
            )
            .await;
        let response = match first {
            Ok(response) => response,
            Err(RelayError::NotFound(_)) => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };

        let mut paths = Vec::new();
        let mut page = Self::list_page(&folder, response).await?;
        loop {
            paths.extend(
                page.entries
                    .iter()
                    .filter(|entry| entry.tag == "file" && entry.name.starts_with(name_prefix))
                    .map(|entry| join_root(dir, &entry.name)),
            );
            if !page.has_more {
                break;
            }
            let response = self
                .rpc(
                    RelayOperation::List,
                    "files/list_folder/continue",
                    &folder,
                    &json!({"cursor": page.cursor}),
                )
                .await?;
            page = Self::list_page(&folder, response).await?;
        }

        paths.sort();
        Ok(paths)
    }

    async fn delete(&self, path: &str) -> RelayResult<()> {
        let remote = self.remote_path(path)?;
        tracing::debug!("Drive delete {remote}");
        match self
            .rpc(
                RelayOperation::Delete,
                "files/delete_v2",
                &remote,
                &json!({"path": remote}),
            )
            .await
        {
            Ok(_) | Err(RelayError::NotFound(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }
}

fn normalize_base_url(value: Option<&str>, default: &str) -> Result<String> {
    let Some(value) = normalize_text_option(value.map(ToOwned::to_owned)) else {
        return Ok(default.to_string());
    };
    if !is_http_url(&value) {
        return Err(Error::InvalidInput(format!(
            "Drive API URL '{value}' must start with http:// or https://"
        )));
    }
    Ok(value.trim_end_matches('/').to_string())
}

/// JSON for the `Dropbox-API-Arg` header. HTTP headers must be ASCII, so
/// every other character is written as a `\uXXXX` escape.
fn api_arg(value: &Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() && ch != '\u{7f}' {
            out.push(ch);
        } else {
            let mut units = [0_u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                let _ = write!(out, "\\u{unit:04x}");
            }
        }
    }
    out
}
