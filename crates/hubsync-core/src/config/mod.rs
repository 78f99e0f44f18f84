//! Relay configuration.
//!
//! A device talks to exactly one relay. The configuration names the backend,
//! carries its credential, and fixes the root path under which the relay
//! layout lives. Hubs configure it directly; spokes receive it through a
//! pairing bundle.

use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::util::{is_http_url, normalize_root_path, normalize_text_option};
use crate::{Error, Result};

/// Root path used when none is configured.
pub const DEFAULT_ROOT_PATH: &str = "hubsync";

const ENV_PROVIDER: &str = "HUBSYNC_RELAY_PROVIDER";
const ENV_ROOT: &str = "HUBSYNC_RELAY_ROOT";
const ENV_DRIVE_TOKEN: &str = "HUBSYNC_DRIVE_TOKEN";
const ENV_DRIVE_API_URL: &str = "HUBSYNC_DRIVE_API_URL";
const ENV_DRIVE_CONTENT_URL: &str = "HUBSYNC_DRIVE_CONTENT_URL";
const ENV_WEBDAV_URL: &str = "HUBSYNC_WEBDAV_URL";
const ENV_WEBDAV_USERNAME: &str = "HUBSYNC_WEBDAV_USERNAME";
const ENV_WEBDAV_PASSWORD: &str = "HUBSYNC_WEBDAV_PASSWORD";
const ENV_S3_BUCKET: &str = "HUBSYNC_S3_BUCKET";
const ENV_S3_ACCESS_KEY_ID: &str = "HUBSYNC_S3_ACCESS_KEY_ID";
const ENV_S3_SECRET_ACCESS_KEY: &str = "HUBSYNC_S3_SECRET_ACCESS_KEY";
const ENV_S3_ACCOUNT_ID: &str = "HUBSYNC_S3_ACCOUNT_ID";
const ENV_S3_ENDPOINT: &str = "HUBSYNC_S3_ENDPOINT";

const ALL_ENV_VARS: [&str; 13] = [
    ENV_PROVIDER,
    ENV_ROOT,
    ENV_DRIVE_TOKEN,
    ENV_DRIVE_API_URL,
    ENV_DRIVE_CONTENT_URL,
    ENV_WEBDAV_URL,
    ENV_WEBDAV_USERNAME,
    ENV_WEBDAV_PASSWORD,
    ENV_S3_BUCKET,
    ENV_S3_ACCESS_KEY_ID,
    ENV_S3_SECRET_ACCESS_KEY,
    ENV_S3_ACCOUNT_ID,
    ENV_S3_ENDPOINT,
];

/// Relay backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayProvider {
    Drive,
    #[serde(rename = "webdav")]
    WebDav,
    S3,
}

impl RelayProvider {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drive => "drive",
            Self::WebDav => "webdav",
            Self::S3 => "s3",
        }
    }
}

impl fmt::Display for RelayProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drive" | "dropbox" => Ok(Self::Drive),
            "webdav" | "dav" => Ok(Self::WebDav),
            "s3" | "r2" => Ok(Self::S3),
            other => Err(Error::InvalidInput(format!(
                "Unknown relay provider '{other}'. Expected drive, webdav or s3"
            ))),
        }
    }
}

/// Credential for one relay backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum RelayCredential {
    Drive {
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_url: Option<String>,
    },
    #[serde(rename = "webdav")]
    WebDav {
        url: String,
        username: String,
        password: String,
    },
    S3 {
        bucket: String,
        access_key_id: String,
        secret_access_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        account_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
}

impl RelayCredential {
    pub const fn provider(&self) -> RelayProvider {
        match self {
            Self::Drive { .. } => RelayProvider::Drive,
            Self::WebDav { .. } => RelayProvider::WebDav,
            Self::S3 { .. } => RelayProvider::S3,
        }
    }

    /// Check required fields and URL shapes without touching the network.
    pub fn validate(&self) -> Result<()> {
        fn require(value: &str, name: &str) -> Result<()> {
            if value.trim().is_empty() {
                return Err(Error::InvalidInput(format!("{name} cannot be empty")));
            }
            Ok(())
        }
        fn optional_url(value: Option<&String>, name: &str) -> Result<()> {
            match value.map(|value| value.trim()).filter(|value| !value.is_empty()) {
                Some(url) if !is_http_url(url) => Err(Error::InvalidInput(format!(
                    "{name} must start with http:// or https://"
                ))),
                _ => Ok(()),
            }
        }

        match self {
            Self::Drive {
                access_token,
                api_url,
                content_url,
            } => {
                require(access_token, "Drive access token")?;
                optional_url(api_url.as_ref(), "Drive API URL")?;
                optional_url(content_url.as_ref(), "Drive content URL")
            }
            Self::WebDav { url, username, .. } => {
                require(url, "WebDAV URL")?;
                require(username, "WebDAV username")?;
                optional_url(Some(url), "WebDAV URL")
            }
            Self::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                account_id,
                endpoint,
            } => {
                require(bucket, "S3 bucket")?;
                require(access_key_id, "S3 access key id")?;
                require(secret_access_key, "S3 secret access key")?;
                crate::relay::s3_endpoint_url(account_id.as_deref(), endpoint.as_deref())
                    .map(|_| ())
            }
        }
    }
}

impl fmt::Debug for RelayCredential {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drive {
                api_url,
                content_url,
                ..
            } => formatter
                .debug_struct("Drive")
                .field("access_token", &"[REDACTED]")
                .field("api_url", api_url)
                .field("content_url", content_url)
                .finish(),
            Self::WebDav { url, username, .. } => formatter
                .debug_struct("WebDav")
                .field("url", url)
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::S3 {
                bucket,
                access_key_id,
                account_id,
                endpoint,
                ..
            } => formatter
                .debug_struct("S3")
                .field("bucket", bucket)
                .field("access_key_id", access_key_id)
                .field("secret_access_key", &"[REDACTED]")
                .field("account_id", account_id)
                .field("endpoint", endpoint)
                .finish(),
        }
    }
}

/// Everything a device needs to reach its relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Folder or key prefix holding the relay layout
    #[serde(default = "default_root_path")]
    pub root_path: String,
    pub credential: RelayCredential,
}

fn default_root_path() -> String {
    DEFAULT_ROOT_PATH.to_string()
}

impl RelayConfig {
    pub fn new(root_path: &str, credential: RelayCredential) -> Self {
        let root_path = normalize_root_path(root_path);
        Self {
            root_path: if root_path.is_empty() {
                default_root_path()
            } else {
                root_path
            },
            credential,
        }
    }

    pub const fn provider(&self) -> RelayProvider {
        self.credential.provider()
    }

    pub fn validate(&self) -> Result<()> {
        self.credential.validate()
    }

    /// Load relay configuration from `HUBSYNC_*` environment variables.
    ///
    /// Returns `Ok(None)` when no relay variables are set.
    /// Returns an error when only a partial configuration is provided.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| env::var(key).ok())
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<RelayConfig>> {
    let value = |key: &str| normalize_text_option(lookup(key));

    if ALL_ENV_VARS.iter().all(|key| value(key).is_none()) {
        return Ok(None);
    }

    let provider: RelayProvider = value(ENV_PROVIDER)
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "Relay configuration is incomplete. Missing: {ENV_PROVIDER}"
            ))
        })?
        .parse()?;

    let required: &[&str] = match provider {
        RelayProvider::Drive => &[ENV_DRIVE_TOKEN],
        RelayProvider::WebDav => &[ENV_WEBDAV_URL, ENV_WEBDAV_USERNAME, ENV_WEBDAV_PASSWORD],
        RelayProvider::S3 => &[ENV_S3_BUCKET, ENV_S3_ACCESS_KEY_ID, ENV_S3_SECRET_ACCESS_KEY],
    };
    let missing = required
        .iter()
        .copied()
        .filter(|key| value(key).is_none())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(Error::InvalidInput(format!(
            "Relay configuration is incomplete. Missing: {}",
            missing.join(", ")
        )));
    }

    let require = |key: &str| value(key).unwrap_or_default();
    let credential = match provider {
        RelayProvider::Drive => RelayCredential::Drive {
            access_token: require(ENV_DRIVE_TOKEN),
            api_url: value(ENV_DRIVE_API_URL),
            content_url: value(ENV_DRIVE_CONTENT_URL),
        },
        RelayProvider::WebDav => RelayCredential::WebDav {
            url: require(ENV_WEBDAV_URL),
            username: require(ENV_WEBDAV_USERNAME),
            password: lookup(ENV_WEBDAV_PASSWORD).unwrap_or_default(),
        },
        RelayProvider::S3 => RelayCredential::S3 {
            bucket: require(ENV_S3_BUCKET),
            access_key_id: require(ENV_S3_ACCESS_KEY_ID),
            secret_access_key: require(ENV_S3_SECRET_ACCESS_KEY),
            account_id: value(ENV_S3_ACCOUNT_ID),
            endpoint: value(ENV_S3_ENDPOINT),
        },
    };

    let config = RelayConfig::new(
        value(ENV_ROOT).as_deref().unwrap_or(DEFAULT_ROOT_PATH),
        credential,
    );
    config.validate()?;
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn parse_from_map(map: &HashMap<&str, &str>) -> Result<Option<RelayConfig>> {
        parse_config(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn parse_config_none_returns_none() {
        assert!(parse_from_map(&HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn parse_config_requires_provider() {
        let map = HashMap::from([(ENV_DRIVE_TOKEN, "tok")]);
        let err = parse_from_map(&map).unwrap_err();
        assert!(err.to_string().contains(ENV_PROVIDER));
    }

    #[test]
    fn parse_config_lists_missing_values() {
        let map = HashMap::from([(ENV_PROVIDER, "webdav"), (ENV_WEBDAV_URL, "https://dav")]);
        match parse_from_map(&map).unwrap_err() {
            Error::InvalidInput(message) => {
                assert!(message.contains(ENV_WEBDAV_USERNAME));
                assert!(message.contains(ENV_WEBDAV_PASSWORD));
                assert!(!message.contains(ENV_WEBDAV_URL));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_config_builds_drive_config_with_default_root() {
        let map = HashMap::from([(ENV_PROVIDER, " Drive "), (ENV_DRIVE_TOKEN, " tok ")]);
        let config = parse_from_map(&map).unwrap().unwrap();
        assert_eq!(config.root_path, DEFAULT_ROOT_PATH);
        assert_eq!(
            config.credential,
            RelayCredential::Drive {
                access_token: "tok".to_string(),
                api_url: None,
                content_url: None,
            }
        );
    }

    #[test]
    fn parse_config_builds_s3_config() {
        let map = HashMap::from([
            (ENV_PROVIDER, "r2"),
            (ENV_ROOT, "/school/sync/"),
            (ENV_S3_BUCKET, "bucket-a"),
            (ENV_S3_ACCESS_KEY_ID, "AKID"),
            (ENV_S3_SECRET_ACCESS_KEY, "SECRET"),
            (ENV_S3_ACCOUNT_ID, "acct"),
        ]);
        let config = parse_from_map(&map).unwrap().unwrap();
        assert_eq!(config.provider(), RelayProvider::S3);
        assert_eq!(config.root_path, "school/sync");
    }

    #[test]
    fn parse_config_rejects_s3_without_endpoint() {
        let map = HashMap::from([
            (ENV_PROVIDER, "s3"),
            (ENV_S3_BUCKET, "bucket-a"),
            (ENV_S3_ACCESS_KEY_ID, "AKID"),
            (ENV_S3_SECRET_ACCESS_KEY, "SECRET"),
        ]);
        assert!(parse_from_map(&map).is_err());
    }

    #[test]
    fn credential_serializes_with_provider_tag() {
        let credential = RelayCredential::WebDav {
            url: "https://dav.example.com".to_string(),
            username: "admin".to_string(),
            password: "pw".to_string(),
        };
        let value = serde_json::to_value(&credential).unwrap();
        assert_eq!(
            value,
            json!({"provider": "webdav", "url": "https://dav.example.com", "username": "admin", "password": "pw"})
        );
        let s3: RelayCredential = serde_json::from_value(json!({
            "provider": "s3",
            "bucket": "b",
            "accessKeyId": "k",
            "secretAccessKey": "s",
            "accountId": "acct"
        }))
        .unwrap();
        assert_eq!(s3.provider(), RelayProvider::S3);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let credential = RelayCredential::S3 {
            bucket: "b".to_string(),
            access_key_id: "AKID".to_string(),
            secret_access_key: "TOPSECRET".to_string(),
            account_id: None,
            endpoint: Some("http://localhost:9000".to_string()),
        };
        let rendered = format!("{:?}", RelayConfig::new("", credential));
        assert!(!rendered.contains("TOPSECRET"));
        assert!(rendered.contains("hubsync"));
    }

    #[test]
    fn provider_parses_aliases() {
        assert_eq!("dropbox".parse::<RelayProvider>().unwrap(), RelayProvider::Drive);
        assert_eq!("DAV".parse::<RelayProvider>().unwrap(), RelayProvider::WebDav);
        assert!("ftp".parse::<RelayProvider>().is_err());
    }
}
