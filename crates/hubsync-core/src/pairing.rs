//! Pairing bundles.
//!
//! The hub hands its relay configuration to a spoke as a single line of text:
//! `hubsync1.` followed by the unpadded base64url encoding of the bundle JSON.
//! The bundle carries no user identity, so whoever holds the token gets the
//! same relay access as the hub.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::{RelayConfig, RelayCredential, RelayProvider};
use crate::util::normalize_root_path;
use crate::{Error, Result};

/// Prefix identifying the token format.
pub const TOKEN_PREFIX: &str = "hubsync1.";

/// Relay configuration handed from the hub to a spoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingBundle {
    pub provider: RelayProvider,
    pub credential: RelayCredential,
    pub root_path: String,
    /// Unix ms when the hub issued the bundle
    pub issued_at: i64,
}

impl PairingBundle {
    pub fn new(config: &RelayConfig, issued_at: i64) -> Self {
        Self {
            provider: config.provider(),
            credential: config.credential.clone(),
            root_path: config.root_path.clone(),
            issued_at,
        }
    }

    /// Encode as a `hubsync1.` token.
    pub fn encode_token(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
    }

    /// Decode a token, ignoring any whitespace introduced by copy and paste.
    pub fn decode_token(token: &str) -> Result<Self> {
        let compact = token
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .collect::<String>();
        let payload = compact.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
            Error::InvalidBundle(format!("Token must start with '{TOKEN_PREFIX}'"))
        })?;
        if payload.is_empty() {
            return Err(Error::InvalidBundle("Token payload is empty".to_string()));
        }

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|error| Error::InvalidBundle(format!("Token is not base64url: {error}")))?;
        let bundle: Self = serde_json::from_slice(&json)
            .map_err(|error| Error::InvalidBundle(format!("Token payload is malformed: {error}")))?;
        bundle.check()?;
        Ok(bundle)
    }

    /// Relay configuration carried by the bundle.
    pub fn into_config(self) -> Result<RelayConfig> {
        self.check()?;
        Ok(RelayConfig::new(&self.root_path, self.credential))
    }

    fn check(&self) -> Result<()> {
        if self.provider != self.credential.provider() {
            return Err(Error::InvalidBundle(format!(
                "Bundle names provider {} but carries {} credentials",
                self.provider,
                self.credential.provider()
            )));
        }
        if normalize_root_path(&self.root_path).is_empty() {
            return Err(Error::InvalidBundle("Bundle root path is empty".to_string()));
        }
        self.credential
            .validate()
            .map_err(|error| Error::InvalidBundle(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn webdav_config() -> RelayConfig {
        RelayConfig::new(
            "school",
            RelayCredential::WebDav {
                url: "https://dav.example.com/remote.php/dav".to_string(),
                username: "admin".to_string(),
                password: "pw".to_string(),
            },
        )
    }

    #[test]
    fn token_round_trips_config() {
        let config = webdav_config();
        let token = PairingBundle::new(&config, 1_700_000_000_000)
            .encode_token()
            .unwrap();
        assert!(token.starts_with(TOKEN_PREFIX));
        assert!(!token.contains('='));

        let bundle = PairingBundle::decode_token(&token).unwrap();
        assert_eq!(bundle.issued_at, 1_700_000_000_000);
        assert_eq!(bundle.into_config().unwrap(), config);
    }

    #[test]
    fn decode_ignores_whitespace() {
        let token = PairingBundle::new(&webdav_config(), 1).encode_token().unwrap();
        let (head, tail) = token.split_at(20);
        let wrapped = format!("  {head}\n  {tail}\n");
        assert!(PairingBundle::decode_token(&wrapped).is_ok());
    }

    #[test]
    fn decode_rejects_bad_tokens() {
        for token in ["", "hubsync1.", "hubsync2.abc", "hubsync1.!!!", "hubsync1.bm90LWpzb24"] {
            assert!(
                matches!(PairingBundle::decode_token(token), Err(Error::InvalidBundle(_))),
                "token {token:?} should be rejected"
            );
        }
    }

    #[test]
    fn decode_rejects_provider_mismatch() {
        let payload = json!({
            "provider": "drive",
            "credential": {"provider": "webdav", "url": "https://dav", "username": "u", "password": "p"},
            "rootPath": "school",
            "issuedAt": 1
        });
        let token = format!(
            "{TOKEN_PREFIX}{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
        );
        let error = PairingBundle::decode_token(&token).unwrap_err();
        assert!(matches!(error, Error::InvalidBundle(message) if message.contains("drive")));
    }
}
