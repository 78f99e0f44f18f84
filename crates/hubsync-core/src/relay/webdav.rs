//! WebDAV relay.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use reqwest::{Method, Response, StatusCode, Url};

use super::http::{build_client, read_bytes, transport_error, ApiFailure};
use super::{
    join_root, normalize_object_path, split_prefix, Relay, RelayError, RelayOperation,
    RelayResult,
};
use crate::config::RelayCredential;
use crate::util::{is_http_url, normalize_root_path, normalize_text_option};
use crate::{Error, Result};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/></d:prop></d:propfind>"#;

/// WebDAV relay using HTTP basic auth.
#[derive(Clone)]
pub struct WebDavRelay {
    client: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
    root: String,
    /// Collections known to exist, so repeated uploads skip `MKCOL`.
    known_collections: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for WebDavRelay {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("WebDavRelay")
            .field("base_url", &self.base_url.as_str())
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

fn method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("WebDAV method names are valid tokens")
}

impl WebDavRelay {
    pub fn new(root: &str, credential: &RelayCredential) -> Result<Self> {
        let RelayCredential::WebDav {
            url,
            username,
            password,
        } = credential
        else {
            return Err(Error::InvalidInput(format!(
                "WebDAV relay cannot use {} credentials",
                credential.provider()
            )));
        };

        let url = normalize_text_option(Some(url.clone()))
            .ok_or_else(|| Error::InvalidInput("WebDAV URL cannot be empty".to_string()))?;
        if !is_http_url(&url) {
            return Err(Error::InvalidInput(format!(
                "WebDAV URL '{url}' must start with http:// or https://"
            )));
        }
        let base_url = Url::parse(&format!("{}/", url.trim_end_matches('/')))
            .map_err(|error| Error::InvalidInput(format!("Invalid WebDAV URL '{url}': {error}")))?;

        Ok(Self {
            client: build_client()?,
            base_url,
            username: username.trim().to_string(),
            password: password.clone(),
            root: normalize_root_path(root),
            known_collections: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// URL of `relative` under the base URL; collections get a trailing slash.
    fn url_for(&self, relative: &str, collection: bool) -> RelayResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                RelayError::Unknown(format!("WebDAV URL {} cannot hold paths", self.base_url))
            })?;
            path.pop_if_empty();
            path.extend(relative.split('/').filter(|segment| !segment.is_empty()));
            if collection {
                path.push("");
            }
        }
        Ok(url)
    }

    fn object_url(&self, path: &str) -> RelayResult<(String, Url)> {
        let path = normalize_object_path(path)?;
        let full = join_root(&self.root, &path);
        let url = self.url_for(&full, false)?;
        Ok((full, url))
    }

    async fn send(
        &self,
        operation: RelayOperation,
        target: &str,
        request: reqwest::RequestBuilder,
    ) -> RelayResult<Response> {
        request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|error| transport_error(operation, target, &error))
    }

    /// Create every missing parent collection of `full_path`, top down.
    async fn ensure_parents(&self, full_path: &str) -> RelayResult<()> {
        let segments = full_path.split('/').collect::<Vec<_>>();
        for depth in 1..segments.len() {
            let collection = segments[..depth].join("/");
            let known = self
                .known_collections
                .lock()
                .map(|known| known.contains(&collection))
                .unwrap_or(false);
            if known {
                continue;
            }

            let url = self.url_for(&collection, true)?;
            let response = self
                .send(
                    RelayOperation::Put,
                    &collection,
                    self.client.request(method("MKCOL"), url),
                )
                .await?;
            let status = response.status();
            if !(status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED) {
                return Err(ApiFailure::read(response)
                    .await
                    .into_error(RelayOperation::Put, &collection));
            }
            if let Ok(mut known) = self.known_collections.lock() {
                known.insert(collection);
            }
        }
        Ok(())
    }

    /// Object names directly inside `collection_url`.
    fn parse_multistatus(&self, collection_url: &Url, body: &str) -> RelayResult<Vec<String>> {
        let collection_path = decode_path(collection_url.path());
        let hrefs = multistatus_hrefs(body).map_err(|error| {
            RelayError::Unknown(format!(
                "Malformed PROPFIND response for {}: {error}",
                collection_url.path()
            ))
        })?;
        Ok(hrefs
            .iter()
            .filter_map(|href| self.base_url.join(href).ok())
            .filter_map(|url| {
                let path = decode_path(url.path());
                let name = path.strip_prefix(&collection_path)?;
                (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
            })
            .collect())
    }
}

fn decode_path(path: &str) -> String {
    urlencoding::decode(path).map_or_else(|_| path.to_string(), |decoded| decoded.into_owned())
}

fn is_dav_href(namespace: &ResolveResult<'_>, local_name: &[u8]) -> bool {
    matches!(namespace, ResolveResult::Bound(Namespace(b"DAV:"))) && local_name == b"href"
}

/// Text of every `DAV:href` element, unescaped and trimmed.
fn multistatus_hrefs(body: &str) -> std::result::Result<Vec<String>, quick_xml::Error> {
    let mut reader = NsReader::from_str(body);
    let mut hrefs = Vec::new();
    let mut current: Option<String> = None;

    loop {
        match reader.read_resolved_event()? {
            (namespace, Event::Start(start))
                if is_dav_href(&namespace, start.local_name().as_ref()) =>
            {
                current = Some(String::new());
            }
            (namespace, Event::End(end))
                if is_dav_href(&namespace, end.local_name().as_ref()) =>
            {
                if let Some(href) = current.take() {
                    hrefs.push(href.trim().to_string());
                }
            }
            (_, Event::Text(text)) => {
                if let Some(href) = current.as_mut() {
                    href.push_str(&text.unescape()?);
                }
            }
            (_, Event::CData(data)) => {
                if let Some(href) = current.as_mut() {
                    href.push_str(&String::from_utf8_lossy(&data));
                }
            }
            (_, Event::Eof) => break,
            _ => {}
        }
    }
    Ok(hrefs)
}

impl Relay for WebDavRelay {
    async fn put(&self, path: &str, blob: Vec<u8>) -> RelayResult<()> {
        let (full, url) = self.object_url(path)?;
        tracing::debug!("WebDAV PUT {full} ({} bytes)", blob.len());
        self.ensure_parents(&full).await?;

        let response = self
            .send(RelayOperation::Put, &full, self.client.put(url).body(blob))
            .await?;
        if !response.status().is_success() {
            return Err(ApiFailure::read(response)
                .await
                .into_error(RelayOperation::Put, &full));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> RelayResult<Vec<u8>> {
        let (full, url) = self.object_url(path)?;
        tracing::debug!("WebDAV GET {full}");
        let response = self
            .send(RelayOperation::Get, &full, self.client.get(url))
            .await?;
        if !response.status().is_success() {
            return Err(ApiFailure::read(response)
                .await
                .into_error(RelayOperation::Get, &full));
        }
        read_bytes(RelayOperation::Get, &full, response).await
    }

    async fn list(&self, prefix: &str) -> RelayResult<Vec<String>> {
        let (dir, name_prefix) = split_prefix(prefix);
        let dir = if dir.is_empty() {
            String::new()
        } else {
            normalize_object_path(dir)?
        };
        let collection = join_root(&self.root, &dir);
        let url = self.url_for(&collection, true)?;
        tracing::debug!("WebDAV PROPFIND {collection}");

        let response = self
            .send(
                RelayOperation::List,
                &collection,
                self.client
                    .request(method("PROPFIND"), url.clone())
                    .header("Depth", "1")
                    .header(reqwest::header::CONTENT_TYPE, "application/xml; charset=utf-8")
                    .body(PROPFIND_BODY),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(ApiFailure::read(response)
                .await
                .into_error(RelayOperation::List, &collection));
        }

        let body = response
            .text()
            .await
            .map_err(|error| transport_error(RelayOperation::List, &collection, &error))?;
        let mut paths = self
            .parse_multistatus(&url, &body)?
            .into_iter()
            .filter(|name| name.starts_with(name_prefix))
            .map(|name| join_root(&dir, &name))
            .collect::<Vec<_>>();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    async fn delete(&self, path: &str) -> RelayResult<()> {
        let (full, url) = self.object_url(path)?;
        tracing::debug!("WebDAV DELETE {full}");
        let response = self
            .send(RelayOperation::Delete, &full, self.client.delete(url))
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(ApiFailure::read(response)
            .await
            .into_error(RelayOperation::Delete, &full))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{basic_auth, header, method as http_method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn relay_for(server: &MockServer) -> WebDavRelay {
        WebDavRelay::new(
            "hubsync",
            &RelayCredential::WebDav {
                url: format!("{}/dav", server.uri()),
                username: "admin".to_string(),
                password: "pw".to_string(),
            },
        )
        .unwrap()
    }

    #[test]
    fn rejects_non_http_urls_and_redacts_password() {
        let error = WebDavRelay::new(
            "hubsync",
            &RelayCredential::WebDav {
                url: "dav.example.com".to_string(),
                username: "a".to_string(),
                password: "b".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));

        let relay = WebDavRelay::new(
            "hubsync",
            &RelayCredential::WebDav {
                url: "https://dav.example.com/files/".to_string(),
                username: "admin".to_string(),
                password: "hunter2".to_string(),
            },
        )
        .unwrap();
        assert!(!format!("{relay:?}").contains("hunter2"));
    }

    #[test]
    fn object_urls_encode_segments() {
        let relay = WebDavRelay::new(
            "school sync",
            &RelayCredential::WebDav {
                url: "https://dav.example.com/files/me".to_string(),
                username: String::new(),
                password: String::new(),
            },
        )
        .unwrap();
        let (full, url) = relay.object_url("inbox/a b-1.json").unwrap();
        assert_eq!(full, "school sync/inbox/a b-1.json");
        assert_eq!(
            url.as_str(),
            "https://dav.example.com/files/me/school%20sync/inbox/a%20b-1.json"
        );
    }

    #[tokio::test]
    async fn put_creates_parent_collections_once() {
        let server = MockServer::start().await;
        Mock::given(http_method("MKCOL"))
            .and(path("/dav/hubsync/"))
            .respond_with(ResponseTemplate::new(405))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(http_method("MKCOL"))
            .and(path("/dav/hubsync/inbox/"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(http_method("PUT"))
            .and(basic_auth("admin", "pw"))
            .and(path("/dav/hubsync/inbox/a-1.json"))
            .respond_with(ResponseTemplate::new(201))
            .expect(2)
            .mount(&server)
            .await;

        let relay = relay_for(&server);
        relay.put("inbox/a-1.json", b"one".to_vec()).await.unwrap();
        relay.put("inbox/a-1.json", b"two".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn get_and_delete_handle_missing_objects() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/dav/hubsync/master.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(http_method("DELETE"))
            .and(path("/dav/hubsync/inbox/a-1.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let relay = relay_for(&server);
        assert!(relay.get("master.json").await.unwrap_err().is_not_found());
        relay.delete("inbox/a-1.json").await.unwrap();
    }

    #[tokio::test]
    async fn list_parses_multistatus_hrefs() {
        let server = MockServer::start().await;
        let body = format!(
            r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response><d:href>/dav/hubsync/inbox/</d:href></d:response>
  <d:response><d:href>/dav/hubsync/inbox/spoke%20b-20.json</d:href></d:response>
  <d:response><D:href xmlns:D="DAV:">{uri}/dav/hubsync/inbox/spoke-a-10.json</D:href></d:response>
  <d:response><d:href>/dav/hubsync/inbox/archive/</d:href></d:response>
  <d:response><d:href>/dav/hubsync/inbox/notes.txt</d:href></d:response>
</d:multistatus>"#,
            uri = server.uri()
        );
        Mock::given(http_method("PROPFIND"))
            .and(path("/dav/hubsync/inbox/"))
            .and(header("depth", "1"))
            .respond_with(ResponseTemplate::new(207).set_body_string(body))
            .mount(&server)
            .await;

        let paths = relay_for(&server).list("inbox/spoke").await.unwrap();
        assert_eq!(paths, vec!["inbox/spoke b-20.json", "inbox/spoke-a-10.json"]);
    }

    const MISMATCHED_MULTISTATUS: &str =
        r#"<d:multistatus xmlns:d="DAV:"><d:href>x</d:multistatus>"#;

    #[test]
    fn multistatus_hrefs_resolve_namespaces_and_entities() {
        let body = r#"<?xml version="1.0"?>
<multistatus xmlns="DAV:" xmlns:x="urn:other">
  <response><href> /dav/a&amp;b-1.json </href></response>
  <response><href><![CDATA[/dav/c-2.json]]></href></response>
  <response><x:href>/dav/ignored.json</x:href></response>
</multistatus>"#;
        assert_eq!(
            multistatus_hrefs(body).unwrap(),
            vec!["/dav/a&b-1.json", "/dav/c-2.json"]
        );
        assert!(multistatus_hrefs(MISMATCHED_MULTISTATUS).is_err());
    }

    #[tokio::test]
    async fn malformed_multistatus_fails_the_listing() {
        let server = MockServer::start().await;
        Mock::given(http_method("PROPFIND"))
            .respond_with(ResponseTemplate::new(207).set_body_string(MISMATCHED_MULTISTATUS))
            .mount(&server)
            .await;

        assert!(matches!(
            relay_for(&server).list("inbox/").await,
            Err(RelayError::Unknown(_))
        ));
    }

    #[tokio::test]
    async fn list_of_missing_collection_is_empty() {
        let server = MockServer::start().await;
        Mock::given(http_method("PROPFIND"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(relay_for(&server).list("inbox/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unauthorized_is_classified() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert!(matches!(
            relay_for(&server).get("master.json").await,
            Err(RelayError::Unauthorized(_))
        ));
    }
}
