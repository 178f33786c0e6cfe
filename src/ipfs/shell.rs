//! IPFS HTTP API client
//!
//! Lists objects with `POST /api/v0/file/ls?arg=/ipfs/<hash>`.

use crate::config::IpfsConfig;
use crate::extractor::build_http_client;
use crate::ipfs::{Filesystem, Link, Listing};
use crate::retry::FetchError;
use crate::types::ResourceType;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

/// `file/ls` response body
#[derive(Debug, Deserialize)]
struct FileLsResponse {
    #[serde(rename = "Objects")]
    objects: HashMap<String, LsObject>,
}

#[derive(Debug, Deserialize)]
struct LsObject {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Size", default)]
    size: u64,
    #[serde(rename = "Links", default)]
    links: Option<Vec<LsLink>>,
}

#[derive(Debug, Deserialize)]
struct LsLink {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Hash")]
    hash: String,
    #[serde(rename = "Size", default)]
    size: u64,
    #[serde(rename = "Type", default)]
    kind: String,
}

/// Error body returned by the API on failure
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "Message")]
    message: String,
}

/// Filesystem client talking to an IPFS node's HTTP API
pub struct IpfsShell {
    api_url: Url,
    client: Client,
}

impl IpfsShell {
    /// Creates a new shell for the configured node
    ///
    /// # Returns
    ///
    /// * `Ok(IpfsShell)` - Client ready for use
    /// * `Err(FetchError::InvalidRequest)` - Unusable API URL or client settings
    pub fn new(config: &IpfsConfig) -> Result<Self, FetchError> {
        let api_url = Url::parse(&config.api_url).map_err(|e| {
            FetchError::InvalidRequest(format!("ipfs api-url '{}': {}", config.api_url, e))
        })?;
        let client = build_http_client(config.request_timeout())
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        Ok(Self { api_url, client })
    }

    fn ls_url(&self, hash: &str) -> Result<Url, FetchError> {
        let mut url = self
            .api_url
            .join("api/v0/file/ls")
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("arg", &format!("/ipfs/{}", hash));
        Ok(url)
    }
}

/// Turns an API error message into a fetch error
///
/// Protocol-level complaints from the node are fatal; everything else fails
/// only the current item.
fn api_error(status: u16, body: &[u8]) -> FetchError {
    match serde_json::from_slice::<ApiError>(body) {
        Ok(err) if err.message.contains("proto") => FetchError::Protocol(err.message),
        Ok(err) => FetchError::Other(format!("ipfs api {}: {}", status, err.message)),
        Err(_) => FetchError::Other(format!(
            "ipfs api {}: {}",
            status,
            String::from_utf8_lossy(body)
        )),
    }
}

/// Decodes a `file/ls` body into a listing for `hash`
fn parse_listing(hash: &str, body: &[u8]) -> Result<Listing, FetchError> {
    let response: FileLsResponse = serde_json::from_slice(body)
        .map_err(|e| FetchError::Protocol(format!("malformed file/ls response: {}", e)))?;

    // Objects are keyed by the resolved hash, which normally equals the argument
    let object = match response.objects.get(hash) {
        Some(object) => object,
        None if response.objects.len() == 1 => response
            .objects
            .values()
            .next()
            .ok_or_else(|| FetchError::Protocol(format!("no object for {}", hash)))?,
        None => {
            return Err(FetchError::Protocol(format!(
                "file/ls response has no object for {}",
                hash
            )))
        }
    };

    let links = object
        .links
        .iter()
        .flatten()
        .map(|link| Link {
            hash: link.hash.clone(),
            name: link.name.clone(),
            size: link.size,
            kind: ResourceType::from_listing_type(&link.kind),
        })
        .collect();

    Ok(Listing {
        kind: ResourceType::from_listing_type(&object.kind),
        size: object.size,
        links,
    })
}

#[async_trait]
impl Filesystem for IpfsShell {
    async fn list(&self, hash: &str) -> Result<Listing, FetchError> {
        let url = self.ls_url(hash)?;
        tracing::trace!("Listing {}", hash);

        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        let body = response.bytes().await.map_err(FetchError::from_reqwest)?;

        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }

        parse_listing(hash, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_shell(api_url: &str) -> IpfsShell {
        IpfsShell::new(&IpfsConfig {
            api_url: api_url.to_string(),
            timeout: 2_000,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_directory_listing() {
        let body = br#"{
            "Arguments": {"/ipfs/QmDir": "QmDir"},
            "Objects": {
                "QmDir": {
                    "Hash": "QmDir",
                    "Size": 0,
                    "Type": "Directory",
                    "Links": [
                        {"Name": "a.txt", "Hash": "QmA", "Size": 100, "Type": "File"},
                        {"Name": "sub", "Hash": "QmSub", "Size": 0, "Type": "Directory"},
                        {"Name": "link", "Hash": "QmLink", "Size": 5, "Type": "Symlink"}
                    ]
                }
            }
        }"#;

        let listing = parse_listing("QmDir", body).unwrap();
        assert_eq!(listing.kind, ResourceType::Directory);
        assert_eq!(listing.links.len(), 3);
        assert_eq!(listing.links[0].kind, ResourceType::File);
        assert_eq!(listing.links[1].kind, ResourceType::Directory);
        assert_eq!(listing.links[2].kind, ResourceType::Unsupported);
    }

    #[test]
    fn test_parse_file_listing_without_links() {
        let body =
            br#"{"Objects": {"QmFile": {"Hash": "QmFile", "Size": 42, "Type": "File", "Links": null}}}"#;
        let listing = parse_listing("QmFile", body).unwrap();

        assert_eq!(listing.kind, ResourceType::File);
        assert_eq!(listing.size, 42);
        assert!(listing.links.is_empty());
    }

    #[test]
    fn test_malformed_listing_is_protocol_error() {
        assert!(matches!(
            parse_listing("QmX", b"{\"Objects\": 12}"),
            Err(FetchError::Protocol(_))
        ));
        assert!(matches!(
            parse_listing("QmX", br#"{"Objects": {}}"#),
            Err(FetchError::Protocol(_))
        ));
    }

    #[test]
    fn test_api_error_mapping() {
        let proto = br#"{"Message":"proto: required field not set","Code":0,"Type":"error"}"#;
        assert!(matches!(api_error(500, proto), FetchError::Protocol(_)));

        let other = br#"{"Message":"merkledag: not found","Code":0,"Type":"error"}"#;
        assert!(matches!(api_error(500, other), FetchError::Other(_)));

        assert!(matches!(api_error(502, b"bad gateway"), FetchError::Other(_)));
    }

    #[tokio::test]
    async fn test_list_against_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v0/file/ls"))
            .and(query_param("arg", "/ipfs/QmFile"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"Objects": {"QmFile": {"Hash": "QmFile", "Size": 7, "Type": "File"}}}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let shell = create_shell(&server.uri());
        let listing = shell.list("QmFile").await.unwrap();

        assert_eq!(listing.kind, ResourceType::File);
        assert_eq!(listing.size, 7);
    }

    #[tokio::test]
    async fn test_list_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string(
                r#"{"Message":"proto: can't skip unknown wire type","Code":0,"Type":"error"}"#,
            ))
            .mount(&server)
            .await;

        let shell = create_shell(&server.uri());
        let result = shell.list("QmBroken").await;

        assert!(matches!(result, Err(FetchError::Protocol(_))));
    }
}
