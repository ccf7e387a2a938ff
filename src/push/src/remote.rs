//! Remote catalog and layer store.
//!
//! [`LayerStore`] and [`ImageCatalog`] are the two capabilities the pipeline
//! consumes; [`RemoteClient`] implements both over the kraud HTTP API.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kra_core::error::{KraError, Result};
use kra_core::{ContentId, PushConfig};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::progress::Progress;

const API_PATH: [&str; 3] = ["apis", "kraudcloud.com", "v1"];

/// Per-architecture record of a remote image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchInfo {
    /// Local runtime id the image was pushed from
    #[serde(rename = "ociID", default)]
    pub oci_id: String,
    #[serde(default)]
    pub size: u64,
}

/// An image record in the remote catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteImage {
    pub aid: String,
    #[serde(rename = "ref", default)]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amd64: Option<ArchInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arm64: Option<ArchInfo>,
}

impl RemoteImage {
    /// Record for an architecture in runtime naming (`amd64`, `arm64`).
    pub fn arch(&self, architecture: &str) -> Option<&ArchInfo> {
        match architecture {
            "amd64" => self.amd64.as_ref(),
            "arm64" => self.arm64.as_ref(),
            _ => None,
        }
    }
}

/// A layer record in the remote store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLayer {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(rename = "ociID", default)]
    pub oci_id: Option<String>,
    #[serde(default)]
    pub refcount: Option<i64>,
    /// Transport hash of the stored (compressed) bytes
    #[serde(default)]
    pub sha256: Option<String>,
}

/// A compressed layer ready to be sent.
#[derive(Debug, Clone)]
pub struct LayerUpload {
    /// Object id, the layer's diff id
    pub object_id: ContentId,
    /// Compressed size in bytes
    pub size: u64,
    /// sha256 of the compressed bytes
    pub transport_hash: ContentId,
    /// Compressed file
    pub path: PathBuf,
}

/// How the layer store answered an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerPutOutcome {
    /// Stored; the remote's record of what it received
    Accepted(RemoteLayer),
    /// The store already holds this object (409 Conflict)
    AlreadyPresent,
}

/// Image creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateImageRequest {
    #[serde(rename = "ref")]
    pub reference: String,
    pub config: String,
    #[serde(rename = "ociID")]
    pub oci_id: String,
    pub architecture: String,
    pub layers: Vec<LayerReference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerReference {
    #[serde(rename = "ociID")]
    pub oci_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateImageResponse {
    pub created: CreatedImage,
    #[serde(default)]
    pub renamed: Vec<RenamedImage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedImage {
    pub aid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamedImage {
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Content-addressed layer storage.
#[async_trait]
pub trait LayerStore: Send + Sync {
    async fn put_layer(&self, upload: &LayerUpload, progress: &Progress) -> Result<LayerPutOutcome>;
}

/// Image catalog.
#[async_trait]
pub trait ImageCatalog: Send + Sync {
    /// Look up an image by reference. `Ok(None)` if the catalog has none.
    async fn inspect_image(&self, reference: &str) -> Result<Option<RemoteImage>>;

    async fn create_image(&self, request: &CreateImageRequest) -> Result<CreateImageResponse>;
}

/// HTTP client for the remote API.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl RemoteClient {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_secs));
        }
        let http = builder
            .build()
            .map_err(|e| KraError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        let base = Url::parse(&config.api_url)
            .map_err(|e| KraError::ConfigError(format!("Invalid api_url {}: {e}", config.api_url)))?;
        if base.cannot_be_a_base() {
            return Err(KraError::ConfigError(format!(
                "api_url cannot be used as a base: {}",
                config.api_url
            )));
        }

        Ok(Self {
            http,
            base,
            token: config.token.clone(),
        })
    }

    /// List all images in the catalog.
    pub async fn list_images(&self) -> Result<Vec<RemoteImage>> {
        let url = self.endpoint(&["images"]);
        let list: ItemList<RemoteImage> = self.get_json(url).await?;
        Ok(list.items)
    }

    /// List all layers in the store.
    pub async fn list_layers(&self) -> Result<Vec<RemoteLayer>> {
        let url = self.endpoint(&["layers"]);
        let list: ItemList<RemoteLayer> = self.get_json(url).await?;
        Ok(list.items)
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(API_PATH).extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self
            .http
            .request(method, url)
            .header(ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, endpoint: &str, request: RequestBuilder) -> Result<Response> {
        request.send().await.map_err(|e| KraError::Transport {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let endpoint = url.path().to_string();
        let response = self
            .execute(&endpoint, self.request(Method::GET, url))
            .await?;
        if !response.status().is_success() {
            return Err(api_error(&endpoint, response).await);
        }
        decode(&endpoint, response).await
    }
}

#[async_trait]
impl LayerStore for RemoteClient {
    async fn put_layer(&self, upload: &LayerUpload, progress: &Progress) -> Result<LayerPutOutcome> {
        let mut url = self.endpoint(&["layers"]);
        url.query_pairs_mut()
            .append_pair("oid", upload.object_id.as_str())
            .append_pair("maxsize", &upload.size.to_string())
            .append_pair("sha256", upload.transport_hash.as_str());
        let endpoint = url.path().to_string();

        let file = tokio::fs::File::open(&upload.path).await?;
        let progress = progress.clone();
        let body = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                progress.advance(bytes.len() as u64);
            }
            chunk
        });

        let request = self
            .request(Method::PUT, url)
            .header(CONTENT_TYPE, "application/x-tar")
            .header(CONTENT_LENGTH, upload.size)
            .body(Body::wrap_stream(body));

        let response = self.execute(&endpoint, request).await?;
        if !response.status().is_success() {
            let err = api_error(&endpoint, response).await;
            if err.is_conflict() {
                return Ok(LayerPutOutcome::AlreadyPresent);
            }
            return Err(err);
        }

        let bytes = response.bytes().await.map_err(|e| KraError::Transport {
            endpoint: endpoint.clone(),
            message: e.to_string(),
        })?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(LayerPutOutcome::Accepted(RemoteLayer::default()));
        }
        Ok(LayerPutOutcome::Accepted(serde_json::from_slice(&bytes)?))
    }
}

#[async_trait]
impl ImageCatalog for RemoteClient {
    async fn inspect_image(&self, reference: &str) -> Result<Option<RemoteImage>> {
        let url = self.endpoint(&["images", reference]);
        let endpoint = url.path().to_string();
        let response = self
            .execute(&endpoint, self.request(Method::GET, url))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => decode(&endpoint, response).await.map(Some),
            _ => Err(api_error(&endpoint, response).await),
        }
    }

    async fn create_image(&self, request: &CreateImageRequest) -> Result<CreateImageResponse> {
        let url = self.endpoint(&["images"]);
        let endpoint = url.path().to_string();
        let response = self
            .execute(&endpoint, self.request(Method::POST, url).json(request))
            .await?;
        if !response.status().is_success() {
            return Err(api_error(&endpoint, response).await);
        }
        decode(&endpoint, response).await
    }
}

async fn decode<T: DeserializeOwned>(endpoint: &str, response: Response) -> Result<T> {
    let bytes = response.bytes().await.map_err(|e| KraError::Transport {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Turn a non-success response into an error, preferring the API's own message.
async fn api_error(endpoint: &str, response: Response) -> KraError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .map(|e| e.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| status.to_string());

    KraError::Api {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        message,
    }
}
