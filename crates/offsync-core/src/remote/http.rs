//! JSON-over-HTTP feature service client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{
    AttachmentEdit, AttachmentEditResponse, Extract, ExtractRequest, FeatureEdit,
    FeatureEditResponse, FeatureService, RemoteError, ServiceSchema,
};

/// Feature service reached over HTTP
///
/// - `GET {url}/schema`
/// - `POST {url}/extract`
/// - `POST {url}/applyEdits`
/// - `POST {url}/applyAttachmentEdits`
#[derive(Debug, Clone)]
pub struct HttpFeatureService {
    url: String,
    client: reqwest::Client,
}

impl HttpFeatureService {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("offsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Unreachable(e.to_string()))?;

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url, path)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, RemoteError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path);
        debug!(url = %url, "POST");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        decode(&bytes)
    }
}

#[async_trait]
impl FeatureService for HttpFeatureService {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_schema(&self) -> Result<ServiceSchema, RemoteError> {
        let url = self.endpoint("schema");
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        decode(&bytes)
    }

    async fn download_extract(
        &self,
        request: &ExtractRequest,
        progress: &(dyn Fn(f32, &str) + Send + Sync),
    ) -> Result<Extract, RemoteError> {
        let url = self.endpoint("extract");
        debug!(url = %url, extent = %request.extent, "POST");
        progress(0.0, "Requesting extract");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        let mut response = check_status(response).await?;

        let total = response.content_length();
        let mut body = Vec::with_capacity(total.unwrap_or(0).min(64 * 1024 * 1024) as usize);
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            body.extend_from_slice(&chunk);
            if let Some(total) = total.filter(|t| *t > 0) {
                progress(body.len() as f32 / total as f32, "Downloading extract");
            }
        }

        progress(1.0, "Extract downloaded");
        decode(&body)
    }

    async fn apply_feature_edits(
        &self,
        edits: &[FeatureEdit],
    ) -> Result<FeatureEditResponse, RemoteError> {
        self.post_json("applyEdits", edits).await
    }

    async fn apply_attachment_edits(
        &self,
        edits: &[AttachmentEdit],
    ) -> Result<AttachmentEditResponse, RemoteError> {
        self.post_json("applyAttachmentEdits", edits).await
    }
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    if error.is_decode() {
        RemoteError::Serialization(error.to_string())
    } else {
        RemoteError::Unreachable(error.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(status_error(status, message))
}

fn status_error(status: StatusCode, message: String) -> RemoteError {
    if status == StatusCode::INSUFFICIENT_STORAGE {
        return RemoteError::StorageFull;
    }
    let message = if message.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string()
    } else {
        message
    };
    RemoteError::Server {
        status: status.as_u16(),
        message,
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RemoteError> {
    serde_json::from_slice(bytes).map_err(|e| RemoteError::Serialization(e.to_string()))
}
