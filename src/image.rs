//! Floor-plan image sink: the one external service besides storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;

pub const DEFAULT_DOWNLOAD_TEMPLATE: &str = "https://drive.google.com/uc?export=download&id={id}";

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("image sink request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("image sink rejected upload: status {0}")]
    Status(u16),
    #[error("image sink returned an empty id")]
    MissingId,
}

/// Stores an image and returns an opaque id for it.
#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn upload(&self, name: &str, content_type: &str, body: Bytes) -> Result<String, SinkError>;
}

/// Turns a sink id into a direct download URL by substituting `{id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadUrlTemplate(String);

impl DownloadUrlTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn render(&self, id: &str) -> String {
        self.0.replace("{id}", id)
    }
}

impl Default for DownloadUrlTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_DOWNLOAD_TEMPLATE)
    }
}

/// MIME type of a png or jpeg payload, judged by magic bytes rather than
/// the client's declared content type.
pub fn sniff_image(bytes: &[u8]) -> Option<&'static str> {
    match infer::get(bytes)?.mime_type() {
        mime @ ("image/png" | "image/jpeg") => Some(mime),
        _ => None,
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    id: String,
}

/// POSTs the raw image to an upload endpoint that answers `{"id": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpImageSink {
    client: Client,
    upload_url: String,
    token: Option<String>,
}

impl HttpImageSink {
    pub fn new(upload_url: impl Into<String>, token: Option<String>) -> Result<Self, SinkError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { client, upload_url: upload_url.into(), token })
    }
}

#[async_trait]
impl ImageSink for HttpImageSink {
    #[tracing::instrument(skip(self, body), fields(bytes = body.len()))]
    async fn upload(&self, name: &str, content_type: &str, body: Bytes) -> Result<String, SinkError> {
        let mut request = self
            .client
            .post(&self.upload_url)
            .query(&[("name", name)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, "image upload rejected");
            return Err(SinkError::Status(status.as_u16()));
        }
        let UploadResponse { id } = response.json().await?;
        if id.is_empty() {
            return Err(SinkError::MissingId);
        }
        Ok(id)
    }
}

/// Keeps uploads in memory. Used when no upload URL is configured, and in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryImageSink {
    next: Arc<AtomicU64>,
    images: Arc<DashMap<String, (String, Bytes)>>,
}

impl MemoryImageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<(String, Bytes)> {
        self.images.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[async_trait]
impl ImageSink for MemoryImageSink {
    async fn upload(&self, name: &str, content_type: &str, body: Bytes) -> Result<String, SinkError> {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("img-{n}");
        tracing::debug!(name, content_type, id, "stored image in memory");
        self.images.insert(id.clone(), (content_type.to_string(), body));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10, b'J', b'F', b'I', b'F'];
    const GIF_MAGIC: &[u8] = b"GIF89a\x01\x00\x01\x00";

    #[test]
    fn sniff_accepts_png_and_jpeg_only() {
        assert_eq!(sniff_image(PNG_MAGIC), Some("image/png"));
        assert_eq!(sniff_image(JPEG_MAGIC), Some("image/jpeg"));
        assert_eq!(sniff_image(GIF_MAGIC), None);
        assert_eq!(sniff_image(b"plain text"), None);
        assert_eq!(sniff_image(&[]), None);
    }

    #[test]
    fn template_substitutes_id() {
        let t = DownloadUrlTemplate::new("https://cdn.example/{id}/raw");
        assert_eq!(t.render("abc"), "https://cdn.example/abc/raw");
        assert_eq!(
            DownloadUrlTemplate::default().render("xyz"),
            "https://drive.google.com/uc?export=download&id=xyz"
        );
    }

    #[tokio::test]
    async fn memory_sink_hands_out_distinct_ids() {
        let sink = MemoryImageSink::new();
        let a = sink.upload("a.png", "image/png", Bytes::from_static(PNG_MAGIC)).await.unwrap();
        let b = sink.upload("b.png", "image/png", Bytes::from_static(PNG_MAGIC)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.get(&a).unwrap().0, "image/png");
    }
}
