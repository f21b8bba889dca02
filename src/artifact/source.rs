//! Where artifact bytes come from.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::ArtifactError;

/// Byte-count callback invoked as data arrives.
pub type ProgressFn<'a> = &'a (dyn Fn(u64) + Send + Sync);

#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Stream the body at `url` into `sink`.  Returns the bytes written.
    async fn fetch(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: ProgressFn<'_>,
    ) -> Result<u64, ArtifactError>;
}

/// Plain HTTP(S) GET via `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactSource for HttpSource {
    async fn fetch(
        &self,
        url: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: ProgressFn<'_>,
    ) -> Result<u64, ArtifactError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ArtifactError::Download(e.to_string()))?;

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ArtifactError::Download(e.to_string()))?
        {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress(written);
        }
        sink.flush().await?;
        Ok(written)
    }
}
