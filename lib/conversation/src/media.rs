//! Archiving of media attachments.
//!
//! Chat platforms hand out attachment URLs that expire. After a message is
//! stored, its remote media parts are downloaded, written to blob storage
//! and the stored message is rewritten to point at the durable copy. The
//! whole step is best effort: failures are logged and the original URL is
//! kept.

use crate::error::MediaError;
use crate::message::{Message, Part};
use crate::session::SessionRepository;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Downloaded attachment content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    /// Content type reported by the remote, if any.
    pub content_type: Option<String>,
}

/// Trait for downloading remote attachments.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Downloads the content behind a URL.
    async fn fetch(&self, url: &str) -> Result<FetchedMedia, MediaError>;
}

/// Fetches attachments over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    /// Creates a fetcher using an existing client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedMedia, MediaError> {
        let fetch_failed = |reason: String| MediaError::FetchFailed {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fetch_failed(e.to_string()))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_failed(e.to_string()))?;

        Ok(FetchedMedia {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// Trait for durable blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores bytes under an object name and returns their durable URI.
    async fn put(&self, object_name: &str, bytes: &[u8]) -> Result<String, MediaError>;

    /// Returns true if the URI already points into this store.
    fn is_durable(&self, uri: &str) -> bool;
}

/// Blob storage on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Creates a store rooted at a directory. The directory is created on
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, object_name: &str, bytes: &[u8]) -> Result<String, MediaError> {
        let upload_failed = |reason: String| MediaError::UploadFailed {
            object: object_name.to_string(),
            reason,
        };

        if object_name
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(upload_failed("invalid object name".to_string()));
        }

        let path = self.root.join(object_name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| upload_failed(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| upload_failed(e.to_string()))?;

        let absolute = tokio::fs::canonicalize(&path)
            .await
            .map_err(|e| upload_failed(e.to_string()))?;
        Ok(format!("file://{}", absolute.display()))
    }

    fn is_durable(&self, uri: &str) -> bool {
        uri.starts_with("file://")
    }
}

/// Configuration for media archiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    /// Deployment environment, used as the first object name segment.
    pub environment: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
        }
    }
}

/// Rewrites remote media references of stored messages to durable copies.
pub struct MediaArchiver {
    fetcher: Arc<dyn MediaFetcher>,
    blobs: Arc<dyn BlobStore>,
    config: MediaConfig,
}

impl MediaArchiver {
    /// Creates an archiver.
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        blobs: Arc<dyn BlobStore>,
        config: MediaConfig,
    ) -> Self {
        Self {
            fetcher,
            blobs,
            config,
        }
    }

    /// Returns true if the message has media that still needs archiving.
    #[must_use]
    pub fn needs_archiving(&self, message: &Message) -> bool {
        message.parts.iter().any(|part| match part {
            Part::Media { url, .. } => self.is_remote(url),
            _ => false,
        })
    }

    fn is_remote(&self, url: &str) -> bool {
        !self.blobs.is_durable(url)
            && (url.starts_with("http://") || url.starts_with("https://") || url.starts_with("data:"))
    }

    /// Archives the remote media of a stored message.
    ///
    /// Each part is handled independently; a part that fails keeps its
    /// original URL. The stored message is only rewritten if its parts are
    /// still the ones this archiver started from. Running it again on an
    /// archived message is a no-op.
    #[instrument(skip_all, fields(message_id = %message.id, session_id = %message.session_id))]
    pub async fn archive(&self, repository: &dyn SessionRepository, message: &Message) {
        if !self.needs_archiving(message) {
            return;
        }

        let uploaded_at = message.created_at.timestamp();
        let mut rewritten = message.parts.clone();
        let mut changed = 0usize;

        for (index, part) in rewritten.iter_mut().enumerate() {
            let Part::Media { content_type, url } = part else {
                continue;
            };
            if !self.is_remote(url) {
                continue;
            }

            let object_name = format!(
                "{}/{}/{}-{}-{}{}",
                self.config.environment,
                message.session_id,
                message.author_id,
                uploaded_at,
                index,
                extension_for(content_type),
            );

            match self.copy_to_blob_store(url, &object_name).await {
                Ok((durable, fetched_type)) => {
                    debug!(object = %object_name, "archived attachment");
                    if let Some(fetched_type) = fetched_type
                        && content_type.is_empty()
                    {
                        *content_type = fetched_type;
                    }
                    *url = durable;
                    changed += 1;
                }
                Err(e) => warn!(error = %e, index, "failed to archive attachment"),
            }
        }

        if changed == 0 {
            return;
        }

        match repository
            .swap_parts(message.id, &message.parts, &rewritten)
            .await
        {
            Ok(true) => info!(changed, "message media archived"),
            Ok(false) => debug!("message parts changed concurrently, keeping stored version"),
            Err(e) => warn!(error = %e, "failed to store archived media references"),
        }
    }

    async fn copy_to_blob_store(
        &self,
        url: &str,
        object_name: &str,
    ) -> Result<(String, Option<String>), MediaError> {
        let fetched = match url.strip_prefix("data:") {
            Some(data) => decode_data_uri(url, data)?,
            None => self.fetcher.fetch(url).await?,
        };
        let durable = self.blobs.put(object_name, &fetched.bytes).await?;
        Ok((durable, fetched.content_type))
    }
}

fn decode_data_uri(url: &str, data: &str) -> Result<FetchedMedia, MediaError> {
    let unsupported = || MediaError::Unsupported {
        url: url.chars().take(64).collect(),
    };

    let (header, payload) = data.split_once(',').ok_or_else(unsupported)?;
    let content_type = header.strip_suffix(";base64").ok_or_else(unsupported)?;
    let bytes = BASE64.decode(payload).map_err(|_| unsupported())?;

    Ok(FetchedMedia {
        bytes,
        content_type: (!content_type.is_empty()).then(|| content_type.to_string()),
    })
}

/// Derives a file extension from a MIME type, e.g. `image/jpeg` to `.jpeg`.
fn extension_for(content_type: &str) -> String {
    let subtype = content_type
        .split(';')
        .next()
        .and_then(|essence| essence.split_once('/'))
        .map(|(_, subtype)| subtype.trim())
        .unwrap_or_default();
    let ext: String = subtype
        .chars()
        .take_while(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();

    if ext.is_empty() {
        String::new()
    } else {
        format!(".{ext}")
    }
}
