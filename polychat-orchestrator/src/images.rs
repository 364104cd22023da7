//! # Image resolution pipeline
//!
//! Collects image references from decoded message chunks, structured
//! attachments and the assistant text in the order they were streamed, then
//! fetches or decodes each one, stores it as a content-addressed
//! [`ImageAsset`] and returns the asset ids.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use futures::future::{BoxFuture, FutureExt, Shared};
use image::ImageReader;
use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use shared::models::{Attachment, ImageAsset, Timestamp};
use std::{
    collections::{HashMap, HashSet},
    io::Cursor,
    sync::{Arc, Mutex, PoisonError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{
    errors::{OrchestratorError, OrchestratorResult},
    persistence::Persistence,
};

static MARKDOWN_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"!\[[^\]]*\]\(\s*([^)\s]+)\s*\)").expect("valid markdown image pattern")
});

static DATA_URI_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"data:image/[A-Za-z0-9.+-]+;base64,[A-Za-z0-9+/=]+").expect("valid data uri pattern")
});

const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "gif", "webp", "bmp", "avif"];

/// Raw bytes of a downloaded image.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    /// Response body.
    pub bytes: Vec<u8>,
    /// `Content-Type` reported by the server, if any.
    pub mime_type: Option<String>,
}

/// Downloads remote images.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Downloads `url`.
    async fn fetch(&self, url: &str) -> OrchestratorResult<FetchedImage>;
}

/// A structured image reference as it arrived in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamedReference {
    /// Image URL or data URI.
    Url(String),
    /// Attachment, which may or may not be an image.
    Attachment(Attachment),
}

/// A structured reference and the length of the answer text when it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedImage {
    /// Byte length of the answer text at arrival.
    pub text_offset: usize,
    /// The reference itself.
    pub reference: StreamedReference,
}

impl StreamedImage {
    /// A URL or data URI seen at `text_offset`.
    #[must_use]
    pub fn url(text_offset: usize, url: impl Into<String>) -> Self {
        Self {
            text_offset,
            reference: StreamedReference::Url(url.into()),
        }
    }

    /// An attachment seen at `text_offset`.
    #[must_use]
    pub fn attachment(text_offset: usize, attachment: Attachment) -> Self {
        Self {
            text_offset,
            reference: StreamedReference::Attachment(attachment),
        }
    }
}

/// Where to look for images of one finished assistant message.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageSources<'a> {
    /// Structured references in arrival order.
    pub streamed: &'a [StreamedImage],
    /// Final answer text, scanned for markdown images and data URIs.
    pub text: &'a str,
    /// Resolve only the reference that arrived last.
    pub keep_only_last: bool,
}

/// Outcome of [`ImagePipeline::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedImages {
    /// Asset ids in first-seen order, each at most once.
    pub ids: Vec<String>,
    /// Inline data URIs that were turned into assets.
    pub inlined: Vec<String>,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<FetchedImage>, String>>>;
type InFlight = Mutex<HashMap<String, SharedFetch>>;

/// Removes its fetch from the in-flight map when the waiter finishes or is
/// dropped mid-download.
struct InFlightEntry<'a> {
    in_flight: &'a InFlight,
    url: &'a str,
    fetch: SharedFetch,
}

impl Drop for InFlightEntry<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(self.url)
            .is_some_and(|current| current.ptr_eq(&self.fetch))
        {
            in_flight.remove(self.url);
        }
    }
}

/// Resolves image references into stored assets, sharing concurrent
/// downloads of the same URL.
pub struct ImagePipeline {
    fetcher: Arc<dyn ImageFetcher>,
    store: Arc<dyn Persistence>,
    in_flight: InFlight,
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("ImagePipeline")
            .field("in_flight", &in_flight)
            .finish_non_exhaustive()
    }
}

impl ImagePipeline {
    /// Creates a pipeline downloading with `fetcher` and storing into `store`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn ImageFetcher>, store: Arc<dyn Persistence>) -> Self {
        Self {
            fetcher,
            store,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves every reference in `sources` into stored assets. Failures of
    /// individual references are logged and skipped.
    pub async fn resolve(&self, sources: ImageSources<'_>, cancel: &CancellationToken) -> ResolvedImages {
        let references = if sources.keep_only_last {
            ordered_references(sources.streamed, sources.text)
                .pop()
                .into_iter()
                .collect()
        } else {
            gather_references(sources.streamed, sources.text)
        };

        let mut resolved = ResolvedImages::default();
        let mut seen_ids = HashSet::new();

        for reference in references {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = tokio::select! {
                () = cancel.cancelled() => break,
                outcome = self.resolve_one(&reference) => outcome,
            };
            match outcome {
                Ok(id) => {
                    if reference.starts_with("data:") {
                        resolved.inlined.push(reference);
                    }
                    if seen_ids.insert(id.clone()) {
                        resolved.ids.push(id);
                    }
                }
                Err(err) => {
                    counter!("polychat_image_fetch_failures_total").increment(1);
                    warn!(reference = %preview(&reference), error = %err, "skipping unresolvable image");
                }
            }
        }

        resolved
    }

    /// Stores user-supplied image bytes and returns the content-addressed id.
    ///
    /// # Errors
    /// Fails when the bytes are not a decodable image or storage fails.
    pub async fn import(&self, bytes: Vec<u8>, mime_type: Option<&str>) -> OrchestratorResult<String> {
        let asset = build_asset(bytes, mime_type)?;
        if self.store.get_image(&asset.id).await?.is_none() {
            self.store.put_image(&asset).await?;
        }
        Ok(asset.id)
    }

    async fn resolve_one(&self, reference: &str) -> OrchestratorResult<String> {
        let (bytes, declared_mime) = if reference.starts_with("data:") {
            decode_data_uri(reference)?
        } else {
            let url = Url::parse(reference)
                .map_err(|err| OrchestratorError::Image(format!("invalid image url: {err}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(OrchestratorError::Image(format!(
                    "unsupported image url scheme `{}`",
                    url.scheme()
                )));
            }
            let fetched = self.fetch_shared(reference).await?;
            (fetched.bytes.clone(), fetched.mime_type.clone())
        };

        let asset = build_asset(bytes, declared_mime.as_deref())?;
        if self.store.get_image(&asset.id).await?.is_none() {
            self.store.put_image(&asset).await?;
            debug!(image_id = %asset.id, width = asset.width, height = asset.height, "stored image asset");
        }
        Ok(asset.id)
    }

    /// Concurrent requests for the same URL share one download.
    async fn fetch_shared(&self, url: &str) -> OrchestratorResult<Arc<FetchedImage>> {
        let fetch = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            in_flight
                .entry(url.to_string())
                .or_insert_with(|| {
                    let fetcher = Arc::clone(&self.fetcher);
                    let url = url.to_string();
                    async move {
                        fetcher
                            .fetch(&url)
                            .await
                            .map(Arc::new)
                            .map_err(|err| err.to_string())
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };

        let entry = InFlightEntry {
            in_flight: &self.in_flight,
            url,
            fetch,
        };
        entry.fetch.clone().await.map_err(OrchestratorError::Image)
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Every image reference in stream order, duplicates included. A structured
/// reference sorts before inline text starting at the same offset, since
/// that text arrived after it.
fn ordered_references(streamed: &[StreamedImage], text: &str) -> Vec<String> {
    let mut ordered: Vec<(usize, u8, String)> = streamed
        .iter()
        .filter_map(|image| {
            let reference = match &image.reference {
                StreamedReference::Url(url) => Some(url.trim().to_string()),
                StreamedReference::Attachment(attachment) if is_image_attachment(attachment) => {
                    attachment_reference(attachment)
                }
                StreamedReference::Attachment(_) => None,
            };
            reference.map(|reference| (image.text_offset, 0, reference))
        })
        .collect();
    ordered.extend(
        inline_references(text)
            .into_iter()
            .map(|(start, reference)| (start, 1, reference)),
    );
    ordered.sort_by_key(|(offset, rank, _)| (*offset, *rank));

    ordered
        .into_iter()
        .map(|(_, _, reference)| reference)
        .filter(|reference| !reference.is_empty())
        .collect()
}

/// Image references in stream order, keeping the first occurrence of every
/// exact string.
#[must_use]
pub fn gather_references(streamed: &[StreamedImage], text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    ordered_references(streamed, text)
        .into_iter()
        .filter(|reference| seen.insert(reference.clone()))
        .collect()
}

fn inline_references(text: &str) -> Vec<(usize, String)> {
    let mut found: Vec<(usize, String)> = MARKDOWN_IMAGE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| (m.start(), m.as_str().to_string()))
        .collect();
    found.extend(
        DATA_URI_IMAGE
            .find_iter(text)
            .map(|m| (m.start(), m.as_str().to_string())),
    );
    found.sort_by_key(|(start, _)| *start);
    found
}

fn is_image_attachment(attachment: &Attachment) -> bool {
    if attachment
        .mime_type
        .as_deref()
        .is_some_and(|mime| mime.to_ascii_lowercase().starts_with("image/"))
    {
        return true;
    }
    let has_image_extension = |value: &str| {
        let path = value.split(['?', '#']).next().unwrap_or(value);
        path.rsplit_once('.')
            .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    };
    [attachment.url.as_deref(), attachment.name.as_deref()]
        .into_iter()
        .flatten()
        .any(|value| value.starts_with("data:image/") || has_image_extension(value))
        || attachment
            .base64
            .as_deref()
            .is_some_and(|b64| b64.starts_with("data:image/"))
}

fn attachment_reference(attachment: &Attachment) -> Option<String> {
    if let Some(url) = attachment.url.as_deref().filter(|u| !u.is_empty()) {
        return Some(url.to_string());
    }
    let payload = attachment.base64.as_deref().filter(|b| !b.is_empty())?;
    if payload.starts_with("data:") {
        return Some(payload.to_string());
    }
    let mime = attachment.mime_type.as_deref().unwrap_or("image/png");
    Some(format!("data:{mime};base64,{payload}"))
}

fn decode_data_uri(uri: &str) -> OrchestratorResult<(Vec<u8>, Option<String>)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| OrchestratorError::Image("not a data URI".into()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| OrchestratorError::Image("data URI without payload".into()))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| OrchestratorError::Image("only base64 data URIs are supported".into()))?;

    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|err| OrchestratorError::Image(format!("invalid base64 payload: {err}")))?;
    Ok((bytes, Some(mime.to_string()).filter(|m| !m.is_empty())))
}

fn build_asset(bytes: Vec<u8>, declared_mime: Option<&str>) -> OrchestratorResult<ImageAsset> {
    let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
        .with_guessed_format()
        .map_err(|err| OrchestratorError::Image(err.to_string()))?;
    let mime_type = reader
        .format()
        .map(|format| format.to_mime_type().to_string())
        .or_else(|| declared_mime.map(str::to_string))
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let (width, height) = reader.into_dimensions()?;

    Ok(ImageAsset {
        id: hex::encode(Sha256::digest(&bytes)),
        mime_type,
        width,
        height,
        bytes,
        created_at: Timestamp::now(),
    })
}

/// Removes resolved inline data URIs, including their markdown wrappers,
/// from `text`.
#[must_use]
pub fn strip_inline_images(text: &str, inlined: &[String]) -> String {
    if inlined.is_empty() {
        return text.to_string();
    }
    let resolved: HashSet<&str> = inlined.iter().map(String::as_str).collect();

    let without_markdown = MARKDOWN_IMAGE.replace_all(text, |caps: &regex::Captures<'_>| {
        let target = caps.get(1).map_or("", |m| m.as_str());
        if resolved.contains(target) {
            String::new()
        } else {
            caps[0].to_string()
        }
    });
    let stripped = DATA_URI_IMAGE.replace_all(&without_markdown, |caps: &regex::Captures<'_>| {
        if resolved.contains(&caps[0]) {
            String::new()
        } else {
            caps[0].to_string()
        }
    });

    stripped.trim().to_string()
}

fn preview(reference: &str) -> &str {
    let end = reference
        .char_indices()
        .nth(64)
        .map_or(reference.len(), |(index, _)| index);
    &reference[..end]
}
