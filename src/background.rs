//! Background image loading, caching, and staleness control
//!
//! Backgrounds are fetched over HTTP, decoded, resized to the output
//! resolution at decode time, and kept in a small LRU cache keyed by
//! `(url, width, height)`. Overlapping loads are ordered by a monotonically
//! increasing request token: only the newest request may commit its result,
//! every earlier in-flight request detects the mismatch and discards its
//! decoded bitmap without touching shared state. The entry currently in use
//! by the compositor is never evicted.

use crate::error::{BgSwapError, Result};
use async_trait::async_trait;
use image::{imageops, RgbaImage};
use std::sync::Arc;
use std::time::Duration;

/// Default capacity of the background cache
pub const DEFAULT_BG_CACHE_CAPACITY: usize = 4;

/// Cache key: URL plus the resolution the bitmap was decoded at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackgroundKey {
    /// Source image URL
    pub url: String,
    /// Decode-time target width
    pub width: u32,
    /// Decode-time target height
    pub height: u32,
}

impl BackgroundKey {
    #[must_use]
    pub fn new<S: Into<String>>(url: S, width: u32, height: u32) -> Self {
        Self {
            url: url.into(),
            width,
            height,
        }
    }
}

/// Abstraction over the HTTP fetch so tests can control completion order
#[async_trait]
pub trait BackgroundFetcher: Send + Sync {
    /// Fetch the raw bytes of an image URL
    ///
    /// # Errors
    /// Network failures, non-success status codes
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Production fetcher backed by reqwest
pub struct HttpBackgroundFetcher {
    client: reqwest::Client,
}

impl HttpBackgroundFetcher {
    /// Create a fetcher with a bounded request timeout
    ///
    /// # Errors
    /// Failed to construct the HTTP client
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BgSwapError::network_error("Failed to create HTTP client", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BackgroundFetcher for HttpBackgroundFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BgSwapError::network_error("background fetch failed", e))?
            .error_for_status()
            .map_err(|e| BgSwapError::network_error("background fetch rejected", e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BgSwapError::network_error("background body read failed", e))?;
        Ok(bytes.to_vec())
    }
}

/// Decode fetched bytes and resize to the target resolution.
///
/// Resizing happens once here rather than per frame at draw time.
///
/// # Errors
/// Undecodable image data
pub fn decode_background(bytes: &[u8], width: u32, height: u32) -> Result<RgbaImage> {
    let decoded = image::load_from_memory(bytes)?.to_rgba8();
    if decoded.width() == width && decoded.height() == height {
        return Ok(decoded);
    }
    Ok(imageops::resize(
        &decoded,
        width,
        height,
        imageops::FilterType::Triangle,
    ))
}

/// Result of probing the cache for a requested key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// Requested key already active at this resolution; nothing to do
    ActiveNoop,
    /// Found in cache; promoted to MRU and activated
    Hit,
    /// Not resident; a fetch is required
    Miss,
}

/// Outcome of committing a completed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Result became the active background and was inserted at MRU
    Committed,
    /// A newer request superseded this one; result was discarded
    Stale,
}

/// LRU cache of decoded backgrounds plus the active-background slot.
///
/// Owned and mutated only by the worker task; overlapping async fetches are
/// serialized through [`begin_request`](BackgroundCache::begin_request) /
/// [`commit`](BackgroundCache::commit) tokens.
pub struct BackgroundCache {
    /// Promotion-ordered entries, oldest first
    entries: Vec<(BackgroundKey, Arc<RgbaImage>)>,
    capacity: usize,
    active: Option<(BackgroundKey, Arc<RgbaImage>)>,
    token: u64,
}

impl BackgroundCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: capacity.max(1),
            active: None,
            token: 0,
        }
    }

    /// The bitmap the compositor should draw as the base layer
    #[must_use]
    pub fn active_bitmap(&self) -> Option<&Arc<RgbaImage>> {
        self.active.as_ref().map(|(_, bitmap)| bitmap)
    }

    /// Key of the active background, if any
    #[must_use]
    pub fn active_key(&self) -> Option<&BackgroundKey> {
        self.active.as_ref().map(|(key, _)| key)
    }

    /// Number of resident cache entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a key is resident in the cache
    #[must_use]
    pub fn contains(&self, key: &BackgroundKey) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Probe the cache for `key`, activating it on a hit.
    ///
    /// A hit promotes the entry to MRU position and makes it the active
    /// background synchronously, with no network round-trip.
    pub fn lookup_activate(&mut self, key: &BackgroundKey) -> CacheLookup {
        if self.active_key() == Some(key) {
            return CacheLookup::ActiveNoop;
        }
        if let Some(index) = self.entries.iter().position(|(k, _)| k == key) {
            let entry = self.entries.remove(index);
            self.active = Some(entry.clone());
            self.entries.push(entry);
            return CacheLookup::Hit;
        }
        CacheLookup::Miss
    }

    /// Start a new fetch request, superseding all earlier in-flight ones.
    /// Returns the token the eventual [`commit`](BackgroundCache::commit)
    /// must present.
    pub fn begin_request(&mut self) -> u64 {
        self.token += 1;
        self.token
    }

    /// Token of the most recent request
    #[must_use]
    pub fn current_token(&self) -> u64 {
        self.token
    }

    /// Commit a completed fetch+decode.
    ///
    /// Only the request holding the current token may commit; stale results
    /// are discarded without mutating the active slot or the cache.
    pub fn commit(&mut self, token: u64, key: BackgroundKey, bitmap: RgbaImage) -> CommitOutcome {
        if token != self.token {
            log::debug!(
                "discarding stale background '{}' (token {token} != {})",
                key.url,
                self.token
            );
            return CommitOutcome::Stale;
        }

        let bitmap = Arc::new(bitmap);
        self.entries.retain(|(k, _)| k != &key);
        self.active = Some((key.clone(), bitmap.clone()));
        self.entries.push((key, bitmap));
        self.evict_overflow();
        CommitOutcome::Committed
    }

    /// Drop the active background (draw falls back to flat white)
    pub fn clear_active(&mut self) {
        self.active = None;
    }

    /// Release all cached bitmaps and the active slot
    pub fn clear(&mut self) {
        self.entries.clear();
        self.active = None;
    }

    fn evict_overflow(&mut self) {
        while self.entries.len() > self.capacity {
            let (oldest_key, oldest_bitmap) = self.entries.remove(0);
            let is_active = self
                .active
                .as_ref()
                .is_some_and(|(_, active)| Arc::ptr_eq(active, &oldest_bitmap));
            if is_active {
                // Never evict the active entry; re-promote it so it is not
                // immediately re-selected and evict the next-oldest instead.
                self.entries.push((oldest_key, oldest_bitmap));
                continue;
            }
            log::debug!("evicting background '{}'", oldest_key.url);
        }
    }
}

impl std::fmt::Debug for BackgroundCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundCache")
            .field("entries", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("active", &self.active_key())
            .field("token", &self.token)
            .finish()
    }
}
