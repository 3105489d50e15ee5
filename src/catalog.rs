//! Catalog (manifest) model and the per-title catalog store.
//!
//! A catalog is the per-title metadata document the host player downloads:
//! audio, video, and timed-text encodings. The interception hook hands it
//! over already parsed as JSON; only the fields this crate reads are modeled.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Per-title catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub movie_id: u64,
    #[serde(default, rename = "timedtexttracks")]
    pub timed_text_tracks: Vec<TrackDescriptor>,
    #[serde(default, rename = "audio_tracks")]
    pub audio_tracks: Vec<AudioTrack>,
    #[serde(default, rename = "video_tracks")]
    pub video_tracks: Vec<VideoTrack>,
    #[serde(default)]
    pub recommended_media: Option<RecommendedMedia>,
}

impl Manifest {
    /// Parse a catalog from its JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Width / height of the first video track that declares both.
    pub fn aspect_ratio(&self) -> Option<f64> {
        self.video_tracks.iter().find_map(|v| match (v.max_width, v.max_height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(f64::from(w) / f64::from(h)),
            _ => None,
        })
    }

    /// Language of the native audio track, or of the first one.
    pub fn audio_language(&self) -> Option<&str> {
        self.audio_tracks
            .iter()
            .find(|a| a.is_native)
            .or_else(|| self.audio_tracks.first())
            .map(|a| a.language.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrack {
    pub language: String,
    #[serde(default)]
    pub is_native: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoTrack {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedMedia {
    pub timed_text_track_id: Option<String>,
}

/// One timed-text entry of the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDescriptor {
    /// Semicolon-delimited track identifier, e.g. `T:1:0;1;en;0;0;0;`
    #[serde(default, rename = "new_track_id", alias = "trackId")]
    pub track_id: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub language_description: Option<String>,
    /// `subtitles` or `closedcaptions`
    #[serde(default)]
    pub raw_track_type: Option<String>,
    #[serde(default)]
    pub is_none_track: bool,
    #[serde(default = "default_hydrated", alias = "isHydrated")]
    pub hydrated: bool,
    #[serde(default)]
    pub rank: Option<i64>,
    /// Encoding profile name → downloadable
    #[serde(default)]
    pub tt_downloadables: BTreeMap<String, Downloadable>,
}

fn default_hydrated() -> bool {
    true
}

impl TrackDescriptor {
    pub fn is_closed_captions(&self) -> bool {
        self.raw_track_type.as_deref() == Some("closedcaptions")
    }
}

/// One encoding profile of a timed-text track.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Downloadable {
    #[serde(default)]
    pub is_image: bool,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Older shape: CDN id → URL
    #[serde(default)]
    pub download_urls: Option<BTreeMap<String, String>>,
    /// Newer shape: list of `{cdn_id, url}`
    #[serde(default)]
    pub urls: Option<Vec<UrlEntry>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlEntry {
    pub url: String,
    #[serde(default)]
    pub cdn_id: Option<serde_json::Value>,
}

impl Downloadable {
    /// Download candidates from whichever URL shape is present, in order,
    /// without duplicates.
    pub fn candidate_urls(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let from_map = self.download_urls.iter().flat_map(|m| m.values().cloned());
        let from_list = self.urls.iter().flatten().map(|e| e.url.clone());
        for url in from_map.chain(from_list) {
            if !url.is_empty() && !out.contains(&url) {
                out.push(url);
            }
        }
        out
    }

    /// Pixel count used to rank image profiles.
    pub fn resolution(&self) -> u64 {
        u64::from(self.width.unwrap_or(0)) * u64::from(self.height.unwrap_or(0))
    }
}

/// Store of the most recently seen catalog per title.
pub trait CatalogStore: Send + Sync {
    fn put(&self, manifest: Manifest) -> Result<()>;

    fn get(&self, movie_id: u64) -> Result<Option<Manifest>>;
}

/// In-memory store. The last stored catalog is the current one.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    catalogs: HashMap<u64, Manifest>,
    current: Option<u64>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Movie id of the most recently stored catalog.
    pub fn current(&self) -> Option<u64> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).current
    }
}

impl CatalogStore for MemoryCatalogStore {
    fn put(&self, manifest: Manifest) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.current = Some(manifest.movie_id);
        inner.catalogs.insert(manifest.movie_id, manifest);
        Ok(())
    }

    fn get(&self, movie_id: u64) -> Result<Option<Manifest>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.catalogs.get(&movie_id).cloned())
    }
}

/// On-disk record written by [`FileCatalogStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCatalog {
    pub movie_id: u64,
    pub stored_at: DateTime<Utc>,
    pub manifest: Manifest,
}

/// Durable store: one JSON file per movie id.
#[derive(Debug, Clone)]
pub struct FileCatalogStore {
    dir: PathBuf,
}

impl FileCatalogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under `<data_dir>/duosub/catalogs`.
    pub fn default_location() -> Self {
        Self::new(
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("duosub")
                .join("catalogs"),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, movie_id: u64) -> PathBuf {
        self.dir.join(format!("{movie_id}.json"))
    }

    /// Read the full record, including when it was stored.
    pub fn get_record(&self, movie_id: u64) -> Result<Option<StoredCatalog>> {
        let path = self.path_for(movie_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

impl CatalogStore for FileCatalogStore {
    fn put(&self, manifest: Manifest) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let record = StoredCatalog {
            movie_id: manifest.movie_id,
            stored_at: Utc::now(),
            manifest,
        };
        let path = self.path_for(record.movie_id);
        std::fs::write(&path, serde_json::to_vec(&record)?)?;
        debug!(movie_id = record.movie_id, path = %path.display(), "Catalog stored");
        Ok(())
    }

    fn get(&self, movie_id: u64) -> Result<Option<Manifest>> {
        Ok(self.get_record(movie_id)?.map(|r| r.manifest))
    }
}
