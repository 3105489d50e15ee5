//! `duosub` - Dual subtitle overlay engine
//!
//! # Features
//!
//! - **Second track**: an independently sourced subtitle track drawn over a
//!   host player's own subtitles, synced to its playback clock
//! - **Collision-free layout**: both layers hang from configurable
//!   baselines and share one recentering offset
//! - **Formats**: timed-text documents and zipped bitmap-cue archives
//! - **AI translation**: batched background translation merged into cues
//!   while they are on screen
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use duosub::{
//!     Extent, HeadlessHost, HttpFetcher, Manifest, ManifestActivation, MemoryCatalogStore,
//!     RenderOptions, TrackFactory,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manifest = Manifest::from_json(&std::fs::read_to_string("catalog.json")?)?;
//!     let host = Arc::new(HeadlessHost::new(Extent::new(1280.0, 720.0)));
//!     host.open_title(manifest.movie_id, "blob:title");
//!
//!     let (_options_tx, options_rx) = tokio::sync::watch::channel(RenderOptions::default());
//!     let factory = TrackFactory::new(Arc::new(HttpFetcher::new()?));
//!     let mut activation =
//!         ManifestActivation::new(host, Arc::new(MemoryCatalogStore::new()), factory, options_rx);
//!
//!     let outcome = activation.on_manifest(manifest).await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod activation;
pub mod catalog;
pub mod config;
pub mod error;
pub mod export;
pub mod factory;
pub mod host;
pub mod http_client;
pub mod layout;
pub mod render_loop;
pub mod track;
pub mod translate;

pub use activation::{select_initial, ActivationOutcome, ManifestActivation, Session};
pub use catalog::{CatalogStore, FileCatalogStore, Manifest, MemoryCatalogStore, TrackDescriptor};
pub use config::{
    ActivationConfig, FaultPolicy, RenderLoopConfig, RenderOptions, SecondaryLanguageMode, Settings,
    TranslationConfig,
};
pub use error::{Error, Result};
pub use export::{ExportFormat, SubtitleEntry};
pub use factory::{is_none_track, TrackFactory};
pub use host::{HeadlessHost, HostPlayer, NoopObserver, RecordingObserver, SessionEvent, SessionObserver};
pub use http_client::{HttpFetcher, MemoryFetcher, SubtitleFetcher};
pub use layout::{Anchor, Extent, Layer, Rect};
pub use render_loop::{LoopExit, RenderLoop, RenderLoopHandle, TickOutcome};
pub use track::{Cue, CueSheet, DownloadState, Primitive, SubtitleTrack, TrackKind, TrackMeta, TrackSummary};
pub use translate::{ChatTranslator, TranslationHandle, TranslationOverlay, TranslationSetup, Translator};

/// Version of duosub
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
