//! Secondary subtitle tracks.
//!
//! A [`SubtitleTrack`] owns one catalog entry's cues and renders the ones
//! visible at a given play time. Variants share one state machine:
//!
//! ```text
//! Uninitialized ──activate()──► Loading ──parsed──► Ready
//!                                  │
//!                                  └── download/parse failure: stays Loading
//! ```
//!
//! The cue sheet is published before the state flips to Ready, so any
//! reader that observes Ready also observes the full cue list.

pub mod archive;
pub mod ttml;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::config::RenderOptions;
use crate::error::Result;
use crate::http_client::SubtitleFetcher;
use crate::layout::{place_scaled, place_vertical, wrap_text, Anchor, Extent, Layer, Rect};
use crate::translate::{TranslationHandle, TranslationOverlay, TranslationSetup};

use self::archive::ImageArchive;

/// Font size as a fraction of frame height at scale 1.0
const TEXT_SIZE_RATIO: f64 = 0.045;
const LINE_HEIGHT: f64 = 1.25;
/// Fraction of frame width a text line may occupy
const TEXT_WIDTH_RATIO: f64 = 0.8;
/// Average glyph advance relative to font size, used for wrapping
const GLYPH_ADVANCE: f64 = 0.55;

// ─── Cues ──────────────────────────────────────────────────────────────────

/// Text payload. Replaced wholesale, never edited in place.
#[derive(Debug)]
pub struct CueText {
    text: RwLock<Arc<str>>,
    /// Baseline chosen from the cue's region; `None` renders on the lower one
    pub anchor: Option<Anchor>,
}

impl CueText {
    pub fn new(text: impl Into<Arc<str>>, anchor: Option<Anchor>) -> Self {
        Self {
            text: RwLock::new(text.into()),
            anchor,
        }
    }

    /// Current text snapshot.
    pub fn get(&self) -> Arc<str> {
        self.text.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Swap in new text. Readers see either the old or the new value.
    pub fn replace(&self, text: impl Into<Arc<str>>) {
        *self.text.write().unwrap_or_else(PoisonError::into_inner) = text.into();
    }

    pub fn lines(&self) -> Vec<String> {
        ttml::normalize_lines(&self.get())
    }
}

/// Bitmap payload. The PNG is pulled out of the archive the first time the
/// cue is rendered.
#[derive(Debug)]
pub struct ImageCue {
    /// Archive entry name
    pub src: String,
    /// Placement in the document frame
    pub rect: Rect,
    bitmap: OnceLock<Bytes>,
}

impl ImageCue {
    pub fn new(src: impl Into<String>, rect: Rect) -> Self {
        Self {
            src: src.into(),
            rect,
            bitmap: OnceLock::new(),
        }
    }

    pub fn bitmap(&self, archive: &ImageArchive) -> Result<Bytes> {
        if let Some(bytes) = self.bitmap.get() {
            return Ok(bytes.clone());
        }
        let bytes = archive.read_entry(&self.src)?;
        Ok(self.bitmap.get_or_init(|| bytes).clone())
    }

    pub fn is_decoded(&self) -> bool {
        self.bitmap.get().is_some()
    }
}

#[derive(Debug)]
pub enum CuePayload {
    Text(CueText),
    Image(ImageCue),
}

#[derive(Debug)]
pub struct Cue {
    /// Position in the sheet
    pub id: usize,
    pub begin: f64,
    pub end: f64,
    pub payload: CuePayload,
}

impl Cue {
    /// Closed interval test.
    pub fn contains(&self, time: f64) -> bool {
        self.begin <= time && time <= self.end
    }

    pub fn text(&self) -> Option<&CueText> {
        match &self.payload {
            CuePayload::Text(text) => Some(text),
            CuePayload::Image(_) => None,
        }
    }
}

/// Parsed cues of one track plus the frame they were authored against.
#[derive(Debug)]
pub struct CueSheet {
    /// Document frame the cue geometry refers to
    pub extent: Extent,
    pub cues: Vec<Cue>,
    archive: Option<ImageArchive>,
    revision: AtomicU64,
}

impl CueSheet {
    pub fn new(extent: Extent, cues: Vec<Cue>, archive: Option<ImageArchive>) -> Self {
        Self {
            extent,
            cues,
            archive,
            revision: AtomicU64::new(0),
        }
    }

    /// Every cue whose interval contains `time`.
    pub fn active(&self, time: f64) -> Vec<&Cue> {
        self.cues.iter().filter(|c| c.contains(time)).collect()
    }

    pub fn archive(&self) -> Option<&ImageArchive> {
        self.archive.as_ref()
    }

    /// Bumped whenever cue text changes after parsing.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    /// Text cues in order, skipping bitmap cues.
    pub fn text_cues(&self) -> impl Iterator<Item = &Cue> {
        self.cues.iter().filter(|c| c.text().is_some())
    }
}

// ─── Render output ─────────────────────────────────────────────────────────

/// A block of overlay text centered on `center_x`, top edge at `top`.
#[derive(Debug, Clone, PartialEq)]
pub struct TextPrimitive {
    pub lines: Vec<String>,
    pub center_x: f64,
    pub top: f64,
    pub font_size: f64,
    pub line_height: f64,
    pub color: String,
    pub stroke_color: String,
    pub stroke_width: f64,
    pub opacity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImagePrimitive {
    pub src: String,
    pub bitmap: Bytes,
    pub rect: Rect,
    pub opacity: f64,
}

/// One overlay child.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Text(TextPrimitive),
    Image(ImagePrimitive),
}

// ─── Track ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Uninitialized,
    Loading,
    Ready,
}

impl DownloadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Loading,
            _ => Self::Ready,
        }
    }
}

/// Display metadata for the track menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackMeta {
    /// Menu label, e.g. `English [CC]`
    pub display_language: String,
    pub bcp47: String,
    pub is_caption: bool,
}

impl TrackMeta {
    pub fn new(display_language: impl Into<String>, bcp47: impl Into<String>, is_caption: bool) -> Self {
        Self {
            display_language: display_language.into(),
            bcp47: bcp47.into(),
            is_caption,
        }
    }
}

/// Track variant.
#[derive(Clone)]
pub enum TrackKind {
    /// The "Off" entry
    Dummy,
    /// Known to exist, not yet resolved to download URLs
    Dehydrated,
    Text,
    Image,
    /// Text plus a background translation started once cues are ready
    AiTranslated(Arc<TranslationSetup>),
}

impl TrackKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dummy => "off",
            Self::Dehydrated => "dehydrated",
            Self::Text => "text",
            Self::Image => "image",
            Self::AiTranslated(_) => "ai",
        }
    }
}

impl std::fmt::Debug for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Serializable snapshot for menus and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct TrackSummary {
    pub display_language: String,
    pub bcp47: String,
    pub is_caption: bool,
    pub kind: &'static str,
    pub state: DownloadState,
    pub active: bool,
}

pub struct SubtitleTrack {
    meta: TrackMeta,
    kind: TrackKind,
    source_urls: Vec<String>,
    fetcher: Option<Arc<dyn SubtitleFetcher>>,
    state: AtomicU8,
    active: AtomicBool,
    load: OnceCell<bool>,
    sheet: OnceLock<Arc<CueSheet>>,
    frame_extent: Mutex<Option<Extent>>,
    last_signature: Mutex<Option<String>>,
    translation: OnceLock<TranslationHandle>,
}

impl std::fmt::Debug for SubtitleTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubtitleTrack")
            .field("meta", &self.meta)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl SubtitleTrack {
    /// Track backed by downloadable content.
    pub fn new(
        meta: TrackMeta,
        kind: TrackKind,
        source_urls: Vec<String>,
        fetcher: Arc<dyn SubtitleFetcher>,
    ) -> Self {
        Self::build(meta, kind, source_urls, Some(fetcher))
    }

    /// The "Off" entry.
    pub fn dummy() -> Self {
        Self::build(TrackMeta::new("Off", "", false), TrackKind::Dummy, Vec::new(), None)
    }

    pub fn dehydrated(meta: TrackMeta) -> Self {
        Self::build(meta, TrackKind::Dehydrated, Vec::new(), None)
    }

    fn build(
        meta: TrackMeta,
        kind: TrackKind,
        source_urls: Vec<String>,
        fetcher: Option<Arc<dyn SubtitleFetcher>>,
    ) -> Self {
        Self {
            meta,
            kind,
            source_urls,
            fetcher,
            state: AtomicU8::new(DownloadState::Uninitialized as u8),
            active: AtomicBool::new(false),
            load: OnceCell::new(),
            sheet: OnceLock::new(),
            frame_extent: Mutex::new(None),
            last_signature: Mutex::new(None),
            translation: OnceLock::new(),
        }
    }

    pub fn meta(&self) -> &TrackMeta {
        &self.meta
    }

    pub fn kind(&self) -> &TrackKind {
        &self.kind
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self.kind, TrackKind::Dummy)
    }

    pub fn is_dehydrated(&self) -> bool {
        matches!(self.kind, TrackKind::Dehydrated)
    }

    pub fn is_ai_translated(&self) -> bool {
        matches!(self.kind, TrackKind::AiTranslated(_))
    }

    pub fn source_urls(&self) -> &[String] {
        &self.source_urls
    }

    pub fn state(&self) -> DownloadState {
        DownloadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Parsed cues, once Ready.
    pub fn cues(&self) -> Option<Arc<CueSheet>> {
        if self.state() == DownloadState::Ready {
            self.sheet.get().cloned()
        } else {
            None
        }
    }

    /// Handle of the background translation, if one was started.
    pub fn translation(&self) -> Option<&TranslationHandle> {
        self.translation.get()
    }

    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            display_language: self.meta.display_language.clone(),
            bcp47: self.meta.bcp47.clone(),
            is_caption: self.meta.is_caption,
            kind: self.kind.name(),
            state: self.state(),
            active: self.is_active(),
        }
    }

    /// Mark the track active and make sure its cues are loaded.
    ///
    /// Only the first call downloads; concurrent callers wait for that one
    /// load. Resolves once cues are parsed or the load failed, and reports
    /// the resulting state.
    #[instrument(skip(self), fields(track = %self.meta.display_language, kind = self.kind.name()))]
    pub async fn activate(&self) -> DownloadState {
        self.mark_active();
        self.ensure_loaded().await
    }

    /// Load cues without touching the active flag.
    pub async fn ensure_loaded(&self) -> DownloadState {
        if matches!(self.kind, TrackKind::Dummy | TrackKind::Dehydrated) {
            return self.state();
        }

        let ready = *self.load.get_or_init(|| self.load_once()).await;
        if ready {
            if let TrackKind::AiTranslated(setup) = &self.kind {
                self.start_translation(setup);
            }
        }
        self.state()
    }

    /// Flag the track active without loading it.
    pub fn mark_active(&self) {
        self.active.store(true, Ordering::Release);
        self.clear_signature();
    }

    /// Stop rendering. Cues stay loaded.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.clear_signature();
    }

    async fn load_once(&self) -> bool {
        if self
            .state
            .compare_exchange(
                DownloadState::Uninitialized as u8,
                DownloadState::Loading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return self.state() == DownloadState::Ready;
        }

        let Some(fetcher) = &self.fetcher else {
            warn!("Track has no fetcher, staying in Loading");
            return false;
        };

        let body = match fetcher.fetch_first(&self.source_urls).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, candidates = self.source_urls.len(), "Subtitle download failed");
                return false;
            }
        };

        let parsed = match self.kind {
            TrackKind::Image => archive::parse_image_archive(body),
            _ => ttml::parse_ttml(&body),
        };
        match parsed {
            Ok(sheet) => {
                let cues = sheet.cues.len();
                // Publish before flipping state
                let _ = self.sheet.set(Arc::new(sheet));
                self.state.store(DownloadState::Ready as u8, Ordering::Release);
                info!(cues, "Subtitle track ready");
                true
            }
            Err(e) => {
                warn!(error = %e, "Subtitle parse failed");
                false
            }
        }
    }

    fn start_translation(&self, setup: &Arc<TranslationSetup>) {
        let Some(sheet) = self.sheet.get() else {
            return;
        };
        self.translation.get_or_init(|| {
            debug!(target_language = %setup.config.target_language, "Starting background translation");
            TranslationOverlay::spawn(Arc::clone(sheet), Arc::clone(setup))
        });
    }

    /// Last known viewport.
    pub fn frame_extent(&self) -> Option<Extent> {
        *self.frame_extent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the viewport. Returns whether it changed.
    pub fn set_frame_extent(&self, extent: Extent) -> bool {
        let mut current = self.frame_extent.lock().unwrap_or_else(PoisonError::into_inner);
        if *current == Some(extent) {
            return false;
        }
        *current = Some(extent);
        true
    }

    fn clear_signature(&self) {
        *self.last_signature.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Render the cues visible at `time`.
    ///
    /// - `Some(vec![])`: inactive, not Ready, or no cues at all
    /// - `None`: the visible cue set is unchanged since the last call and
    ///   `force` is false
    /// - `Some(primitives)`: the new overlay content
    pub fn render(&self, time: f64, opts: &RenderOptions, force: bool) -> Option<Vec<Primitive>> {
        if !self.is_active() {
            return Some(Vec::new());
        }
        let Some(sheet) = self.cues() else {
            return Some(Vec::new());
        };
        if sheet.cues.is_empty() {
            return Some(Vec::new());
        }

        let visible = sheet.active(time);
        let signature = signature(sheet.revision(), &visible);
        {
            let mut last = self.last_signature.lock().unwrap_or_else(PoisonError::into_inner);
            if !force && last.as_deref() == Some(signature.as_str()) {
                return None;
            }
            *last = Some(signature);
        }

        let frame = self.frame_extent().unwrap_or(sheet.extent);
        let mut out = render_text(&visible, frame, opts);
        out.extend(render_images(&sheet, &visible, frame, opts));
        Some(out)
    }
}

fn signature(revision: u64, visible: &[&Cue]) -> String {
    let ids: Vec<String> = visible.iter().map(|c| c.id.to_string()).collect();
    format!("{revision}:{}", ids.join(","))
}

fn render_text(visible: &[&Cue], frame: Extent, opts: &RenderOptions) -> Vec<Primitive> {
    let font_size = frame.height * TEXT_SIZE_RATIO * opts.secondary_text_scale;
    let line_height = font_size * LINE_HEIGHT;
    let max_chars = (frame.width * TEXT_WIDTH_RATIO / (font_size * GLYPH_ADVANCE)).floor().max(1.0) as usize;

    let mut upper = Vec::new();
    let mut lower = Vec::new();
    for text in visible.iter().filter_map(|c| c.text()) {
        let group = match text.anchor.unwrap_or(Anchor::Lower) {
            Anchor::Upper => &mut upper,
            Anchor::Lower => &mut lower,
        };
        for line in text.lines() {
            group.extend(wrap_text(&line, max_chars));
        }
    }

    [(Anchor::Upper, upper), (Anchor::Lower, lower)]
        .into_iter()
        .filter(|(_, lines)| !lines.is_empty())
        .map(|(anchor, lines)| {
            let height = lines.len() as f64 * line_height;
            let placement = place_vertical(Layer::Secondary, anchor, height, frame.height, opts);
            Primitive::Text(TextPrimitive {
                lines,
                center_x: frame.width / 2.0,
                top: placement.top,
                font_size,
                line_height,
                color: opts.secondary_text_color.clone(),
                stroke_color: opts.stroke_color.clone(),
                stroke_width: opts.stroke_width,
                opacity: opts.secondary_text_opacity,
            })
        })
        .collect()
}

fn render_images(sheet: &CueSheet, visible: &[&Cue], frame: Extent, opts: &RenderOptions) -> Vec<Primitive> {
    let Some(archive) = sheet.archive() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for cue in visible {
        let CuePayload::Image(image) = &cue.payload else {
            continue;
        };
        let bitmap = match image.bitmap(archive) {
            Ok(bitmap) => bitmap,
            Err(e) => {
                warn!(src = %image.src, error = %e, "Bitmap cue unavailable");
                continue;
            }
        };
        let (rect, _) = place_scaled(
            Layer::Secondary,
            &image.rect,
            sheet.extent,
            frame,
            opts.secondary_image_scale,
            opts,
        );
        out.push(Primitive::Image(ImagePrimitive {
            src: image.src.clone(),
            bitmap,
            rect,
            opacity: opts.secondary_image_opacity,
        }));
    }
    out
}
