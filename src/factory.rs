//! Catalog descriptor → [`SubtitleTrack`] conversion.

use std::sync::Arc;

use tracing::debug;

use crate::catalog::{Downloadable, Manifest, TrackDescriptor};
use crate::http_client::SubtitleFetcher;
use crate::track::{SubtitleTrack, TrackKind, TrackMeta};
use crate::translate::TranslationSetup;

/// The only text encoding profile we download.
pub const TEXT_PROFILE: &str = "dfxp-ls-sdh";

/// Whether a descriptor is one of the placeholder "Off" entries the catalog
/// sometimes injects.
///
/// Any one signal is enough: the explicit flag, a `1` in the fifth
/// `;`-separated field of the track id, or a negative rank.
pub fn is_none_track(descriptor: &TrackDescriptor) -> bool {
    if descriptor.is_none_track {
        return true;
    }
    let id_flag = descriptor
        .track_id
        .as_deref()
        .and_then(|id| id.split(';').nth(4))
        .is_some_and(|field| field == "1");
    id_flag || descriptor.rank.is_some_and(|rank| rank < 0)
}

fn meta_for(descriptor: &TrackDescriptor) -> TrackMeta {
    let language = descriptor
        .language_description
        .clone()
        .or_else(|| descriptor.language.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    let is_caption = descriptor.is_closed_captions();
    let display = if is_caption {
        format!("{language} [CC]")
    } else {
        language
    };
    TrackMeta::new(display, descriptor.language.clone().unwrap_or_default(), is_caption)
}

fn text_profile(descriptor: &TrackDescriptor) -> Option<&Downloadable> {
    descriptor.tt_downloadables.get(TEXT_PROFILE).filter(|d| !d.is_image)
}

fn is_image_based(descriptor: &TrackDescriptor) -> bool {
    descriptor.tt_downloadables.values().any(|d| d.is_image)
}

/// Builds tracks that share one fetcher and, optionally, one translator.
#[derive(Clone)]
pub struct TrackFactory {
    fetcher: Arc<dyn SubtitleFetcher>,
    translation: Option<Arc<TranslationSetup>>,
}

impl TrackFactory {
    pub fn new(fetcher: Arc<dyn SubtitleFetcher>) -> Self {
        Self {
            fetcher,
            translation: None,
        }
    }

    /// Synthesize an AI-translated entry for catalogs with a source track.
    #[must_use]
    pub fn with_translation(mut self, setup: Arc<TranslationSetup>) -> Self {
        self.translation = Some(setup);
        self
    }

    pub fn translation(&self) -> Option<&Arc<TranslationSetup>> {
        self.translation.as_ref()
    }

    /// Convert one descriptor. `None` when the descriptor has nothing we can
    /// render.
    pub fn build(&self, descriptor: &TrackDescriptor) -> Option<SubtitleTrack> {
        let meta = meta_for(descriptor);

        if !descriptor.hydrated {
            return Some(SubtitleTrack::dehydrated(meta));
        }

        let (kind, downloadable) = if is_image_based(descriptor) {
            let best = descriptor
                .tt_downloadables
                .values()
                .filter(|d| d.is_image)
                .max_by_key(|d| d.resolution())?;
            (TrackKind::Image, best)
        } else {
            let Some(profile) = text_profile(descriptor) else {
                debug!(track = %meta.display_language, "No supported text profile");
                return None;
            };
            (TrackKind::Text, profile)
        };

        let urls = downloadable.candidate_urls();
        if urls.is_empty() {
            debug!(track = %meta.display_language, "Descriptor has no download URLs");
            return None;
        }
        Some(SubtitleTrack::new(meta, kind, urls, Arc::clone(&self.fetcher)))
    }

    /// Translated variant of a text descriptor.
    pub fn build_ai_translated(&self, source: &TrackDescriptor) -> Option<SubtitleTrack> {
        let setup = self.translation.as_ref()?;
        if !source.hydrated || is_image_based(source) {
            return None;
        }
        let urls = text_profile(source)?.candidate_urls();
        if urls.is_empty() {
            return None;
        }
        let base = meta_for(source);
        let target = &setup.config.target_language;
        let meta = TrackMeta::new(format!("{} (AI → {target})", base.display_language), target.clone(), false);
        Some(SubtitleTrack::new(
            meta,
            TrackKind::AiTranslated(Arc::clone(setup)),
            urls,
            Arc::clone(&self.fetcher),
        ))
    }

    /// Descriptor the translated entry is derived from: the source-language
    /// text track, subtitles preferred over captions.
    pub fn translation_source<'a>(&self, manifest: &'a Manifest) -> Option<&'a TrackDescriptor> {
        let setup = self.translation.as_ref()?;
        let source = setup.config.source_language.as_str();
        let candidates = manifest.timed_text_tracks.iter().filter(|d| {
            !is_none_track(d)
                && d.hydrated
                && d.language.as_deref() == Some(source)
                && text_profile(d).is_some()
                && !is_image_based(d)
        });
        let (subtitles, captions): (Vec<_>, Vec<_>) = candidates.partition(|d| !d.is_closed_captions());
        subtitles.into_iter().chain(captions).next()
    }

    /// Every renderable track of a catalog, none-tracks removed.
    pub fn build_all(&self, manifest: &Manifest) -> Vec<SubtitleTrack> {
        manifest
            .timed_text_tracks
            .iter()
            .filter(|d| !is_none_track(d))
            .filter_map(|d| self.build(d))
            .collect()
    }
}
