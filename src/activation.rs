//! Binding an arriving catalog to the title on screen.
//!
//! The interception hook can deliver catalogs for titles the user is not
//! watching (previews, prefetches) and can deliver them before the video
//! element exists. [`ManifestActivation`] only acts on a catalog once the
//! page, the player, and the store all agree on the movie id, then builds or
//! merges the track list, applies the language selection policy, and
//! (re)starts the render loop.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::catalog::{CatalogStore, Manifest};
use crate::config::{ActivationConfig, RenderLoopConfig, RenderOptions, SecondaryLanguageMode};
use crate::error::Result;
use crate::factory::{is_none_track, TrackFactory};
use crate::host::{HostPlayer, NoopObserver, SessionObserver, VideoState};
use crate::render_loop::{LoopSignal, RenderLoop, RenderLoopHandle, TrackList};
use crate::track::{SubtitleTrack, TrackSummary};

/// Result of one activation attempt. Only `Activated` and `Merged` change
/// anything; the rest are silent aborts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// New title: fresh track list
    Activated {
        movie_id: u64,
        tracks: usize,
        selected: Option<usize>,
    },
    /// Same title: placeholders resolved in place
    Merged { movie_id: u64, replaced: usize },
    /// The page shows a different title
    NotDisplayed { movie_id: u64 },
    /// No video element appeared in time
    VideoTimeout,
    /// The store has no catalog for the title
    UnknownCatalog { movie_id: u64 },
    /// The player reports a different title
    PlayerMismatch { expected: u64, found: Option<u64> },
}

/// State that lives exactly as long as one title.
#[derive(Debug, Clone)]
pub struct Session {
    pub movie_id: u64,
    pub tracks: TrackList,
    pub aspect_ratio: Option<f64>,
}

impl Session {
    pub fn snapshot(&self) -> Vec<Arc<SubtitleTrack>> {
        self.tracks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn summaries(&self) -> Vec<TrackSummary> {
        self.snapshot().iter().map(|t| t.summary()).collect()
    }
}

pub struct ManifestActivation {
    host: Arc<dyn HostPlayer>,
    store: Arc<dyn CatalogStore>,
    factory: TrackFactory,
    observer: Arc<dyn SessionObserver>,
    options: watch::Receiver<RenderOptions>,
    config: ActivationConfig,
    loop_config: RenderLoopConfig,
    session: Option<Session>,
    render_loop: Option<RenderLoopHandle>,
    /// Video source the latest loop was started for
    bound_src: Option<String>,
    signals_tx: mpsc::UnboundedSender<LoopSignal>,
    signals_rx: mpsc::UnboundedReceiver<LoopSignal>,
}

impl ManifestActivation {
    pub fn new(
        host: Arc<dyn HostPlayer>,
        store: Arc<dyn CatalogStore>,
        factory: TrackFactory,
        options: watch::Receiver<RenderOptions>,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            host,
            store,
            factory,
            observer: Arc::new(NoopObserver),
            options,
            config: ActivationConfig::default(),
            loop_config: RenderLoopConfig::default(),
            session: None,
            render_loop: None,
            bound_src: None,
            signals_tx,
            signals_rx,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ActivationConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_loop_config(mut self, config: RenderLoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Current track list, empty before the first activation.
    pub fn tracks(&self) -> Vec<Arc<SubtitleTrack>> {
        self.session.as_ref().map(Session::snapshot).unwrap_or_default()
    }

    /// The active non-"Off" track.
    pub fn active_track(&self) -> Option<Arc<SubtitleTrack>> {
        self.session
            .as_ref()
            .and_then(|s| crate::render_loop::active_track(&s.tracks))
    }

    pub fn is_render_loop_running(&self) -> bool {
        self.render_loop.as_ref().is_some_and(RenderLoopHandle::is_running)
    }

    pub fn stop_render_loop(&mut self) {
        if let Some(handle) = self.render_loop.take() {
            handle.stop();
        }
    }

    /// Store a catalog delivered by the interception hook and try to
    /// activate it.
    pub async fn on_manifest(&mut self, manifest: Manifest) -> Result<ActivationOutcome> {
        let movie_id = manifest.movie_id;
        self.store.put(manifest)?;
        self.activate(movie_id).await
    }

    /// Activate the stored catalog of `movie_id` if it is the title playing.
    #[instrument(skip(self))]
    pub async fn activate(&mut self, movie_id: u64) -> Result<ActivationOutcome> {
        if self.host.displayed_movie_id() != Some(movie_id) {
            debug!("Catalog is not for the displayed title");
            return Ok(ActivationOutcome::NotDisplayed { movie_id });
        }

        let Some(video) = self.wait_for_video().await else {
            info!(timeout = ?self.config.video_wait_timeout(), "No video element, activation abandoned");
            return Ok(ActivationOutcome::VideoTimeout);
        };

        // Re-check after the wait: navigation may have happened meanwhile
        let Some(manifest) = self.store.get(movie_id)? else {
            debug!("Catalog vanished from the store");
            return Ok(ActivationOutcome::UnknownCatalog { movie_id });
        };
        let found = self.host.player_movie_id();
        if found != Some(movie_id) {
            debug!(?found, "Player reports another title");
            return Ok(ActivationOutcome::PlayerMismatch {
                expected: movie_id,
                found,
            });
        }

        let outcome = if self.session.as_ref().is_some_and(|s| s.movie_id == movie_id) {
            self.merge(&manifest)
        } else {
            self.rebuild(&manifest)
        };

        if let Some(session) = self.session.as_mut() {
            session.aspect_ratio = manifest.aspect_ratio();
        }
        self.restart_render_loop(&video.src);
        info!(?outcome, "Activation complete");
        Ok(outcome)
    }

    async fn wait_for_video(&self) -> Option<VideoState> {
        let poll = async {
            loop {
                if let Some(video) = self.host.video() {
                    return video;
                }
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        };
        tokio::time::timeout(self.config.video_wait_timeout(), poll).await.ok()
    }

    /// Replace dehydrated placeholders whose label now resolves. Selection
    /// carries over to the replacement.
    fn merge(&mut self, manifest: &Manifest) -> ActivationOutcome {
        let Some(session) = self.session.as_ref() else {
            return self.rebuild(manifest);
        };

        let mut replaced = 0;
        {
            let mut tracks = session.tracks.write().unwrap_or_else(PoisonError::into_inner);
            for descriptor in manifest.timed_text_tracks.iter().filter(|d| !is_none_track(d)) {
                let Some(track) = self.factory.build(descriptor) else {
                    continue;
                };
                if track.is_dehydrated() {
                    continue;
                }
                let slot = tracks
                    .iter()
                    .position(|t| t.is_dehydrated() && t.meta().display_language == track.meta().display_language);
                if let Some(index) = slot {
                    let track = Arc::new(track);
                    if tracks[index].is_active() {
                        spawn_activate(&track);
                    }
                    debug!(track = %track.meta().display_language, "Placeholder hydrated");
                    tracks[index] = track;
                    replaced += 1;
                }
            }
        }

        if replaced > 0 {
            self.observer.tracks_changed(&session.summaries());
        }
        ActivationOutcome::Merged {
            movie_id: session.movie_id,
            replaced,
        }
    }

    fn rebuild(&mut self, manifest: &Manifest) -> ActivationOutcome {
        let mut tracks: Vec<Arc<SubtitleTrack>> = vec![Arc::new(SubtitleTrack::dummy())];
        tracks.extend(self.factory.build_all(manifest).into_iter().map(Arc::new));
        if let Some(ai) = self
            .factory
            .translation_source(manifest)
            .and_then(|source| self.factory.build_ai_translated(source))
        {
            tracks.push(Arc::new(ai));
        }

        let opts = self.options.borrow().clone();
        let selected = select_initial(&tracks, manifest, &opts);
        match selected {
            Some(index) => spawn_activate(&tracks[index]),
            None => tracks[0].mark_active(),
        }

        let count = tracks.len();
        let session = Session {
            movie_id: manifest.movie_id,
            tracks: Arc::new(RwLock::new(tracks)),
            aspect_ratio: manifest.aspect_ratio(),
        };
        self.observer.tracks_changed(&session.summaries());
        self.session = Some(session);

        ActivationOutcome::Activated {
            movie_id: manifest.movie_id,
            tracks: count,
            selected,
        }
    }

    fn restart_render_loop(&mut self, src: &str) {
        self.stop_render_loop();
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let render_loop = RenderLoop::new(
            Arc::clone(&self.host),
            Arc::clone(&session.tracks),
            self.options.clone(),
            src,
        )
        .with_aspect_ratio(session.aspect_ratio);
        self.bound_src = Some(src.to_string());
        self.render_loop = Some(render_loop.spawn(
            &self.loop_config,
            Arc::clone(&self.observer),
            self.signals_tx.clone(),
        ));
    }

    /// User picked entry `index` from the menu. Must be called inside a
    /// Tokio runtime.
    pub fn select(&self, index: usize) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let tracks = session.snapshot();
        let Some(chosen) = tracks.get(index) else {
            return false;
        };

        for (i, track) in tracks.iter().enumerate() {
            if i != index {
                track.deactivate();
            }
        }
        if chosen.is_dummy() {
            chosen.mark_active();
        } else {
            spawn_activate(chosen);
            self.observer
                .language_selected(&chosen.meta().bcp47, chosen.meta().is_caption);
        }
        self.observer.tracks_changed(&session.summaries());
        true
    }

    /// The bound video switched media without a new catalog: drop the
    /// session and rebuild from whatever the store holds for the displayed
    /// title.
    async fn on_loop_signal(&mut self, signal: LoopSignal) -> Result<Option<ActivationOutcome>> {
        match signal {
            LoopSignal::SourceChanged { src } => {
                if self.bound_src.as_deref() == Some(src.as_str()) {
                    debug!(%src, "Session already bound to this source, signal dropped");
                    return Ok(None);
                }
                info!(%src, "Media source changed, rebuilding session");
                self.stop_render_loop();
                self.session = None;
                match self.host.displayed_movie_id() {
                    Some(movie_id) => self.activate(movie_id).await.map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    /// Process catalogs and loop signals until the catalog channel closes.
    pub async fn run(&mut self, mut catalogs: mpsc::Receiver<Manifest>) {
        loop {
            tokio::select! {
                manifest = catalogs.recv() => {
                    let Some(manifest) = manifest else {
                        break;
                    };
                    if let Err(e) = self.on_manifest(manifest).await {
                        warn!(error = %e, "Catalog activation failed");
                    }
                }
                Some(signal) = self.signals_rx.recv() => {
                    if let Err(e) = self.on_loop_signal(signal).await {
                        warn!(error = %e, "Session rebuild failed");
                    }
                }
            }
        }
        self.stop_render_loop();
    }
}

fn spawn_activate(track: &Arc<SubtitleTrack>) {
    track.mark_active();
    let track = Arc::clone(track);
    tokio::spawn(async move {
        track.ensure_loaded().await;
    });
}

fn selectable(track: &SubtitleTrack) -> bool {
    !track.is_dummy() && !track.is_dehydrated()
}

fn primary_subtag(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}

/// Index of the track the selection policy picks for a new title.
pub fn select_initial(tracks: &[Arc<SubtitleTrack>], manifest: &Manifest, opts: &RenderOptions) -> Option<usize> {
    match opts.secondary_language_mode {
        SecondaryLanguageMode::Disabled => None,
        SecondaryLanguageMode::MatchAudio => {
            let language = manifest.audio_language()?;
            match_audio(tracks, language)
        }
        SecondaryLanguageMode::LastUsed => {
            let language = opts.last_used_language.as_deref()?;
            last_used(tracks, language, opts.last_used_is_caption)
        }
    }
}

fn match_audio(tracks: &[Arc<SubtitleTrack>], language: &str) -> Option<usize> {
    let candidates: Vec<(usize, &Arc<SubtitleTrack>)> = tracks
        .iter()
        .enumerate()
        .filter(|(_, t)| selectable(t) && !t.is_ai_translated())
        .collect();

    let exact: Vec<_> = candidates
        .iter()
        .filter(|(_, t)| t.meta().bcp47.eq_ignore_ascii_case(language))
        .collect();
    let pool = if exact.is_empty() {
        candidates
            .iter()
            .filter(|(_, t)| primary_subtag(&t.meta().bcp47).eq_ignore_ascii_case(primary_subtag(language)))
            .collect()
    } else {
        exact
    };

    pool.iter()
        .find(|(_, t)| !t.meta().is_caption)
        .or_else(|| pool.first())
        .map(|(i, _)| *i)
}

fn last_used(tracks: &[Arc<SubtitleTrack>], language: &str, is_caption: bool) -> Option<usize> {
    let same_language = |t: &Arc<SubtitleTrack>| selectable(t) && t.meta().bcp47 == language;
    tracks
        .iter()
        .position(|t| same_language(t) && t.meta().is_caption == is_caption)
        .or_else(|| tracks.iter().position(same_language))
}
