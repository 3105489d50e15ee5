//! Per-frame synchronization of the primary and secondary subtitle layers.
//!
//! Each tick reads the video clock, restyles the host's own subtitles when
//! they changed, renders the active secondary track, and keeps the overlay
//! shifted by the same recentering offset as the primary layer. Work the
//! host would see is skipped whenever memoized state says nothing changed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{FaultPolicy, RenderLoopConfig, RenderOptions};
use crate::error::Result;
use crate::host::{HostPlayer, PrimaryLayer, PrimaryTransform, SessionObserver};
use crate::layout::{place_scaled, Extent, Layer};
use crate::track::SubtitleTrack;

/// Track list shared between the activation manager and the render loop.
pub type TrackList = Arc<RwLock<Vec<Arc<SubtitleTrack>>>>;

/// The first active track that can render anything.
pub fn active_track(tracks: &TrackList) -> Option<Arc<SubtitleTrack>> {
    tracks
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .find(|t| t.is_active() && !t.is_dummy())
        .cloned()
}

/// Raised by the loop for its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopSignal {
    /// The video element switched media without a new catalog.
    SourceChanged { src: String },
}

/// What one tick decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// No video and not on a playback page
    Stop,
    SourceChanged(String),
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Stopped,
    NoVideo,
    SourceChanged,
    Faulted,
}

pub struct RenderLoop {
    host: Arc<dyn HostPlayer>,
    tracks: TrackList,
    options: watch::Receiver<RenderOptions>,
    aspect_ratio: Option<f64>,
    bound_src: String,
    dirty: bool,
    /// `content_key|controls_visible` of the last applied primary transform
    primary_key: Option<String>,
    primary_offset: f64,
    /// Frame both layers were last placed in
    frame: Option<Extent>,
    overlay_offset: Option<f64>,
    overlay_empty: bool,
}

impl RenderLoop {
    /// Bind a loop to the video currently playing `bound_src`.
    pub fn new(
        host: Arc<dyn HostPlayer>,
        tracks: TrackList,
        options: watch::Receiver<RenderOptions>,
        bound_src: impl Into<String>,
    ) -> Self {
        Self {
            host,
            tracks,
            options,
            aspect_ratio: None,
            bound_src: bound_src.into(),
            dirty: true,
            primary_key: None,
            primary_offset: 0.0,
            frame: None,
            overlay_offset: None,
            overlay_empty: true,
        }
    }

    /// Size the overlay frame to the title's video geometry.
    #[must_use]
    pub fn with_aspect_ratio(mut self, aspect_ratio: Option<f64>) -> Self {
        self.aspect_ratio = aspect_ratio;
        self
    }

    /// Force a full re-render and re-transform on the next tick.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Run one frame.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        let Some(video) = self.host.video() else {
            if self.host.is_playback_page() {
                return Ok(TickOutcome::Continue);
            }
            return Ok(TickOutcome::Stop);
        };
        if video.src != self.bound_src {
            return Ok(TickOutcome::SourceChanged(video.src));
        }

        if self.options.has_changed().unwrap_or(false) {
            self.dirty = true;
        }
        let opts = self.options.borrow_and_update().clone();

        let Some(viewport) = self.host.mount_overlay() else {
            return Ok(TickOutcome::Continue);
        };
        let frame = self.aspect_ratio.map_or(viewport, |r| viewport.fit_aspect(r));
        if self.frame != Some(frame) {
            debug!(width = frame.width, height = frame.height, "Frame resized");
            self.frame = Some(frame);
            self.dirty = true;
        }

        let offset = self.transform_primary(frame, &opts)?;
        self.render_secondary(video.current_time, frame, &opts)?;

        if self.dirty || self.overlay_offset != Some(offset) {
            self.host.shift_overlay(offset)?;
            self.overlay_offset = Some(offset);
        }

        self.dirty = false;
        Ok(TickOutcome::Continue)
    }

    fn transform_primary(&mut self, frame: Extent, opts: &RenderOptions) -> Result<f64> {
        let Some(layer) = self.host.primary_layer() else {
            self.primary_key = None;
            self.primary_offset = 0.0;
            return Ok(0.0);
        };

        let key = format!("{}|{}", layer.content_key, self.host.controls_visible());
        if !self.dirty && self.primary_key.as_deref() == Some(key.as_str()) {
            return Ok(self.primary_offset);
        }

        let transform = primary_transform(&layer, frame, opts);
        self.host.apply_primary_transform(&transform)?;
        debug!(key = %key, offset = transform.offset, "Primary layer transformed");

        self.primary_key = Some(key);
        self.primary_offset = transform.offset;
        Ok(transform.offset)
    }

    fn render_secondary(&mut self, time: f64, frame: Extent, opts: &RenderOptions) -> Result<()> {
        let Some(track) = active_track(&self.tracks) else {
            if !self.overlay_empty {
                self.host.replace_overlay(&[])?;
                self.overlay_empty = true;
            }
            return Ok(());
        };

        if track.set_frame_extent(frame) {
            self.dirty = true;
        }

        match track.render(time, opts, self.dirty) {
            None => {}
            Some(primitives) if primitives.is_empty() && self.overlay_empty => {}
            Some(primitives) => {
                self.host.replace_overlay(&primitives)?;
                self.overlay_empty = primitives.is_empty();
            }
        }
        Ok(())
    }

    /// Drive the loop on a frame timer until stopped, halted, or unbound.
    pub fn spawn(
        mut self,
        config: &RenderLoopConfig,
        observer: Arc<dyn SessionObserver>,
        signals: mpsc::UnboundedSender<LoopSignal>,
    ) -> RenderLoopHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let frame_interval = config.frame_interval();
        let policy = config.fault_policy;

        observer.render_loop_started();
        info!(src = %self.bound_src, ?policy, "Render loop started");

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(frame_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let exit = loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break LoopExit::Stopped;
                        }
                    }
                    _ = interval.tick() => {}
                }

                match self.tick() {
                    Ok(TickOutcome::Continue) => {}
                    Ok(TickOutcome::Stop) => break LoopExit::NoVideo,
                    Ok(TickOutcome::SourceChanged(src)) => {
                        debug!(%src, "Video source changed");
                        let _ = signals.send(LoopSignal::SourceChanged { src });
                        break LoopExit::SourceChanged;
                    }
                    Err(e) => match policy {
                        FaultPolicy::Halt => {
                            error!(error = %e, "Render tick failed, loop halted");
                            break LoopExit::Faulted;
                        }
                        FaultPolicy::Resume => {
                            warn!(error = %e, "Render tick failed, retrying next frame");
                            self.mark_dirty();
                        }
                    },
                }
            };

            flag.store(false, Ordering::Release);
            observer.render_loop_stopped();
            info!(?exit, "Render loop stopped");
            exit
        });

        RenderLoopHandle {
            stop: stop_tx,
            running,
            task,
        }
    }
}

/// Scale and place the host's bitmap cues; the largest recentering offset
/// wins.
pub fn primary_transform(layer: &PrimaryLayer, frame: Extent, opts: &RenderOptions) -> PrimaryTransform {
    let mut offset: f64 = 0.0;
    let images = layer
        .images
        .iter()
        .map(|rect| {
            let (placed, shift) = place_scaled(Layer::Primary, rect, layer.frame, frame, opts.primary_image_scale, opts);
            offset = offset.max(shift);
            placed
        })
        .collect();

    PrimaryTransform {
        images,
        image_opacity: opts.primary_image_opacity,
        text_scale: opts.primary_text_scale,
        text_opacity: opts.primary_text_opacity,
        text_color: opts.primary_text_color.clone(),
        offset,
    }
}

/// Owner's handle on a running loop.
#[derive(Debug)]
pub struct RenderLoopHandle {
    stop: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    task: JoinHandle<LoopExit>,
}

impl RenderLoopHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the loop to stop after its current tick.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Wait for the loop to end.
    pub async fn join(self) -> LoopExit {
        self.task.await.unwrap_or(LoopExit::Faulted)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::host::{HeadlessHost, RecordingObserver, SessionEvent};
    use crate::http_client::MemoryFetcher;
    use crate::layout::Rect;
    use crate::track::tests::{text_track, OVERLAP_DOC};
    use crate::track::Primitive;

    struct Fixture {
        host: Arc<HeadlessHost>,
        tracks: TrackList,
        options: watch::Sender<RenderOptions>,
    }

    async fn fixture() -> (Fixture, RenderLoop) {
        let host = Arc::new(HeadlessHost::new(Extent::new(1000.0, 1000.0)));
        host.open_title(42, "blob:title-42");

        let fetcher = Arc::new(MemoryFetcher::new().with_body("https://cdn.example/en.xml", OVERLAP_DOC));
        let track = Arc::new(text_track(fetcher));
        track.activate().await;
        let tracks: TrackList = Arc::new(RwLock::new(vec![Arc::new(SubtitleTrack::dummy()), track]));

        let (options, rx) = watch::channel(RenderOptions::default());
        let render_loop = RenderLoop::new(host.clone(), tracks.clone(), rx, "blob:title-42");
        (Fixture { host, tracks, options }, render_loop)
    }

    fn overlay_lines(host: &HeadlessHost) -> Vec<String> {
        host.overlay()
            .into_iter()
            .flat_map(|p| match p {
                Primitive::Text(t) => t.lines,
                Primitive::Image(_) => Vec::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn overlay_replaced_only_when_cues_change() {
        let (f, mut lp) = fixture().await;

        f.host.seek(0.5);
        lp.tick().unwrap();
        // Nothing visible and nothing on screen yet: no host write
        assert_eq!(f.host.overlay_replacements(), 0);

        f.host.seek(2.5);
        lp.tick().unwrap();
        assert_eq!(overlay_lines(&f.host), vec!["first line", "second line"]);
        assert_eq!(f.host.overlay_replacements(), 1);

        f.host.seek(2.6);
        lp.tick().unwrap();
        assert_eq!(f.host.overlay_replacements(), 1);

        f.host.seek(5.0);
        lp.tick().unwrap();
        assert!(f.host.overlay().is_empty());
        assert_eq!(f.host.overlay_replacements(), 2);
    }

    #[tokio::test]
    async fn option_change_forces_rerender() {
        let (f, mut lp) = fixture().await;
        f.host.seek(2.5);
        lp.tick().unwrap();
        lp.tick().unwrap();
        assert_eq!(f.host.overlay_replacements(), 1);

        f.options.send_modify(|o| o.secondary_text_scale = 2.0);
        lp.tick().unwrap();
        assert_eq!(f.host.overlay_replacements(), 2);
        assert!(!lp.is_dirty());
    }

    #[tokio::test]
    async fn deselecting_clears_overlay() {
        let (f, mut lp) = fixture().await;
        f.host.seek(2.5);
        lp.tick().unwrap();
        assert!(!f.host.overlay().is_empty());

        for track in f.tracks.read().unwrap().iter() {
            track.deactivate();
        }
        lp.tick().unwrap();
        assert!(f.host.overlay().is_empty());
        lp.tick().unwrap();
        assert_eq!(f.host.overlay_replacements(), 2);
    }

    #[tokio::test]
    async fn primary_transform_memoized_by_content_and_controls() {
        let (f, mut lp) = fixture().await;
        f.host.set_primary(Some(PrimaryLayer {
            content_key: "cue-1".to_string(),
            frame: Extent::new(1000.0, 1000.0),
            images: vec![Rect::new(400.0, 800.0, 200.0, 100.0)],
            has_text: false,
        }));

        lp.tick().unwrap();
        lp.tick().unwrap();
        assert_eq!(f.host.transforms(), 1);

        f.host.set_controls_visible(true);
        lp.tick().unwrap();
        assert_eq!(f.host.transforms(), 2);

        lp.mark_dirty();
        lp.tick().unwrap();
        assert_eq!(f.host.transforms(), 3);
    }

    #[tokio::test]
    async fn resize_retransforms_primary_layer() {
        let (f, mut lp) = fixture().await;
        f.host.set_primary(Some(PrimaryLayer {
            content_key: "cue-1".to_string(),
            frame: Extent::new(1000.0, 1000.0),
            images: vec![Rect::new(400.0, 800.0, 200.0, 100.0)],
            has_text: false,
        }));
        lp.tick().unwrap();
        let before = f.host.last_transform().unwrap().images[0];

        f.host.set_viewport(Extent::new(2000.0, 2000.0));
        lp.tick().unwrap();
        lp.tick().unwrap();
        assert_eq!(f.host.transforms(), 2);

        let after = f.host.last_transform().unwrap().images[0];
        assert_ne!(before, after);
        assert!((after.center_x() - 1000.0).abs() < 1e-9);
        assert!((after.top + after.height - 0.85 * 2000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn upper_recenter_offset_shared_with_overlay() {
        let (f, mut lp) = fixture().await;
        // Centered at y=200 of 1000: upper baseline (150). Scaled height 300.
        f.host.set_primary(Some(PrimaryLayer {
            content_key: "tall".to_string(),
            frame: Extent::new(1000.0, 1000.0),
            images: vec![Rect::new(300.0, 0.0, 400.0, 400.0)],
            has_text: false,
        }));
        lp.tick().unwrap();

        let transform = f.host.last_transform().unwrap();
        assert!((transform.offset - 150.0).abs() < 1e-9);
        assert!(transform.images[0].top.abs() < 1e-9);
        assert!((f.host.overlay_offset() - 150.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stops_without_video_off_playback_page() {
        let (f, mut lp) = fixture().await;
        f.host.remove_video(true);
        assert_eq!(lp.tick().unwrap(), TickOutcome::Continue);
        f.host.remove_video(false);
        assert_eq!(lp.tick().unwrap(), TickOutcome::Stop);
    }

    #[tokio::test]
    async fn source_change_is_reported() {
        let (f, mut lp) = fixture().await;
        f.host.set_video_src("blob:other");
        assert_eq!(lp.tick().unwrap(), TickOutcome::SourceChanged("blob:other".to_string()));
    }

    fn fast(policy: FaultPolicy) -> RenderLoopConfig {
        RenderLoopConfig {
            frame_interval_ms: 1,
            fault_policy: policy,
        }
    }

    #[tokio::test]
    async fn halt_policy_stops_on_fault() {
        let (f, lp) = fixture().await;
        f.host.seek(2.5);
        f.host.fail_next_replace();
        let observer = Arc::new(RecordingObserver::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = lp.spawn(&fast(FaultPolicy::Halt), observer.clone(), tx);

        let exit = tokio::time::timeout(Duration::from_secs(2), handle.join()).await.unwrap();
        assert_eq!(exit, LoopExit::Faulted);
        assert_eq!(
            observer.events(),
            vec![SessionEvent::RenderLoopStarted, SessionEvent::RenderLoopStopped]
        );
    }

    #[tokio::test]
    async fn resume_policy_recovers_after_fault() {
        let (f, lp) = fixture().await;
        f.host.seek(2.5);
        f.host.fail_next_replace();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = lp.spawn(&fast(FaultPolicy::Resume), Arc::new(RecordingObserver::new()), tx);

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.host.overlay_replacements() == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert!(handle.is_running());
        assert_eq!(overlay_lines(&f.host), vec!["first line", "second line"]);

        handle.stop();
        assert_eq!(handle.join().await, LoopExit::Stopped);
    }

    #[tokio::test]
    async fn source_change_signals_owner() {
        let (f, lp) = fixture().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = lp.spawn(&fast(FaultPolicy::Halt), Arc::new(RecordingObserver::new()), tx);
        f.host.set_video_src("blob:next");

        let signal = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(
            signal,
            Some(LoopSignal::SourceChanged {
                src: "blob:next".to_string()
            })
        );
        assert_eq!(handle.join().await, LoopExit::SourceChanged);
    }
}
