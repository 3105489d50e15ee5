//! Host player seam.
//!
//! The engine never touches markup directly. A [`HostPlayer`] adapter
//! answers questions about the page (is a video playing, which title is
//! displayed, where are the host's own subtitles) and applies the shapes the
//! engine computes. [`SessionObserver`] receives the outbound notifications
//! for menus, settings persistence, and telemetry.
//!
//! [`HeadlessHost`] is a self-contained adapter with a simulated clock, used
//! by the `play` command and by tests.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::layout::{Extent, Rect};
use crate::track::{Primitive, TrackSummary};

/// The bound media element.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoState {
    /// Media source the element is playing
    pub src: String,
    /// Playback position in seconds
    pub current_time: f64,
}

/// The host's own subtitle rendering, as currently on screen.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryLayer {
    /// Changes whenever the host swaps its subtitle content
    pub content_key: String,
    /// Frame the host positions its bitmap cues in
    pub frame: Extent,
    /// Bitmap cue rectangles in `frame` coordinates
    pub images: Vec<Rect>,
    /// Whether host text cues are present
    pub has_text: bool,
}

/// Styling to apply to the host's subtitle layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryTransform {
    /// Placed bitmap cues, same order as [`PrimaryLayer::images`]
    pub images: Vec<Rect>,
    pub image_opacity: f64,
    pub text_scale: f64,
    pub text_opacity: f64,
    pub text_color: String,
    /// Recentering shift shared with the overlay
    pub offset: f64,
}

/// Render target supplied by the embedding.
pub trait HostPlayer: Send + Sync {
    /// The playing video, if a video element exists.
    fn video(&self) -> Option<VideoState>;

    /// Whether the current page is a playback page at all.
    fn is_playback_page(&self) -> bool;

    /// Title id shown in the page address.
    fn displayed_movie_id(&self) -> Option<u64>;

    /// Title id reported by the player itself.
    fn player_movie_id(&self) -> Option<u64>;

    fn controls_visible(&self) -> bool;

    /// Make sure the overlay container exists and return the viewport size.
    fn mount_overlay(&self) -> Option<Extent>;

    fn primary_layer(&self) -> Option<PrimaryLayer>;

    fn apply_primary_transform(&self, transform: &PrimaryTransform) -> Result<()>;

    /// Replace every overlay child.
    fn replace_overlay(&self, primitives: &[Primitive]) -> Result<()>;

    /// Vertical shift applied to the whole overlay.
    fn shift_overlay(&self, offset: f64) -> Result<()>;
}

/// Outbound notifications. Every method defaults to a no-op.
pub trait SessionObserver: Send + Sync {
    /// The track list or the active selection changed.
    fn tracks_changed(&self, _tracks: &[TrackSummary]) {}

    /// The user picked a secondary language; persist it for `lastUsed`.
    fn language_selected(&self, _bcp47: &str, _is_caption: bool) {}

    fn render_loop_started(&self) {}

    fn render_loop_stopped(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// One recorded notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    TracksChanged { tracks: Vec<String>, active: Option<String> },
    LanguageSelected { bcp47: String, is_caption: bool },
    RenderLoopStarted,
    RenderLoopStopped,
}

/// Observer that keeps every notification in order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn push(&self, event: SessionEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

impl SessionObserver for RecordingObserver {
    fn tracks_changed(&self, tracks: &[TrackSummary]) {
        self.push(SessionEvent::TracksChanged {
            tracks: tracks.iter().map(|t| t.display_language.clone()).collect(),
            active: tracks
                .iter()
                .find(|t| t.active && t.kind != "off")
                .map(|t| t.display_language.clone()),
        });
    }

    fn language_selected(&self, bcp47: &str, is_caption: bool) {
        self.push(SessionEvent::LanguageSelected {
            bcp47: bcp47.to_string(),
            is_caption,
        });
    }

    fn render_loop_started(&self) {
        self.push(SessionEvent::RenderLoopStarted);
    }

    fn render_loop_stopped(&self) {
        self.push(SessionEvent::RenderLoopStopped);
    }
}

// ─── Headless adapter ──────────────────────────────────────────────────────

#[derive(Debug)]
struct Clock {
    /// Position at `since`
    base: f64,
    /// `None` while paused
    since: Option<Instant>,
}

impl Clock {
    fn now(&self) -> f64 {
        self.base + self.since.map_or(0.0, |s| s.elapsed().as_secs_f64())
    }
}

#[derive(Debug)]
struct HeadlessState {
    video_src: Option<String>,
    clock: Clock,
    playback_page: bool,
    displayed_movie_id: Option<u64>,
    player_movie_id: Option<u64>,
    controls_visible: bool,
    viewport: Extent,
    primary: Option<PrimaryLayer>,
    overlay: Vec<Primitive>,
    overlay_offset: f64,
    overlay_replacements: usize,
    last_transform: Option<PrimaryTransform>,
    transforms: usize,
    fail_next_replace: bool,
}

/// In-process player with a simulated playback clock.
#[derive(Debug)]
pub struct HeadlessHost {
    state: Mutex<HeadlessState>,
}

impl HeadlessHost {
    /// A playback page with no video yet.
    pub fn new(viewport: Extent) -> Self {
        Self {
            state: Mutex::new(HeadlessState {
                video_src: None,
                clock: Clock {
                    base: 0.0,
                    since: None,
                },
                playback_page: true,
                displayed_movie_id: None,
                player_movie_id: None,
                controls_visible: false,
                viewport,
                primary: None,
                overlay: Vec::new(),
                overlay_offset: 0.0,
                overlay_replacements: 0,
                last_transform: None,
                transforms: 0,
                fail_next_replace: false,
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HeadlessState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Navigate to a title: sets both the page and player ids.
    pub fn open_title(&self, movie_id: u64, src: impl Into<String>) {
        let src = src.into();
        self.with_state(|s| {
            s.displayed_movie_id = Some(movie_id);
            s.player_movie_id = Some(movie_id);
            s.video_src = Some(src);
            s.playback_page = true;
            s.clock = Clock {
                base: 0.0,
                since: None,
            };
        });
    }

    pub fn set_displayed_movie_id(&self, movie_id: Option<u64>) {
        self.with_state(|s| s.displayed_movie_id = movie_id);
    }

    pub fn set_player_movie_id(&self, movie_id: Option<u64>) {
        self.with_state(|s| s.player_movie_id = movie_id);
    }

    /// Swap the media source without a new catalog.
    pub fn set_video_src(&self, src: impl Into<String>) {
        let src = src.into();
        self.with_state(|s| s.video_src = Some(src));
    }

    /// Remove the video element. `playback_page` controls whether the page
    /// still counts as a playback page.
    pub fn remove_video(&self, playback_page: bool) {
        self.with_state(|s| {
            s.video_src = None;
            s.playback_page = playback_page;
        });
    }

    /// Pause at `time`.
    pub fn seek(&self, time: f64) {
        self.with_state(|s| {
            s.clock = Clock {
                base: time,
                since: s.clock.since.map(|_| Instant::now()),
            };
        });
    }

    /// Start the clock from the current position.
    pub fn play(&self) {
        self.with_state(|s| {
            if s.clock.since.is_none() {
                s.clock.since = Some(Instant::now());
            }
        });
    }

    pub fn pause(&self) {
        self.with_state(|s| {
            s.clock = Clock {
                base: s.clock.now(),
                since: None,
            };
        });
    }

    pub fn set_controls_visible(&self, visible: bool) {
        self.with_state(|s| s.controls_visible = visible);
    }

    pub fn set_viewport(&self, viewport: Extent) {
        self.with_state(|s| s.viewport = viewport);
    }

    pub fn set_primary(&self, primary: Option<PrimaryLayer>) {
        self.with_state(|s| s.primary = primary);
    }

    /// Make the next overlay replacement fail.
    pub fn fail_next_replace(&self) {
        self.with_state(|s| s.fail_next_replace = true);
    }

    pub fn overlay(&self) -> Vec<Primitive> {
        self.with_state(|s| s.overlay.clone())
    }

    pub fn overlay_offset(&self) -> f64 {
        self.with_state(|s| s.overlay_offset)
    }

    /// How many times the overlay children were replaced.
    pub fn overlay_replacements(&self) -> usize {
        self.with_state(|s| s.overlay_replacements)
    }

    pub fn transforms(&self) -> usize {
        self.with_state(|s| s.transforms)
    }

    pub fn last_transform(&self) -> Option<PrimaryTransform> {
        self.with_state(|s| s.last_transform.clone())
    }
}

impl HostPlayer for HeadlessHost {
    fn video(&self) -> Option<VideoState> {
        self.with_state(|s| {
            s.video_src.clone().map(|src| VideoState {
                src,
                current_time: s.clock.now(),
            })
        })
    }

    fn is_playback_page(&self) -> bool {
        self.with_state(|s| s.playback_page)
    }

    fn displayed_movie_id(&self) -> Option<u64> {
        self.with_state(|s| s.displayed_movie_id)
    }

    fn player_movie_id(&self) -> Option<u64> {
        self.with_state(|s| s.player_movie_id)
    }

    fn controls_visible(&self) -> bool {
        self.with_state(|s| s.controls_visible)
    }

    fn mount_overlay(&self) -> Option<Extent> {
        self.with_state(|s| s.video_src.as_ref().map(|_| s.viewport))
    }

    fn primary_layer(&self) -> Option<PrimaryLayer> {
        self.with_state(|s| s.primary.clone())
    }

    fn apply_primary_transform(&self, transform: &PrimaryTransform) -> Result<()> {
        self.with_state(|s| {
            s.transforms += 1;
            s.last_transform = Some(transform.clone());
        });
        Ok(())
    }

    fn replace_overlay(&self, primitives: &[Primitive]) -> Result<()> {
        self.with_state(|s| {
            if std::mem::take(&mut s.fail_next_replace) {
                return Err(Error::Host("overlay container detached".to_string()));
            }
            s.overlay = primitives.to_vec();
            s.overlay_replacements += 1;
            Ok(())
        })
    }

    fn shift_overlay(&self, offset: f64) -> Result<()> {
        self.with_state(|s| s.overlay_offset = offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_clock_reports_seek_position() {
        let host = HeadlessHost::new(Extent::new(1280.0, 720.0));
        assert!(host.video().is_none());
        host.open_title(42, "blob:a");
        host.seek(12.5);
        let video = host.video().unwrap();
        assert_eq!(video.src, "blob:a");
        assert!((video.current_time - 12.5).abs() < 1e-9);
        assert_eq!(host.player_movie_id(), Some(42));
    }

    #[test]
    fn playing_clock_advances() {
        let host = HeadlessHost::new(Extent::new(1280.0, 720.0));
        host.open_title(1, "blob:a");
        host.seek(5.0);
        host.play();
        std::thread::sleep(std::time::Duration::from_millis(20));
        host.pause();
        let t = host.video().unwrap().current_time;
        assert!(t > 5.0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!((host.video().unwrap().current_time - t).abs() < 1e-9);
    }

    #[test]
    fn injected_replace_failure_fires_once() {
        let host = HeadlessHost::new(Extent::new(1280.0, 720.0));
        host.fail_next_replace();
        assert!(host.replace_overlay(&[]).is_err());
        assert!(host.replace_overlay(&[]).is_ok());
        assert_eq!(host.overlay_replacements(), 1);
    }

    #[test]
    fn recording_observer_keeps_order() {
        let observer = RecordingObserver::new();
        observer.render_loop_started();
        observer.language_selected("fr", true);
        observer.render_loop_stopped();
        assert_eq!(
            observer.events(),
            vec![
                SessionEvent::RenderLoopStarted,
                SessionEvent::LanguageSelected {
                    bcp47: "fr".to_string(),
                    is_caption: true
                },
                SessionEvent::RenderLoopStopped,
            ]
        );
    }
}
