//! Render options and settings loaded from `~/.config/duosub/config.toml`.
//!
//! [`RenderOptions`] is the flat record the host-side settings channel
//! delivers; every frame works on one cloned snapshot of it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How the secondary track is chosen when a new title starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecondaryLanguageMode {
    /// Leave every secondary track inactive.
    Disabled,
    /// Pick the track whose language matches the native audio track.
    MatchAudio,
    /// Pick the language the user selected last.
    #[default]
    LastUsed,
}

/// Per-frame configuration snapshot shared by both subtitle layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderOptions {
    /// Upper baseline as a fraction of frame height
    #[serde(alias = "upperBaselinePos")]
    pub upper_baseline: f64,
    /// Lower baseline as a fraction of frame height
    #[serde(alias = "lowerBaselinePos")]
    pub lower_baseline: f64,
    pub primary_image_scale: f64,
    pub primary_image_opacity: f64,
    pub primary_text_scale: f64,
    pub primary_text_opacity: f64,
    pub secondary_image_scale: f64,
    pub secondary_image_opacity: f64,
    pub secondary_text_scale: f64,
    pub secondary_text_opacity: f64,
    /// CSS color for host-rendered text
    pub primary_text_color: String,
    /// CSS color for overlay text
    pub secondary_text_color: String,
    pub stroke_color: String,
    pub stroke_width: f64,
    pub secondary_language_mode: SecondaryLanguageMode,
    /// BCP47 code of the last selected secondary track
    pub last_used_language: Option<String>,
    pub last_used_is_caption: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            upper_baseline: 0.15,
            lower_baseline: 0.85,
            primary_image_scale: 0.75,
            primary_image_opacity: 1.0,
            primary_text_scale: 0.95,
            primary_text_opacity: 1.0,
            secondary_image_scale: 0.5,
            secondary_image_opacity: 1.0,
            secondary_text_scale: 1.0,
            secondary_text_opacity: 1.0,
            primary_text_color: "#ffffff".to_string(),
            secondary_text_color: "#ffffff".to_string(),
            stroke_color: "#000000".to_string(),
            stroke_width: 2.0,
            secondary_language_mode: SecondaryLanguageMode::LastUsed,
            last_used_language: Some("en".to_string()),
            last_used_is_caption: false,
        }
    }
}

impl RenderOptions {
    /// Remember a selection for the `lastUsed` policy.
    #[must_use]
    pub fn with_last_used(mut self, bcp47: impl Into<String>, is_caption: bool) -> Self {
        self.last_used_language = Some(bcp47.into());
        self.last_used_is_caption = is_caption;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: SecondaryLanguageMode) -> Self {
        self.secondary_language_mode = mode;
        self
    }
}

/// Background translation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// Synthesize an AI-translated track when a source track exists
    pub enabled: bool,
    /// OpenAI-compatible chat completions endpoint
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// BCP47 code of the track to translate from
    pub source_language: String,
    /// Human-readable or BCP47 target language handed to the model
    pub target_language: String,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4.1-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            source_language: "en".to_string(),
            target_language: "zh-Hans".to_string(),
            batch_size: 50,
            batch_delay_ms: 1000,
            timeout_secs: 120,
        }
    }
}

impl TranslationConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Bounds for the wait-for-video step of activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    pub video_wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            video_wait_timeout_secs: 100,
            poll_interval_ms: 100,
        }
    }
}

impl ActivationConfig {
    pub fn video_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.video_wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// What the render loop does after a tick fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Log and stop rescheduling. Matches the host-page behavior where an
    /// exception inside the frame callback ends the callback chain.
    #[default]
    Halt,
    /// Log, mark the loop dirty, and keep ticking.
    Resume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderLoopConfig {
    pub frame_interval_ms: u64,
    pub fault_policy: FaultPolicy,
}

impl Default for RenderLoopConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 16,
            fault_policy: FaultPolicy::Halt,
        }
    }
}

impl RenderLoopConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub options: RenderOptions,
    pub translation: TranslationConfig,
    pub activation: ActivationConfig,
    pub render_loop: RenderLoopConfig,
}

impl Settings {
    /// Load settings from the default location.
    ///
    /// Returns defaults if the file doesn't exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load settings from an explicit path, falling back to defaults when
    /// the file is absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Return the path to the settings file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("duosub")
        .join("config.toml")
}
