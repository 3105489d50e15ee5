//! Error types shared across the crate.

use thiserror::Error;

/// Errors produced while fetching, parsing, or translating subtitle tracks.
///
/// None of these are fatal to a playback session: callers log them and
/// degrade (a track stays non-Ready, a translation batch is skipped).
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("all {0} download candidates failed")]
    AllMirrorsFailed(usize),

    #[error("no download candidates")]
    NoCandidates,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("malformed timed text: {0}")]
    TimedText(String),

    #[error("archive entry not found: {0}")]
    MissingEntry(String),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("translation returned {got} lines, expected {expected}")]
    LineCountMismatch { expected: usize, got: usize },

    #[error("host player error: {0}")]
    Host(String),
}

pub type Result<T> = std::result::Result<T, Error>;
