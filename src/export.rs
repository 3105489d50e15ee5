//! Export a loaded text track as SRT or WebVTT.
//!
//! Used by the `export` command to save a track, including merged
//! translations, for players that load sidecar files.

use std::fmt::Write as FmtWrite;
use std::path::Path;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::track::CueSheet;

/// Sidecar format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// `SubRip` (.srt)
    #[default]
    Srt,
    /// `WebVTT` (.vtt)
    Vtt,
}

impl ExportFormat {
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Srt => "srt",
            Self::Vtt => "vtt",
        }
    }
}

/// One exported cue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubtitleEntry {
    pub start_ms: u64,
    pub end_ms: u64,
    /// May contain newlines
    pub text: String,
}

impl SubtitleEntry {
    #[must_use]
    pub fn new(start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
        }
    }

    fn format_time(ms: u64, separator: char) -> String {
        let hours = ms / 3_600_000;
        let minutes = (ms % 3_600_000) / 60_000;
        let seconds = (ms % 60_000) / 1000;
        let millis = ms % 1000;
        format!("{hours:02}:{minutes:02}:{seconds:02}{separator}{millis:03}")
    }
}

/// Text cues of a sheet in document order. Bitmap cues are skipped.
pub fn entries_from_sheet(sheet: &CueSheet) -> Vec<SubtitleEntry> {
    sheet
        .text_cues()
        .filter_map(|cue| {
            let text = cue.text()?.lines().join("\n");
            Some(SubtitleEntry::new(
                (cue.begin * 1000.0).round() as u64,
                (cue.end * 1000.0).round() as u64,
                text,
            ))
        })
        .collect()
}

/// Render entries in the given format.
pub fn generate(format: ExportFormat, entries: &[SubtitleEntry]) -> Result<String> {
    let mut output = String::new();
    let separator = match format {
        ExportFormat::Srt => ',',
        ExportFormat::Vtt => {
            output.push_str("WEBVTT\n\n");
            '.'
        }
    };

    for (i, entry) in entries.iter().enumerate() {
        if format == ExportFormat::Srt {
            writeln!(output, "{}", i + 1).ok();
        }
        writeln!(
            output,
            "{} --> {}",
            SubtitleEntry::format_time(entry.start_ms, separator),
            SubtitleEntry::format_time(entry.end_ms, separator)
        )
        .ok();
        writeln!(output, "{}", entry.text).ok();
        writeln!(output).ok();
    }

    Ok(output)
}

pub async fn write_to_file(format: ExportFormat, entries: &[SubtitleEntry], path: &Path) -> Result<()> {
    let content = generate(format, entries)?;
    tokio::fs::write(path, content).await?;
    Ok(())
}

pub async fn write_to<W: AsyncWrite + Unpin + Send>(
    format: ExportFormat,
    entries: &[SubtitleEntry],
    writer: &mut W,
) -> Result<()> {
    let content = generate(format, entries)?;
    writer.write_all(content.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
