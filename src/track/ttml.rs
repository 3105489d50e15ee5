//! Timed-text (TTML/DFXP) parser.
//!
//! Reads `<p begin end region>` paragraphs into text cues. Times are
//! resolved to microseconds first, then exposed as seconds. Supported time
//! expressions:
//! - ticks: `12345t`, scaled by the root `ttp:tickRate` (default 10 MHz)
//! - offsets: `12.5s`, `1500ms`, `2m`, `1h`
//! - clock time: `HH:MM:SS` or `HH:MM:SS.fff`

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use super::{Cue, CuePayload, CueSheet, CueText};
use crate::error::{Error, Result};
use crate::layout::{Anchor, Extent};

pub(super) const DEFAULT_TICK_RATE: u64 = 10_000_000;
pub(super) const DEFAULT_EXTENT: Extent = Extent {
    width: 1280.0,
    height: 720.0,
};

/// Region geometry as fractions of the document frame.
#[derive(Debug, Clone, Copy)]
struct Region {
    origin_y: f64,
    extent_h: f64,
}

struct PendingCue {
    begin_us: u64,
    end_us: u64,
    region: Option<String>,
    text: String,
}

/// Parse a timed-text document into a cue sheet.
pub fn parse_ttml(data: &[u8]) -> Result<CueSheet> {
    let mut reader = Reader::from_reader(data);
    let mut buf = Vec::new();

    let mut tick_rate = DEFAULT_TICK_RATE;
    let mut extent = DEFAULT_EXTENT;
    let mut regions: HashMap<String, Region> = HashMap::new();
    let mut pending: Option<PendingCue> = None;
    let mut cues = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if pending.is_some() => {
                if e.local_name().as_ref() == b"br" {
                    if let Some(cue) = pending.as_mut() {
                        cue.text.push('\n');
                    }
                }
            }
            Event::Start(e) => match e.local_name().as_ref() {
                b"tt" => read_root(&e, &mut tick_rate, &mut extent)?,
                b"region" => read_region(&e, extent, &mut regions)?,
                b"p" => pending = Some(read_paragraph(&e, tick_rate)?),
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"tt" => read_root(&e, &mut tick_rate, &mut extent)?,
                b"region" => read_region(&e, extent, &mut regions)?,
                _ => {}
            },
            Event::Text(t) => {
                if let Some(cue) = pending.as_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::TimedText(e.to_string()))?;
                    for ch in text.chars() {
                        cue.text.push(if ch.is_whitespace() { ' ' } else { ch });
                    }
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"p" => {
                if let Some(done) = pending.take() {
                    let lines = normalize_lines(&done.text);
                    if lines.is_empty() {
                        buf.clear();
                        continue;
                    }
                    let anchor = done
                        .region
                        .as_ref()
                        .and_then(|id| regions.get(id))
                        .map(|r| {
                            let center = (r.origin_y + r.extent_h / 2.0) * extent.height;
                            Anchor::for_center(center, extent.height)
                        });
                    cues.push(Cue {
                        id: cues.len(),
                        begin: micros_to_seconds(done.begin_us),
                        end: micros_to_seconds(done.end_us),
                        payload: CuePayload::Text(CueText::new(lines.join("\n"), anchor)),
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(CueSheet::new(extent, cues, None))
}

/// Split cue text into display lines, collapsing runs of spaces and
/// dropping blank lines.
///
/// A single multi-line string and several speaker-separated elements end up
/// in the same form.
pub fn normalize_lines(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect()
}

pub(super) fn micros_to_seconds(us: u64) -> f64 {
    us as f64 / 1_000_000.0
}

pub(super) fn attr_value(e: &BytesStart<'_>, local: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::TimedText(err.to_string()))?;
        if attr.key.local_name().as_ref() == local {
            let value = attr
                .unescape_value()
                .map_err(|err| Error::TimedText(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn read_root(e: &BytesStart<'_>, tick_rate: &mut u64, extent: &mut Extent) -> Result<()> {
    if let Some(rate) = attr_value(e, b"tickRate")? {
        *tick_rate = rate
            .trim()
            .parse()
            .ok()
            .filter(|r: &u64| *r > 0)
            .ok_or_else(|| Error::TimedText(format!("bad tickRate: {rate}")))?;
    }
    if let Some(value) = attr_value(e, b"extent")? {
        if let Some((w, h)) = parse_pair(&value, DEFAULT_EXTENT) {
            *extent = Extent::new(w, h);
        }
    }
    Ok(())
}

fn read_region(e: &BytesStart<'_>, frame: Extent, regions: &mut HashMap<String, Region>) -> Result<()> {
    let Some(id) = attr_value(e, b"id")? else {
        return Ok(());
    };
    let origin_y = attr_value(e, b"origin")?
        .and_then(|v| parse_pair(&v, frame))
        .map_or(0.0, |(_, y)| y / frame.height);
    let extent_h = attr_value(e, b"extent")?
        .and_then(|v| parse_pair(&v, frame))
        .map_or(0.0, |(_, h)| h / frame.height);
    regions.insert(id, Region { origin_y, extent_h });
    Ok(())
}

fn read_paragraph(e: &BytesStart<'_>, tick_rate: u64) -> Result<PendingCue> {
    let begin = attr_value(e, b"begin")?
        .ok_or_else(|| Error::TimedText("paragraph without begin".to_string()))?;
    let end = attr_value(e, b"end")?
        .ok_or_else(|| Error::TimedText("paragraph without end".to_string()))?;
    Ok(PendingCue {
        begin_us: parse_time_us(&begin, tick_rate)?,
        end_us: parse_time_us(&end, tick_rate)?,
        region: attr_value(e, b"region")?,
        text: String::new(),
    })
}

/// Parse `"1280px 720px"` or `"10% 80%"` into pixels relative to `frame`.
pub(super) fn parse_pair(value: &str, frame: Extent) -> Option<(f64, f64)> {
    let mut parts = value.split_whitespace();
    let x = parse_length(parts.next()?, frame.width)?;
    let y = parse_length(parts.next()?, frame.height)?;
    Some((x, y))
}

fn parse_length(value: &str, reference: f64) -> Option<f64> {
    if let Some(pct) = value.strip_suffix('%') {
        return pct.parse::<f64>().ok().map(|p| p / 100.0 * reference);
    }
    value.strip_suffix("px").unwrap_or(value).parse().ok()
}

/// Resolve a TTML time expression to microseconds.
pub fn parse_time_us(value: &str, tick_rate: u64) -> Result<u64> {
    let value = value.trim();
    let bad = || Error::TimedText(format!("bad time expression: {value}"));

    if let Some(ticks) = value.strip_suffix('t') {
        let ticks: u64 = ticks.parse().map_err(|_| bad())?;
        let us = u128::from(ticks) * 1_000_000 / u128::from(tick_rate.max(1));
        return u64::try_from(us).map_err(|_| bad());
    }

    if value.contains(':') {
        let parts: Vec<&str> = value.split(':').collect();
        if parts.len() != 3 {
            return Err(bad());
        }
        let hours: u64 = parts[0].parse().map_err(|_| bad())?;
        let minutes: u64 = parts[1].parse().map_err(|_| bad())?;
        let seconds: f64 = parts[2].parse().map_err(|_| bad())?;
        let whole = (hours * 3600 + minutes * 60) * 1_000_000;
        return Ok(whole + (seconds * 1_000_000.0).round() as u64);
    }

    let (number, scale) = if let Some(n) = value.strip_suffix("ms") {
        (n, 1_000.0)
    } else if let Some(n) = value.strip_suffix('s') {
        (n, 1_000_000.0)
    } else if let Some(n) = value.strip_suffix('m') {
        (n, 60_000_000.0)
    } else if let Some(n) = value.strip_suffix('h') {
        (n, 3_600_000_000.0)
    } else {
        return Err(bad());
    };
    let number: f64 = number.parse().map_err(|_| bad())?;
    if number < 0.0 {
        return Err(bad());
    }
    Ok((number * scale).round() as u64)
}
