//! Bitmap subtitle archives.
//!
//! An archive is a zip holding `manifest_ttml2.xml` plus one PNG per cue.
//! The manifest declares the root `tts:extent`, pixel regions, and timed
//! `<div begin end region>` blocks that each wrap an `<image src>`.
//! Bitmaps stay compressed in the archive until a cue first renders.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use bytes::Bytes;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::debug;
use zip::ZipArchive;

use super::ttml::{attr_value, micros_to_seconds, parse_pair, parse_time_us, DEFAULT_EXTENT, DEFAULT_TICK_RATE};
use super::{Cue, CuePayload, CueSheet, ImageCue};
use crate::error::{Error, Result};
use crate::layout::{Extent, Rect};

/// Name of the timing manifest inside an image archive.
pub const MANIFEST_ENTRY: &str = "manifest_ttml2.xml";

/// Raw archive bytes with lazy entry extraction.
#[derive(Debug, Clone)]
pub struct ImageArchive {
    data: Bytes,
}

impl ImageArchive {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    /// Decompress one entry.
    pub fn read_entry(&self, name: &str) -> Result<Bytes> {
        let mut archive = ZipArchive::new(Cursor::new(self.data.clone()))?;
        let mut file = match archive.by_name(name) {
            Ok(file) => file,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(Error::MissingEntry(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
        file.read_to_end(&mut out)?;
        Ok(Bytes::from(out))
    }
}

struct PendingImage {
    begin_us: u64,
    end_us: u64,
    region: Option<String>,
    src: Option<String>,
}

/// Parse an image archive into a cue sheet whose cues reference PNG
/// entries of the same archive.
pub fn parse_image_archive(data: Bytes) -> Result<CueSheet> {
    let archive = ImageArchive::new(data);
    let manifest = archive.read_entry(MANIFEST_ENTRY)?;

    let mut reader = Reader::from_reader(&manifest[..]);
    let mut buf = Vec::new();

    let mut tick_rate = DEFAULT_TICK_RATE;
    let mut extent = DEFAULT_EXTENT;
    let mut regions: HashMap<String, Rect> = HashMap::new();
    let mut pending: Option<PendingImage> = None;
    let mut cues = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"tt" => {
                    if let Some(rate) = attr_value(&e, b"tickRate")? {
                        tick_rate = rate
                            .trim()
                            .parse()
                            .ok()
                            .filter(|r: &u64| *r > 0)
                            .ok_or_else(|| Error::TimedText(format!("bad tickRate: {rate}")))?;
                    }
                    if let Some((w, h)) = attr_value(&e, b"extent")?.and_then(|v| parse_pair(&v, DEFAULT_EXTENT)) {
                        extent = Extent::new(w, h);
                    }
                }
                b"region" => {
                    if let Some(id) = attr_value(&e, b"id")? {
                        let (left, top) = attr_value(&e, b"origin")?
                            .and_then(|v| parse_pair(&v, extent))
                            .unwrap_or((0.0, 0.0));
                        let (width, height) = attr_value(&e, b"extent")?
                            .and_then(|v| parse_pair(&v, extent))
                            .unwrap_or((0.0, 0.0));
                        regions.insert(id, Rect::new(left, top, width, height));
                    }
                }
                b"div" => {
                    if let (Some(begin), Some(end)) = (attr_value(&e, b"begin")?, attr_value(&e, b"end")?) {
                        pending = Some(PendingImage {
                            begin_us: parse_time_us(&begin, tick_rate)?,
                            end_us: parse_time_us(&end, tick_rate)?,
                            region: attr_value(&e, b"region")?,
                            src: None,
                        });
                    }
                }
                b"image" => {
                    if let Some(p) = pending.as_mut() {
                        p.src = attr_value(&e, b"src")?;
                    }
                }
                _ => {}
            },
            Event::End(e) if e.local_name().as_ref() == b"div" => {
                if let Some(PendingImage {
                    begin_us,
                    end_us,
                    region,
                    src: Some(src),
                }) = pending.take()
                {
                    let Some(rect) = region.as_ref().and_then(|id| regions.get(id)).copied() else {
                        debug!(src = %src, "Image cue without a known region, skipped");
                        buf.clear();
                        continue;
                    };
                    cues.push(Cue {
                        id: cues.len(),
                        begin: micros_to_seconds(begin_us),
                        end: micros_to_seconds(end_us),
                        payload: CuePayload::Image(ImageCue::new(src, rect)),
                    });
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    debug!(cues = cues.len(), width = extent.width, height = extent.height, "Image archive parsed");
    Ok(CueSheet::new(extent, cues, Some(archive)))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    pub(crate) const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<tt xmlns="http://www.w3.org/ns/ttml" xmlns:tts="http://www.w3.org/ns/ttml#styling"
    xmlns:ttp="http://www.w3.org/ns/ttml#parameter" ttp:tickRate="1000" tts:extent="1920px 1080px">
  <head>
    <layout>
      <region xml:id="r0" tts:origin="660px 900px" tts:extent="600px 80px"/>
      <region xml:id="r1" tts:origin="660px 100px" tts:extent="600px 80px"/>
    </layout>
  </head>
  <body>
    <div begin="1000t" end="3000t" region="r0"><image src="0.png"/></div>
    <div begin="4000t" end="5000t" region="r1"><image src="1.png"/></div>
    <div begin="6000t" end="7000t" region="missing"><image src="2.png"/></div>
  </body>
</tt>"#;

    pub(crate) fn build_archive(manifest: &str, images: &[(&str, &[u8])]) -> Bytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.start_file(MANIFEST_ENTRY, options).unwrap();
        writer.write_all(manifest.as_bytes()).unwrap();
        for (name, data) in images {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    #[test]
    fn parses_image_cues() {
        let data = build_archive(MANIFEST, &[("0.png", b"png0"), ("1.png", b"png1")]);
        let sheet = parse_image_archive(data).unwrap();
        assert_eq!(sheet.extent, Extent::new(1920.0, 1080.0));
        assert_eq!(sheet.cues.len(), 2);

        let CuePayload::Image(first) = &sheet.cues[0].payload else {
            panic!("expected image cue");
        };
        assert_eq!(first.src, "0.png");
        assert_eq!(first.rect, Rect::new(660.0, 900.0, 600.0, 80.0));
        assert!((sheet.cues[0].begin - 1.0).abs() < 1e-9);
        assert!((sheet.cues[0].end - 3.0).abs() < 1e-9);
    }

    #[test]
    fn bitmaps_decoded_on_demand() {
        let data = build_archive(MANIFEST, &[("0.png", b"png0")]);
        let archive = ImageArchive::new(data);
        assert_eq!(&archive.read_entry("0.png").unwrap()[..], b"png0");
        assert!(matches!(archive.read_entry("9.png"), Err(Error::MissingEntry(_))));
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("0.png", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"png").unwrap();
        let data = Bytes::from(writer.finish().unwrap().into_inner());
        assert!(matches!(parse_image_archive(data), Err(Error::MissingEntry(_))));
    }

    #[test]
    fn garbage_is_an_archive_error() {
        let err = parse_image_archive(Bytes::from_static(b"not a zip")).unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
    }
}
