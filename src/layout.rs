//! Geometry shared by the primary and secondary subtitle layers.
//!
//! Both layers anchor cues to one of two horizontal baselines. A cue whose
//! original vertical center is at or above the frame midpoint goes to the
//! upper baseline, anything lower to the lower baseline. Primary cues hang
//! above their baseline and secondary cues hang below it, so the two layers
//! stack on the same line without overlapping.

use serde::{Deserialize, Serialize};

use crate::config::RenderOptions;

/// Smallest top coordinate a placed cue may have.
pub const TOP_MARGIN: f64 = 2.0;
/// Smallest gap kept between a block and the frame's bottom edge
pub const BOTTOM_MARGIN: f64 = 2.0;

/// Width and height of a frame or viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub width: f64,
    pub height: f64,
}

impl Extent {
    #[must_use]
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Fit a frame of the given aspect ratio inside this extent
    /// (letterboxed or pillarboxed).
    #[must_use]
    pub fn fit_aspect(&self, aspect_ratio: f64) -> Self {
        if aspect_ratio <= 0.0 || self.height <= 0.0 {
            return *self;
        }
        if self.width / self.height > aspect_ratio {
            Self::new(self.height * aspect_ratio, self.height)
        } else {
            Self::new(self.width, self.width / aspect_ratio)
        }
    }
}

/// Axis-aligned rectangle in some frame's coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    #[must_use]
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn center_x(&self) -> f64 {
        self.left + self.width / 2.0
    }

    pub fn center_y(&self) -> f64 {
        self.top + self.height / 2.0
    }
}

/// Which subtitle layer a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layer {
    /// Host-rendered subtitles
    Primary,
    /// Our overlay
    Secondary,
}

/// Which baseline a cue hangs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anchor {
    Upper,
    Lower,
}

impl Anchor {
    /// Anchor for a cue whose vertical center sits at `center_y` in a frame
    /// `frame_height` tall.
    pub fn for_center(center_y: f64, frame_height: f64) -> Self {
        if center_y <= frame_height / 2.0 {
            Self::Upper
        } else {
            Self::Lower
        }
    }
}

/// Result of vertical placement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub top: f64,
    /// Downward shift applied by recentering; the paired layer must move by
    /// the same amount.
    pub offset: f64,
}

/// Place a block `height` tall against its baseline.
///
/// A primary block's bottom edge sits on the baseline. A primary upper block
/// taller than the space above the upper baseline is recentered on the
/// baseline instead, which records an offset of half its height. A secondary
/// block's top edge sits on the baseline. A block that would run past the
/// bottom edge is pulled up to end just inside it; the top clamp wins for
/// blocks taller than the frame.
pub fn place_vertical(
    layer: Layer,
    anchor: Anchor,
    height: f64,
    frame_height: f64,
    opts: &RenderOptions,
) -> Placement {
    let baseline = match anchor {
        Anchor::Upper => opts.upper_baseline * frame_height,
        Anchor::Lower => opts.lower_baseline * frame_height,
    };
    let (mut top, offset) = match (layer, anchor) {
        (Layer::Secondary, _) => (baseline, 0.0),
        (Layer::Primary, Anchor::Upper) if height > baseline => {
            (baseline - height / 2.0, height / 2.0)
        }
        (Layer::Primary, _) => (baseline - height, 0.0),
    };
    let max_top = frame_height - height - BOTTOM_MARGIN;
    if top > max_top {
        top = max_top;
    }
    if top < 0.0 {
        top = TOP_MARGIN;
    }
    Placement { top, offset }
}

/// Scale `rect` from `from` coordinates into `to` coordinates, shrink it by
/// `scale` around its center column, and place it on its baseline.
pub fn place_scaled(
    layer: Layer,
    rect: &Rect,
    from: Extent,
    to: Extent,
    scale: f64,
    opts: &RenderOptions,
) -> (Rect, f64) {
    let sx = if from.width > 0.0 { to.width / from.width } else { 1.0 };
    let sy = if from.height > 0.0 { to.height / from.height } else { 1.0 };
    let width = rect.width * sx * scale;
    let height = rect.height * sy * scale;
    let left = rect.center_x() * sx - width / 2.0;
    let anchor = Anchor::for_center(rect.center_y(), from.height);
    let placement = place_vertical(layer, anchor, height, to.height, opts);
    (Rect::new(left, placement.top, width, height), placement.offset)
}

/// Word wrap `text` so no line exceeds `max_chars` characters.
///
/// Words longer than the limit get a line of their own. Existing line
/// breaks are preserved.
pub fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut lines = Vec::new();

    for paragraph in text.lines() {
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            if current.is_empty() {
                current = word.to_string();
            } else if current.chars().count() + 1 + word.chars().count() <= max_chars {
                current.push(' ');
                current.push_str(word);
            } else {
                lines.push(std::mem::take(&mut current));
                current = word.to_string();
            }
        }
        if !current.is_empty() {
            lines.push(current);
        }
    }

    lines
}
