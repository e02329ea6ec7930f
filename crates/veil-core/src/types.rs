use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Intersection over union with another box; 0 when either is degenerate.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let overlap_w = ((self.x + self.width).min(other.x + other.width) - self.x.max(other.x)).max(0.0);
        let overlap_h = ((self.y + self.height).min(other.y + other.height) - self.y.max(other.y)).max(0.0);
        let overlap = overlap_w * overlap_h;
        let union = self.width * self.height + other.width * other.height - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }

    /// Snap to an integer pixel rectangle clamped to an image of the given size.
    ///
    /// Returns `None` when nothing of the box remains inside the image.
    pub fn to_region(&self, image_width: u32, image_height: u32) -> Option<FaceRegion> {
        let x1 = self.x.floor().clamp(0.0, image_width as f32) as u32;
        let y1 = self.y.floor().clamp(0.0, image_height as f32) as u32;
        let x2 = (self.x + self.width).ceil().clamp(0.0, image_width as f32) as u32;
        let y2 = (self.y + self.height).ceil().clamp(0.0, image_height as f32) as u32;

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        })
    }
}

/// Integer pixel rectangle covering one face, as stored in output metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    /// Clip the region to an image of the given size. `None` if nothing remains.
    pub fn clipped(&self, image_width: u32, image_height: u32) -> Option<FaceRegion> {
        let x2 = self.x.saturating_add(self.width).min(image_width);
        let y2 = self.y.saturating_add(self.height).min(image_height);
        if self.x >= x2 || self.y >= y2 {
            return None;
        }
        Some(FaceRegion {
            x: self.x,
            y: self.y,
            width: x2 - self.x,
            height: y2 - self.y,
        })
    }
}

impl fmt::Display for FaceRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

/// Face coordinates recorded alongside a detection output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub faces: Vec<FaceRegion>,
    /// Hex digest of the input file the record was produced from.
    pub source_digest: String,
}

impl FaceRecord {
    /// Render the face list as `"x,y,w,h; x,y,w,h"`.
    pub fn describe(&self) -> String {
        self.faces
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Parse a face list rendered by [`describe`](Self::describe).
    ///
    /// Returns `None` if any entry is malformed.
    pub fn parse_description(description: &str) -> Option<Vec<FaceRegion>> {
        description
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|entry| {
                let mut parts = entry.split(',').map(|p| p.trim().parse::<u32>());
                let region = FaceRegion {
                    x: parts.next()?.ok()?,
                    y: parts.next()?.ok()?,
                    width: parts.next()?.ok()?,
                    height: parts.next()?.ok()?,
                };
                parts.next().is_none().then_some(region)
            })
            .collect()
    }
}
