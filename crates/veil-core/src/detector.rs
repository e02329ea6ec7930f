//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing,
//! applied to full-colour photographs.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
pub const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// File name of the SCRFD model inside the models directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("image is empty ({0}x{1})")]
    EmptyImage(u32, u32),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can locate faces in a decoded photograph.
///
/// The pipeline is generic over this so the ONNX-backed detector can be swapped
/// for a scripted one.
pub trait Detect {
    /// Return detected faces sorted by descending confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

impl<D: Detect + ?Sized> Detect for Box<D> {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        (**self).detect(image)
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    confidence_threshold: f32,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            confidence_threshold,
            stride_indices,
        })
    }
}

impl Detect for FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyImage(image.width(), image.height()));
        }

        let (input, letterbox) = letterbox(image, self.input_width, self.input_height);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let tensor = |idx: usize, what: &str, stride: usize| {
            outputs[idx]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
        };

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(&self.stride_indices) {
            let level = StrideOutputs {
                stride,
                scores: tensor(score_idx, "scores", stride)?,
                boxes: tensor(bbox_idx, "bboxes", stride)?,
                keypoints: tensor(kps_idx, "kps", stride)?,
            };
            candidates.extend(level.decode(self.input_width, self.input_height, &letterbox, self.confidence_threshold));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

impl LetterboxInfo {
    /// Map a point in letterboxed input space back onto the source photo.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Letterbox an RGB image into a NCHW float tensor of `input_width × input_height`.
///
/// The photo is resized with a triangle (bilinear) filter, centred, padded with
/// the mean value and normalized to the SCRFD input distribution.
fn letterbox(image: &RgbImage, input_width: usize, input_height: usize) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (image.width() as f32, image.height() as f32);
    let scale = (input_width as f32 / width).min(input_height as f32 / height);

    let fit_w = ((width * scale).round() as usize).clamp(1, input_width);
    let fit_h = ((height * scale).round() as usize).clamp(1, input_height);
    let info = LetterboxInfo {
        scale,
        pad_x: (input_width - fit_w) as f32 / 2.0,
        pad_y: (input_height - fit_h) as f32 / 2.0,
    };

    let resized = imageops::resize(image, fit_w as u32, fit_h as u32, FilterType::Triangle);
    let (left, top) = (info.pad_x as usize, info.pad_y as usize);

    // Zeros are mean-valued padding once normalized.
    let mut tensor = Array4::<f32>::zeros((1, 3, input_height, input_width));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, c, top + y as usize, left + x as usize]] = (value as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, info)
}

/// Map each stride to its (score, bbox, kps) output tensors.
///
/// Exports that name their outputs `score_8`, `bbox_16`, `kps_32` and so on are
/// mapped by name. Anything else is assumed to use the reference export's
/// order: scores, then boxes, then keypoints, each for strides 8, 16 and 32.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let by_name = |stride: usize| -> Option<StrideOutputIndices> {
        Some((position("score", stride)?, position("bbox", stride)?, position("kps", stride)?))
    };

    if let [Some(s8), Some(s16), Some(s32)] = SCRFD_STRIDES.map(by_name) {
        tracing::info!("SCRFD: mapping output tensors by name");
        return [s8, s16, s32];
    }

    tracing::info!(?names, "SCRFD: unrecognized output names, using positional mapping");
    let levels = SCRFD_STRIDES.len();
    std::array::from_fn(|i| (i, levels + i, 2 * levels + i))
}

/// Raw head outputs for one feature-map stride.
struct StrideOutputs<'a> {
    stride: usize,
    scores: &'a [f32],
    /// Four distances per anchor: left, top, right, bottom (in stride units).
    boxes: &'a [f32],
    /// Five (x, y) offsets per anchor (in stride units).
    keypoints: &'a [f32],
}

impl StrideOutputs<'_> {
    /// Turn every anchor scoring above `threshold` into a box on the source photo.
    fn decode(
        &self,
        input_width: usize,
        input_height: usize,
        letterbox: &LetterboxInfo,
        threshold: f32,
    ) -> Vec<BoundingBox> {
        let cols = input_width / self.stride;
        let anchors = (input_height / self.stride) * cols * SCRFD_ANCHORS_PER_CELL;
        let step = self.stride as f32;

        (0..anchors.min(self.scores.len()))
            .filter(|&idx| self.scores[idx] > threshold)
            .filter_map(|idx| {
                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let ax = (cell % cols) as f32 * step;
                let ay = (cell / cols) as f32 * step;

                let d = self.boxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = letterbox.to_source(ax - d[0] * step, ay - d[1] * step);
                let (x2, y2) = letterbox.to_source(ax + d[2] * step, ay + d[3] * step);

                let landmarks = self.keypoints.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| letterbox.to_source(ax + k[2 * i] * step, ay + k[2 * i + 1] * step))
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: self.scores[idx],
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression. Returns survivors by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn candidate(x: f32, y: f32, size: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: size,
            height: size,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_nms_keeps_best_of_each_cluster() {
        let survivors = nms(
            vec![
                candidate(5.0, 5.0, 100.0, 0.8),
                candidate(200.0, 200.0, 50.0, 0.7),
                candidate(0.0, 0.0, 100.0, 0.9),
                candidate(210.0, 205.0, 50.0, 0.6),
            ],
            0.4,
        );
        let confidences: Vec<f32> = survivors.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, [0.9, 0.7]);
    }

    #[test]
    fn test_nms_keeps_disjoint_faces() {
        let survivors = nms(
            vec![candidate(0.0, 0.0, 10.0, 0.6), candidate(50.0, 0.0, 10.0, 0.95)],
            0.4,
        );
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].confidence, 0.95);
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_shape_and_padding() {
        // 320x160 landscape: scale 2.0, image fills 640x320, 160 rows of padding top and bottom
        let image = RgbImage::from_pixel(320, 160, Rgb([255, 0, 128]));
        let (tensor, info) = letterbox(&image, 640, 640);

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((info.scale - 2.0).abs() < 1e-6);
        assert!(info.pad_x.abs() < 1e-6);
        assert!((info.pad_y - 160.0).abs() < 1e-6);

        // Padding normalizes to zero
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert_eq!(tensor[[0, 2, 639, 639]], 0.0);

        // Image area keeps per-channel values
        let r = tensor[[0, 0, 320, 320]];
        let g = tensor[[0, 1, 320, 320]];
        assert!((r - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-2, "r = {r}");
        assert!((g - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-2, "g = {g}");
    }

    #[test]
    fn test_decode_stride_maps_back_through_letterbox() {
        // One anchor above threshold at grid cell (1, 1) of stride 32 on a 64x64 input.
        let stride = 32;
        let grid = 64 / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let idx = (grid + 1) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.8;

        let mut bboxes = vec![0.0f32; anchors * 4];
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);
        let kps = vec![0.0f32; anchors * 10];

        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 16.0 };
        let level = StrideOutputs { stride, scores: &scores, boxes: &bboxes, keypoints: &kps };
        let dets = level.decode(64, 64, &letterbox, 0.5);

        assert_eq!(dets.len(), 1);
        let det = &dets[0];
        // Anchor centre (32, 32), box 16..48 in letterboxed space
        assert!((det.x - 8.0).abs() < 1e-4, "x = {}", det.x);
        assert!((det.y - 0.0).abs() < 1e-4, "y = {}", det.y);
        assert!((det.width - 16.0).abs() < 1e-4);
        assert!((det.height - 16.0).abs() < 1e-4);
        // Zero keypoint offsets sit on the anchor centre
        let landmarks = det.landmarks.unwrap();
        assert!((landmarks[0].0 - 16.0).abs() < 1e-4 && (landmarks[0].1 - 8.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_below_threshold() {
        let stride = 32;
        let anchors = 2 * 2 * SCRFD_ANCHORS_PER_CELL;
        let scores = vec![0.3f32; anchors];
        let bboxes = vec![1.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let level = StrideOutputs { stride, scores: &scores, boxes: &bboxes, keypoints: &kps };
        assert!(level.decode(64, 64, &letterbox, 0.5).is_empty());
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8",  "bbox_16",  "bbox_32",
            "kps_8",   "kps_16",   "kps_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let indices = discover_output_indices(&names);

        // score_8 at index 2, bbox_8 at 0, kps_8 at 1
        assert_eq!(indices[0], (2, 0, 1));
        assert_eq!(indices[1], (5, 3, 4));
        assert_eq!(indices[2], (8, 6, 7));
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceDetector::load(Path::new("/nonexistent/det_10g.onnx"), 0.5).err();
        assert!(matches!(err, Some(DetectorError::ModelNotFound(_))));
    }
}
