//! Test fixtures: a scripted detector and a temporary directory layout.

use crate::config::Config;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use veil_core::format::{self, PhotoFormat};
use veil_core::{BoundingBox, Detect, DetectorError};

#[derive(Clone, Copy)]
enum Script {
    Faces,
    Fail,
    Panic,
}

/// Returns a fixed answer for every image and counts its calls.
pub struct ScriptedDetector {
    faces: Vec<BoundingBox>,
    script: Script,
    calls: Arc<AtomicUsize>,
}

impl ScriptedDetector {
    fn scripted(faces: Vec<BoundingBox>, script: Script) -> Self {
        Self {
            faces,
            script,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_faces(faces: Vec<BoundingBox>) -> Self {
        Self::scripted(faces, Script::Faces)
    }

    pub fn failing() -> Self {
        Self::scripted(vec![], Script::Fail)
    }

    pub fn panicking() -> Self {
        Self::scripted(vec![], Script::Panic)
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Detect for ScriptedDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Faces => Ok(self.faces.clone()),
            Script::Fail => Err(DetectorError::InferenceFailed("scripted failure".into())),
            Script::Panic => panic!("scripted detector panic"),
        }
    }
}

pub fn face(x: f32, y: f32, width: f32, height: f32) -> BoundingBox {
    BoundingBox {
        x,
        y,
        width,
        height,
        confidence: 0.9,
        landmarks: None,
    }
}

fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 4 % 256) as u8, (y * 4 % 256) as u8, ((x + y) * 2 % 256) as u8])
    }))
}

pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    format::encode(&gradient(width, height), PhotoFormat::Jpeg).unwrap()
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    format::encode(&gradient(width, height), PhotoFormat::Png).unwrap()
}

pub fn bmp(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    gradient(width, height).write_to(&mut out, ImageFormat::Bmp).unwrap();
    out.into_inner()
}

/// Input and output directories under one temp root.
pub struct Workspace {
    pub root: tempfile::TempDir,
    pub config: Config,
}

impl Workspace {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            input_dir: root.path().join("photo_input"),
            detection_output_dir: root.path().join("photo_detection_output"),
            detection_error_dir: root.path().join("photo_detection_error"),
            anonymization_output_dir: root.path().join("photo_anonymization_output"),
            poll_interval_secs: 1,
            ..Config::default()
        };
        config.prepare_directories().unwrap();
        Self { root, config }
    }

    pub fn drop_input(&self, name: &str, bytes: &[u8]) {
        std::fs::write(self.config.input_dir.join(name), bytes).unwrap();
    }

    pub fn listing(&self, dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }
}
