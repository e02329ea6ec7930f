//! Writing job results into the output directories.
//!
//! Every file lands via a hidden `.partial` temp file in the destination
//! directory, is synced and then renamed into place, so external consumers
//! never see a half-written output.

use crate::config::Config;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use veil_core::metadata::{self, MetadataError};
use veil_core::{FaceRecord, PhotoFormat};

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("metadata: {0}")]
    Metadata(#[from] MetadataError),
    #[error("no face record format for {0}")]
    Unsupported(PathBuf),
}

/// Write `bytes` to `dir/name` atomically.
pub fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    let target = dir.join(name);
    let partial = partial_path(dir, name);

    let written = (|| {
        let mut file = File::create(&partial)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&partial, &target)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    sync_dir(dir);
    Ok(target)
}

fn partial_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!(".{name}{PARTIAL_SUFFIX}"))
}

/// Persist the rename itself. Not every platform can open a directory for
/// syncing, so failures are ignored.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// Remove temp files left behind by an interrupted write. Returns how many were removed.
pub fn sweep_partials(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) && entry.path().is_file() {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(file = name, error = %e, "failed to remove stale partial"),
            }
        }
    }
    Ok(removed)
}

/// Read the face record attached to a detection output, from its EXIF or sidecar.
pub fn load_record(image_path: &Path) -> Result<Option<FaceRecord>, PlacementError> {
    let format = PhotoFormat::from_path(image_path)
        .ok_or_else(|| PlacementError::Unsupported(image_path.to_path_buf()))?;

    if format.embeds_exif() {
        let bytes = fs::read(image_path)?;
        return Ok(metadata::read_exif(&bytes)?);
    }

    let Some(name) = image_path.file_name().and_then(|n| n.to_str()) else {
        return Err(PlacementError::Unsupported(image_path.to_path_buf()));
    };
    let sidecar = image_path.with_file_name(metadata::sidecar_name(name));
    match fs::read(&sidecar) {
        Ok(bytes) => Ok(Some(metadata::from_sidecar(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The three result directories of the pipeline.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub detection_dir: PathBuf,
    pub error_dir: PathBuf,
    pub anonymization_dir: PathBuf,
}

impl OutputLayout {
    pub fn from_config(config: &Config) -> Self {
        Self {
            detection_dir: config.detection_output_dir.clone(),
            error_dir: config.detection_error_dir.clone(),
            anonymization_dir: config.anonymization_output_dir.clone(),
        }
    }

    pub fn detection_path(&self, output_name: &str) -> PathBuf {
        self.detection_dir.join(output_name)
    }

    pub fn anonymization_path(&self, output_name: &str) -> PathBuf {
        self.anonymization_dir.join(output_name)
    }

    pub fn error_path(&self, file_name: &str) -> PathBuf {
        self.error_dir.join(file_name)
    }

    /// Write the detection output. A sidecar, when present, is written first so
    /// the image never appears without its record.
    pub fn write_detection(
        &self,
        output_name: &str,
        image: &[u8],
        sidecar: Option<&[u8]>,
    ) -> io::Result<PathBuf> {
        let Some(sidecar) = sidecar else {
            return write_atomic(&self.detection_dir, output_name, image);
        };
        let sidecar_name = metadata::sidecar_name(output_name);
        write_atomic(&self.detection_dir, &sidecar_name, sidecar)?;
        write_atomic(&self.detection_dir, output_name, image).inspect_err(|_| {
            let _ = fs::remove_file(self.detection_dir.join(&sidecar_name));
        })
    }

    pub fn write_anonymized(&self, output_name: &str, image: &[u8]) -> io::Result<PathBuf> {
        write_atomic(&self.anonymization_dir, output_name, image)
    }

    /// Remove a detection output and its sidecar after a later stage failed.
    pub fn discard_detection(&self, output_name: &str) {
        let sidecar = metadata::sidecar_name(output_name);
        for name in [output_name, sidecar.as_str()] {
            let path = self.detection_dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "discarded detection output"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to discard detection output")
                }
            }
        }
        sync_dir(&self.detection_dir);
    }

    /// Whether both outputs for `output_name` exist.
    pub fn outputs_exist(&self, output_name: &str) -> bool {
        self.detection_path(output_name).is_file() && self.anonymization_path(output_name).is_file()
    }

    /// Digest recorded in an existing detection output, if it can be read.
    pub fn recorded_digest(&self, output_name: &str) -> Option<String> {
        match load_record(&self.detection_path(output_name)) {
            Ok(record) => record.map(|r| r.source_digest),
            Err(e) => {
                tracing::debug!(file = output_name, error = %e, "existing detection output unreadable");
                None
            }
        }
    }

    /// Move the original input into the error directory under its own name.
    ///
    /// Falls back to copy + sync + remove when a rename is not possible
    /// (e.g. the directories are on different filesystems).
    pub fn route_to_error(&self, source: &Path, file_name: &str) -> io::Result<PathBuf> {
        let target = self.error_path(file_name);
        match fs::rename(source, &target) {
            Ok(()) => {
                sync_dir(&self.error_dir);
                return Ok(target);
            }
            Err(e) => {
                tracing::debug!(file = file_name, error = %e, "rename into error dir failed, copying");
            }
        }

        let bytes = fs::read(source)?;
        let target = write_atomic(&self.error_dir, file_name, &bytes)?;
        fs::remove_file(source)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::FaceRegion;

    fn layout(root: &Path) -> OutputLayout {
        let layout = OutputLayout {
            detection_dir: root.join("det"),
            error_dir: root.join("err"),
            anonymization_dir: root.join("anon"),
        };
        for dir in [&layout.detection_dir, &layout.error_dir, &layout.anonymization_dir] {
            fs::create_dir_all(dir).unwrap();
        }
        layout
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_write_atomic_leaves_no_partial() {
        let root = tempfile::tempdir().unwrap();
        let path = write_atomic(root.path(), "a.jpg", b"data").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"data");
        assert_eq!(listing(root.path()), ["a.jpg"]);
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let root = tempfile::tempdir().unwrap();
        write_atomic(root.path(), "a.jpg", b"old").unwrap();
        let path = write_atomic(root.path(), "a.jpg", b"new").unwrap();
        assert_eq!(fs::read(path).unwrap(), b"new");
    }

    #[test]
    fn test_write_atomic_missing_dir_fails() {
        let root = tempfile::tempdir().unwrap();
        assert!(write_atomic(&root.path().join("gone"), "a.jpg", b"x").is_err());
    }

    #[test]
    fn test_sweep_partials() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join(".a.jpg.partial"), b"half").unwrap();
        fs::write(root.path().join("b.jpg"), b"whole").unwrap();
        fs::write(root.path().join("c.partial"), b"visible name").unwrap();

        assert_eq!(sweep_partials(root.path()).unwrap(), 1);
        assert_eq!(listing(root.path()), ["b.jpg", "c.partial"]);
    }

    #[test]
    fn test_sidecar_written_with_detection_output() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout(root.path());
        let record = FaceRecord {
            faces: vec![FaceRegion { x: 1, y: 1, width: 2, height: 2 }],
            source_digest: metadata::source_digest(b"png"),
        };
        let sidecar = metadata::to_sidecar(&record).unwrap();
        layout.write_detection("a.png", b"png bytes", Some(&sidecar)).unwrap();

        assert_eq!(listing(&layout.detection_dir), ["a.png", "a.png.faces.json"]);
        assert_eq!(load_record(&layout.detection_path("a.png")).unwrap(), Some(record.clone()));
        assert_eq!(layout.recorded_digest("a.png"), Some(record.source_digest));

        layout.discard_detection("a.png");
        assert!(listing(&layout.detection_dir).is_empty());
    }

    #[test]
    fn test_load_record_missing_sidecar() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout(root.path());
        fs::write(layout.detection_path("a.tiff"), b"tiff").unwrap();
        assert_eq!(load_record(&layout.detection_path("a.tiff")).unwrap(), None);
    }

    #[test]
    fn test_route_to_error_moves_original() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout(root.path());
        let source = root.path().join("corrupt.jpg");
        fs::write(&source, b"garbage").unwrap();

        let placed = layout.route_to_error(&source, "corrupt.jpg").unwrap();
        assert_eq!(placed, layout.error_path("corrupt.jpg"));
        assert_eq!(fs::read(placed).unwrap(), b"garbage");
        assert!(!source.exists());
    }

    #[test]
    fn test_outputs_exist_requires_both() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout(root.path());
        fs::write(layout.detection_path("b.jpg"), b"x").unwrap();
        assert!(!layout.outputs_exist("b.jpg"));
        fs::write(layout.anonymization_path("b.jpg"), b"y").unwrap();
        assert!(layout.outputs_exist("b.jpg"));
    }
}
