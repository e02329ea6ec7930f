//! Detection then anonymization for a single input file.

use crate::archive::{ArchiveError, OriginalArchive};
use crate::config::Config;
use crate::job::{JobError, JobOutcome, JobState, PipelineJob, Stage};
use crate::placement::OutputLayout;
use image::DynamicImage;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use veil_core::format::{self, ImageError};
use veil_core::metadata::{self, MetadataError};
use veil_core::{Anonymizer, Detect, DetectorError, FaceRecord, FaceRegion, PhotoFormat};

/// Why a stage failed.
#[derive(Error, Debug)]
pub enum FailureCause {
    #[error("unsupported file type")]
    Unsupported,
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("panicked: {0}")]
    Panic(String),
}

#[derive(Error, Debug)]
#[error("{stage} failed: {cause}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub cause: FailureCause,
}

/// Attribute a stage error to `stage`.
fn at<E: Into<FailureCause>>(stage: Stage) -> impl FnOnce(E) -> PipelineError {
    move |e| PipelineError {
        stage,
        cause: e.into(),
    }
}

/// Runs jobs against one detector. Owned by the engine thread.
pub struct Pipeline<D> {
    detector: D,
    anonymizer: Anonymizer,
    layout: OutputLayout,
    archive: Option<OriginalArchive>,
}

impl<D: Detect> Pipeline<D> {
    pub fn new(detector: D, config: &Config) -> Self {
        Self {
            detector,
            anonymizer: Anonymizer::new(config.blur_strength),
            layout: OutputLayout::from_config(config),
            archive: OriginalArchive::from_config(config),
        }
    }

    /// Drive one job to its outcome. Never returns an error: failures are
    /// routed to the error directory and reported in the outcome.
    pub fn process(&mut self, job: &mut PipelineJob) -> JobOutcome {
        let bytes = match fs::read(&job.source) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(file = %job.file_name, error = %e, "input not readable, retrying next cycle");
                return JobOutcome::Deferred {
                    reason: e.to_string(),
                };
            }
        };

        match self.run(job, &bytes) {
            Ok(outcome) => outcome,
            Err(err) => self.fail(job, err),
        }
    }

    fn run(&mut self, job: &mut PipelineJob, bytes: &[u8]) -> Result<JobOutcome, PipelineError> {
        let format = PhotoFormat::from_path(&job.source)
            .ok_or(FailureCause::Unsupported)
            .map_err(at::<FailureCause>(Stage::Intake))?;
        let output_name = format::output_file_name(&job.file_name)
            .ok_or(FailureCause::Unsupported)
            .map_err(at::<FailureCause>(Stage::Intake))?;
        let digest = metadata::source_digest(bytes);

        if self.already_placed(job, &output_name, &digest, bytes) {
            remove_input(&job.source, &job.file_name);
            return Ok(JobOutcome::AlreadyProcessed);
        }

        if let Some(archive) = &self.archive {
            archive
                .store(&job.file_name, bytes)
                .map_err(at::<ArchiveError>(Stage::Intake))?;
        }

        job.advance(JobState::Detecting).map_err(at::<JobError>(Stage::Intake))?;
        let (mut image, record) = self.detect(job, format, bytes, digest)?;
        let detection_output = self.write_detection(format, &output_name, bytes, &image, &record)?;

        job.advance(JobState::Anonymizing)
            .map_err(at::<JobError>(Stage::Detection))?;
        let anonymization_output = match self.anonymize(format, &output_name, &mut image, &record.faces) {
            Ok(path) => path,
            Err(err) => {
                self.layout.discard_detection(&output_name);
                return Err(err);
            }
        };

        job.advance(JobState::Done)
            .map_err(at::<JobError>(Stage::Anonymization))?;
        remove_input(&job.source, &job.file_name);

        tracing::info!(
            job = %job.id,
            file = %job.file_name,
            faces = record.faces.len(),
            "photo processed"
        );
        Ok(JobOutcome::Done {
            faces: record.faces.len(),
            detection_output,
            anonymization_output,
        })
    }

    /// Whether a previous run already placed this exact input.
    fn already_placed(&self, job: &PipelineJob, output_name: &str, digest: &str, bytes: &[u8]) -> bool {
        if self.layout.outputs_exist(output_name)
            && self.layout.recorded_digest(output_name).as_deref() == Some(digest)
        {
            tracing::info!(file = %job.file_name, "outputs already present, skipping");
            return true;
        }

        let error_copy = self.layout.error_path(&job.file_name);
        if error_copy.is_file() && fs::read(&error_copy).is_ok_and(|existing| existing == bytes) {
            tracing::info!(file = %job.file_name, "already routed to error directory, skipping");
            return true;
        }
        false
    }

    fn detect(
        &mut self,
        job: &PipelineJob,
        format: PhotoFormat,
        bytes: &[u8],
        source_digest: String,
    ) -> Result<(DynamicImage, FaceRecord), PipelineError> {
        let image = format::decode(bytes, format).map_err(at::<ImageError>(Stage::Detection))?;
        let (width, height) = (image.width(), image.height());

        let boxes = self
            .detector
            .detect(&image.to_rgb8())
            .map_err(at::<DetectorError>(Stage::Detection))?;
        let faces: Vec<FaceRegion> = boxes
            .iter()
            .filter_map(|b| b.to_region(width, height))
            .collect();

        tracing::debug!(
            file = %job.file_name,
            width,
            height,
            detections = boxes.len(),
            faces = faces.len(),
            "detection complete"
        );
        Ok((image, FaceRecord { faces, source_digest }))
    }

    fn write_detection(
        &self,
        format: PhotoFormat,
        output_name: &str,
        bytes: &[u8],
        image: &DynamicImage,
        record: &FaceRecord,
    ) -> Result<std::path::PathBuf, PipelineError> {
        let stage = Stage::Detection;
        let written = match format {
            PhotoFormat::Jpeg => {
                // Keep the original encoding where the stream allows it.
                let tagged = match metadata::embed_exif(bytes, record) {
                    Ok(tagged) => tagged,
                    Err(e) => {
                        tracing::debug!(file = output_name, error = %e, "re-encoding JPEG to embed metadata");
                        let encoded = format::encode(image, PhotoFormat::Jpeg).map_err(at::<ImageError>(stage))?;
                        metadata::embed_exif(&encoded, record).map_err(at::<MetadataError>(stage))?
                    }
                };
                self.layout.write_detection(output_name, &tagged, None)
            }
            f if f.needs_conversion() => {
                let encoded = format::encode(image, PhotoFormat::Jpeg).map_err(at::<ImageError>(stage))?;
                let tagged = metadata::embed_exif(&encoded, record).map_err(at::<MetadataError>(stage))?;
                self.layout.write_detection(output_name, &tagged, None)
            }
            _ => {
                let sidecar = metadata::to_sidecar(record).map_err(at::<MetadataError>(stage))?;
                self.layout.write_detection(output_name, bytes, Some(&sidecar))
            }
        };
        written.map_err(at::<io::Error>(stage))
    }

    fn anonymize(
        &self,
        format: PhotoFormat,
        output_name: &str,
        image: &mut DynamicImage,
        faces: &[FaceRegion],
    ) -> Result<std::path::PathBuf, PipelineError> {
        let stage = Stage::Anonymization;
        let blurred = self.anonymizer.anonymize(image, faces);
        tracing::debug!(file = output_name, blurred, "faces blurred");

        let encoded = format::encode(image, format.output_format()).map_err(at::<ImageError>(stage))?;
        self.layout
            .write_anonymized(output_name, &encoded)
            .map_err(at::<io::Error>(stage))
    }

    fn fail(&self, job: &mut PipelineJob, err: PipelineError) -> JobOutcome {
        tracing::error!(
            job = %job.id,
            file = %job.file_name,
            stage = %err.stage,
            error = %err.cause,
            "job failed"
        );
        self.place_failure(job, err.stage, err.cause.to_string())
    }

    /// Route a job whose processing panicked. Outputs written by the
    /// interrupted job are discarded.
    pub fn recover_from_panic(&self, job: &mut PipelineJob, message: String) -> JobOutcome {
        let stage = job.state().stage();
        tracing::error!(job = %job.id, file = %job.file_name, %stage, panic = %message, "job panicked");
        if job.state() == JobState::Anonymizing {
            if let Some(output_name) = format::output_file_name(&job.file_name) {
                self.layout.discard_detection(&output_name);
            }
        }
        let cause = FailureCause::Panic(message);
        self.place_failure(job, stage, cause.to_string())
    }

    fn place_failure(&self, job: &mut PipelineJob, stage: Stage, reason: String) -> JobOutcome {
        if let Err(e) = job.advance(JobState::Failed) {
            tracing::warn!(job = %job.id, error = %e, "job already terminal");
        }
        let error_path = match self.layout.route_to_error(&job.source, &job.file_name) {
            Ok(path) => {
                tracing::info!(file = %job.file_name, path = %path.display(), "original moved to error directory");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(
                    file = %job.file_name,
                    error = %e,
                    "could not move original to error directory, retrying next cycle"
                );
                None
            }
        };
        JobOutcome::Failed {
            stage,
            reason,
            error_path,
        }
    }
}

/// Remove a fully placed input. A failure leaves it for the watcher to retry.
pub fn remove_input(source: &Path, file_name: &str) {
    match fs::remove_file(source) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(file = file_name, error = %e, "failed to remove processed input"),
    }
}
