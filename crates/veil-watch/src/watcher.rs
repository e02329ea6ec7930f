//! The polling loop: scan the input directory, hand settled files to the
//! engine, repeat until told to stop.

use crate::config::{Config, ConfigError};
use crate::engine::{spawn_engine, EngineError, EngineHandle};
use crate::job::{JobOutcome, PipelineJob};
use crate::pipeline::{self, Pipeline};
use crate::placement;
use crate::scan::{self, Fingerprint, Observation, Scanner, Settle};
use serde::Serialize;
use std::ops::AddAssign;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use veil_core::{DetectorError, FaceDetector};

#[derive(Error, Debug)]
pub enum WatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("watch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Counts of job outcomes over one or more cycles.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred: usize,
}

impl CycleSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Done { .. } => self.processed += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
            JobOutcome::AlreadyProcessed => self.skipped += 1,
            JobOutcome::Deferred { .. } => self.deferred += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.processed + self.failed + self.skipped + self.deferred
    }
}

impl AddAssign for CycleSummary {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.deferred += other.deferred;
    }
}

/// Load the detector, start the engine and prepare the working directories.
///
/// Every error here is a startup error and should end the process.
pub fn bootstrap(config: &Config) -> Result<Watcher, WatchError> {
    config.prepare_directories()?;

    let model_path = config.scrfd_model_path();
    let detector = FaceDetector::load(&model_path, config.detection_confidence)?;
    tracing::info!(path = %model_path.display(), "SCRFD detector loaded");

    let engine = spawn_engine(Pipeline::new(detector, config))?;
    let watcher = Watcher::new(config.clone(), engine);
    watcher.prepare()?;
    Ok(watcher)
}

pub struct Watcher {
    config: Config,
    engine: EngineHandle,
    scanner: Scanner,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Watcher {
    pub fn new(config: Config, engine: EngineHandle) -> Self {
        Self {
            config,
            engine,
            scanner: Scanner::new(),
            shutdown: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ensure the directories exist and clear temp files left by a previous run.
    pub fn prepare(&self) -> Result<(), WatchError> {
        self.config.prepare_directories()?;

        let mut dirs = vec![
            &self.config.detection_output_dir,
            &self.config.detection_error_dir,
            &self.config.anonymization_output_dir,
        ];
        if let Some(archive) = &self.config.originals_archive_dir {
            dirs.push(archive);
        }
        for dir in dirs {
            match placement::sweep_partials(dir) {
                Ok(0) => {}
                Ok(removed) => tracing::info!(dir = %dir.display(), removed, "removed stale partial files"),
                Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "could not sweep partial files"),
            }
        }
        Ok(())
    }

    /// One watch-mode cycle. Files are processed once they have settled.
    pub async fn tick(&mut self) -> CycleSummary {
        self.cycle(Settle::TwoScans).await
    }

    /// Process everything currently in the input directory without waiting
    /// for files to settle.
    pub async fn drain(&mut self) -> CycleSummary {
        self.cycle(Settle::Immediate).await
    }

    fn stopping(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn cycle(&mut self, settle: Settle) -> CycleSummary {
        let mut summary = CycleSummary::default();

        let listing = match self.list_input().await {
            Ok(listing) => listing,
            Err(e) => {
                tracing::warn!(
                    dir = %self.config.input_dir.display(),
                    error = %e,
                    "failed to list input directory, retrying next cycle"
                );
                return summary;
            }
        };

        let scan = self.scanner.observe(listing, settle);

        if !scan.lingering.is_empty() {
            let lingering = scan.lingering;
            let removal = tokio::task::spawn_blocking(move || {
                for obs in &lingering {
                    tracing::debug!(file = %obs.name, "retrying removal of processed input");
                    pipeline::remove_input(&obs.path, &obs.name);
                }
            });
            if let Err(e) = removal.await {
                tracing::warn!(error = %e, "input removal task failed, retrying next cycle");
            }
        }

        for obs in scan.ready {
            if self.stopping() {
                // Not started: picked up again by the next run.
                self.scanner.finish(&obs.name, false);
                continue;
            }

            let job = PipelineJob::new(obs.path, obs.name.clone());
            tracing::debug!(job = %job.id, file = %job.file_name, "job queued");
            match self.engine.process(job).await {
                Ok(report) => {
                    tracing::debug!(
                        job = %report.id,
                        file = %report.file_name,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        outcome = ?report.outcome,
                        "job finished"
                    );
                    self.scanner.finish(&obs.name, report.outcome.is_settled());
                    summary.record(&report.outcome);
                }
                Err(e) => {
                    tracing::error!(file = %obs.name, error = %e, "engine unavailable");
                    self.scanner.finish(&obs.name, false);
                }
            }
        }

        if summary.total() > 0 {
            tracing::info!(
                processed = summary.processed,
                failed = summary.failed,
                skipped = summary.skipped,
                deferred = summary.deferred,
                "cycle complete"
            );
        }
        summary
    }

    async fn list_input(&self) -> std::io::Result<Vec<Observation>> {
        let mut entries = tokio::fs::read_dir(&self.config.input_dir).await?;
        let mut listing = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !scan::is_candidate(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                tracing::warn!(path = %path.display(), "skipping file with non UTF-8 name");
                continue;
            };
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    // Vanished or locked between listing and stat.
                    tracing::debug!(file = %name, error = %e, "stat failed, retrying next cycle");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            listing.push(Observation {
                name,
                path,
                fingerprint: Fingerprint::of(&metadata),
            });
        }

        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    /// Run the polling loop on a tokio task until [`RunningWatcher::stop`].
    pub fn start(mut self) -> RunningWatcher {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_rx.clone());
        let interval = self.config.poll_interval();

        let task = tokio::spawn(async move {
            tracing::info!(
                input = %self.config.input_dir.display(),
                interval_secs = interval.as_secs(),
                "watching for photos"
            );
            let mut totals = CycleSummary::default();
            loop {
                totals += self.tick().await;
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            tracing::info!(
                processed = totals.processed,
                failed = totals.failed,
                skipped = totals.skipped,
                "watcher stopped"
            );
            totals
        });

        RunningWatcher {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// A watcher running on a background task.
pub struct RunningWatcher {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<CycleSummary>,
}

impl RunningWatcher {
    /// Signal the loop to stop and wait for it. The job in progress finishes;
    /// queued files are left for the next run.
    pub async fn stop(self) -> Result<CycleSummary, WatchError> {
        let _ = self.shutdown.send(true);
        Ok(self.task.await?)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, ScriptedDetector, Workspace};
    use std::fs;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn watcher(ws: &Workspace, detector: ScriptedDetector) -> Watcher {
        let engine = spawn_engine(Pipeline::new(detector, &ws.config)).unwrap();
        let watcher = Watcher::new(ws.config.clone(), engine);
        watcher.prepare().unwrap();
        watcher
    }

    fn one_face() -> ScriptedDetector {
        ScriptedDetector::with_faces(vec![testing::face(4.0, 4.0, 16.0, 16.0)])
    }

    #[tokio::test]
    async fn test_settled_file_processed_on_second_cycle() {
        let ws = Workspace::new();
        let mut watcher = watcher(&ws, one_face());
        ws.drop_input("a.jpg", &testing::jpeg(48, 48));

        assert_eq!(watcher.tick().await.total(), 0);
        let summary = watcher.tick().await;

        assert_eq!(summary.processed, 1);
        assert!(ws.listing(&ws.config.input_dir).is_empty());
        assert_eq!(ws.listing(&ws.config.detection_output_dir), ["a.jpg"]);
        assert_eq!(ws.listing(&ws.config.anonymization_output_dir), ["a.jpg"]);
    }

    #[tokio::test]
    async fn test_growing_file_waits() {
        let ws = Workspace::new();
        let mut watcher = watcher(&ws, one_face());
        let jpeg = testing::jpeg(48, 48);
        let (head, _) = jpeg.split_at(jpeg.len() / 2);

        ws.drop_input("big.jpg", head);
        watcher.tick().await;
        ws.drop_input("big.jpg", &jpeg);
        assert_eq!(watcher.tick().await.total(), 0);
        assert!(ws.listing(&ws.config.detection_error_dir).is_empty());

        assert_eq!(watcher.tick().await.processed, 1);
    }

    #[tokio::test]
    async fn test_drain_processes_everything_once() {
        let ws = Workspace::new();
        let mut watcher = watcher(&ws, one_face());
        ws.drop_input("a.jpg", &testing::jpeg(32, 32));
        ws.drop_input("corrupt.jpg", b"not an image");
        ws.drop_input(".hidden.jpg", b"ignored");

        let summary = watcher.drain().await;

        assert_eq!(summary, CycleSummary { processed: 1, failed: 1, skipped: 0, deferred: 0 });
        assert_eq!(ws.listing(&ws.config.input_dir), [".hidden.jpg"]);
        assert_eq!(ws.listing(&ws.config.detection_error_dir), ["corrupt.jpg"]);
        assert_eq!(ws.listing(&ws.config.detection_output_dir), ["a.jpg"]);
        assert_eq!(watcher.drain().await.total(), 0);
    }

    #[tokio::test]
    async fn test_subdirectories_ignored() {
        let ws = Workspace::new();
        let mut watcher = watcher(&ws, one_face());
        fs::create_dir(ws.config.input_dir.join("nested.jpg")).unwrap();

        assert_eq!(watcher.drain().await.total(), 0);
        assert!(ws.config.input_dir.join("nested.jpg").is_dir());
    }

    #[tokio::test]
    async fn test_readded_file_processed_again() {
        let ws = Workspace::new();
        let mut watcher = watcher(&ws, one_face());
        ws.drop_input("a.jpg", &testing::jpeg(32, 32));
        assert_eq!(watcher.drain().await.processed, 1);

        ws.drop_input("a.jpg", &testing::jpeg(40, 40));
        assert_eq!(watcher.drain().await.processed, 1);
    }

    #[tokio::test]
    async fn test_lingering_processed_input_is_removed() {
        let ws = Workspace::new();
        let detector = one_face();
        let calls = detector.calls();
        let mut watcher = watcher(&ws, detector);
        let jpeg = testing::jpeg(32, 32);
        let input = ws.config.input_dir.join("a.jpg");
        ws.drop_input("a.jpg", &jpeg);
        let modified = fs::metadata(&input).unwrap().modified().unwrap();
        assert_eq!(watcher.drain().await.processed, 1);

        // Same bytes and mtime: the file whose removal did not stick
        ws.drop_input("a.jpg", &jpeg);
        fs::File::options().write(true).open(&input).unwrap().set_modified(modified).unwrap();

        assert_eq!(watcher.drain().await.total(), 0);
        assert!(!input.exists());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_input_dir_is_not_fatal() {
        let ws = Workspace::new();
        let mut watcher = watcher(&ws, one_face());
        fs::remove_dir(&ws.config.input_dir).unwrap();

        assert_eq!(watcher.tick().await.total(), 0);

        fs::create_dir(&ws.config.input_dir).unwrap();
        ws.drop_input("a.jpg", &testing::jpeg(16, 16));
        assert_eq!(watcher.drain().await.processed, 1);
    }

    #[tokio::test]
    async fn test_prepare_sweeps_partials() {
        let ws = Workspace::new();
        let stale = ws.config.anonymization_output_dir.join(".a.jpg.partial");
        fs::write(&stale, b"half").unwrap();

        watcher(&ws, one_face());

        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let ws = Workspace::new();
        let running = watcher(&ws, one_face()).start();
        ws.drop_input("a.jpg", &testing::jpeg(32, 32));

        let anonymized = ws.config.anonymization_output_dir.join("a.jpg");
        for _ in 0..100 {
            if anonymized.exists() && !ws.config.input_dir.join("a.jpg").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let totals = running.stop().await.unwrap();
        assert_eq!(totals.processed, 1);
        assert!(anonymized.is_file());
    }

    #[tokio::test]
    async fn test_stop_while_idle_returns_promptly() {
        let ws = Workspace::new();
        let mut config = ws.config.clone();
        config.poll_interval_secs = 3600;
        let engine = spawn_engine(Pipeline::new(one_face(), &config)).unwrap();
        let running = Watcher::new(config, engine).start();

        let totals = tokio::time::timeout(Duration::from_secs(5), running.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(totals.total(), 0);
    }
}
