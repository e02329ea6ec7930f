use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_INPUT_DIR: &str = "photo_input";
pub const DEFAULT_DETECTION_OUTPUT_DIR: &str = "photo_detection_output";
pub const DEFAULT_DETECTION_ERROR_DIR: &str = "photo_detection_error";
pub const DEFAULT_ANONYMIZATION_OUTPUT_DIR: &str = "photo_anonymization_output";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{first} and {second} must be different directories (both {path})")]
    SharedDirectory {
        first: &'static str,
        second: &'static str,
        path: PathBuf,
    },
    #[error("directory {path} is not usable: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the watcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Poll the input directory until stopped.
    Watch,
    /// Process what is in the input directory now, then exit.
    Once,
}

impl std::str::FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "watch" => Ok(Self::Watch),
            "once" => Ok(Self::Once),
            _ => Err(()),
        }
    }
}

/// Watcher configuration: defaults, then an optional TOML file named by
/// `VEIL_CONFIG`, then environment variables.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Seconds between scans of the input directory (default: 5, minimum 1).
    pub poll_interval_secs: u64,
    pub input_dir: PathBuf,
    pub detection_output_dir: PathBuf,
    pub detection_error_dir: PathBuf,
    pub anonymization_output_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub mode: Mode,
    /// Box blur kernel size in pixels.
    pub blur_strength: u32,
    /// Minimum detector score for a face.
    pub detection_confidence: f32,
    /// Where originals are archived before processing; disabled when unset.
    pub originals_archive_dir: Option<PathBuf>,
    /// Encrypts archived originals when set.
    #[serde(skip)]
    pub encryption_password: Option<String>,
    /// Directory for the rolling log file; console only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            detection_output_dir: PathBuf::from(DEFAULT_DETECTION_OUTPUT_DIR),
            detection_error_dir: PathBuf::from(DEFAULT_DETECTION_ERROR_DIR),
            anonymization_output_dir: PathBuf::from(DEFAULT_ANONYMIZATION_OUTPUT_DIR),
            model_dir: veil_core::default_model_dir(),
            mode: Mode::Watch,
            blur_strength: veil_core::anonymizer::DEFAULT_BLUR_STRENGTH,
            detection_confidence: veil_core::detector::SCRFD_CONFIDENCE_THRESHOLD,
            originals_archive_dir: None,
            encryption_password: None,
            log_dir: None,
        }
    }
}

/// Keys accepted in the TOML config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    poll_interval: Option<u64>,
    input_dir: Option<PathBuf>,
    detection_output_dir: Option<PathBuf>,
    detection_error_dir: Option<PathBuf>,
    anonymization_output_dir: Option<PathBuf>,
    models_dir: Option<PathBuf>,
    mode: Option<Mode>,
    blur_strength: Option<u32>,
    detection_confidence: Option<f32>,
    originals_archive_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = non_empty(lookup("VEIL_CONFIG")) {
            config.apply_file(Path::new(&path))?;
        }

        if let Some(v) = non_empty(lookup("POLL_INTERVAL")) {
            config.poll_interval_secs = parse_u64("POLL_INTERVAL", &v)?;
        }
        if let Some(v) = non_empty(lookup("PHOTO_INPUT")) {
            config.input_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty(lookup("PHOTO_DETECTION_OUTPUT")) {
            config.detection_output_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty(lookup("PHOTO_DETECTION_ERROR")) {
            config.detection_error_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty(lookup("PHOTO_ANONYMIZATION_OUTPUT")) {
            config.anonymization_output_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty(lookup("MODELS_DIR")) {
            config.model_dir = PathBuf::from(v);
        }
        if let Some(v) = non_empty(lookup("WATCHER_MODE")) {
            config.mode = v.parse().map_err(|()| ConfigError::InvalidValue {
                key: "WATCHER_MODE",
                value: v.clone(),
                reason: "expected \"watch\" or \"once\"",
            })?;
        }
        if let Some(v) = non_empty(lookup("BLUR_STRENGTH")) {
            config.blur_strength = parse_u64("BLUR_STRENGTH", &v)?
                .try_into()
                .map_err(|_| invalid("BLUR_STRENGTH", &v, "out of range"))?;
        }
        if let Some(v) = non_empty(lookup("DETECTION_CONFIDENCE")) {
            config.detection_confidence = v
                .trim()
                .parse()
                .map_err(|_| invalid("DETECTION_CONFIDENCE", &v, "not a number"))?;
        }
        if let Some(v) = non_empty(lookup("PHOTO_ORIGINALS_ARCHIVE")) {
            config.originals_archive_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty(lookup("ORIGINALS_ENCRYPTION_PASSWORD")) {
            config.encryption_password = Some(v);
        }
        if let Some(v) = non_empty(lookup("LOG_DIR")) {
            config.log_dir = Some(PathBuf::from(v));
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&text).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(v) = file.poll_interval {
            self.poll_interval_secs = v;
        }
        if let Some(v) = file.input_dir {
            self.input_dir = v;
        }
        if let Some(v) = file.detection_output_dir {
            self.detection_output_dir = v;
        }
        if let Some(v) = file.detection_error_dir {
            self.detection_error_dir = v;
        }
        if let Some(v) = file.anonymization_output_dir {
            self.anonymization_output_dir = v;
        }
        if let Some(v) = file.models_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.mode {
            self.mode = v;
        }
        if let Some(v) = file.blur_strength {
            self.blur_strength = v;
        }
        if let Some(v) = file.detection_confidence {
            self.detection_confidence = v;
        }
        if file.originals_archive_dir.is_some() {
            self.originals_archive_dir = file.originals_archive_dir;
        }
        if file.log_dir.is_some() {
            self.log_dir = file.log_dir;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs < 1 {
            return Err(invalid(
                "POLL_INTERVAL",
                &self.poll_interval_secs.to_string(),
                "must be at least 1 second",
            ));
        }
        if self.blur_strength < 1 {
            return Err(invalid(
                "BLUR_STRENGTH",
                &self.blur_strength.to_string(),
                "must be at least 1",
            ));
        }
        if !(0.0..1.0).contains(&self.detection_confidence) {
            return Err(invalid(
                "DETECTION_CONFIDENCE",
                &self.detection_confidence.to_string(),
                "must be in [0, 1)",
            ));
        }

        let dirs = self.named_dirs();
        for (i, (first, a)) in dirs.iter().enumerate() {
            for (second, b) in &dirs[i + 1..] {
                if a == b {
                    return Err(ConfigError::SharedDirectory {
                        first: *first,
                        second: *second,
                        path: a.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn named_dirs(&self) -> Vec<(&'static str, PathBuf)> {
        let mut dirs = vec![
            ("PHOTO_INPUT", self.input_dir.clone()),
            ("PHOTO_DETECTION_OUTPUT", self.detection_output_dir.clone()),
            ("PHOTO_DETECTION_ERROR", self.detection_error_dir.clone()),
            ("PHOTO_ANONYMIZATION_OUTPUT", self.anonymization_output_dir.clone()),
        ];
        if let Some(archive) = &self.originals_archive_dir {
            dirs.push(("PHOTO_ORIGINALS_ARCHIVE", archive.clone()));
        }
        dirs
    }

    /// Create every working directory that is missing and check that the input
    /// directory can be listed. Any failure here is fatal for the watcher.
    pub fn prepare_directories(&self) -> Result<(), ConfigError> {
        for (_, dir) in self.named_dirs() {
            std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Directory {
                path: dir.clone(),
                source,
            })?;
        }

        std::fs::read_dir(&self.input_dir).map_err(|source| ConfigError::Directory {
            path: self.input_dir.clone(),
            source,
        })?;

        for (name, dir) in self.named_dirs() {
            if name == "PHOTO_INPUT" {
                continue;
            }
            probe_writable(&dir).map_err(|source| ConfigError::Directory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(veil_core::detector::SCRFD_MODEL_FILE)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }
}

fn probe_writable(dir: &Path) -> std::io::Result<()> {
    let probe = dir.join(".veil-write-probe");
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, value, "not a non-negative integer"))
}

fn invalid(key: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason,
    }
}
