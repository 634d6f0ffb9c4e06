use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::CurationStage;

#[derive(Error, Debug)]
pub enum CuratorError {
    /// A label file line violates the annotation schema.
    #[error("Format error in {}:{line}: {message}", path.display())]
    Format {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// A label references an image that is not on disk, or the reverse.
    #[error("Missing file {}: {message}", path.display())]
    MissingFile { path: PathBuf, message: String },

    #[error("Quality threshold exceeded for source '{source_id}': {detail}")]
    QualityThreshold { source_id: String, detail: String },

    #[error("Infeasible split: {0}")]
    InfeasibleSplit(String),

    /// Aggregates every violation found by the consistency pass.
    #[error("Validation failed with {} violation(s): {}", .0.len(), .0.join("; "))]
    Validation(Vec<String>),

    /// Dataset-level failure; always fatal.
    #[error("Source '{source_id}' is unusable: {message}")]
    Source { source_id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid stage transition: {from} -> {to}")]
    Stage {
        from: CurationStage,
        to: CurationStage,
    },

    #[error("Image error in {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CuratorError {
    pub fn format(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    pub fn missing_file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MissingFile {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn quality(source_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::QualityThreshold {
            source_id: source_id.into(),
            detail: detail.into(),
        }
    }

    pub fn unusable_source(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Per-record errors are skipped during ingestion; everything else halts the run.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            Self::Format { .. } | Self::MissingFile { .. } | Self::Image { .. }
        )
    }
}

impl From<config::ConfigError> for CuratorError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CuratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let err = CuratorError::format("/data/a.txt", 3, "expected 5 fields, got 4");
        assert_eq!(
            err.to_string(),
            "Format error in /data/a.txt:3: expected 5 fields, got 4",
            "Format should carry path and line"
        );

        let err = CuratorError::missing_file("/data/b.txt", "no image for label");
        assert_eq!(err.to_string(), "Missing file /data/b.txt: no image for label");

        let err = CuratorError::quality("dfire", "invalid fraction 10.0% exceeds 5.0%");
        assert!(err.to_string().contains("'dfire'"));
        assert!(err.to_string().contains("10.0%"));

        let err = CuratorError::InfeasibleSplit("class fire has 4 groups".to_string());
        assert_eq!(err.to_string(), "Infeasible split: class fire has 4 groups");
    }

    #[test]
    fn test_validation_error_lists_every_violation() {
        let err = CuratorError::Validation(vec![
            "record a: unlabeled but not background".to_string(),
            "record b: annotation belongs to c".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("Validation failed with 2 violation(s)"));
        assert!(msg.contains("record a"), "First violation missing: {msg}");
        assert!(msg.contains("record b"), "Second violation missing: {msg}");
    }

    #[test]
    fn test_stage_error_names_both_stages() {
        let err = CuratorError::Stage {
            from: CurationStage::Split,
            to: CurationStage::Ingesting,
        };
        assert_eq!(err.to_string(), "Invalid stage transition: split -> ingesting");
    }

    #[test]
    fn test_record_level_classification() {
        assert!(CuratorError::format("a", 1, "x").is_record_level());
        assert!(CuratorError::missing_file("a", "x").is_record_level());
        assert!(!CuratorError::quality("s", "x").is_record_level());
        assert!(!CuratorError::unusable_source("s", "x").is_record_level());
    }

    #[test]
    fn test_error_conversion_from_io_error() {
        fn returns_io_error() -> std::result::Result<(), io::Error> {
            Err(io::Error::other("disk full"))
        }

        fn uses_question_mark() -> Result<()> {
            returns_io_error()?;
            Ok(())
        }

        match uses_question_mark() {
            Err(CuratorError::Io(e)) => assert_eq!(e.to_string(), "disk full"),
            other => panic!("Expected Io variant, got {other:?}"),
        }
    }
}
