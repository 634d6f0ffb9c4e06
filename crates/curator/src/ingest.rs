//! Per-source ingestion: discovery, label parsing, decoding, fingerprinting.
//!
//! Record-level failures are collected and logged; the source only fails as a
//! whole when the invalid fraction passes the configured threshold, the wall
//! clock budget runs out, or the source is larger than allowed.

use opentelemetry::KeyValue;
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::errors::{CuratorError, Result};
use crate::fingerprint::Fingerprint;
use crate::labels::parse_label_file;
use crate::source::{DiscoveredImage, SourceDataset};
use crate::telemetry::metrics;
use crate::types::{ImageRecord, LabelFormat, UnifiedClass};

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub max_invalid_fraction: f64,
    pub timeout: Duration,
    pub max_images: Option<usize>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_invalid_fraction: 0.05,
            timeout: Duration::from_secs(1800),
            max_images: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRecord {
    pub path: PathBuf,
    pub reason: String,
}

/// Provenance and quality figures for one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub id: String,
    pub root: PathBuf,
    pub format: LabelFormat,
    /// Unified classes the source's class map can produce.
    pub provided_classes: Vec<UnifiedClass>,
    pub discovered: usize,
    pub accepted: usize,
    pub background: usize,
    pub duplicates_removed: usize,
    pub rejected: Vec<RejectedRecord>,
}

impl SourceReport {
    pub fn invalid_fraction(&self) -> f64 {
        let total = self.accepted + self.rejected.len();
        if total == 0 {
            0.0
        } else {
            self.rejected.len() as f64 / total as f64
        }
    }
}

/// Records contributed by one source, in sorted relative-path order.
#[derive(Debug, Clone)]
pub struct SourceCorpus {
    pub source_index: usize,
    pub records: Vec<ImageRecord>,
    pub report: SourceReport,
}

/// Ingests one source into its own partial corpus.
pub fn ingest(source: &SourceDataset, options: &IngestOptions) -> Result<SourceCorpus> {
    let _span = common::span!("ingest", source = %source.id);
    let started = Instant::now();

    let layout = source.discover()?;
    tracing::info!(
        source = %source.id,
        images = layout.images.len(),
        orphan_labels = layout.orphan_labels.len(),
        "Discovered source files"
    );

    if let Some(max_images) = options.max_images
        && layout.images.len() > max_images
    {
        return Err(CuratorError::quality(
            &source.id,
            format!(
                "{} images exceed the per-source limit of {max_images}",
                layout.images.len()
            ),
        ));
    }

    let outcomes: Vec<(PathBuf, Result<ImageRecord>)> = layout
        .images
        .par_iter()
        .map(|image| {
            let elapsed = started.elapsed();
            if elapsed > options.timeout {
                return Err(CuratorError::quality(
                    &source.id,
                    format!(
                        "ingestion exceeded its {}s budget",
                        options.timeout.as_secs_f64()
                    ),
                ));
            }
            Ok((image.path.clone(), load_record(source, image)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut records = Vec::with_capacity(outcomes.len());
    let mut rejected = Vec::new();
    for (path, outcome) in outcomes {
        match outcome {
            Ok(record) => records.push(record),
            Err(e) if e.is_record_level() => {
                tracing::warn!(source = %source.id, error = %e, "Skipping invalid record");
                rejected.push(RejectedRecord {
                    path,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    for label in layout.orphan_labels {
        let e = CuratorError::missing_file(&label, "label references an image that is not on disk");
        tracing::warn!(source = %source.id, error = %e, "Skipping orphan label");
        rejected.push(RejectedRecord {
            path: label,
            reason: e.to_string(),
        });
    }

    let report = SourceReport {
        id: source.id.clone(),
        root: source.root.clone(),
        format: source.format,
        provided_classes: source.provided_classes(),
        discovered: layout.images.len(),
        accepted: records.len(),
        background: records.iter().filter(|r| r.background).count(),
        duplicates_removed: 0,
        rejected,
    };

    let attrs = [KeyValue::new("source", source.id.clone())];
    metrics()
        .records_ingested
        .add(report.accepted as u64, &attrs);
    metrics()
        .records_rejected
        .add(report.rejected.len() as u64, &attrs);

    let invalid_fraction = report.invalid_fraction();
    if invalid_fraction > options.max_invalid_fraction {
        return Err(CuratorError::quality(
            &source.id,
            format!(
                "invalid record fraction {:.1}% exceeds {:.1}% ({} of {})",
                invalid_fraction * 100.0,
                options.max_invalid_fraction * 100.0,
                report.rejected.len(),
                report.accepted + report.rejected.len()
            ),
        ));
    }

    tracing::info!(
        source = %source.id,
        accepted = report.accepted,
        rejected = report.rejected.len(),
        background = report.background,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Source ingested"
    );

    Ok(SourceCorpus {
        source_index: source.index,
        records,
        report,
    })
}

/// Builds one record. Every error returned here is record-level.
fn load_record(source: &SourceDataset, discovered: &DiscoveredImage) -> Result<ImageRecord> {
    let id = ImageRecord::derive_id(&source.id, &discovered.relative);

    let content = match &discovered.label {
        Some(label) => fs::read_to_string(label)
            .map_err(|e| CuratorError::missing_file(label, format!("unreadable label: {e}")))?,
        None if source.unlabeled_as_background => String::new(),
        None => {
            return Err(CuratorError::missing_file(
                &discovered.path,
                "image has no label file",
            ));
        }
    };

    let label_path = discovered.label.as_deref().unwrap_or(discovered.path.as_path());
    let annotations = parse_label_file(&content, source.format, &source.class_map, label_path, &id)?;

    let bytes = fs::read(&discovered.path)
        .map_err(|e| CuratorError::missing_file(&discovered.path, format!("unreadable image: {e}")))?;
    let decoded = image::load_from_memory(&bytes).map_err(|e| CuratorError::Image {
        path: discovered.path.clone(),
        source: e,
    })?;

    Ok(ImageRecord {
        id,
        source_id: source.id.clone(),
        source_index: source.index,
        path: discovered.path.clone(),
        width: decoded.width(),
        height: decoded.height(),
        fingerprint: Fingerprint::of_image(&bytes, &decoded),
        background: annotations.is_empty(),
        annotations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;
    use std::path::Path;

    fn write_image(path: &Path, shade: u8) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_fn(18, 16, |x, y| Rgb([shade, (x * 10) as u8, (y * 10) as u8]))
            .save(path)
            .unwrap();
    }

    fn write_label(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn source(root: &Path) -> SourceDataset {
        SourceDataset {
            id: "dfire".to_string(),
            index: 0,
            root: root.to_path_buf(),
            format: LabelFormat::Yolo,
            class_map: [(0, UnifiedClass::Smoke), (1, UnifiedClass::Fire)]
                .into_iter()
                .collect(),
            unlabeled_as_background: false,
        }
    }

    #[test]
    fn test_ingests_labeled_and_background_images() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_image(&root.join("images/a.png"), 10);
        write_label(&root.join("labels/a.txt"), "0 0.5 0.5 0.2 0.2\n1 0.3 0.3 0.1 0.1\n");
        write_image(&root.join("images/b.png"), 200);
        write_label(&root.join("labels/b.txt"), "");

        let corpus = ingest(&source(root), &IngestOptions::default()).unwrap();
        assert_eq!(corpus.records.len(), 2);
        assert_eq!(corpus.report.accepted, 2);
        assert_eq!(corpus.report.background, 1);
        assert!(corpus.report.rejected.is_empty());

        let a = &corpus.records[0];
        assert_eq!(a.id, ImageRecord::derive_id("dfire", "images/a.png"));
        assert_eq!((a.width, a.height), (18, 16));
        assert_eq!(a.annotations.len(), 2);
        assert!(!a.background);
        assert!(corpus.records[1].background);
    }

    #[test]
    fn test_skips_malformed_records_within_tolerance() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for i in 0..4 {
            write_image(&root.join(format!("images/{i}.png")), i as u8 * 40);
            write_label(&root.join(format!("labels/{i}.txt")), "0 0.5 0.5 0.2 0.2");
        }
        write_label(&root.join("labels/3.txt"), "0 0.5 0.5");
        write_image(&root.join("images/unlabeled.png"), 2);
        write_label(&root.join("labels/ghost.txt"), "0 0.5 0.5 0.2 0.2");

        // 3 of 6 invalid: malformed label, missing label, orphan label
        let options = IngestOptions {
            max_invalid_fraction: 0.5,
            ..IngestOptions::default()
        };
        let corpus = ingest(&source(root), &options).unwrap();
        assert_eq!(corpus.report.accepted, 3);
        let reasons: Vec<&str> = corpus.report.rejected.iter().map(|r| r.reason.as_str()).collect();
        assert_eq!(reasons.len(), 3);
        assert!(reasons.iter().any(|r| r.contains("image has no label file")));
        assert!(reasons.iter().any(|r| r.contains("not on disk")));

        let strict = IngestOptions {
            max_invalid_fraction: 0.4,
            ..options
        };
        assert!(matches!(
            ingest(&source(root), &strict),
            Err(CuratorError::QualityThreshold { .. })
        ));

        let lenient = SourceDataset {
            unlabeled_as_background: true,
            ..source(root)
        };
        let corpus = ingest(&lenient, &options).unwrap();
        assert_eq!(corpus.report.accepted, 4);
        assert_eq!(corpus.report.background, 1);
    }

    #[test]
    fn test_colliding_file_names_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for (name, shade) in [("a b", 10), ("a_b", 90), ("x", 150)] {
            write_image(&root.join(format!("{name}.png")), shade);
            write_label(&root.join(format!("{name}.txt")), "0 0.5 0.5 0.2 0.2");
        }
        write_image(&root.join("x.jpg"), 220);

        let lenient = SourceDataset {
            unlabeled_as_background: true,
            ..source(root)
        };
        let corpus = ingest(&lenient, &IngestOptions::default()).unwrap();
        assert_eq!(corpus.records.len(), 4);

        let ids: HashSet<&str> = corpus.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 4, "Record ids must be unique: {ids:?}");
        assert!(ids.contains("dfire__a_b.png"));
        assert!(ids.contains("dfire__x.png"));
        assert!(ids.contains("dfire__x.jpg"));
        crate::validate::validate(&crate::corpus::UnifiedCorpus::new(corpus.records)).unwrap();
    }

    #[test]
    fn test_corrupt_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_image(&root.join("images/good.png"), 1);
        write_label(&root.join("labels/good.txt"), "");
        write_label(&root.join("images/bad.png"), "not a png");
        write_label(&root.join("labels/bad.txt"), "");

        let options = IngestOptions {
            max_invalid_fraction: 1.0,
            ..IngestOptions::default()
        };
        let corpus = ingest(&source(root), &options).unwrap();
        assert_eq!(corpus.report.accepted, 1);
        assert!(corpus.report.rejected[0].reason.starts_with("Image error"));
    }

    #[test]
    fn test_oversized_source_and_zero_budget_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_image(&root.join("images/a.png"), 1);
        write_label(&root.join("labels/a.txt"), "");
        write_image(&root.join("images/b.png"), 2);
        write_label(&root.join("labels/b.txt"), "");

        let limited = IngestOptions {
            max_images: Some(1),
            ..IngestOptions::default()
        };
        assert!(matches!(
            ingest(&source(root), &limited),
            Err(CuratorError::QualityThreshold { .. })
        ));

        let no_time = IngestOptions {
            timeout: Duration::ZERO,
            ..IngestOptions::default()
        };
        let err = ingest(&source(root), &no_time).unwrap_err();
        assert!(err.to_string().contains("budget"), "{err}");
    }
}
