//! Read-only integrity scan of configured sources (`curator check`).

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::labels::parse_line;
use crate::source::{DiscoveredImage, SourceDataset};

const REPORTED_ISSUES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub source_id: String,
    pub total_images: usize,
    pub corrupt_images: usize,
    pub missing_labels: usize,
    /// Label files without objects; background samples.
    pub empty_labels: usize,
    pub valid_objects: usize,
    /// Object count per raw source class index.
    pub class_counts: BTreeMap<u32, usize>,
    pub orphan_labels: usize,
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && self.corrupt_images == 0 && self.missing_labels == 0
    }

    fn merge(&mut self, other: ImageCheck) {
        self.corrupt_images += other.corrupt as usize;
        self.missing_labels += other.missing_label as usize;
        self.empty_labels += other.empty_label as usize;
        self.valid_objects += other.objects.values().sum::<usize>();
        for (class, count) in other.objects {
            *self.class_counts.entry(class).or_default() += count;
        }
        self.issues.extend(other.issues);
    }

    /// Logs the summary and the first issues.
    pub fn log(&self) {
        tracing::info!(
            source = %self.source_id,
            total_images = self.total_images,
            corrupt_images = self.corrupt_images,
            empty_labels = self.empty_labels,
            missing_labels = self.missing_labels,
            orphan_labels = self.orphan_labels,
            valid_objects = self.valid_objects,
            class_counts = ?self.class_counts,
            "Integrity report"
        );
        if self.issues.is_empty() {
            return;
        }
        tracing::warn!(source = %self.source_id, issues = self.issues.len(), "Found issues");
        for issue in self.issues.iter().take(REPORTED_ISSUES) {
            tracing::warn!(source = %self.source_id, "  - {issue}");
        }
        if self.issues.len() > REPORTED_ISSUES {
            tracing::warn!(
                source = %self.source_id,
                "  ... and {} more",
                self.issues.len() - REPORTED_ISSUES
            );
        }
    }
}

#[derive(Debug, Default)]
struct ImageCheck {
    corrupt: bool,
    missing_label: bool,
    empty_label: bool,
    objects: BTreeMap<u32, usize>,
    issues: Vec<String>,
}

/// Scans one source without building records. Structural problems are
/// reported as issues rather than errors so every source gets a report.
pub fn check_source(source: &SourceDataset, progress: bool) -> IntegrityReport {
    let _span = common::span!("check", source = %source.id);
    let mut report = IntegrityReport {
        source_id: source.id.clone(),
        ..IntegrityReport::default()
    };

    let layout = match source.discover() {
        Ok(layout) => layout,
        Err(e) => {
            tracing::error!(source = %source.id, error = %e, "Source cannot be scanned");
            report.issues.push(e.to_string());
            return report;
        }
    };
    report.total_images = layout.images.len();
    report.orphan_labels = layout.orphan_labels.len();

    let bar = if progress {
        progress_bar(layout.images.len() as u64, &source.id)
    } else {
        ProgressBar::hidden()
    };

    let checks: Vec<ImageCheck> = layout
        .images
        .par_iter()
        .map(|image| {
            let check = check_image(source, image);
            bar.inc(1);
            check
        })
        .collect();
    bar.finish_and_clear();

    for check in checks {
        report.merge(check);
    }
    for orphan in &layout.orphan_labels {
        report
            .issues
            .push(format!("Orphan label: {}", display_name(orphan)));
    }
    report
}

pub fn check_sources(sources: &[SourceDataset], progress: bool) -> Vec<IntegrityReport> {
    sources
        .iter()
        .map(|source| {
            let report = check_source(source, progress);
            report.log();
            report
        })
        .collect()
}

fn progress_bar(len: u64, source_id: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    match ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({eta})") {
        Ok(style) => bar.set_style(style.progress_chars("=> ")),
        Err(e) => tracing::debug!(error = %e, "Falling back to the default progress style"),
    }
    bar.set_message(format!("Checking {source_id}"));
    bar
}

fn check_image(source: &SourceDataset, image: &DiscoveredImage) -> ImageCheck {
    let mut check = ImageCheck::default();

    if image::image_dimensions(&image.path).is_err() {
        check.corrupt = true;
        check
            .issues
            .push(format!("Corrupt image: {}", display_name(&image.path)));
        return check;
    }

    let Some(label) = &image.label else {
        check.missing_label = true;
        return check;
    };

    let content = match fs::read_to_string(label) {
        Ok(content) => content,
        Err(e) => {
            check
                .issues
                .push(format!("Error reading {}: {e}", display_name(label)));
            return check;
        }
    };
    if content.trim().is_empty() {
        check.empty_label = true;
        return check;
    }

    for (idx, line) in content.lines().enumerate() {
        match parse_line(line, source.format, label, idx + 1) {
            Ok(Some(raw)) => {
                if source.class_map.get(raw.class_index).is_none() {
                    check.issues.push(format!(
                        "Unknown class {} in {}:{}",
                        raw.class_index,
                        display_name(label),
                        idx + 1
                    ));
                }
                *check.objects.entry(raw.class_index).or_default() += 1;
            }
            Ok(None) => {}
            Err(e) => check.issues.push(e.to_string()),
        }
    }
    check
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}
