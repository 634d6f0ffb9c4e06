//! The manifest consumed by the training process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::balance::BalanceReport;
use crate::errors::Result;
use crate::pipeline::CurationOutput;
use crate::split::PartitionSummary;
use crate::types::{LabelFormat, Partition, UnifiedClass};

pub const MANIFEST_SCHEMA_VERSION: &str = "1.0";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProvenance {
    pub id: String,
    pub root: PathBuf,
    pub format: LabelFormat,
    pub provided_classes: Vec<UnifiedClass>,
    pub discovered: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub background: usize,
    pub duplicates_removed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordProvenance {
    pub id: String,
    pub source: String,
    pub original_path: PathBuf,
    pub partition: Partition,
    pub width: u32,
    pub height: u32,
    pub annotations: usize,
    pub background: bool,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    pub seed: u64,
    pub ratios: SplitRatios,
    pub requested_tolerance: f64,
    pub achieved_tolerance: f64,
    pub duplicate_distance: u32,
    pub leakage_distance: u32,
    pub sources: Vec<SourceProvenance>,
    pub partitions: BTreeMap<Partition, PartitionSummary>,
    pub balance: BalanceReport,
    /// Sorted by record id.
    pub records: Vec<RecordProvenance>,
}

impl Manifest {
    pub fn from_output(output: &CurationOutput) -> Self {
        let assignment = &output.split.assignment;

        let mut records: Vec<RecordProvenance> = output
            .corpus
            .records()
            .iter()
            .filter_map(|record| {
                let partition = assignment.get(&record.id)?;
                Some(RecordProvenance {
                    id: record.id.clone(),
                    source: record.source_id.clone(),
                    original_path: record.path.clone(),
                    partition,
                    width: record.width,
                    height: record.height,
                    annotations: record.annotations.len(),
                    background: record.background,
                    content_hash: record.fingerprint.content_hex(),
                })
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        Self {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            created_at: Utc::now(),
            seed: output.seed,
            ratios: SplitRatios {
                train: output.ratios.train,
                val: output.ratios.val,
                test: output.ratios.test,
            },
            requested_tolerance: output.split.report.requested_tolerance,
            achieved_tolerance: output.split.report.achieved_tolerance,
            duplicate_distance: output.dedup.max_distance,
            leakage_distance: output.split.report.leakage_distance,
            sources: output
                .sources
                .iter()
                .map(|report| SourceProvenance {
                    id: report.id.clone(),
                    root: report.root.clone(),
                    format: report.format,
                    provided_classes: report.provided_classes.clone(),
                    discovered: report.discovered,
                    accepted: report.accepted,
                    rejected: report.rejected.len(),
                    background: report.background,
                    duplicates_removed: report.duplicates_removed,
                })
                .collect(),
            partitions: output.split.report.partitions.clone(),
            balance: output.balance.clone(),
            records,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
