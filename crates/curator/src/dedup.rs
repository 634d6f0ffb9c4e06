//! Cross-source deduplication by content fingerprint.

use opentelemetry::KeyValue;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use crate::corpus::UnifiedCorpus;
use crate::fingerprint::{Fingerprint, group_near_duplicates, max_distance_for};
use crate::telemetry::metrics;
use crate::types::ImageRecord;

/// A record discarded in favour of the canonical member of its group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovedDuplicate {
    pub id: String,
    pub source_id: String,
    pub kept_id: String,
    pub kept_source_id: String,
    pub exact: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupReport {
    pub max_distance: u32,
    /// Groups with more than one member.
    pub duplicate_groups: usize,
    pub removed: Vec<RemovedDuplicate>,
    pub removed_per_source: BTreeMap<String, usize>,
}

impl DedupReport {
    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }
}

/// Keeps one canonical record per near-duplicate group.
///
/// The canonical record has the most annotations, then the earliest source
/// registration, then the smallest id. Retained records keep corpus order.
pub fn deduplicate(corpus: UnifiedCorpus, similarity: f64) -> (UnifiedCorpus, DedupReport) {
    let max_distance = max_distance_for(similarity);
    let records = corpus.into_records();

    let fingerprints: Vec<Fingerprint> = records.iter().map(|r| r.fingerprint).collect();
    let groups = group_near_duplicates(&fingerprints, max_distance);

    let mut report = DedupReport {
        max_distance,
        ..DedupReport::default()
    };
    let mut dropped = HashSet::new();

    for group in groups.iter().filter(|g| g.len() > 1) {
        report.duplicate_groups += 1;
        let Some(&canonical) = group.iter().max_by_key(|&&i| canonical_rank(&records[i])) else {
            continue;
        };
        let kept = &records[canonical];

        for &index in group.iter().filter(|&&i| i != canonical) {
            let removed = &records[index];
            dropped.insert(index);
            *report
                .removed_per_source
                .entry(removed.source_id.clone())
                .or_default() += 1;
            report.removed.push(RemovedDuplicate {
                id: removed.id.clone(),
                source_id: removed.source_id.clone(),
                kept_id: kept.id.clone(),
                kept_source_id: kept.source_id.clone(),
                exact: removed.fingerprint.content == kept.fingerprint.content,
            });
        }
    }

    for (source, count) in &report.removed_per_source {
        metrics()
            .duplicates_removed
            .add(*count as u64, &[KeyValue::new("source", source.clone())]);
    }

    tracing::info!(
        records = records.len(),
        groups = report.duplicate_groups,
        removed = report.removed.len(),
        max_distance,
        "Deduplicated corpus"
    );

    let retained = records
        .into_iter()
        .enumerate()
        .filter(|(index, _)| !dropped.contains(index))
        .map(|(_, record)| record)
        .collect();

    (UnifiedCorpus::new(retained), report)
}

fn canonical_rank(record: &ImageRecord) -> (usize, Reverse<usize>, Reverse<&str>) {
    (
        record.annotations.len(),
        Reverse(record.source_index),
        Reverse(record.id.as_str()),
    )
}
