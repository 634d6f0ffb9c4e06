//! The unified corpus and its class statistics.

use std::collections::BTreeMap;

use crate::ingest::{SourceCorpus, SourceReport};
use crate::types::{ImageRecord, UnifiedClass};

/// Image-level class counts: an image counts once for every class it
/// contains; background counts images without objects.
pub type ClassCounts = BTreeMap<UnifiedClass, usize>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedCorpus {
    records: Vec<ImageRecord>,
}

impl UnifiedCorpus {
    pub fn new(records: Vec<ImageRecord>) -> Self {
        Self { records }
    }

    /// Single-writer merge of per-source partial corpora.
    ///
    /// Merge order is registration order regardless of the order the partials
    /// finished in.
    pub fn merge(mut partials: Vec<SourceCorpus>) -> (Self, Vec<SourceReport>) {
        partials.sort_by_key(|partial| partial.source_index);

        let total = partials.iter().map(|p| p.records.len()).sum();
        let mut records = Vec::with_capacity(total);
        let mut reports = Vec::with_capacity(partials.len());
        for partial in partials {
            records.extend(partial.records);
            reports.push(partial.report);
        }
        (Self { records }, reports)
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ImageRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn class_counts(&self) -> ClassCounts {
        class_counts(&self.records)
    }

    /// Stratum of every record, in corpus order.
    pub fn strata(&self) -> Vec<UnifiedClass> {
        let counts = self.class_counts();
        self.records.iter().map(|r| stratum(r, &counts)).collect()
    }
}

pub fn class_counts<'a>(records: impl IntoIterator<Item = &'a ImageRecord>) -> ClassCounts {
    let mut counts: ClassCounts = UnifiedClass::ALL.iter().map(|c| (*c, 0)).collect();
    for record in records {
        if record.annotations.is_empty() {
            *counts.entry(UnifiedClass::Background).or_default() += 1;
        }
        for class in record.classes() {
            *counts.entry(class).or_default() += 1;
        }
    }
    counts
}

/// Background for images without objects, otherwise the globally rarest
/// class present. Rare classes therefore keep all of their images in their
/// own stratum.
pub fn stratum(record: &ImageRecord, counts: &ClassCounts) -> UnifiedClass {
    record
        .classes()
        .into_iter()
        .min_by_key(|class| (counts.get(class).copied().unwrap_or(0), *class))
        .unwrap_or(UnifiedClass::Background)
}

/// Share of `total` images containing each class.
pub fn class_shares(counts: &ClassCounts, total: usize) -> BTreeMap<UnifiedClass, f64> {
    counts
        .iter()
        .map(|(class, count)| {
            let share = if total == 0 {
                0.0
            } else {
                *count as f64 / total as f64
            };
            (*class, share)
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::fingerprint::Fingerprint;
    use crate::types::{Annotation, BoundingBox, ImageRecord, UnifiedClass};
    use std::path::PathBuf;

    /// Synthetic record; `seed` drives both fingerprints so distinct seeds are
    /// far apart.
    pub fn record(id: &str, source_index: usize, seed: u64, classes: &[UnifiedClass]) -> ImageRecord {
        let annotations = classes
            .iter()
            .map(|class| Annotation {
                record_id: id.to_string(),
                class: *class,
                bbox: BoundingBox::from_center(0.5, 0.5, 0.2, 0.2).unwrap(),
            })
            .collect::<Vec<_>>();
        let mut content = [0u8; 32];
        content[..8].copy_from_slice(&seed.to_le_bytes());
        ImageRecord {
            id: id.to_string(),
            source_id: format!("source{source_index}"),
            source_index,
            path: PathBuf::from(format!("/data/{id}.jpg")),
            width: 640,
            height: 480,
            fingerprint: Fingerprint::new(content, scramble(seed)),
            background: annotations.is_empty(),
            annotations,
        }
    }

    /// SplitMix64 finalizer; spreads sequential seeds over the whole hash space.
    pub fn scramble(seed: u64) -> u64 {
        let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}
