//! Deterministic, leakage-free, stratified train/val/test partitioning.

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::SplitConfig;
use crate::corpus::{ClassCounts, UnifiedCorpus, class_counts, class_shares, stratum};
use crate::errors::{CuratorError, Result};
use crate::fingerprint::{Fingerprint, group_near_duplicates, max_distance_for};
use crate::types::{ImageRecord, Partition, UnifiedClass};

/// Record id to partition. Ordered so serialization is byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SplitAssignment {
    assignments: BTreeMap<String, Partition>,
}

impl SplitAssignment {
    pub fn get(&self, record_id: &str) -> Option<Partition> {
        self.assignments.get(record_id).copied()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Partition)> {
        self.assignments.iter().map(|(id, p)| (id.as_str(), *p))
    }

    /// Ids assigned to `partition`, ascending.
    pub fn members(&self, partition: Partition) -> Vec<&str> {
        self.iter()
            .filter(|(_, p)| *p == partition)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn counts(&self) -> BTreeMap<Partition, usize> {
        let mut counts: BTreeMap<Partition, usize> = Partition::ALL.iter().map(|p| (*p, 0)).collect();
        for partition in self.assignments.values() {
            *counts.entry(*partition).or_default() += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitOptions {
    pub ratios: SplitConfig,
    pub leakage_similarity: f64,
    pub seed: u64,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            ratios: SplitConfig::default(),
            leakage_similarity: 0.85,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSummary {
    pub images: usize,
    pub class_counts: ClassCounts,
    pub class_shares: BTreeMap<UnifiedClass, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitReport {
    pub seed: u64,
    pub leakage_distance: u32,
    /// Leakage groups with more than one member.
    pub leakage_groups: usize,
    pub largest_group: usize,
    pub global_shares: BTreeMap<UnifiedClass, f64>,
    pub partitions: BTreeMap<Partition, PartitionSummary>,
    pub requested_tolerance: f64,
    pub achieved_tolerance: f64,
}

impl SplitReport {
    pub fn within_tolerance(&self) -> bool {
        self.achieved_tolerance <= self.requested_tolerance + 1e-12
    }
}

#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub assignment: SplitAssignment,
    pub report: SplitReport,
}

/// Splits the corpus into train/val/test.
///
/// Near-duplicate clusters at the leakage threshold form groups that move as
/// a unit. Groups are bucketed by stratum, shuffled with a ChaCha8 RNG seeded
/// from `options.seed`, then each is handed to the partition with the largest
/// remaining image deficit inside its bucket.
pub fn split(corpus: &UnifiedCorpus, options: &SplitOptions) -> Result<SplitOutcome> {
    let _span = common::span!("split", records = corpus.len());
    options.ratios.validate()?;

    let records = corpus.records();
    if records.is_empty() {
        return Err(CuratorError::InfeasibleSplit("corpus is empty".to_string()));
    }

    let leakage_distance = max_distance_for(options.leakage_similarity);
    let fingerprints: Vec<Fingerprint> = records.iter().map(|r| r.fingerprint).collect();
    let groups = group_near_duplicates(&fingerprints, leakage_distance);

    let counts = class_counts(records);
    let strata: Vec<UnifiedClass> = records.iter().map(|r| stratum(r, &counts)).collect();

    // Within a stratum, groups are keyed further by their class composition
    // so mixed smoke+fire images spread like the rest.
    let mut cells: BTreeMap<(UnifiedClass, Vec<UnifiedClass>), Vec<usize>> = BTreeMap::new();
    for (group_index, members) in groups.iter().enumerate() {
        let group_stratum = members
            .iter()
            .map(|&m| strata[m])
            .min_by_key(|class| (counts.get(class).copied().unwrap_or(0), *class))
            .unwrap_or(UnifiedClass::Background);
        let mut composition: Vec<UnifiedClass> =
            members.iter().flat_map(|&m| records[m].classes()).collect();
        composition.sort();
        composition.dedup();
        cells
            .entry((group_stratum, composition))
            .or_default()
            .push(group_index);
    }

    check_feasibility(&groups_per_class(&cells), &options.ratios)?;

    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    let mut assignments = BTreeMap::new();

    for ((class, composition), group_indices) in cells.iter_mut() {
        group_indices.shuffle(&mut rng);

        let cell_images: usize = group_indices.iter().map(|&g| groups[g].len()).sum();
        let mut assigned: BTreeMap<Partition, usize> = BTreeMap::new();

        for &group_index in group_indices.iter() {
            let partition = largest_deficit(&options.ratios, cell_images, &assigned);
            let members = &groups[group_index];
            *assigned.entry(partition).or_default() += members.len();
            for &member in members {
                assignments.insert(records[member].id.clone(), partition);
            }
        }

        tracing::debug!(
            stratum = %class,
            composition = ?composition,
            groups = group_indices.len(),
            images = cell_images,
            train = assigned.get(&Partition::Train).copied().unwrap_or(0),
            val = assigned.get(&Partition::Val).copied().unwrap_or(0),
            test = assigned.get(&Partition::Test).copied().unwrap_or(0),
            "Assigned split cell"
        );
    }

    let assignment = SplitAssignment { assignments };
    let report = summarize(records, &assignment, &groups, leakage_distance, options);

    if !report.within_tolerance() {
        let message = format!(
            "achieved class-distribution tolerance {:.4} exceeds {:.4}",
            report.achieved_tolerance, report.requested_tolerance
        );
        if options.ratios.strict_tolerance {
            return Err(CuratorError::InfeasibleSplit(message));
        }
        tracing::warn!(
            achieved = report.achieved_tolerance,
            requested = report.requested_tolerance,
            "Split is outside the requested tolerance"
        );
    }

    tracing::info!(
        train = report.partitions[&Partition::Train].images,
        val = report.partitions[&Partition::Val].images,
        test = report.partitions[&Partition::Test].images,
        leakage_groups = report.leakage_groups,
        achieved_tolerance = report.achieved_tolerance,
        "Split complete"
    );

    Ok(SplitOutcome { assignment, report })
}

/// Number of leakage groups containing each class. A group with no boxes
/// counts as background.
fn groups_per_class(cells: &BTreeMap<(UnifiedClass, Vec<UnifiedClass>), Vec<usize>>) -> BTreeMap<UnifiedClass, usize> {
    let mut per_class = BTreeMap::new();
    for ((_, composition), group_indices) in cells {
        if composition.is_empty() {
            *per_class.entry(UnifiedClass::Background).or_default() += group_indices.len();
        }
        for class in composition {
            *per_class.entry(*class).or_default() += group_indices.len();
        }
    }
    per_class
}

/// Every class needs enough groups to put one in each non-empty partition.
fn check_feasibility(groups_per_class: &BTreeMap<UnifiedClass, usize>, ratios: &SplitConfig) -> Result<()> {
    for (class, &groups) in groups_per_class {
        for partition in Partition::ALL {
            let ratio = ratios.ratio(partition);
            if ratio > 0.0 && (groups as f64) * ratio < 1.0 - 1e-9 {
                return Err(CuratorError::InfeasibleSplit(format!(
                    "class {class} appears in {groups} group(s); {partition} at ratio {ratio} needs at least {}",
                    (1.0 / ratio).ceil() as usize
                )));
            }
        }
    }
    Ok(())
}

/// Ties go to the earlier partition.
fn largest_deficit(ratios: &SplitConfig, total: usize, assigned: &BTreeMap<Partition, usize>) -> Partition {
    let mut best = Partition::Train;
    let mut best_deficit = f64::NEG_INFINITY;
    for partition in Partition::ALL {
        let ratio = ratios.ratio(partition);
        if ratio <= 0.0 {
            continue;
        }
        let have = assigned.get(&partition).copied().unwrap_or(0) as f64;
        let deficit = ratio * total as f64 - have;
        if deficit > best_deficit {
            best = partition;
            best_deficit = deficit;
        }
    }
    best
}

fn summarize(
    records: &[ImageRecord],
    assignment: &SplitAssignment,
    groups: &[Vec<usize>],
    leakage_distance: u32,
    options: &SplitOptions,
) -> SplitReport {
    let global_shares = class_shares(&class_counts(records), records.len());

    let mut partitions = BTreeMap::new();
    let mut achieved: f64 = 0.0;
    for partition in Partition::ALL {
        let members: Vec<&ImageRecord> = records
            .iter()
            .filter(|r| assignment.get(&r.id) == Some(partition))
            .collect();
        let counts = class_counts(members.iter().copied());
        let shares = class_shares(&counts, members.len());

        if !members.is_empty() {
            for (class, share) in &shares {
                let global = global_shares.get(class).copied().unwrap_or(0.0);
                achieved = achieved.max((share - global).abs());
            }
        }

        partitions.insert(
            partition,
            PartitionSummary {
                images: members.len(),
                class_counts: counts,
                class_shares: shares,
            },
        );
    }

    SplitReport {
        seed: options.seed,
        leakage_distance,
        leakage_groups: groups.iter().filter(|g| g.len() > 1).count(),
        largest_group: groups.iter().map(Vec::len).max().unwrap_or(0),
        global_shares,
        partitions,
        requested_tolerance: options.ratios.tolerance,
        achieved_tolerance: achieved,
    }
}
