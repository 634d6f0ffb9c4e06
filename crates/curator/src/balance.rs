//! Class-composition balancing by seeded downsampling.
//!
//! Shares are measured per stratum (see [`crate::corpus::stratum`]) so they
//! sum to one. Over-represented strata are cut down to their target; nothing
//! is ever oversampled, so shortfalls are only reported.

use opentelemetry::KeyValue;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::corpus::{UnifiedCorpus, class_counts, stratum};
use crate::telemetry::metrics;
use crate::types::UnifiedClass;

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceTargets {
    /// Desired share of images per stratum. Strata without a target are left alone.
    pub shares: BTreeMap<UnifiedClass, f64>,
    pub tolerance: f64,
    pub min_background_fraction: f64,
}

impl Default for BalanceTargets {
    fn default() -> Self {
        Self {
            shares: BTreeMap::new(),
            tolerance: 0.02,
            min_background_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratumBalance {
    pub before: usize,
    pub after: usize,
    pub share: f64,
    pub target: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceReport {
    pub strata: BTreeMap<UnifiedClass, StratumBalance>,
    pub downsampled: usize,
    pub under_represented: Vec<UnifiedClass>,
    pub background_share: f64,
    pub background_below_minimum: bool,
}

/// Downsamples strata above `target + tolerance` to their target share.
///
/// Strata are processed in class order against the running corpus size.
/// Selection is a ChaCha8 shuffle seeded from `seed`, and the retained
/// records keep corpus order.
pub fn balance(corpus: UnifiedCorpus, targets: &BalanceTargets, seed: u64) -> (UnifiedCorpus, BalanceReport) {
    let records = corpus.into_records();
    let counts = class_counts(&records);
    let strata: Vec<UnifiedClass> = records.iter().map(|r| stratum(r, &counts)).collect();

    let mut members: BTreeMap<UnifiedClass, Vec<usize>> =
        UnifiedClass::ALL.iter().map(|c| (*c, Vec::new())).collect();
    for (index, class) in strata.iter().enumerate() {
        members.entry(*class).or_default().push(index);
    }
    let before: BTreeMap<UnifiedClass, usize> =
        members.iter().map(|(class, idx)| (*class, idx.len())).collect();

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut total = records.len();
    let mut dropped = HashSet::new();

    for (class, indices) in members.iter_mut() {
        let Some(&target) = targets.shares.get(class) else {
            continue;
        };
        let count = indices.len();
        if total == 0 || target >= 1.0 {
            continue;
        }
        let share = count as f64 / total as f64;
        if share <= target + targets.tolerance {
            continue;
        }

        // keep / (others + keep) == target
        let others = (total - count) as f64;
        let keep = ((target * others / (1.0 - target)).round() as usize).min(count);

        indices.shuffle(&mut rng);
        for index in indices.drain(keep..) {
            dropped.insert(index);
        }
        indices.sort_unstable();
        total -= count - keep;

        tracing::info!(stratum = %class, before = count, after = keep, target, "Downsampled stratum");
        metrics()
            .records_downsampled
            .add((count - keep) as u64, &[KeyValue::new("stratum", class.as_str())]);
    }

    let mut report = BalanceReport {
        downsampled: dropped.len(),
        ..BalanceReport::default()
    };
    for (class, indices) in &members {
        let share = if total == 0 {
            0.0
        } else {
            indices.len() as f64 / total as f64
        };
        let target = targets.shares.get(class).copied();
        if let Some(target) = target
            && share < target - targets.tolerance
        {
            report.under_represented.push(*class);
        }
        report.strata.insert(
            *class,
            StratumBalance {
                before: before.get(class).copied().unwrap_or(0),
                after: indices.len(),
                share,
                target,
            },
        );
    }

    report.background_share = report
        .strata
        .get(&UnifiedClass::Background)
        .map_or(0.0, |s| s.share);
    if report.background_share < targets.min_background_fraction {
        report.background_below_minimum = true;
        if !report.under_represented.contains(&UnifiedClass::Background) {
            report.under_represented.push(UnifiedClass::Background);
        }
    }

    for class in &report.under_represented {
        tracing::warn!(
            stratum = %class,
            share = report.strata.get(class).map_or(0.0, |s| s.share),
            "Stratum is under-represented"
        );
    }

    let retained = records
        .into_iter()
        .enumerate()
        .filter(|(index, _)| !dropped.contains(index))
        .map(|(_, record)| record)
        .collect();

    (UnifiedCorpus::new(retained), report)
}
