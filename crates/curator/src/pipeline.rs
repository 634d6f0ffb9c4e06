use rayon::prelude::*;
use std::fmt;
use std::time::Duration;

use crate::balance::{BalanceReport, BalanceTargets, balance};
use crate::config::{CuratorConfig, SplitConfig};
use crate::corpus::UnifiedCorpus;
use crate::dedup::{DedupReport, deduplicate};
use crate::errors::{CuratorError, Result};
use crate::ingest::{IngestOptions, SourceCorpus, SourceReport, ingest};
use crate::manifest::Manifest;
use crate::persist::{PersistOptions, PersistedLayout, persist};
use crate::split::{SplitOptions, SplitOutcome, split};
use crate::telemetry::StageTimer;
use crate::validate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CurationStage {
    Unconfigured,
    Ingesting,
    Validated,
    Split,
    Persisted,
}

impl CurationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurationStage::Unconfigured => "unconfigured",
            CurationStage::Ingesting => "ingesting",
            CurationStage::Validated => "validated",
            CurationStage::Split => "split",
            CurationStage::Persisted => "persisted",
        }
    }

    pub fn next(&self) -> Option<CurationStage> {
        match self {
            CurationStage::Unconfigured => Some(CurationStage::Ingesting),
            CurationStage::Ingesting => Some(CurationStage::Validated),
            CurationStage::Validated => Some(CurationStage::Split),
            CurationStage::Split => Some(CurationStage::Persisted),
            CurationStage::Persisted => None,
        }
    }
}

impl fmt::Display for CurationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strictly forward lifecycle of one run.
pub struct StageTracker {
    current: CurationStage,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: CurationStage::Unconfigured,
        }
    }

    pub fn current(&self) -> CurationStage {
        self.current
    }

    /// Moves to `to` if it is the immediate successor of the current stage.
    pub fn advance(&mut self, to: CurationStage) -> Result<()> {
        if self.current.next() != Some(to) {
            return Err(CuratorError::Stage {
                from: self.current,
                to,
            });
        }
        tracing::info!(from = %self.current, to = %to, "Stage transition");
        self.current = to;
        Ok(())
    }
}

/// Everything a run produces before it is written to disk.
#[derive(Debug, Clone)]
pub struct CurationOutput {
    pub corpus: UnifiedCorpus,
    pub sources: Vec<SourceReport>,
    pub dedup: DedupReport,
    pub balance: BalanceReport,
    pub split: SplitOutcome,
    pub seed: u64,
    pub ratios: SplitConfig,
}

pub struct Curator {
    config: CuratorConfig,
    stage: StageTracker,
}

impl Curator {
    pub fn new(config: CuratorConfig) -> Self {
        Self {
            config,
            stage: StageTracker::new(),
        }
    }

    pub fn stage(&self) -> CurationStage {
        self.stage.current()
    }

    pub fn config(&self) -> &CuratorConfig {
        &self.config
    }

    /// Ingests every source in parallel and merges the partial corpora in
    /// registration order. Any source failure halts the run.
    pub fn ingest(&mut self) -> Result<(UnifiedCorpus, Vec<SourceReport>)> {
        self.stage.advance(CurationStage::Ingesting)?;
        let _timer = StageTimer::start("ingest");

        let sources = self.config.source_datasets()?;
        let options = IngestOptions {
            max_invalid_fraction: self.config.max_invalid_fraction,
            timeout: Duration::from_secs(self.config.ingest_timeout_secs),
            max_images: self.config.max_images_per_source,
        };

        let partials = sources
            .par_iter()
            .map(|source| ingest(source, &options))
            .collect::<Result<Vec<SourceCorpus>>>()?;

        let (corpus, reports) = UnifiedCorpus::merge(partials);
        tracing::info!(sources = reports.len(), records = corpus.len(), "Unified corpus built");
        Ok((corpus, reports))
    }

    /// Runs every stage up to and including the split.
    pub fn curate(&mut self) -> Result<CurationOutput> {
        let _span = common::span!("curate", seed = self.config.seed);
        let (corpus, mut sources) = self.ingest()?;

        let (corpus, dedup) = {
            let _timer = StageTimer::start("deduplicate");
            deduplicate(corpus, self.config.duplicate_similarity)
        };
        for report in &mut sources {
            report.duplicates_removed = dedup
                .removed_per_source
                .get(&report.id)
                .copied()
                .unwrap_or(0);
        }

        let (corpus, balance_report) = {
            let _timer = StageTimer::start("balance");
            let targets = BalanceTargets {
                shares: self.config.class_targets.clone(),
                tolerance: self.config.balance_tolerance,
                min_background_fraction: self.config.min_background_fraction,
            };
            balance(corpus, &targets, self.config.seed)
        };

        {
            let _timer = StageTimer::start("validate");
            validate(&corpus)?;
        }
        self.stage.advance(CurationStage::Validated)?;

        let outcome = {
            let _timer = StageTimer::start("split");
            let options = SplitOptions {
                ratios: self.config.split,
                leakage_similarity: self.config.leakage_similarity,
                seed: self.config.seed,
            };
            split(&corpus, &options)?
        };
        self.stage.advance(CurationStage::Split)?;

        Ok(CurationOutput {
            corpus,
            sources,
            dedup,
            balance: balance_report,
            split: outcome,
            seed: self.config.seed,
            ratios: self.config.split,
        })
    }

    pub fn persist(&mut self, output: &CurationOutput) -> Result<PersistedLayout> {
        if self.stage.current() != CurationStage::Split {
            return Err(CuratorError::Stage {
                from: self.stage.current(),
                to: CurationStage::Persisted,
            });
        }
        let _timer = StageTimer::start("persist");

        let manifest = Manifest::from_output(output);
        let options = PersistOptions {
            output_dir: self.config.output_dir.clone(),
            copy_images: self.config.copy_images,
        };
        let layout = persist(output, &manifest, &options)?;
        self.stage.advance(CurationStage::Persisted)?;
        Ok(layout)
    }

    /// Full run: curate, then persist.
    pub fn run(&mut self) -> Result<(CurationOutput, PersistedLayout)> {
        let output = self.curate()?;
        let layout = self.persist(&output)?;
        Ok((output, layout))
    }
}
