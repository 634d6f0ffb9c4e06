//! Final consistency pass over the unified corpus.

use std::collections::HashSet;
use thiserror::Error;

use crate::corpus::UnifiedCorpus;
use crate::errors::{CuratorError, Result};
use crate::types::{BoundingBox, UnifiedClass};

/// A single broken corpus invariant.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Violation {
    #[error("record {0}: no annotations but not flagged background")]
    UnflaggedEmpty(String),

    #[error("record {0}: flagged background but carries annotations")]
    AnnotatedBackground(String),

    #[error("record {record}: annotation class {class} is not an object class")]
    NonObjectClass { record: String, class: UnifiedClass },

    #[error("record {record}: annotation belongs to {owner}")]
    OrphanAnnotation { record: String, owner: String },

    #[error("record {record}: bbox out of the unit square {bbox:?}")]
    InvalidBbox { record: String, bbox: BoundingBox },

    #[error("duplicate record id {0}")]
    DuplicateId(String),
}

/// Collects every violation in corpus order.
pub fn violations(corpus: &UnifiedCorpus) -> Vec<Violation> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();

    for record in corpus.records() {
        if !seen.insert(record.id.as_str()) {
            found.push(Violation::DuplicateId(record.id.clone()));
        }

        match (record.annotations.is_empty(), record.background) {
            (true, false) => found.push(Violation::UnflaggedEmpty(record.id.clone())),
            (false, true) => found.push(Violation::AnnotatedBackground(record.id.clone())),
            _ => {}
        }

        for annotation in &record.annotations {
            if !annotation.class.is_object() {
                found.push(Violation::NonObjectClass {
                    record: record.id.clone(),
                    class: annotation.class,
                });
            }
            if annotation.record_id != record.id {
                found.push(Violation::OrphanAnnotation {
                    record: record.id.clone(),
                    owner: annotation.record_id.clone(),
                });
            }
            if !annotation.bbox.is_valid() {
                found.push(Violation::InvalidBbox {
                    record: record.id.clone(),
                    bbox: annotation.bbox,
                });
            }
        }
    }
    found
}

/// Fails with every violation at once rather than the first.
pub fn validate(corpus: &UnifiedCorpus) -> Result<()> {
    let found = violations(corpus);
    if found.is_empty() {
        tracing::info!(records = corpus.len(), "Corpus validated");
        return Ok(());
    }
    for violation in found.iter().take(10) {
        tracing::error!(%violation, "Corpus invariant violated");
    }
    Err(CuratorError::Validation(
        found.iter().map(ToString::to_string).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::fixtures::record;
    use crate::types::UnifiedClass::{Background, Fire, Smoke};

    #[test]
    fn test_clean_corpus_passes() {
        let corpus = UnifiedCorpus::new(vec![
            record("a", 0, 1, &[Smoke, Fire]),
            record("b", 0, 2, &[]),
        ]);
        assert!(validate(&corpus).is_ok());
    }

    #[test]
    fn test_aggregates_every_violation() {
        let mut unflagged = record("a", 0, 1, &[]);
        unflagged.background = false;

        let mut annotated_bg = record("b", 0, 2, &[Smoke]);
        annotated_bg.background = true;

        let mut orphan = record("c", 0, 3, &[Fire]);
        orphan.annotations[0].record_id = "elsewhere".to_string();

        let mut bad_class = record("d", 0, 4, &[Smoke]);
        bad_class.annotations[0].class = Background;

        let mut bad_box = record("e", 0, 5, &[Smoke]);
        bad_box.annotations[0].bbox.width = 3.0;

        let duplicate = record("e", 0, 6, &[Smoke]);

        let corpus = UnifiedCorpus::new(vec![unflagged, annotated_bg, orphan, bad_class, bad_box, duplicate]);
        let found = violations(&corpus);
        assert_eq!(found.len(), 6, "{found:?}");
        assert!(found.contains(&Violation::DuplicateId("e".to_string())));

        match validate(&corpus) {
            Err(CuratorError::Validation(messages)) => {
                assert_eq!(messages.len(), 6);
                assert!(messages[0].contains("not flagged background"));
                assert!(messages.iter().any(|m| m.contains("belongs to elsewhere")));
            }
            other => panic!("Expected Validation error, got {other:?}"),
        }
    }
}
