//! Entity Detector
//!
//! Scores every catalog entity against the raw question and returns a
//! small ranked candidate list.
//!
//! Keywords are built from the whole entity name only: the lower-cased
//! name ("sales order"), its concatenated form ("salesorder") and the
//! simple plural of both. Multi-word names are never split into single
//! words, otherwise every entity containing "order" would match any
//! question mentioning an order.

use crate::catalog::{EntityCatalog, EntitySchema};
use crate::config::DetectorConfig;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

/// An entity judged relevant to a question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedEntity {
    pub entity_name: String,
    pub confidence: f64,
    pub exact_match: bool,
    /// Keyword variant that produced the score
    pub matched_keyword: String,
}

#[derive(Debug, Clone)]
struct Candidate {
    entity: DetectedEntity,
    /// Byte offset of the first occurrence of the winning keyword
    position: usize,
}

pub struct EntityDetector {
    config: DetectorConfig,
}

impl Default for EntityDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl EntityDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Ranked candidates for `query`, at most `max_entities` long.
    ///
    /// Ordering is confidence descending, then earliest mention in the
    /// question, then longer (more specific) name, then name order, so
    /// identical inputs always give identical output.
    pub fn detect(&self, query: &str, catalog: &EntityCatalog) -> Vec<DetectedEntity> {
        let text = query.to_lowercase();
        let mut candidates: Vec<Candidate> = catalog
            .entities()
            .filter_map(|entity| self.score_entity(&text, entity))
            .collect();

        candidates.sort_by(compare_candidates);

        let confident: Vec<Candidate> = candidates
            .iter()
            .filter(|c| c.entity.confidence >= self.config.min_confidence)
            .cloned()
            .collect();

        // Nothing clears the bar: hand back the best raw scores instead
        let mut selected = if confident.is_empty() {
            candidates
        } else {
            confident
        };
        selected.truncate(self.config.max_entities);

        let detected: Vec<DetectedEntity> = selected.into_iter().map(|c| c.entity).collect();
        debug!(
            "Detected entities for '{}': {:?}",
            query,
            detected
                .iter()
                .map(|d| (d.entity_name.as_str(), d.confidence))
                .collect::<Vec<_>>()
        );
        detected
    }

    fn score_entity(&self, text: &str, entity: &EntitySchema) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;

        for keyword in keyword_variants(entity) {
            let Some((position, whole_word)) = find_keyword(text, &keyword) else {
                continue;
            };
            let confidence = if whole_word {
                self.config.exact_confidence
            } else {
                self.config.substring_confidence
            };

            let better = match &best {
                None => true,
                Some(current) => {
                    confidence > current.entity.confidence
                        || (confidence == current.entity.confidence && position < current.position)
                }
            };
            if better {
                best = Some(Candidate {
                    entity: DetectedEntity {
                        entity_name: entity.name.clone(),
                        confidence,
                        exact_match: whole_word,
                        matched_keyword: keyword,
                    },
                    position,
                });
            }
        }

        best
    }
}

/// Lower-cased keyword set for one entity, in a stable order
pub fn keyword_variants(entity: &EntitySchema) -> Vec<String> {
    let mut keywords = Vec::new();
    let phrases = std::iter::once(entity.name.as_str()).chain(entity.aliases.iter().map(|a| a.as_str()));

    for phrase in phrases {
        let spaced = phrase.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        if spaced.is_empty() {
            continue;
        }
        let compact = spaced.replace(' ', "");
        for base in [spaced, compact] {
            let plural = if base.ends_with('s') {
                None
            } else {
                Some(format!("{}s", base))
            };
            push_unique(&mut keywords, base);
            if let Some(plural) = plural {
                push_unique(&mut keywords, plural);
            }
        }
    }

    keywords
}

fn push_unique(keywords: &mut Vec<String>, keyword: String) {
    if !keywords.contains(&keyword) {
        keywords.push(keyword);
    }
}

/// First occurrence of `keyword` in `text`, preferring a whole-word one.
/// Returns the byte offset and whether the occurrence is word-bounded.
fn find_keyword(text: &str, keyword: &str) -> Option<(usize, bool)> {
    let mut first: Option<usize> = None;
    for (idx, _) in text.match_indices(keyword) {
        if is_word_bounded(text, idx, idx + keyword.len()) {
            return Some((idx, true));
        }
        first.get_or_insert(idx);
    }
    first.map(|idx| (idx, false))
}

fn is_word_bounded(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.map_or(false, is_word_char) && !after.map_or(false, is_word_char)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.entity
        .confidence
        .total_cmp(&a.entity.confidence)
        .then_with(|| a.position.cmp(&b.position))
        .then_with(|| b.entity.entity_name.len().cmp(&a.entity.entity_name.len()))
        .then_with(|| a.entity.entity_name.cmp(&b.entity.entity_name))
}
