//! Composite identifier matching
//!
//! A composite identifier packs several atomic keys joined by a separator,
//! e.g. `"Q2_Q3"`. Matching never compares the two datasets pairwise: both the
//! full identifiers and the individual parts of the targets are indexed once.

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use super::efficient::MatchIndex;
use super::record::{IdMatch, MatchType};

/// Outcome of `CompositeKeyResolver::resolve`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeMatchReport {
    pub matches: Vec<IdMatch>,
    /// Sources with no match at all
    pub unmatched_sources: Vec<String>,
    /// Parts of composite sources that matched nothing (first-seen order, deduplicated)
    pub unmatched_parts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeKeyResolver {
    separator: String,
}

impl Default for CompositeKeyResolver {
    fn default() -> Self {
        Self::new("_")
    }
}

impl CompositeKeyResolver {
    /// An empty separator disables splitting
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Atomic parts of an identifier: trimmed, non-empty, deduplicated, in order
    pub fn split(&self, id: &str) -> Vec<String> {
        let id = id.trim();
        if id.is_empty() {
            return Vec::new();
        }
        if self.separator.is_empty() {
            return vec![id.to_string()];
        }
        let mut seen = AHashSet::new();
        id.split(self.separator.as_str())
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .filter(|part| seen.insert(*part))
            .map(str::to_string)
            .collect()
    }

    pub fn is_composite(&self, id: &str) -> bool {
        self.split(id).len() > 1
    }

    /// Match `sources` against `targets`
    ///
    /// - equal identifiers: one `Direct` match
    /// - otherwise one `Composite` match per part shared by the two identifiers
    pub fn resolve(&self, sources: &[String], targets: &[String]) -> CompositeMatchReport {
        let full_index = MatchIndex::build(targets, |t| Some(t.trim().to_string()));

        let mut part_index: AHashMap<String, Vec<usize>> = AHashMap::with_capacity(targets.len());
        for (pos, target) in targets.iter().enumerate() {
            for part in self.split(target) {
                part_index.entry(part).or_default().push(pos);
            }
        }

        let mut report = CompositeMatchReport::default();
        let mut reported_parts: AHashSet<String> = AHashSet::new();

        for source in sources {
            let trimmed = source.trim();
            if trimmed.is_empty() {
                continue;
            }

            let direct = full_index.positions(trimmed);
            for &pos in direct {
                report.matches.push(IdMatch::new(
                    source.clone(),
                    targets[pos].clone(),
                    trimmed,
                    MatchType::Direct,
                ));
            }

            let parts = self.split(trimmed);
            let mut any_part_matched = false;
            for part in &parts {
                let mut part_matched = !direct.is_empty();
                for &pos in part_index.get(part).map(Vec::as_slice).unwrap_or(&[]) {
                    if direct.contains(&pos) {
                        continue;
                    }
                    part_matched = true;
                    report.matches.push(IdMatch::new(
                        source.clone(),
                        targets[pos].clone(),
                        part.as_str(),
                        MatchType::Composite,
                    ));
                }
                if part_matched {
                    any_part_matched = true;
                } else if parts.len() > 1 && reported_parts.insert(part.clone()) {
                    report.unmatched_parts.push(part.clone());
                }
            }

            if direct.is_empty() && !any_part_matched {
                report.unmatched_sources.push(source.clone());
            }
        }
        report
    }
}
