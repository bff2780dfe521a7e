//! Bidirectional validation of forward matches
//!
//! A forward match `A → X` is trusted more when an independent reverse lookup
//! of `X` leads back to `A`. Validation is best-effort: a missing or failing
//! reverse resolver leaves the forward matches untouched.

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::record::IdMatch;
use crate::resolver::IdentifierResolver;

/// Strips known namespace prefixes before identifiers are compared
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdNormalizer {
    prefixes: Vec<String>,
}

impl IdNormalizer {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    /// Trim and strip the first matching prefix (ASCII case-insensitive)
    pub fn normalize(&self, id: &str) -> String {
        let id = id.trim();
        for prefix in &self.prefixes {
            if id.len() >= prefix.len()
                && id.is_char_boundary(prefix.len())
                && id[..prefix.len()].eq_ignore_ascii_case(prefix)
            {
                return id[prefix.len()..].trim().to_string();
            }
        }
        id.to_string()
    }
}

/// Reconciliation outcome of one forward match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// Reverse lookup leads back to the source
    Validated,
    /// Source is among the reverse results, but not the primary one
    ValidatedAmbiguous,
    /// No reverse data for any of the source's targets
    SuccessfulNoReversePath,
    /// Reverse data exists but does not include the source
    Successful,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Validated => "validated",
            ValidationStatus::ValidatedAmbiguous => "validated_ambiguous",
            ValidationStatus::SuccessfulNoReversePath => "successful_no_reverse_path",
            ValidationStatus::Successful => "successful",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ValidationStatus::Validated => "Validated",
            ValidationStatus::ValidatedAmbiguous => "Validated (Ambiguous)",
            ValidationStatus::SuccessfulNoReversePath => "Successful (No Reverse Path)",
            ValidationStatus::Successful => "Successful",
        }
    }

    pub fn is_validated(&self) -> bool {
        matches!(
            self,
            ValidationStatus::Validated | ValidationStatus::ValidatedAmbiguous
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedMatch {
    pub record: IdMatch,
    /// `None` when no reverse pass ran
    pub status: Option<ValidationStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub matches: Vec<ValidatedMatch>,
    /// The reverse resolver was available and answered
    pub reverse_path_found: bool,
}

impl ValidationReport {
    fn unvalidated(matches: Vec<IdMatch>) -> Self {
        Self {
            matches: matches
                .into_iter()
                .map(|record| ValidatedMatch {
                    record,
                    status: None,
                })
                .collect(),
            reverse_path_found: false,
        }
    }

    pub fn count(&self, status: ValidationStatus) -> usize {
        self.matches
            .iter()
            .filter(|m| m.status == Some(status))
            .count()
    }
}

/// Reverse-lookup data for one target
struct ReverseEntry {
    /// Raw and normalized forms of every reverse result
    members: AHashSet<String>,
    primary: String,
}

#[derive(Debug, Clone, Default)]
pub struct BidirectionalValidator {
    normalizer: IdNormalizer,
}

impl BidirectionalValidator {
    pub fn new(normalizer: IdNormalizer) -> Self {
        Self { normalizer }
    }

    /// Classify every forward match against one reverse resolution of all targets
    pub async fn validate(
        &self,
        forward: Vec<IdMatch>,
        reverse: Option<&dyn IdentifierResolver>,
    ) -> ValidationReport {
        let Some(reverse) = reverse else {
            debug!("No reverse resolver, returning {} matches unvalidated", forward.len());
            return ValidationReport::unvalidated(forward);
        };

        let mut seen = AHashSet::new();
        let targets: Vec<String> = forward
            .iter()
            .filter(|m| seen.insert(m.target.as_str()))
            .map(|m| m.target.clone())
            .collect();
        if targets.is_empty() {
            return ValidationReport::unvalidated(forward);
        }

        let reverse_results = match reverse.resolve(&targets).await {
            Ok(results) => results,
            Err(e) => {
                warn!(
                    "Reverse resolver '{}' failed, skipping validation: {}",
                    reverse.name(),
                    e
                );
                return ValidationReport::unvalidated(forward);
            }
        };

        let mut reverse_map: AHashMap<&str, ReverseEntry> = AHashMap::new();
        for target in &targets {
            let Some(values) = reverse_results.get(target) else {
                continue;
            };
            let Some(primary) = values.first() else {
                continue;
            };
            let mut members = AHashSet::with_capacity(values.len() * 2);
            for value in values {
                members.insert(value.trim().to_string());
                members.insert(self.normalizer.normalize(value));
            }
            reverse_map.insert(
                target.as_str(),
                ReverseEntry {
                    members,
                    primary: primary.clone(),
                },
            );
        }

        // Forward targets per source, in first-seen order
        let mut targets_by_source: AHashMap<&str, Vec<&str>> = AHashMap::new();
        for m in &forward {
            let entry = targets_by_source.entry(m.source.as_str()).or_default();
            if !entry.contains(&m.target.as_str()) {
                entry.push(m.target.as_str());
            }
        }

        let statuses: Vec<ValidationStatus> = forward
            .iter()
            .map(|m| {
                let source_targets = targets_by_source
                    .get(m.source.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                self.classify(&m.source, source_targets, &reverse_map)
            })
            .collect();

        ValidationReport {
            matches: forward
                .into_iter()
                .zip(statuses)
                .map(|(record, status)| ValidatedMatch {
                    record,
                    status: Some(status),
                })
                .collect(),
            reverse_path_found: true,
        }
    }

    fn classify(
        &self,
        source: &str,
        targets: &[&str],
        reverse_map: &AHashMap<&str, ReverseEntry>,
    ) -> ValidationStatus {
        let raw = source.trim();
        let normalized = self.normalizer.normalize(source);

        let mut any_reverse_data = false;
        for target in targets {
            let Some(entry) = reverse_map.get(target) else {
                continue;
            };
            any_reverse_data = true;
            if entry.members.contains(raw) || entry.members.contains(&normalized) {
                // First matching reverse path wins
                return if self.normalizer.normalize(&entry.primary) == normalized {
                    ValidationStatus::Validated
                } else {
                    ValidationStatus::ValidatedAmbiguous
                };
            }
        }

        if any_reverse_data {
            ValidationStatus::Successful
        } else {
            ValidationStatus::SuccessfulNoReversePath
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{OrchestratorError, Result};
    use crate::matching::MatchType;
    use crate::resolver::MappingTableResolver;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    fn fwd(source: &str, target: &str) -> IdMatch {
        IdMatch::new(source.into(), target.into(), target, MatchType::Exact)
    }

    struct Broken;

    #[async_trait]
    impl IdentifierResolver for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn resolve(&self, _ids: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
            Err(OrchestratorError::Resolver {
                resolver: "broken".into(),
                message: "connection refused".into(),
            })
        }
    }

    #[test]
    fn test_normalizer() {
        let n = IdNormalizer::new(["UniProtKB:", "HMDB:"]);
        assert_eq!(n.normalize(" uniprotkb:P12345 "), "P12345");
        assert_eq!(n.normalize("HMDB:0001"), "0001");
        assert_eq!(n.normalize("CHEBI:15377"), "CHEBI:15377");
    }

    #[tokio::test]
    async fn test_validated() {
        let reverse = MappingTableResolver::from_pairs("rev", [("X", "A")]);
        let report = BidirectionalValidator::default()
            .validate(vec![fwd("A", "X")], Some(&reverse))
            .await;
        assert!(report.reverse_path_found);
        assert_eq!(report.matches[0].status, Some(ValidationStatus::Validated));
    }

    #[tokio::test]
    async fn test_validated_after_normalization() {
        let reverse = MappingTableResolver::from_pairs("rev", [("X", "UniProtKB:A")]);
        let validator = BidirectionalValidator::new(IdNormalizer::new(["UniProtKB:"]));
        let report = validator.validate(vec![fwd("A", "X")], Some(&reverse)).await;
        assert_eq!(report.matches[0].status, Some(ValidationStatus::Validated));
    }

    #[tokio::test]
    async fn test_ambiguous_when_primary_differs() {
        let reverse = MappingTableResolver::from_pairs("rev", [("X", "B"), ("X", "A")]);
        let report = BidirectionalValidator::default()
            .validate(vec![fwd("A", "X")], Some(&reverse))
            .await;
        assert_eq!(
            report.matches[0].status,
            Some(ValidationStatus::ValidatedAmbiguous)
        );
    }

    #[tokio::test]
    async fn test_unidirectional_and_no_reverse_path() {
        let reverse = MappingTableResolver::from_pairs("rev", [("X", "B")]);
        let report = BidirectionalValidator::default()
            .validate(vec![fwd("A", "X"), fwd("C", "Y")], Some(&reverse))
            .await;
        assert_eq!(report.matches[0].status, Some(ValidationStatus::Successful));
        assert_eq!(
            report.matches[1].status,
            Some(ValidationStatus::SuccessfulNoReversePath)
        );
    }

    #[tokio::test]
    async fn test_any_forward_target_validates_source() {
        // A → X has no reverse data, A → Y leads back to A
        let reverse = MappingTableResolver::from_pairs("rev", [("Y", "A")]);
        let report = BidirectionalValidator::default()
            .validate(vec![fwd("A", "X"), fwd("A", "Y")], Some(&reverse))
            .await;
        assert_eq!(report.count(ValidationStatus::Validated), 2);
    }

    #[tokio::test]
    async fn test_degrades_without_reverse_path() {
        let forward = vec![fwd("A", "X")];
        let report = BidirectionalValidator::default()
            .validate(forward.clone(), None)
            .await;
        assert!(!report.reverse_path_found);
        assert_eq!(report.matches[0].record, forward[0]);
        assert!(report.matches[0].status.is_none());

        let report = BidirectionalValidator::default()
            .validate(forward, Some(&Broken))
            .await;
        assert!(!report.reverse_path_found);
        assert!(report.matches[0].status.is_none());
    }
}
