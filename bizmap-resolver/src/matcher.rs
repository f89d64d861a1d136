//! Candidate scoring and best-match selection
//!
//! Score = name similarity (0-100, normalized Levenshtein over normalized
//! names) + city bonus + phone bonus. The similarity floor is applied before
//! bonuses, so a weak name can never be carried over the line by a matching
//! city or phone.

use crate::normalizer::{comparison_name, normalize_phone};
use crate::types::{CandidateMatch, MatchReason, RawCandidate, SourceRecord};
use bizmap_common::config::ScoringConfig;

/// Per-candidate breakdown, kept for logging and tests
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub index: usize,
    pub name_similarity: f64,
    pub city_match: bool,
    pub phone_match: bool,
    pub total: f64,
}

/// Stateless scorer parametrised by [`ScoringConfig`]
#[derive(Debug, Clone)]
pub struct Matcher {
    scoring: ScoringConfig,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

impl Matcher {
    pub fn new(scoring: ScoringConfig) -> Self {
        Self { scoring }
    }

    pub fn scoring(&self) -> &ScoringConfig {
        &self.scoring
    }

    /// Name similarity in [0, 100], rounded to a whole point
    pub fn name_similarity(&self, a: &str, b: &str) -> f64 {
        let a = comparison_name(a);
        let b = comparison_name(b);
        (strsim::normalized_levenshtein(&a, &b) * 100.0).round()
    }

    /// Score one candidate; `None` when it falls under the similarity floor
    pub fn score(
        &self,
        target: &SourceRecord,
        candidate: &RawCandidate,
        index: usize,
    ) -> Option<ScoredCandidate> {
        let name_similarity = self.name_similarity(&target.name, candidate.name());
        if name_similarity < self.scoring.name_floor {
            return None;
        }

        let city_match = candidate
            .city()
            .map(|c| c.trim().eq_ignore_ascii_case(target.city.trim()))
            .unwrap_or(false);

        let phone_match = match (target.phone.as_deref(), candidate.phone()) {
            (Some(ours), Some(theirs)) => {
                let ours = normalize_phone(ours);
                !ours.is_empty() && ours == normalize_phone(theirs)
            }
            _ => false,
        };

        let mut total = name_similarity;
        if city_match {
            total += self.scoring.city_bonus;
        }
        if phone_match {
            total += self.scoring.phone_bonus;
        }

        Some(ScoredCandidate {
            index,
            name_similarity,
            city_match,
            phone_match,
            total,
        })
    }

    /// Pick the best candidate.
    ///
    /// Only the first `max_candidates` are considered. On equal totals the
    /// earlier candidate wins.
    pub fn best_match(
        &self,
        target: &SourceRecord,
        candidates: &[RawCandidate],
    ) -> Option<CandidateMatch> {
        let mut best: Option<ScoredCandidate> = None;

        for (index, candidate) in candidates
            .iter()
            .take(self.scoring.max_candidates)
            .enumerate()
        {
            let Some(scored) = self.score(target, candidate, index) else {
                continue;
            };

            tracing::trace!(
                record_id = %target.id,
                candidate = %candidate.name(),
                similarity = scored.name_similarity,
                total = scored.total,
                "Scored candidate"
            );

            if best.as_ref().map_or(true, |b| scored.total > b.total) {
                best = Some(scored);
            }
        }

        let best = best?;
        let candidate = &candidates[best.index];

        Some(CandidateMatch {
            id: candidate.external_id().to_string(),
            name: candidate.name().to_string(),
            url: candidate.url().to_string(),
            score: best.total,
            match_reasons: self.reasons(&best),
        })
    }

    fn reasons(&self, scored: &ScoredCandidate) -> Vec<MatchReason> {
        let mut reasons = Vec::new();
        if scored.city_match {
            reasons.push(MatchReason::CityMatch);
        }
        if scored.phone_match {
            reasons.push(MatchReason::PhoneMatch);
        }
        if scored.name_similarity >= self.scoring.exact_name_threshold {
            reasons.push(MatchReason::ExactName);
        } else if scored.name_similarity >= self.scoring.high_similarity_threshold {
            reasons.push(MatchReason::HighNameSimilarity);
        }
        reasons
    }
}
