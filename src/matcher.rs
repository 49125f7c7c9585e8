//! Descriptor matching: k=2 nearest neighbours with Lowe's ratio test, and
//! batched ranking of a query against a reference set.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::MatchConfig;
use crate::fingerprint::{hamming_distance, Descriptor, ImageFingerprint};
use crate::metadata::CardMetadata;
use crate::reference::ReferenceEntry;

/// One ranked candidate identity for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub reference_path: String,
    /// Number of descriptor matches surviving the ratio test.
    pub score: u32,
    pub metadata: Option<CardMetadata>,
}

/// Outcome of ranking one query against the reference set.
#[derive(Debug, Clone, PartialEq)]
pub enum Ranking {
    /// Best candidates first, all at or above the minimum score.
    Confident(Vec<MatchResult>),
    /// Top two scores were too close to call; no identity is reported.
    Ambiguous { best: u32, runner_up: u32 },
    /// Nothing reached the minimum score.
    NoMatch,
}

impl Ranking {
    pub fn matches(&self) -> &[MatchResult] {
        match self {
            Ranking::Confident(matches) => matches,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorMatcher {
    config: MatchConfig,
}

impl DescriptorMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Count of query descriptors whose nearest reference descriptor passes
    /// both the absolute distance ceiling and the ratio test.
    pub fn score(&self, query: &ImageFingerprint, reference: &ImageFingerprint) -> u32 {
        let train = reference.descriptors();
        if query.len() < 2 || train.len() < 2 {
            return 0;
        }
        query
            .descriptors()
            .iter()
            .filter(|q| {
                let (best, second) = two_nearest(q, train);
                best < self.config.max_distance && (best as f32) < self.config.ratio * second as f32
            })
            .count() as u32
    }

    /// Score every reference in fixed-size batches, keep the best few of each
    /// batch, then re-rank the survivors. The result is sorted by score
    /// (descending) then path, without the minimum-score or top-K cut.
    pub fn candidates<'a, I>(&self, query: &ImageFingerprint, references: I) -> Vec<MatchResult>
    where
        I: IntoIterator<Item = &'a ReferenceEntry>,
    {
        let references: Vec<&ReferenceEntry> = references.into_iter().collect();
        let mut survivors: Vec<(u32, &ReferenceEntry)> = Vec::new();

        for batch in references.chunks(self.config.batch_size.max(1)) {
            let mut scored: Vec<(u32, &ReferenceEntry)> = batch
                .iter()
                .map(|entry| (self.score(query, &entry.fingerprint), *entry))
                .filter(|(score, _)| *score > 0)
                .collect();
            scored.sort_by(by_score_then_path);
            scored.truncate(self.config.batch_keep);
            survivors.extend(scored);
        }

        survivors.sort_by(by_score_then_path);
        survivors
            .into_iter()
            .map(|(score, entry)| MatchResult {
                reference_path: entry.relative_path.clone(),
                score,
                metadata: entry.metadata.clone(),
            })
            .collect()
    }

    pub fn rank<'a, I>(&self, query: &ImageFingerprint, references: I) -> Ranking
    where
        I: IntoIterator<Item = &'a ReferenceEntry>,
    {
        let mut candidates = self.candidates(query, references);
        if let [first, second, ..] = candidates.as_slice() {
            if self.is_ambiguous(first.score, second.score) {
                tracing::debug!(
                    best = %first.reference_path,
                    best_score = first.score,
                    runner_up = %second.reference_path,
                    runner_up_score = second.score,
                    "rejecting ambiguous match"
                );
                return Ranking::Ambiguous {
                    best: first.score,
                    runner_up: second.score,
                };
            }
        }
        candidates.retain(|m| m.score >= self.config.min_score);
        candidates.truncate(self.config.top_k);
        if candidates.is_empty() {
            Ranking::NoMatch
        } else {
            Ranking::Confident(candidates)
        }
    }

    /// True when the best score does not clear the runner-up by the
    /// configured multiple.
    pub fn is_ambiguous(&self, best: u32, runner_up: u32) -> bool {
        runner_up > 0 && (best as f32) < self.config.ambiguity_ratio * runner_up as f32
    }
}

fn by_score_then_path(a: &(u32, &ReferenceEntry), b: &(u32, &ReferenceEntry)) -> Ordering {
    b.0.cmp(&a.0).then_with(|| a.1.relative_path.cmp(&b.1.relative_path))
}

/// Distances to the nearest and second-nearest descriptors in `train`.
fn two_nearest(query: &Descriptor, train: &[Descriptor]) -> (u32, u32) {
    let mut best = u32::MAX;
    let mut second = u32::MAX;
    for candidate in train {
        let d = hamming_distance(query, candidate);
        if d < best {
            second = best;
            best = d;
        } else if d < second {
            second = d;
        }
    }
    (best, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Keypoint;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_descriptors(n: usize, seed: u64) -> Vec<Descriptor> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen()).collect()
    }

    fn fingerprint(descriptors: Vec<Descriptor>) -> ImageFingerprint {
        let keypoints = (0..descriptors.len())
            .map(|i| Keypoint {
                x: i as f32,
                y: 0.0,
                scale: 1.0,
                orientation: 0.0,
                strength: 1.0,
            })
            .collect();
        ImageFingerprint::new(100, 100, keypoints, descriptors).unwrap()
    }

    fn entry(path: &str, descriptors: Vec<Descriptor>) -> ReferenceEntry {
        ReferenceEntry {
            relative_path: path.to_string(),
            folder: ".".to_string(),
            fingerprint: fingerprint(descriptors),
            metadata: None,
        }
    }

    #[test]
    fn duplicate_scores_highest_and_is_not_ambiguous() {
        let query = random_descriptors(120, 1);
        let mut refs = vec![entry("dup.png", query.clone())];
        for i in 0..30 {
            refs.push(entry(&format!("noise_{i:02}.png"), random_descriptors(120, 100 + i)));
        }
        let matcher = DescriptorMatcher::default();
        let q = fingerprint(query);

        let candidates = matcher.candidates(&q, &refs);
        assert_eq!(candidates[0].reference_path, "dup.png");
        assert_eq!(candidates[0].score, 120);
        assert!(candidates.iter().skip(1).all(|m| m.score < 120));

        match matcher.rank(&q, &refs) {
            Ranking::Confident(matches) => assert_eq!(matches[0].reference_path, "dup.png"),
            other => panic!("expected a confident match, got {other:?}"),
        }
    }

    #[test]
    fn ratio_test_rejects_indistinct_neighbours() {
        // every query descriptor appears twice in the reference: best == second
        let query = random_descriptors(40, 2);
        let mut doubled = query.clone();
        doubled.extend(query.iter().copied());
        let matcher = DescriptorMatcher::default();
        assert_eq!(matcher.score(&fingerprint(query), &fingerprint(doubled)), 0);
    }

    #[test]
    fn distance_ceiling_rejects_far_matches() {
        let query = random_descriptors(30, 3);
        // flip the first 9 bytes (72 bits) of every descriptor
        let far: Vec<Descriptor> = query
            .iter()
            .map(|d| {
                let mut f = *d;
                for b in f.iter_mut().take(9) {
                    *b = !*b;
                }
                f
            })
            .collect();
        let matcher = DescriptorMatcher::default();
        assert_eq!(matcher.score(&fingerprint(query), &fingerprint(far)), 0);
    }

    #[test]
    fn close_scores_are_ambiguous() {
        let matcher = DescriptorMatcher::default();
        assert!(matcher.is_ambiguous(50, 45));
        assert!(!matcher.is_ambiguous(60, 45));
        assert!(!matcher.is_ambiguous(12, 0));

        let query = random_descriptors(60, 4);
        let refs = vec![entry("a.png", query.clone()), entry("b.png", query[..55].to_vec())];
        assert_eq!(
            matcher.rank(&fingerprint(query), &refs),
            Ranking::Ambiguous { best: 60, runner_up: 55 }
        );
    }

    #[test]
    fn low_scores_are_no_match() {
        let query = random_descriptors(50, 5);
        let refs = vec![entry("partial.png", query[..6].to_vec())];
        assert_eq!(DescriptorMatcher::default().rank(&fingerprint(query), &refs), Ranking::NoMatch);
    }

    #[test]
    fn batches_keep_only_their_best() {
        let query = random_descriptors(80, 6);
        let refs = vec![
            entry("a.png", query[..80].to_vec()),
            entry("b.png", query[..40].to_vec()),
            entry("c.png", query[..70].to_vec()),
            entry("d.png", query[..20].to_vec()),
        ];
        let matcher = DescriptorMatcher::new(MatchConfig {
            batch_size: 2,
            batch_keep: 1,
            ..MatchConfig::default()
        });
        let paths: Vec<String> = matcher
            .candidates(&fingerprint(query), &refs)
            .into_iter()
            .map(|m| m.reference_path)
            .collect();
        assert_eq!(paths, vec!["a.png", "c.png"]);
    }

    #[test]
    fn zero_batch_size_scores_one_at_a_time() {
        let query = random_descriptors(80, 6);
        let refs = vec![
            entry("a.png", query[..80].to_vec()),
            entry("b.png", query[..40].to_vec()),
            entry("c.png", query[..70].to_vec()),
        ];
        let matcher = DescriptorMatcher::new(MatchConfig {
            batch_size: 0,
            batch_keep: 1,
            ..MatchConfig::default()
        });
        let paths: Vec<String> = matcher
            .candidates(&fingerprint(query), &refs)
            .into_iter()
            .map(|m| m.reference_path)
            .collect();
        assert_eq!(paths, vec!["a.png", "c.png", "b.png"]);
    }

    #[test]
    fn top_k_truncates_and_ties_order_by_path() {
        let query = random_descriptors(40, 7);
        let refs: Vec<ReferenceEntry> = ["c.png", "a.png", "b.png"]
            .iter()
            .map(|p| entry(p, query.clone()))
            .collect();
        let matcher = DescriptorMatcher::new(MatchConfig {
            top_k: 2,
            ambiguity_ratio: 1.0,
            ..MatchConfig::default()
        });
        let ranking = matcher.rank(&fingerprint(query), &refs);
        let paths: Vec<&str> = ranking.matches().iter().map(|m| m.reference_path.as_str()).collect();
        assert_eq!(paths, vec!["a.png", "b.png"]);
    }
}
