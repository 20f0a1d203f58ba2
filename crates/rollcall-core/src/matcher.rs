//! Probe-to-gallery matching and the multi-shot voting decision.
//!
//! Each probe is matched independently against every gallery entry,
//! regardless of pose. A probe votes for the identity of its best entry
//! when that entry clears the threshold; an identity is recognized once
//! it collects `min_votes` votes.

use crate::similarity::{self, DimensionMismatch};
use crate::types::{Embedding, GalleryEntry, IdentityId, MatchResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MIN_VOTES: usize = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("probe {probe} vs gallery entry {entry}: {source}")]
    DimensionMismatch {
        probe: usize,
        entry: usize,
        #[source]
        source: DimensionMismatch,
    },
}

/// Tunable accept policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchParams {
    /// Minimum rescaled cosine similarity for a probe to vote.
    pub threshold: f32,
    /// Votes an identity needs before it is recognized.
    pub min_votes: usize,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_votes: DEFAULT_MIN_VOTES,
        }
    }
}

/// Match one probe against the gallery.
///
/// Every entry is scored. Ties go to the earliest entry in gallery order.
/// The best similarity is reported even on a non-match. NaN scores are
/// skipped; an empty gallery (or one where every score is NaN) yields
/// `(None, 0.0)`.
pub fn match_one(
    probe: &Embedding,
    gallery: &[GalleryEntry],
    threshold: f32,
) -> Result<MatchResult, MatchError> {
    score_probe(0, probe, gallery, threshold)
}

fn score_probe(
    probe_idx: usize,
    probe: &Embedding,
    gallery: &[GalleryEntry],
    threshold: f32,
) -> Result<MatchResult, MatchError> {
    let mut best: Option<(usize, f32)> = None;

    for (i, entry) in gallery.iter().enumerate() {
        let sim = similarity::similarity(&probe.values, &entry.embedding.values).map_err(
            |source| MatchError::DimensionMismatch {
                probe: probe_idx,
                entry: i,
                source,
            },
        )?;
        // A NaN score never becomes the best, so it cannot mask later entries.
        if sim.is_nan() {
            continue;
        }
        // Strict `>` keeps the first maximum.
        if best.map_or(true, |(_, s)| sim > s) {
            best = Some((i, sim));
        }
    }

    let result = match best {
        Some((idx, sim)) if sim >= threshold => MatchResult {
            identity: Some(gallery[idx].identity),
            similarity: sim,
        },
        Some((_, sim)) => MatchResult::no_match(sim),
        None => MatchResult::no_match(0.0),
    };

    tracing::trace!(
        probe = probe_idx,
        identity = ?result.identity,
        similarity = result.similarity,
        threshold,
        "probe scored"
    );

    Ok(result)
}

/// Count votes per identity across independent probes.
///
/// Identities that received no vote are absent from the map.
pub fn match_many(
    probes: &[Embedding],
    gallery: &[GalleryEntry],
    threshold: f32,
) -> Result<BTreeMap<IdentityId, usize>, MatchError> {
    let mut votes = BTreeMap::new();
    for (i, probe) in probes.iter().enumerate() {
        if let Some(id) = score_probe(i, probe, gallery, threshold)?.identity {
            *votes.entry(id).or_insert(0) += 1;
        }
    }
    Ok(votes)
}

/// Identities in `votes` with at least `min_votes` votes.
pub fn recognized_from_votes(
    votes: &BTreeMap<IdentityId, usize>,
    min_votes: usize,
) -> BTreeSet<IdentityId> {
    votes
        .iter()
        .filter(|(_, &count)| count >= min_votes)
        .map(|(&id, _)| id)
        .collect()
}

/// Identities whose vote count reaches `min_votes`.
///
/// Several identities may be returned at once (a classroom frame holds
/// many faces).
pub fn decide(
    probes: &[Embedding],
    gallery: &[GalleryEntry],
    threshold: f32,
    min_votes: usize,
) -> Result<BTreeSet<IdentityId>, MatchError> {
    let votes = match_many(probes, gallery, threshold)?;
    let recognized = recognized_from_votes(&votes, min_votes);

    tracing::debug!(
        probes = probes.len(),
        gallery = gallery.len(),
        threshold,
        min_votes,
        ?votes,
        recognized = recognized.len(),
        "match decision"
    );

    Ok(recognized)
}

/// Strategy for comparing probes against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> Result<MatchResult, MatchError>;

    fn recognize(
        &self,
        probes: &[Embedding],
        gallery: &[GalleryEntry],
    ) -> Result<BTreeSet<IdentityId>, MatchError>;
}

/// Rescaled-cosine matcher with threshold + vote policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher {
    pub params: MatchParams,
}

impl CosineMatcher {
    pub fn new(params: MatchParams) -> Self {
        Self { params }
    }

    pub fn votes(
        &self,
        probes: &[Embedding],
        gallery: &[GalleryEntry],
    ) -> Result<BTreeMap<IdentityId, usize>, MatchError> {
        match_many(probes, gallery, self.params.threshold)
    }
}

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> Result<MatchResult, MatchError> {
        match_one(probe, gallery, self.params.threshold)
    }

    fn recognize(
        &self,
        probes: &[Embedding],
        gallery: &[GalleryEntry],
    ) -> Result<BTreeSet<IdentityId>, MatchError> {
        decide(probes, gallery, self.params.threshold, self.params.min_votes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pose;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn two_person_gallery() -> Vec<GalleryEntry> {
        vec![
            GalleryEntry::new(1, Pose::Front, vec![1.0, 0.0]),
            GalleryEntry::new(2, Pose::Front, vec![0.0, 1.0]),
        ]
    }

    #[test]
    fn test_match_one_exact() {
        let result = match_one(&emb(&[1.0, 0.0]), &two_person_gallery(), 0.5).unwrap();
        assert_eq!(result.identity, Some(IdentityId(1)));
        assert_relative_eq!(result.similarity, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_match_one_picks_higher_rescaled_cosine() {
        // cos to id1 = 0.6 -> 0.8, cos to id2 = 0.8 -> 0.9
        let result = match_one(&emb(&[0.6, 0.8]), &two_person_gallery(), 0.5).unwrap();
        assert_eq!(result.identity, Some(IdentityId(2)));
        assert_relative_eq!(result.similarity, 0.9, epsilon = 1e-6);
    }

    #[test]
    fn test_match_one_below_threshold_reports_best() {
        let result = match_one(&emb(&[0.6, 0.8]), &two_person_gallery(), 0.95).unwrap();
        assert_eq!(result.identity, None);
        assert_relative_eq!(result.similarity, 0.9, epsilon = 1e-6);
    }

    #[test]
    fn test_match_one_threshold_is_inclusive() {
        // Orthogonal vectors score exactly 0.5.
        let gallery = vec![GalleryEntry::new(3, Pose::Left, vec![0.0, 1.0])];
        let result = match_one(&emb(&[1.0, 0.0]), &gallery, 0.5).unwrap();
        assert_eq!(result.identity, Some(IdentityId(3)));
    }

    #[test]
    fn test_match_one_empty_gallery() {
        let result = match_one(&emb(&[1.0, 0.0]), &[], 0.5).unwrap();
        assert_eq!(result, MatchResult::no_match(0.0));
    }

    #[test]
    fn test_match_one_tie_goes_to_first_entry() {
        let gallery = vec![
            GalleryEntry::new(5, Pose::Up, vec![0.0, 1.0]),
            GalleryEntry::new(9, Pose::Front, vec![1.0, 0.0]),
            GalleryEntry::new(4, Pose::Down, vec![1.0, 0.0]),
        ];
        let result = match_one(&emb(&[1.0, 0.0]), &gallery, 0.5).unwrap();
        assert_eq!(result.identity, Some(IdentityId(9)));
    }

    #[test]
    fn test_match_one_nan_entry_does_not_mask_later_entries() {
        let gallery = vec![
            GalleryEntry::new(1, Pose::Front, vec![f32::NAN, 0.0]),
            GalleryEntry::new(2, Pose::Front, vec![1.0, 0.0]),
        ];
        let result = match_one(&emb(&[1.0, 0.0]), &gallery, 0.5).unwrap();
        assert_eq!(result.identity, Some(IdentityId(2)));
        assert_relative_eq!(result.similarity, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_match_one_all_nan_is_no_match() {
        let gallery = vec![GalleryEntry::new(1, Pose::Front, vec![f32::NAN, 0.0])];
        let result = match_one(&emb(&[1.0, 0.0]), &gallery, 0.0).unwrap();
        assert_eq!(result, MatchResult::no_match(0.0));
    }

    #[test]
    fn test_match_one_considers_all_poses() {
        let gallery = vec![
            GalleryEntry::new(1, Pose::Front, vec![0.0, 1.0, 0.0]),
            GalleryEntry::new(2, Pose::Front, vec![0.0, 0.0, 1.0]),
            GalleryEntry::new(1, Pose::Right, vec![1.0, 0.0, 0.0]),
        ];
        let result = match_one(&emb(&[1.0, 0.0, 0.0]), &gallery, 0.9).unwrap();
        assert_eq!(result.identity, Some(IdentityId(1)));
    }

    #[test]
    fn test_match_one_dimension_mismatch_aborts() {
        let gallery = vec![
            GalleryEntry::new(1, Pose::Front, vec![0.1; 512]),
            GalleryEntry::new(2, Pose::Front, vec![0.1; 128]),
        ];
        let err = match_one(&emb(&[0.1; 512]), &gallery, 0.5).unwrap_err();
        assert_eq!(
            err,
            MatchError::DimensionMismatch {
                probe: 0,
                entry: 1,
                source: DimensionMismatch { expected: 512, actual: 128 },
            }
        );
    }

    #[test]
    fn test_match_many_counts_votes() {
        let probes = vec![emb(&[1.0, 0.0]), emb(&[0.9, 0.1]), emb(&[0.0, 1.0])];
        let votes = match_many(&probes, &two_person_gallery(), 0.9).unwrap();
        assert_eq!(votes.get(&IdentityId(1)), Some(&2));
        assert_eq!(votes.get(&IdentityId(2)), Some(&1));
    }

    #[test]
    fn test_match_many_empty_probes() {
        let votes = match_many(&[], &two_person_gallery(), 0.5).unwrap();
        assert!(votes.is_empty());
    }

    #[test]
    fn test_match_many_mismatch_in_later_probe_fails_whole_call() {
        let probes = vec![emb(&[1.0, 0.0]), emb(&[1.0, 0.0, 0.0])];
        let err = match_many(&probes, &two_person_gallery(), 0.5).unwrap_err();
        assert!(matches!(err, MatchError::DimensionMismatch { probe: 1, entry: 0, .. }));
    }

    fn voting_fixture() -> (Vec<Embedding>, Vec<GalleryEntry>) {
        let gallery = vec![
            GalleryEntry::new(7, Pose::Front, vec![1.0, 0.0, 0.0]),
            GalleryEntry::new(7, Pose::Left, vec![0.9, 0.1, 0.0]),
            GalleryEntry::new(8, Pose::Front, vec![0.0, 1.0, 0.0]),
        ];
        let probes = vec![
            emb(&[1.0, 0.0, 0.0]),
            emb(&[0.95, 0.05, 0.0]),
            // Points away from everyone enrolled.
            emb(&[0.0, 0.0, -1.0]),
        ];
        (probes, gallery)
    }

    #[rstest]
    #[case(1, &[7])]
    #[case(2, &[7])]
    #[case(3, &[])]
    fn test_decide_min_votes(#[case] min_votes: usize, #[case] expected: &[i64]) {
        let (probes, gallery) = voting_fixture();
        let recognized = decide(&probes, &gallery, 0.9, min_votes).unwrap();
        let expected: BTreeSet<IdentityId> = expected.iter().copied().map(IdentityId).collect();
        assert_eq!(recognized, expected);
    }

    #[test]
    fn test_recognized_from_votes_cut() {
        let votes = BTreeMap::from([(IdentityId(1), 3), (IdentityId(2), 1), (IdentityId(3), 2)]);
        assert_eq!(
            recognized_from_votes(&votes, 2),
            BTreeSet::from([IdentityId(1), IdentityId(3)])
        );
        assert_eq!(recognized_from_votes(&votes, 0).len(), 3);
        assert!(recognized_from_votes(&BTreeMap::new(), 0).is_empty());
    }

    #[test]
    fn test_decide_multiple_identities() {
        let probes = vec![emb(&[1.0, 0.0]), emb(&[0.0, 1.0])];
        let recognized = decide(&probes, &two_person_gallery(), 0.9, 1).unwrap();
        assert_eq!(recognized, BTreeSet::from([IdentityId(1), IdentityId(2)]));
    }

    #[test]
    fn test_decide_empty_gallery() {
        let (probes, _) = voting_fixture();
        assert!(decide(&probes, &[], 0.0, 0).unwrap().is_empty());
        assert!(decide(&probes, &[], 0.5, 1).unwrap().is_empty());
    }

    #[test]
    fn test_cosine_matcher_uses_params() {
        let matcher = CosineMatcher::new(MatchParams { threshold: 0.95, min_votes: 2 });
        let gallery = two_person_gallery();
        let probes = vec![emb(&[1.0, 0.0]), emb(&[0.0, 1.0]), emb(&[1.0, 0.01])];

        assert!(!matcher.compare(&emb(&[0.6, 0.8]), &gallery).unwrap().is_match());
        assert_eq!(matcher.recognize(&probes, &gallery).unwrap(), BTreeSet::from([IdentityId(1)]));
        assert_eq!(matcher.votes(&probes, &gallery).unwrap().len(), 2);
    }

    #[test]
    fn test_match_params_default() {
        let p = MatchParams::default();
        assert_eq!(p.threshold, 0.5);
        assert_eq!(p.min_votes, 1);
    }
}
