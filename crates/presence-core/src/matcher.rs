//! Exhaustive nearest-identity search over enrolled embeddings.
//!
//! Every stored embedding of every record is compared against the probe;
//! there is no index. Cost is O(records × embeddings × dim), which is fine
//! for site-sized rosters.

use crate::types::{Embedding, EnrolledIdentity};
use serde::Serialize;

/// Reference cosine-distance threshold for a positive match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.55;

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Cosine distance below which the closest identity is accepted.
    pub threshold: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

/// Outcome of matching a probe embedding against the enrolled gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched {
        identity_id: String,
        display_name: String,
        /// Cosine distance of the closest stored embedding.
        distance: f32,
        /// Threshold-relative similarity in [0, 100].
        similarity_pct: f32,
    },
    NoMatch {
        /// Closest distance seen, if any valid candidate was scanned.
        closest_distance: Option<f32>,
        similarity_pct: f32,
    },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }

    pub fn similarity_pct(&self) -> f32 {
        match self {
            MatchOutcome::Matched { similarity_pct, .. }
            | MatchOutcome::NoMatch { similarity_pct, .. } => *similarity_pct,
        }
    }
}

/// Map a cosine distance onto a threshold-relative percentage.
///
/// 100% at distance 0, 0% at or beyond the threshold.
pub fn similarity_percent(distance: f32, threshold: f32) -> f32 {
    if !distance.is_finite() || threshold <= 0.0 {
        return 0.0;
    }
    ((1.0 - (distance / threshold).min(1.0)) * 100.0).clamp(0.0, 100.0)
}

/// Strategy for comparing a probe embedding against a gallery of enrolled identities.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[EnrolledIdentity], threshold: f32)
        -> MatchOutcome;
}

/// Cosine-distance matcher with a full gallery scan.
///
/// Stored embeddings are re-normalized on read; zero vectors and
/// dimension mismatches are skipped rather than aborting the scan.
pub struct CosineDistanceMatcher;

impl Matcher for CosineDistanceMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[EnrolledIdentity],
        threshold: f32,
    ) -> MatchOutcome {
        let Some(probe) = probe.normalized() else {
            tracing::warn!(dim = probe.dim(), "probe embedding cannot be normalized");
            return MatchOutcome::NoMatch {
                closest_distance: None,
                similarity_pct: 0.0,
            };
        };

        let mut best_distance = f32::INFINITY;
        let mut best: Option<&EnrolledIdentity> = None;
        let mut scanned = 0usize;
        let mut skipped = 0usize;

        for record in gallery {
            for stored in &record.embeddings {
                if stored.dim() != probe.dim() {
                    skipped += 1;
                    continue;
                }
                let Some(stored) = stored.normalized() else {
                    skipped += 1;
                    continue;
                };
                scanned += 1;

                let distance = probe.cosine_distance(&stored);
                if distance < best_distance {
                    best_distance = distance;
                    best = Some(record);
                }
            }
        }

        if skipped > 0 {
            tracing::warn!(skipped, scanned, "skipped unusable stored embeddings");
        }

        let similarity_pct = similarity_percent(best_distance, threshold);
        tracing::debug!(
            scanned,
            best_distance,
            similarity_pct,
            "identity scan complete"
        );

        match best {
            Some(record) if best_distance < threshold => MatchOutcome::Matched {
                identity_id: record.id.clone(),
                display_name: record.display_name.clone(),
                distance: best_distance,
                similarity_pct,
            },
            Some(_) => MatchOutcome::NoMatch {
                closest_distance: Some(best_distance),
                similarity_pct,
            },
            None => MatchOutcome::NoMatch {
                closest_distance: None,
                similarity_pct: 0.0,
            },
        }
    }
}
