//! Nearest-neighbor identity matching over the enrolled gallery.
//!
//! A captured template is compared against every enrolled template by
//! Euclidean distance. Linear scan, O(n · d) per query — fine at the
//! target scale of tens to low hundreds of enrolled persons. If the
//! gallery ever grows past that, an approximate nearest-neighbor index
//! can replace [`EuclideanMatcher`] behind the same [`Matcher`] contract.

use crate::types::{Template, TemplateSnapshot};
use serde::Serialize;

/// Maximum Euclidean distance still considered the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Result of matching one captured template against a snapshot.
///
/// `NoMatch` still reports the best distance seen so callers can log
/// near-misses; it is `None` only when the snapshot was empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Match {
        person_id: i64,
        name: String,
        distance: f32,
    },
    NoMatch {
        best_distance: Option<f32>,
    },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Match { .. })
    }
}

/// Strategy for mapping a captured template to zero or one enrolled person.
pub trait Matcher {
    fn match_identity(
        &self,
        probe: &Template,
        snapshot: &TemplateSnapshot,
        threshold: f32,
    ) -> MatchOutcome;
}

/// Euclidean nearest-neighbor matcher.
///
/// Pure function over its inputs; holds no state and may run from any
/// number of capture stations concurrently.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn match_identity(
        &self,
        probe: &Template,
        snapshot: &TemplateSnapshot,
        threshold: f32,
    ) -> MatchOutcome {
        let mut best: Option<(usize, f32)> = None;

        for (i, enrolled) in snapshot.entries().iter().enumerate() {
            let distance = probe.euclidean_distance(&enrolled.template);
            // Strict `<` so a tie keeps the first entry encountered.
            let better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if better {
                best = Some((i, distance));
            }
        }

        match best {
            // A match requires strictly less than the threshold; a distance
            // exactly at the threshold is a no-match.
            Some((i, distance)) if distance < threshold => {
                let entry = &snapshot.entries()[i];
                MatchOutcome::Match {
                    person_id: entry.person_id,
                    name: entry.name.clone(),
                    distance,
                }
            }
            Some((_, distance)) => MatchOutcome::NoMatch {
                best_distance: Some(distance),
            },
            None => MatchOutcome::NoMatch { best_distance: None },
        }
    }
}
