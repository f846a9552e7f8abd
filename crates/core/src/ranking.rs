use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Weight assigned to one candidate node by the fit oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ranking {
    pub node: String,
    pub weight: f64,
}

/// Candidate nodes for one scheduling attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Rankings(SmallVec<[Ranking; 8]>);

impl Rankings {
    pub fn new() -> Self { Self(SmallVec::new()) }

    pub fn push(&mut self, node: impl Into<String>, weight: f64) {
        self.0.push(Ranking { node: node.into(), weight });
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn as_slice(&self) -> &[Ranking] { &self.0 }

    /// Ascending by weight (exact `<`, no epsilon), then by node name so equal
    /// weights order the same way regardless of the oracle's map order.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| {
            let by_weight = if a.weight < b.weight {
                Ordering::Less
            } else if b.weight < a.weight {
                Ordering::Greater
            } else {
                Ordering::Equal
            };
            by_weight.then_with(|| a.node.cmp(&b.node))
        });
    }

    /// Sort and take the last element: the maximum weight, and on ties the
    /// lexicographically greatest node name.
    pub fn best(&mut self) -> Option<&Ranking> {
        self.sort();
        self.0.last()
    }
}

impl FromIterator<(String, f64)> for Rankings {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(node, weight)| Ranking { node, weight }).collect())
    }
}
