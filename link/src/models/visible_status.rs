use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::entity::STATUS_DELETED;

/// Statuses whose entries belong in a consumer's collection.
///
/// Values are compared after upper-casing. `DELETED` is never visible.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct VisibleStatusSet {
    statuses: BTreeSet<String>,
}

impl VisibleStatusSet {
    pub fn new<I, S>(statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            statuses: statuses
                .into_iter()
                .map(|s| s.as_ref().trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty() && s != STATUS_DELETED)
                .collect(),
        }
    }

    pub fn contains(&self, status: &str) -> bool {
        let status = status.trim();
        self.statuses.iter().any(|s| s.eq_ignore_ascii_case(status))
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.statuses.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for VisibleStatusSet {
    fn from(statuses: Vec<String>) -> Self {
        Self::new(statuses)
    }
}

impl From<VisibleStatusSet> for Vec<String> {
    fn from(set: VisibleStatusSet) -> Self {
        set.statuses.into_iter().collect()
    }
}
