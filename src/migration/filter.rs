// ABOUTME: Allow-list and deny-list policy deciding which tables cross environments
// ABOUTME: Produces a sorted, de-duplicated table set from catalog discovery output

use crate::config::TablePolicy;
use std::collections::BTreeSet;

/// Two-set table policy: a table survives only if it is allowed and not denied
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl TableFilter {
    pub fn new<I, E, S>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_policy(policy: &TablePolicy) -> Self {
        Self::new(policy.include.iter().cloned(), policy.exclude.iter().cloned())
    }

    /// The deny-list wins over the allow-list
    pub fn allows(&self, table: &str) -> bool {
        !self.exclude.contains(table) && self.include.contains(table)
    }

    /// Keep allowed tables, sorted lexicographically without duplicates
    pub fn apply<I, S>(&self, tables: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tables
            .into_iter()
            .filter(|t| self.allows(t.as_ref()))
            .map(|t| t.as_ref().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
