//! Column counting for transformed feature tables
//!
//! Two derived tables feed interval resolution: how many transformed columns
//! each logical feature expands into (inferred from the raw input), and how
//! many transformed columns share each generated name prefix.

use crate::errors::MutFeatResult;
use anyhow::anyhow;
use polars::prelude::*;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Insertion-ordered name -> count table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedCounts {
    entries: Vec<(String, usize)>,
    index: HashMap<String, usize>,
}

impl OrderedCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (S, usize)>) -> Self {
        let mut counts = Self::new();
        for (name, count) in pairs {
            counts.add(name.into(), count);
        }
        counts
    }

    /// Add `amount` to `name`, appending it if unseen
    pub fn add(&mut self, name: String, amount: usize) {
        match self.index.get(&name) {
            Some(&pos) => self.entries[pos].1 += amount,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, amount));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.index.get(name).map(|&pos| self.entries[pos].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.entries.iter().map(|(n, c)| (n.as_str(), *c))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total(&self) -> usize {
        self.entries.iter().map(|(_, c)| c).sum()
    }
}

/// Logical feature -> number of transformed columns
pub type ExpandedCounts = OrderedCounts;

/// Generated column prefix -> number of transformed columns with that prefix
pub type GroupCounts = OrderedCounts;

fn is_categorical(dtype: &DataType) -> bool {
    matches!(dtype, DataType::String | DataType::Categorical(..))
}

/// Infer how many transformed columns each recognized feature occupies.
///
/// String columns count their distinct values, everything else counts one.
/// Columns outside `recognized` are skipped.
pub fn expanded_counts(df: &DataFrame, recognized: &[String]) -> MutFeatResult<ExpandedCounts> {
    let recognized: HashSet<&str> = recognized.iter().map(|s| s.as_str()).collect();
    let mut counts = ExpandedCounts::new();

    for (idx, column) in df.get_columns().iter().enumerate() {
        let name = column.name().as_str();
        if !recognized.contains(name) {
            continue;
        }
        let count = if is_categorical(column.dtype()) {
            column.n_unique()?
        } else {
            1
        };
        debug!("[{}, {}] Count: {} dtype: {}", idx, name, count, column.dtype());
        counts.add(name.to_string(), count);
    }

    debug!("Total number of features: {}", counts.total());
    Ok(counts)
}

/// Group transformed column names by the prefix before a trailing
/// `_<digits>` suffix, keeping first-seen order.
pub fn group_counts<S: AsRef<str>>(columns: &[S]) -> MutFeatResult<GroupCounts> {
    let suffix = Regex::new(r"_(\d+)$").map_err(|e| anyhow!("Invalid suffix pattern: {}", e))?;
    let mut counts = GroupCounts::new();

    for name in columns {
        let name = name.as_ref();
        let prefix = match suffix.find(name) {
            Some(m) => &name[..m.start()],
            None => name,
        };
        counts.add(prefix.to_string(), 1);
    }

    for (prefix, count) in counts.iter() {
        debug!("Group Name: {}, Feature Count: {}", prefix, count);
    }
    Ok(counts)
}

/// Column names of a DataFrame as owned strings
pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .map(|n| n.to_string())
        .collect()
}
