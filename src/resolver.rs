//! Feature-interval resolution
//!
//! Maps a logical feature name to the half-open range of transformed columns
//! that encode it. Two routes are provided:
//!
//! - [`TransformLayout`]: the transform reports its own per-feature output
//!   widths, so intervals are exact by construction.
//! - [`FeatureIntervalResolver`]: reconstructs the layout from generated
//!   column names and expanded counts inferred from the raw input. Use it when
//!   only the transformed table is available.

use crate::counts::{expanded_counts, group_counts, ExpandedCounts, GroupCounts};
use crate::errors::{MutFeatError, MutFeatResult};
use polars::prelude::DataFrame;
use serde::Serialize;
use std::ops::Range;
use tracing::debug;

/// Half-open `[start, end)` range of transformed column positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Interval {
    pub start: usize,
    pub end: usize,
}

impl Interval {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// The slice of `names` covered by this interval
    pub fn columns<'a, S>(&self, names: &'a [S]) -> &'a [S] {
        &names[self.range()]
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Resolves intervals by parsing transformed column names.
///
/// The recognized-feature allow-list is part of the resolver so that
/// differently configured resolvers can coexist.
#[derive(Debug, Clone)]
pub struct FeatureIntervalResolver {
    recognized: Vec<String>,
}

impl FeatureIntervalResolver {
    pub fn new(recognized: Vec<String>) -> Self {
        Self { recognized }
    }

    pub fn recognized(&self) -> &[String] {
        &self.recognized
    }

    /// Resolve `target` within `transformed_columns`, counting expansions from
    /// `pre_transform`.
    pub fn resolve<S: AsRef<str>>(
        &self,
        transformed_columns: &[S],
        pre_transform: &DataFrame,
        target: &str,
    ) -> MutFeatResult<Interval> {
        let expanded = expanded_counts(pre_transform, &self.recognized)?;
        let groups = group_counts(transformed_columns)?;
        resolve_with_counts(&groups, &expanded, target)
    }

    /// Resolve several features against one pair of derived tables
    pub fn resolve_many<S: AsRef<str>, T: AsRef<str>>(
        &self,
        transformed_columns: &[S],
        pre_transform: &DataFrame,
        targets: &[T],
    ) -> MutFeatResult<Vec<Interval>> {
        let expanded = expanded_counts(pre_transform, &self.recognized)?;
        let groups = group_counts(transformed_columns)?;
        targets
            .iter()
            .map(|t| resolve_with_counts(&groups, &expanded, t.as_ref()))
            .collect()
    }

    /// Verify that expanded counts reproduce every group width and the total
    /// transformed width.
    pub fn check_layout<S: AsRef<str>>(
        &self,
        transformed_columns: &[S],
        pre_transform: &DataFrame,
    ) -> MutFeatResult<()> {
        let expanded = expanded_counts(pre_transform, &self.recognized)?;
        let groups = group_counts(transformed_columns)?;
        check_layout(&groups, &expanded)
    }
}

/// Sum of the expanded counts of `prefix`'s constituents, checked against the
/// group's actual width.
fn checked_group_width(
    prefix: &str,
    group_total: usize,
    expanded: &ExpandedCounts,
) -> MutFeatResult<()> {
    let mut expected = 0;
    for part in prefix.split('_') {
        expected += expanded
            .get(part)
            .ok_or_else(|| MutFeatError::UncountedFeature {
                feature: part.to_string(),
                group: prefix.to_string(),
            })?;
    }
    if expected != group_total {
        return Err(MutFeatError::LayoutMismatch {
            group: prefix.to_string(),
            expected,
            actual: group_total,
        });
    }
    Ok(())
}

/// Walk the group table left to right, accumulating widths until the first
/// group whose constituents contain `target`.
pub fn resolve_with_counts(
    groups: &GroupCounts,
    expanded: &ExpandedCounts,
    target: &str,
) -> MutFeatResult<Interval> {
    let mut start = 0;

    for (prefix, group_total) in groups.iter() {
        let parts: Vec<&str> = prefix.split('_').collect();

        if !parts.contains(&target) {
            debug!("Adding interval for column-group: {}", prefix);
            start += group_total;
            continue;
        }

        checked_group_width(prefix, group_total, expanded)?;
        for part in parts {
            // Presence of every part was established by the width check
            let count = expanded.get(part).unwrap_or(0);
            if part == target {
                return Ok(Interval::new(start, start + count));
            }
            start += count;
        }
    }

    Err(MutFeatError::FeatureNotFound(target.to_string()))
}

pub fn check_layout(groups: &GroupCounts, expanded: &ExpandedCounts) -> MutFeatResult<()> {
    for (prefix, group_total) in groups.iter() {
        checked_group_width(prefix, group_total, expanded)?;
    }
    Ok(())
}

/// One transform step's output: features and their widths in output order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutGroup {
    pub features: Vec<(String, usize)>,
}

impl LayoutGroup {
    pub fn width(&self) -> usize {
        self.features.iter().map(|(_, w)| w).sum()
    }
}

/// A transform that can report where each logical feature lands in its output.
pub trait TransformLayout {
    fn layout(&self) -> Vec<LayoutGroup>;

    fn output_width(&self, feature: &str) -> Option<usize> {
        self.layout()
            .into_iter()
            .flat_map(|g| g.features)
            .find(|(name, _)| name == feature)
            .map(|(_, width)| width)
    }

    fn total_width(&self) -> usize {
        self.layout().iter().map(LayoutGroup::width).sum()
    }

    /// Interval of the first occurrence of `feature` in the output
    fn interval(&self, feature: &str) -> MutFeatResult<Interval> {
        let mut start = 0;
        for group in self.layout() {
            for (name, width) in group.features {
                if name == feature {
                    return Ok(Interval::new(start, start + width));
                }
                start += width;
            }
        }
        Err(MutFeatError::FeatureNotFound(feature.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;
    use proptest::prelude::*;

    fn resolver_for(names: &[&str]) -> FeatureIntervalResolver {
        FeatureIntervalResolver::new(names.iter().map(|s| s.to_string()).collect())
    }

    fn abc_columns() -> Vec<String> {
        let mut columns: Vec<String> = (0..3).map(|i| format!("A_{}", i)).collect();
        columns.push("B".to_string());
        columns.extend((0..5).map(|i| format!("C_{}", i)));
        columns
    }

    fn abc_input() -> DataFrame {
        df! {
            "A" => &["a", "b", "c", "a", "b"],
            "B" => &[1.0, 2.0, 3.0, 4.0, 5.0],
            "C" => &["p", "q", "r", "s", "t"]
        }
        .unwrap()
    }

    #[test]
    fn test_resolve_concatenated_groups() {
        let resolver = resolver_for(&["A", "B", "C"]);
        let columns = abc_columns();
        let input = abc_input();

        assert_eq!(resolver.resolve(&columns, &input, "B").unwrap(), Interval::new(3, 4));
        assert_eq!(resolver.resolve(&columns, &input, "A").unwrap(), Interval::new(0, 3));
        assert_eq!(resolver.resolve(&columns, &input, "C").unwrap(), Interval::new(4, 9));
    }

    #[test]
    fn test_missing_feature_is_an_error() {
        let resolver = resolver_for(&["A", "B", "C"]);
        let err = resolver
            .resolve(&abc_columns(), &abc_input(), "D")
            .unwrap_err();
        match err {
            MutFeatError::FeatureNotFound(name) => assert_eq!(name, "D"),
            other => panic!("Expected FeatureNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_substring_of_prefix_does_not_match() {
        let resolver = resolver_for(&["A", "B", "C"]);
        let columns = vec!["AB_0", "AB_1"];
        let err = resolver.resolve(&columns, &abc_input(), "A").unwrap_err();
        assert!(matches!(err, MutFeatError::FeatureNotFound(_)));
    }

    #[test]
    fn test_line_ratio_and_operator() {
        let input = df! {
            "lineRatio" => &[0.1, 0.5, 0.9],
            "mutationOperator" => &["AOR", "ROR", "LVR"]
        }
        .unwrap();
        let columns = [
            "lineRatio",
            "mutationOperator_0",
            "mutationOperator_1",
            "mutationOperator_2",
        ];
        let resolver = resolver_for(&["lineRatio", "mutationOperator"]);

        assert_eq!(
            resolver.resolve(&columns, &input, "lineRatio").unwrap(),
            Interval::new(0, 1)
        );
        assert_eq!(
            resolver.resolve(&columns, &input, "mutationOperator").unwrap(),
            Interval::new(1, 4)
        );
    }

    #[test]
    fn test_joined_group_walks_constituents() {
        let input = df! {
            "lineRatio" => &[0.1, 0.5, 0.9],
            "nodeTypeBasic" => &["Expr", "Stmt", "Expr"],
            "nodeTypeDetailed" => &["Call", "If", "Assign"]
        }
        .unwrap();
        let mut columns = vec!["lineRatio".to_string()];
        columns.extend((0..5).map(|i| format!("nodeTypeBasic_nodeTypeDetailed_{}", i)));
        let resolver = resolver_for(&["lineRatio", "nodeTypeBasic", "nodeTypeDetailed"]);

        let intervals = resolver
            .resolve_many(&columns, &input, &["nodeTypeBasic", "nodeTypeDetailed"])
            .unwrap();
        assert_eq!(intervals, vec![Interval::new(1, 3), Interval::new(3, 6)]);
        assert_eq!(
            intervals[1].columns(&columns),
            &columns[3..6]
        );
    }

    #[test]
    fn test_first_match_wins() {
        let groups = GroupCounts::from_pairs([("x_y", 2), ("y", 1)]);
        let expanded = ExpandedCounts::from_pairs([("x", 1), ("y", 1)]);
        assert_eq!(
            resolve_with_counts(&groups, &expanded, "y").unwrap(),
            Interval::new(1, 2)
        );
    }

    #[test]
    fn test_sampled_counts_surface_mismatch() {
        // Counts from a sample that only saw two of the three operators
        let sample = df! {
            "mutationOperator" => &["AOR", "ROR", "AOR"]
        }
        .unwrap();
        let columns = ["mutationOperator_0", "mutationOperator_1", "mutationOperator_2"];
        let resolver = resolver_for(&["mutationOperator"]);

        let err = resolver
            .resolve(&columns, &sample, "mutationOperator")
            .unwrap_err();
        match err {
            MutFeatError::LayoutMismatch {
                expected, actual, ..
            } => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("Expected LayoutMismatch, got {:?}", other),
        }
        assert!(resolver.check_layout(&columns, &sample).is_err());
    }

    #[test]
    fn test_uncounted_constituent() {
        let groups = GroupCounts::from_pairs([("x_y", 2)]);
        let expanded = ExpandedCounts::from_pairs([("y", 1)]);
        let err = resolve_with_counts(&groups, &expanded, "y").unwrap_err();
        assert!(matches!(err, MutFeatError::UncountedFeature { .. }));
    }

    struct FixedLayout(Vec<LayoutGroup>);

    impl TransformLayout for FixedLayout {
        fn layout(&self) -> Vec<LayoutGroup> {
            self.0.clone()
        }
    }

    #[test]
    fn test_transform_layout_intervals() {
        let layout = FixedLayout(vec![
            LayoutGroup {
                features: vec![("A".to_string(), 3)],
            },
            LayoutGroup {
                features: vec![("B".to_string(), 1), ("C".to_string(), 5)],
            },
        ]);
        assert_eq!(layout.interval("C").unwrap(), Interval::new(4, 9));
        assert_eq!(layout.output_width("A"), Some(3));
        assert_eq!(layout.total_width(), 9);
        assert!(layout.interval("D").is_err());
    }

    fn synthetic_table(widths: &[usize]) -> (Vec<String>, DataFrame) {
        let rows = 6;
        let mut names = Vec::new();
        let mut columns = Vec::new();
        for (i, &width) in widths.iter().enumerate() {
            let feature = format!("f{}", i);
            if width == 1 {
                names.push(feature.clone());
                let values: Vec<f64> = (0..rows).map(|r| r as f64).collect();
                columns.push(Series::new(feature.as_str().into(), values).into_column());
            } else {
                names.extend((0..width).map(|k| format!("{}_{}", feature, k)));
                let values: Vec<String> =
                    (0..rows).map(|r| format!("v{}", r % width)).collect();
                columns.push(Series::new(feature.as_str().into(), values).into_column());
            }
        }
        (names, DataFrame::new(columns).unwrap())
    }

    proptest! {
        #[test]
        fn prop_interval_width_matches_expanded_count(widths in prop::collection::vec(1usize..6, 1..8)) {
            let (columns, input) = synthetic_table(&widths);
            let recognized: Vec<String> = (0..widths.len()).map(|i| format!("f{}", i)).collect();
            let resolver = FeatureIntervalResolver::new(recognized.clone());

            let mut expected_start = 0;
            for (feature, &width) in recognized.iter().zip(widths.iter()) {
                let interval = resolver.resolve(&columns, &input, feature).unwrap();
                prop_assert_eq!(interval.start, expected_start);
                prop_assert_eq!(interval.len(), width);
                // No hidden state between calls
                prop_assert_eq!(resolver.resolve(&columns, &input, feature).unwrap(), interval);
                expected_start = interval.end;
            }
            prop_assert_eq!(expected_start, columns.len());
            prop_assert!(resolver.check_layout(&columns, &input).is_ok());
        }

        #[test]
        fn prop_unknown_feature_never_resolves(widths in prop::collection::vec(1usize..6, 1..8)) {
            let (columns, input) = synthetic_table(&widths);
            let recognized: Vec<String> = (0..widths.len()).map(|i| format!("f{}", i)).collect();
            let resolver = FeatureIntervalResolver::new(recognized);
            let result = resolver.resolve(&columns, &input, "missing");
            prop_assert!(matches!(result, Err(MutFeatError::FeatureNotFound(_))));
        }
    }
}
