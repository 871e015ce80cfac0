//! Grouped feature mapper
//!
//! Implements a fit/transform pattern over groups of input columns. Each group
//! is passed through, standard-scaled (optionally after mean imputation) or
//! one-hot encoded, and the outputs are concatenated in group order. Output
//! columns are named `<prefix>_<i>` where the prefix joins the group's input
//! columns with `_`; a group producing a single column uses the bare prefix.

use crate::config::{GroupSpec, GroupTransform, MapperConfig};
use crate::errors::{MutFeatError, MutFeatResult};
use crate::matrix::SparseMatrix;
use crate::resolver::{LayoutGroup, TransformLayout};
use anyhow::{anyhow, Result};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::debug;

/// Statistics for Standard scaling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StandardStats {
    pub mean: f64,
    pub std: f64,
}

impl StandardStats {
    fn apply(&self, value: f64) -> f64 {
        // Constant column maps to 0
        if self.std.abs() < f64::EPSILON {
            0.0
        } else {
            (value - self.mean) / self.std
        }
    }
}

/// Vocabulary for OneHot encoding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OneHotVocab {
    pub categories: Vec<String>,
    /// Missing values seen during fit get a trailing slot of their own
    #[serde(default)]
    pub has_null: bool,
}

impl OneHotVocab {
    fn width(&self) -> usize {
        self.categories.len() + usize::from(self.has_null)
    }
}

/// Fitted state of one mapper group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupState {
    Passthrough,
    Standard {
        stats: Vec<StandardStats>,
    },
    MeanImputeStandard {
        means: Vec<f64>,
        stats: Vec<StandardStats>,
    },
    OneHot {
        fill_value: Option<String>,
        vocabs: Vec<OneHotVocab>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FittedGroup {
    pub columns: Vec<String>,
    pub state: GroupState,
}

impl FittedGroup {
    fn widths(&self) -> Vec<usize> {
        match &self.state {
            GroupState::OneHot { vocabs, .. } => {
                vocabs.iter().map(|v| v.width()).collect()
            }
            _ => vec![1; self.columns.len()],
        }
    }

    fn width(&self) -> usize {
        self.widths().iter().sum()
    }

    fn output_names(&self) -> Vec<String> {
        let prefix = self.columns.join("_");
        match self.width() {
            0 => Vec::new(),
            1 => vec![prefix],
            n => (0..n).map(|i| format!("{}_{}", prefix, i)).collect(),
        }
    }

    /// Encoded output columns of this group, left to right
    fn encode(&self, df: &DataFrame) -> Result<Vec<Vec<f64>>> {
        match &self.state {
            GroupState::Passthrough => self
                .columns
                .iter()
                .map(|c| {
                    Ok(numeric_values(df, c)?
                        .into_iter()
                        .map(|v| v.unwrap_or(f64::NAN))
                        .collect())
                })
                .collect(),
            GroupState::Standard { stats } => self
                .columns
                .iter()
                .zip(stats)
                .map(|(c, s)| {
                    Ok(numeric_values(df, c)?
                        .into_iter()
                        .map(|v| v.map(|x| s.apply(x)).unwrap_or(f64::NAN))
                        .collect())
                })
                .collect(),
            GroupState::MeanImputeStandard { means, stats } => self
                .columns
                .iter()
                .zip(means.iter().zip(stats))
                .map(|(c, (mean, s))| {
                    Ok(numeric_values(df, c)?
                        .into_iter()
                        .map(|v| s.apply(v.unwrap_or(*mean)))
                        .collect())
                })
                .collect(),
            GroupState::OneHot { fill_value, vocabs } => {
                let mut out = Vec::new();
                for (c, vocab) in self.columns.iter().zip(vocabs) {
                    let values = string_values(df, c, fill_value.as_deref())?;
                    for category in &vocab.categories {
                        // Unknown categories encode as all zeros
                        out.push(
                            values
                                .iter()
                                .map(|v| match v {
                                    Some(val) if val == category => 1.0,
                                    _ => 0.0,
                                })
                                .collect(),
                        );
                    }
                    if vocab.has_null {
                        out.push(
                            values
                                .iter()
                                .map(|v| if v.is_none() { 1.0 } else { 0.0 })
                                .collect(),
                        );
                    }
                }
                Ok(out)
            }
        }
    }
}

fn numeric_values(df: &DataFrame, column: &str) -> Result<Vec<Option<f64>>> {
    let col = df
        .column(column)
        .map_err(|e| anyhow!("Column '{}' not found: {}", column, e))?;

    let float_col = col
        .cast(&DataType::Float64)
        .map_err(|e| anyhow!("Cannot cast column '{}' to float: {}", column, e))?;

    let ca = float_col
        .f64()
        .map_err(|e| anyhow!("Failed to get f64 chunked array: {}", e))?;

    Ok(ca.into_iter().collect())
}

fn string_values(df: &DataFrame, column: &str, fill: Option<&str>) -> Result<Vec<Option<String>>> {
    let col = df
        .column(column)
        .map_err(|e| anyhow!("Column '{}' not found: {}", column, e))?;

    let str_col = col
        .cast(&DataType::String)
        .map_err(|e| anyhow!("Cannot cast column '{}' to string: {}", column, e))?;

    let ca = str_col
        .str()
        .map_err(|e| anyhow!("Column '{}' is not a string type: {}", column, e))?;

    Ok(ca
        .into_iter()
        .map(|opt| opt.or(fill).map(|s| s.to_string()))
        .collect())
}

/// Population mean and std of the non-null values
fn fit_standard(values: &[f64], column: &str) -> Result<StandardStats> {
    if values.is_empty() {
        return Err(anyhow!("Column '{}' has no values", column));
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Ok(StandardStats {
        mean,
        std: var.sqrt(),
    })
}

fn fit_group(df: &DataFrame, spec: &GroupSpec) -> Result<GroupState> {
    let state = match spec.transform {
        GroupTransform::Passthrough => {
            for c in &spec.columns {
                numeric_values(df, c)?;
            }
            GroupState::Passthrough
        }
        GroupTransform::StandardScale => {
            let mut stats = Vec::with_capacity(spec.columns.len());
            for c in &spec.columns {
                let values: Vec<f64> = numeric_values(df, c)?.into_iter().flatten().collect();
                stats.push(fit_standard(&values, c)?);
            }
            GroupState::Standard { stats }
        }
        GroupTransform::MeanImputeScale => {
            let mut means = Vec::with_capacity(spec.columns.len());
            let mut stats = Vec::with_capacity(spec.columns.len());
            for c in &spec.columns {
                let raw = numeric_values(df, c)?;
                let present: Vec<f64> = raw.iter().flatten().copied().collect();
                let mean = fit_standard(&present, c)?.mean;
                let imputed: Vec<f64> = raw.into_iter().map(|v| v.unwrap_or(mean)).collect();
                means.push(mean);
                stats.push(fit_standard(&imputed, c)?);
            }
            GroupState::MeanImputeStandard { means, stats }
        }
        GroupTransform::OneHot => {
            let mut vocabs = Vec::with_capacity(spec.columns.len());
            for c in &spec.columns {
                let values = string_values(df, c, spec.fill_value.as_deref())?;
                let has_null = values.iter().any(|v| v.is_none());
                let categories: BTreeSet<String> = values.into_iter().flatten().collect();
                vocabs.push(OneHotVocab {
                    categories: categories.into_iter().collect(),
                    has_null,
                });
            }
            GroupState::OneHot {
                fill_value: spec.fill_value.clone(),
                vocabs,
            }
        }
    };
    Ok(state)
}

pub struct FeatureMapper;

impl FeatureMapper {
    /// Fit every group of `config` on `df`
    pub fn fit(df: &DataFrame, config: &MapperConfig) -> MutFeatResult<FittedMapper> {
        let mut groups = Vec::with_capacity(config.groups.len());
        for spec in &config.groups {
            let state = fit_group(df, spec)?;
            let group = FittedGroup {
                columns: spec.columns.clone(),
                state,
            };
            debug!(
                "Fitted group {} ({:?}) -> {} columns",
                spec.prefix(),
                spec.transform,
                group.width()
            );
            groups.push(group);
        }
        Ok(FittedMapper { groups })
    }
}

/// Mapper with fitted statistics, ready to transform new rows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FittedMapper {
    pub groups: Vec<FittedGroup>,
}

impl FittedMapper {
    /// Names of the transformed columns, in output order
    pub fn output_names(&self) -> Vec<String> {
        self.groups.iter().flat_map(|g| g.output_names()).collect()
    }

    /// Transform into a Float64 DataFrame
    pub fn transform(&self, df: &DataFrame) -> MutFeatResult<DataFrame> {
        let mut columns = Vec::new();
        for group in &self.groups {
            let names = group.output_names();
            let encoded = group.encode(df)?;
            for (name, values) in names.into_iter().zip(encoded) {
                columns.push(Series::new(name.into(), values).into_column());
            }
        }
        Ok(DataFrame::new(columns)?)
    }

    /// Transform straight into a sparse matrix, skipping the dense table
    pub fn transform_matrix(&self, df: &DataFrame) -> MutFeatResult<SparseMatrix> {
        let mut matrix = SparseMatrix::with_rows(df.height());
        for group in &self.groups {
            for values in group.encode(df)? {
                matrix.push_dense_column(&values);
            }
        }
        if matrix.n_cols() != self.total_width() {
            return Err(MutFeatError::LayoutMismatch {
                group: "<all>".to_string(),
                expected: self.total_width(),
                actual: matrix.n_cols(),
            });
        }
        Ok(matrix)
    }

    /// Save fitted mapper to JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())
            .map_err(|e| anyhow!("Failed to create mapper file: {}", e))?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)
            .map_err(|e| anyhow!("Failed to write mapper: {}", e))?;
        Ok(())
    }

    /// Load fitted mapper from JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .map_err(|e| anyhow!("Failed to open mapper file: {}", e))?;
        let reader = BufReader::new(file);
        let mapper: FittedMapper = serde_json::from_reader(reader)
            .map_err(|e| anyhow!("Failed to parse mapper: {}", e))?;
        Ok(mapper)
    }
}

impl TransformLayout for FittedMapper {
    fn layout(&self) -> Vec<LayoutGroup> {
        self.groups
            .iter()
            .map(|g| LayoutGroup {
                features: g.columns.iter().cloned().zip(g.widths()).collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_recognized_features;
    use crate::counts::column_names;
    use crate::resolver::{FeatureIntervalResolver, Interval};
    use tempfile::tempdir;

    fn mutants_df() -> DataFrame {
        df! {
            "lineRatio" => &[Some(0.2), None, Some(0.6), Some(1.0)],
            "nestingIf" => &[0, 1, 2, 1],
            "hasLiteralChild" => &[true, false, true, false],
            "nodeTypeBasic" => &[Some("Expr"), Some("Stmt"), None, Some("Expr")],
            "mutationOperator" => &["AOR", "ROR", "LVR", "AOR"],
            "mutationOperatorGroup" => &["ARITH", "REL", "LIT", "ARITH"]
        }
        .unwrap()
    }

    fn mutants_config() -> MapperConfig {
        MapperConfig {
            groups: vec![
                GroupSpec::new(&["lineRatio"], GroupTransform::MeanImputeScale),
                GroupSpec::new(&["nestingIf"], GroupTransform::StandardScale),
                GroupSpec::new(&["hasLiteralChild"], GroupTransform::Passthrough),
                GroupSpec::new(&["nodeTypeBasic"], GroupTransform::OneHot).with_fill("Unknown"),
                GroupSpec::new(
                    &["mutationOperator", "mutationOperatorGroup"],
                    GroupTransform::OneHot,
                ),
            ],
        }
    }

    #[test]
    fn test_output_names_follow_prefix_convention() {
        let mapper = FeatureMapper::fit(&mutants_df(), &mutants_config()).unwrap();
        let names = mapper.output_names();
        assert_eq!(
            names,
            vec![
                "lineRatio",
                "nestingIf",
                "hasLiteralChild",
                "nodeTypeBasic_0",
                "nodeTypeBasic_1",
                "nodeTypeBasic_2",
                "mutationOperator_mutationOperatorGroup_0",
                "mutationOperator_mutationOperatorGroup_1",
                "mutationOperator_mutationOperatorGroup_2",
                "mutationOperator_mutationOperatorGroup_3",
                "mutationOperator_mutationOperatorGroup_4",
                "mutationOperator_mutationOperatorGroup_5",
            ]
        );
    }

    #[test]
    fn test_mean_impute_then_scale() {
        let df = mutants_df();
        let mapper = FeatureMapper::fit(&df, &mutants_config()).unwrap();
        let out = mapper.transform(&df).unwrap();

        let scaled = out.column("lineRatio").unwrap().f64().unwrap();
        // Imputed row sits exactly at the mean
        assert!(scaled.get(1).unwrap().abs() < 1e-10);
        let sum: f64 = scaled.into_iter().flatten().sum();
        assert!(sum.abs() < 1e-10);
    }

    #[test]
    fn test_onehot_fill_and_unknown() {
        let train = mutants_df();
        let mapper = FeatureMapper::fit(&train, &mutants_config()).unwrap();

        // Vocabulary is sorted: Expr, Stmt, Unknown
        let out = mapper.transform(&train).unwrap();
        let unknown = out.column("nodeTypeBasic_2").unwrap().f64().unwrap();
        assert_eq!(unknown.get(2), Some(1.0));
        assert_eq!(unknown.get(0), Some(0.0));

        let test = df! {
            "lineRatio" => &[0.5],
            "nestingIf" => &[3],
            "hasLiteralChild" => &[true],
            "nodeTypeBasic" => &["Decl"],
            "mutationOperator" => &["AOR"],
            "mutationOperatorGroup" => &["ARITH"]
        }
        .unwrap();
        let out = mapper.transform(&test).unwrap();
        for name in ["nodeTypeBasic_0", "nodeTypeBasic_1", "nodeTypeBasic_2"] {
            assert_eq!(out.column(name).unwrap().f64().unwrap().get(0), Some(0.0));
        }
    }

    #[test]
    fn test_layout_agrees_with_name_resolver() {
        let df = mutants_df();
        let mapper = FeatureMapper::fit(&df, &mutants_config()).unwrap();
        let transformed = mapper.transform(&df).unwrap();
        let names = column_names(&transformed);
        let resolver = FeatureIntervalResolver::new(default_recognized_features());

        for feature in mutants_config().input_columns() {
            let by_layout = mapper.interval(&feature).unwrap();
            let by_names = resolver.resolve(&names, &df, &feature).unwrap();
            assert_eq!(by_layout, by_names, "feature {}", feature);
        }
        assert_eq!(
            mapper.interval("mutationOperatorGroup").unwrap(),
            Interval::new(9, 12)
        );
        assert_eq!(mapper.total_width(), transformed.width());
    }

    #[test]
    fn test_unfilled_null_gets_own_slot() {
        let df = df! {
            "kind" => &[None, Some("b"), Some("a"), Some("b"), None],
            "op" => &["AOR", "ROR", "AOR", "LVR", "ROR"]
        }
        .unwrap();
        let config = MapperConfig {
            groups: vec![GroupSpec::new(&["kind", "op"], GroupTransform::OneHot)],
        };
        let mapper = FeatureMapper::fit(&df, &config).unwrap();
        let transformed = mapper.transform(&df).unwrap();

        // a, b, <null>, then AOR, LVR, ROR
        assert_eq!(mapper.interval("kind").unwrap(), Interval::new(0, 3));
        assert_eq!(mapper.interval("op").unwrap(), Interval::new(3, 6));
        let null_slot = transformed.column("kind_op_2").unwrap().f64().unwrap();
        let flags: Vec<f64> = null_slot.into_iter().flatten().collect();
        assert_eq!(flags, vec![1.0, 0.0, 0.0, 0.0, 1.0]);

        let names = column_names(&transformed);
        let resolver =
            FeatureIntervalResolver::new(vec!["kind".to_string(), "op".to_string()]);
        resolver.check_layout(&names, &df).unwrap();
        for feature in ["kind", "op"] {
            assert_eq!(
                resolver.resolve(&names, &df, feature).unwrap(),
                mapper.interval(feature).unwrap()
            );
        }

        // Rows without nulls at transform time leave the slot empty
        let test = df! { "kind" => &["a"], "op" => &["ROR"] }.unwrap();
        let out = mapper.transform(&test).unwrap();
        assert_eq!(out.column("kind_op_2").unwrap().f64().unwrap().get(0), Some(0.0));
    }

    #[test]
    fn test_transform_matrix_matches_table() {
        let df = mutants_df();
        let mapper = FeatureMapper::fit(&df, &mutants_config()).unwrap();
        let table = mapper.transform(&df).unwrap();
        let matrix = mapper.transform_matrix(&df).unwrap();

        assert_eq!(matrix.n_rows(), table.height());
        assert_eq!(matrix.n_cols(), table.width());
        let op_col = matrix.dense_column(6);
        let expected: Vec<f64> = table
            .column("mutationOperator_mutationOperatorGroup_0")
            .unwrap()
            .f64()
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(op_col, expected);
    }

    #[test]
    fn test_missing_column_fails_fit() {
        let df = df! { "lineRatio" => &[0.1, 0.2] }.unwrap();
        let config = MapperConfig::few_features();
        assert!(FeatureMapper::fit(&df, &config).is_err());
    }

    #[test]
    fn test_mapper_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mapper.json");

        let mapper = FeatureMapper::fit(&mutants_df(), &mutants_config()).unwrap();
        mapper.save(&path).unwrap();
        let loaded = FittedMapper::load(&path).unwrap();

        assert_eq!(mapper, loaded);
    }
}
