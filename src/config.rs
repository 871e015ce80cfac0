//! Analysis configuration
//!
//! Mapper grouping, the recognized-feature allow-list and the named feature
//! groups used for ablation. Everything here is a plain value handed to
//! constructors; presets mirror the mapper layouts used for the mutant data.

use crate::errors::{MutFeatError, MutFeatResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How one group of columns is encoded
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupTransform {
    Passthrough,
    StandardScale,
    MeanImputeScale,
    OneHot,
}

/// One mapper step: the columns it consumes and the encoding applied to them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSpec {
    pub columns: Vec<String>,
    pub transform: GroupTransform,
    /// Constant used to fill nulls before one-hot encoding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_value: Option<String>,
}

impl GroupSpec {
    pub fn new(columns: &[&str], transform: GroupTransform) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            transform,
            fill_value: None,
        }
    }

    pub fn with_fill(mut self, fill: &str) -> Self {
        self.fill_value = Some(fill.to_string());
        self
    }

    /// Prefix of the generated column names
    pub fn prefix(&self) -> String {
        self.columns.join("_")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapperConfig {
    pub groups: Vec<GroupSpec>,
}

impl MapperConfig {
    /// The full feature set: scaled line ratio and nesting counts, raw ratios
    /// and child flags, one-hot node types and operator/context columns.
    pub fn all_features() -> Self {
        Self {
            groups: vec![
                GroupSpec::new(&["lineRatio"], GroupTransform::MeanImputeScale),
                GroupSpec::new(
                    &["nestingIf", "nestingLoop", "nestingTotal", "maxNestingInSameMethod"],
                    GroupTransform::StandardScale,
                ),
                GroupSpec::new(
                    &[
                        "nestingRatioLoop",
                        "nestingRatioIf",
                        "nestingRatioTotal",
                        "hasOperatorChild",
                        "hasVariableChild",
                        "hasLiteralChild",
                    ],
                    GroupTransform::Passthrough,
                ),
                GroupSpec::new(&["nodeTypeBasic", "nodeTypeDetailed"], GroupTransform::OneHot)
                    .with_fill("Unknown"),
                GroupSpec::new(
                    &[
                        "mutationOperator",
                        "mutationOperatorGroup",
                        "nodeContextBasic",
                        "astContextBasic",
                        "astContextDetailed",
                        "astStmtContextBasic",
                        "astStmtContextDetailed",
                        "parentContextBasic",
                        "parentContextDetailed",
                        "parentStmtContextBasic",
                        "parentStmtContextDetailed",
                    ],
                    GroupTransform::OneHot,
                ),
            ],
        }
    }

    pub fn few_features() -> Self {
        Self {
            groups: vec![GroupSpec::new(
                &["mutationOperator", "parentStmtContextDetailed"],
                GroupTransform::OneHot,
            )],
        }
    }

    /// All input columns in the order the mapper consumes them
    pub fn input_columns(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.columns.iter().cloned())
            .collect()
    }
}

/// A named set of logical features held out together
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureGroup {
    pub name: String,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    /// Layout for `--data all` and the inspection commands
    pub mapper: MapperConfig,
    /// Layout for `--data small`
    #[serde(default = "MapperConfig::few_features")]
    pub small_mapper: MapperConfig,
    #[serde(default = "default_recognized_features")]
    pub recognized_features: Vec<String>,
    #[serde(default = "default_feature_groups")]
    pub feature_groups: Vec<FeatureGroup>,
    #[serde(default = "default_individual_features")]
    pub individual_features: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            mapper: MapperConfig::all_features(),
            small_mapper: MapperConfig::few_features(),
            recognized_features: default_recognized_features(),
            feature_groups: default_feature_groups(),
            individual_features: default_individual_features(),
        }
    }
}

impl AnalysisConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> MutFeatResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> MutFeatResult<Self> {
        let config: AnalysisConfig =
            serde_yaml::from_str(content).map_err(|e| MutFeatError::ConfigError(e, None))?;
        for (field, mapper) in [("mapper", &config.mapper), ("small_mapper", &config.small_mapper)] {
            if mapper.groups.is_empty() {
                return Err(MutFeatError::InvalidArgs(format!(
                    "{} must configure at least one group",
                    field
                )));
            }
            if let Some(g) = mapper.groups.iter().find(|g| g.columns.is_empty()) {
                return Err(MutFeatError::InvalidArgs(format!(
                    "{} group with transform {:?} has no columns",
                    field, g.transform
                )));
            }
        }
        Ok(config)
    }

    /// Features making up a named group; a name that is not a group stands
    /// for itself.
    pub fn features_of(&self, interval_name: &str) -> Vec<String> {
        self.feature_groups
            .iter()
            .find(|g| g.name == interval_name)
            .map(|g| g.features.clone())
            .unwrap_or_else(|| vec![interval_name.to_string()])
    }

    pub fn group_names(&self) -> Vec<String> {
        self.feature_groups.iter().map(|g| g.name.clone()).collect()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn default_recognized_features() -> Vec<String> {
    strings(&[
        "lineRatio",
        "nestingIf",
        "nestingLoop",
        "nestingTotal",
        "maxNestingInSameMethod",
        "nestingRatioLoop",
        "nestingRatioIf",
        "nestingRatioTotal",
        "hasOperatorChild",
        "hasVariableChild",
        "hasLiteralChild",
        "nodeTypeBasic",
        "nodeTypeDetailed",
        "mutationOperator",
        "mutationOperatorGroup",
        "nodeContextBasic",
        "astContextBasic",
        "astContextDetailed",
        "astStmtContextBasic",
        "astStmtContextDetailed",
        "parentContextBasic",
        "parentContextDetailed",
        "parentStmtContextBasic",
        "parentStmtContextDetailed",
    ])
}

pub fn default_feature_groups() -> Vec<FeatureGroup> {
    let group = |name: &str, features: &[&str]| FeatureGroup {
        name: name.to_string(),
        features: strings(features),
    };
    vec![
        group(
            "mutation_operator_features",
            &["mutationOperatorGroup", "mutationOperator"],
        ),
        group("node_type_features", &["nodeTypeBasic", "nodeTypeDetailed"]),
        group(
            "AST_Context_features",
            &[
                "astContextBasic",
                "astContextDetailed",
                "astStmtContextBasic",
                "astStmtContextDetailed",
            ],
        ),
        group(
            "parent_Context_features",
            &[
                "parentContextBasic",
                "parentContextDetailed",
                "parentStmtContextBasic",
                "parentStmtContextDetailed",
            ],
        ),
        group(
            "child_features",
            &["hasLiteralChild", "hasVariableChild", "hasOperatorChild"],
        ),
        group(
            "nesting_features",
            &[
                "nestingTotal",
                "nestingLoop",
                "nestingIf",
                "maxNestingInSameMethod",
                "nestingRatioTotal",
                "nestingRatioLoop",
                "nestingRatioIf",
            ],
        ),
        group("lineRatio", &["lineRatio"]),
    ]
}

pub fn default_individual_features() -> Vec<String> {
    strings(&[
        "mutationOperatorGroup",
        "mutationOperator",
        "nodeTypeBasic",
        "nodeTypeDetailed",
        "nodeContextBasic",
        "astContextBasic",
        "astContextDetailed",
        "astStmtContextBasic",
        "astStmtContextDetailed",
        "parentContextBasic",
        "parentContextDetailed",
        "parentStmtContextBasic",
        "parentStmtContextDetailed",
        "hasLiteralChild",
        "hasVariableChild",
        "hasOperatorChild",
        "nestingTotal",
        "nestingLoop",
        "nestingIf",
        "maxNestingInSameMethod",
        "nestingRatioTotal",
        "nestingRatioLoop",
        "nestingRatioIf",
        "lineRatio",
    ])
}
