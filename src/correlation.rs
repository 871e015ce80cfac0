//! How well one feature's columns predict another's
//!
//! Both features are located in the transformed matrix through the resolver.
//! Each column of the dependent feature is regressed on all columns of the
//! independent feature and the test R² is reported per column.

use crate::config::AnalysisConfig;
use crate::dataset::train_test_split;
use crate::errors::MutFeatResult;
use crate::mapper::FeatureMapper;
use crate::model::{Estimator, Ridge};
use crate::resolver::{FeatureIntervalResolver, Interval};
use polars::prelude::*;
use tracing::info;

#[derive(Debug, Clone)]
pub struct CorrelationReport {
    pub independent: Interval,
    pub dependent: Interval,
    pub train_size: usize,
    pub test_size: usize,
    /// `(dependent column name, test R²)`
    pub scores: Vec<(String, f64)>,
}

pub fn correlate(
    df: &DataFrame,
    config: &AnalysisConfig,
    independent: &str,
    dependent: &str,
    test_fraction: f64,
    seed: u64,
) -> MutFeatResult<CorrelationReport> {
    let mapper = FeatureMapper::fit(df, &config.mapper)?;
    let x = mapper.transform_matrix(df)?;
    let columns = mapper.output_names();

    let resolver = FeatureIntervalResolver::new(config.recognized_features.clone());
    let intervals = resolver.resolve_many(&columns, df, &[independent, dependent])?;
    let (ind, dep) = (intervals[0], intervals[1]);
    info!(
        "Using {} {} to predict values for {} {}",
        independent, ind, dependent, dep
    );

    let (train, test) = train_test_split(x.n_rows(), test_fraction, seed);
    let x_ind = x.slice_interval(ind);
    let x_train = x_ind.select_rows(&train);
    let x_test = x_ind.select_rows(&test);

    let mut scores = Vec::with_capacity(dep.len());
    for j in dep.range() {
        let values = x.dense_column(j);
        let y_train: Vec<f64> = train.iter().map(|&i| values[i]).collect();
        let y_test: Vec<f64> = test.iter().map(|&i| values[i]).collect();

        let mut ridge = Ridge::default();
        ridge.fit(&x_train, &y_train)?;
        scores.push((columns[j].clone(), ridge.score(&x_test, &y_test)?));
    }

    Ok(CorrelationReport {
        independent: ind,
        dependent: dep,
        train_size: train.len(),
        test_size: test.len(),
        scores,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupSpec, GroupTransform, MapperConfig};

    fn config() -> AnalysisConfig {
        AnalysisConfig {
            mapper: MapperConfig {
                groups: vec![GroupSpec::new(&["op", "group", "ctx"], GroupTransform::OneHot)],
            },
            recognized_features: vec!["op".into(), "group".into(), "ctx".into()],
            ..Default::default()
        }
    }

    fn data() -> DataFrame {
        let n = 50;
        // group is a function of op; ctx is unrelated
        let op: Vec<&str> = (0..n).map(|i| ["AOR", "ROR", "LVR", "SBR"][i % 4]).collect();
        let group: Vec<&str> = op
            .iter()
            .map(|o| if *o == "AOR" || *o == "ROR" { "arith" } else { "other" })
            .collect();
        let ctx: Vec<&str> = (0..n).map(|i| ["If", "Return"][(i / 3) % 2]).collect();
        df! {
            "op" => op,
            "group" => group,
            "ctx" => ctx,
        }
        .unwrap()
    }

    #[test]
    fn test_dependent_feature_is_predictable() {
        let report = correlate(&data(), &config(), "op", "group", 0.2, 42).unwrap();
        assert_eq!(report.independent, Interval::new(0, 4));
        assert_eq!(report.dependent, Interval::new(4, 6));
        assert_eq!(report.test_size, 10);
        assert_eq!(report.scores.len(), 2);
        assert_eq!(report.scores[0].0, "op_group_ctx_4");
        for (_, r2) in &report.scores {
            assert!(*r2 > 0.9);
        }
    }

    #[test]
    fn test_unknown_feature_fails() {
        assert!(correlate(&data(), &config(), "op", "nope", 0.2, 42).is_err());
    }
}
