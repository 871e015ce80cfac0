//! Hold-out feature importance for the linear model
//!
//! A baseline ridge model is scored on a held-out split; each feature (or
//! feature group) is then removed from the transformed matrix by resolving its
//! column interval, the model is refitted, and the drop in test R² is averaged
//! over several random splits.

use crate::config::AnalysisConfig;
use crate::dataset::{float_column, train_test_split, TARGET_COLUMN};
use crate::errors::{MutFeatError, MutFeatResult};
use crate::mapper::FeatureMapper;
use crate::matrix::SparseMatrix;
use crate::model::{Estimator, Ridge};
use crate::resolver::{FeatureIntervalResolver, Interval};
use clap::ValueEnum;
use polars::prelude::*;
use rayon::prelude::*;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Granularity {
    /// Hold out named feature groups
    Group,
    /// Hold out one logical feature at a time
    Individual,
}

#[derive(Debug, Clone)]
pub struct AblationOptions {
    pub granularity: Granularity,
    pub samples: usize,
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for AblationOptions {
    fn default() -> Self {
        Self {
            granularity: Granularity::Group,
            samples: 5,
            test_fraction: 0.25,
            seed: 42,
        }
    }
}

/// Held-out name with the columns it covers
#[derive(Debug, Clone, PartialEq)]
pub struct HoldOut {
    pub name: String,
    pub intervals: Vec<Interval>,
}

#[derive(Debug, Clone)]
pub struct AblationReport {
    /// Baseline test R² per sample
    pub baselines: Vec<f64>,
    /// `(name, mean decrease)` sorted by decrease, largest first
    pub decreases: Vec<(String, f64)>,
}

/// Resolve the column intervals of every hold-out name
pub fn plan_hold_outs(
    df: &DataFrame,
    transformed_columns: &[String],
    config: &AnalysisConfig,
    granularity: Granularity,
) -> MutFeatResult<Vec<HoldOut>> {
    let resolver = FeatureIntervalResolver::new(config.recognized_features.clone());
    let names = match granularity {
        Granularity::Group => config.group_names(),
        Granularity::Individual => config.individual_features.clone(),
    };
    names
        .into_iter()
        .map(|name| {
            let features = config.features_of(&name);
            let intervals = resolver.resolve_many(transformed_columns, df, &features)?;
            debug!("Hold-out {} covers {:?}", name, intervals);
            Ok(HoldOut { name, intervals })
        })
        .collect()
}

fn fit_score(
    x_train: &SparseMatrix,
    y_train: &[f64],
    x_test: &SparseMatrix,
    y_test: &[f64],
) -> MutFeatResult<f64> {
    let mut ridge = Ridge::default();
    ridge.fit(x_train, y_train)?;
    ridge.score(x_test, y_test)
}

pub fn run_ablation(
    df: &DataFrame,
    config: &AnalysisConfig,
    opts: &AblationOptions,
) -> MutFeatResult<AblationReport> {
    if opts.samples == 0 {
        return Err(MutFeatError::InvalidArgs(
            "at least one sample is required".to_string(),
        ));
    }

    info!("Fitting mapper on {} rows", df.height());
    let mapper = FeatureMapper::fit(df, &config.mapper)?;
    let x = mapper.transform_matrix(df)?;
    let columns = mapper.output_names();
    let y = float_column(df, TARGET_COLUMN)?;

    let hold_outs = plan_hold_outs(df, &columns, config, opts.granularity)?;

    let mut baselines = Vec::with_capacity(opts.samples);
    let mut totals = vec![0.0; hold_outs.len()];
    for sample in 0..opts.samples {
        let (train, test) = train_test_split(
            x.n_rows(),
            opts.test_fraction,
            opts.seed.wrapping_add(sample as u64),
        );
        let x_train = x.select_rows(&train);
        let x_test = x.select_rows(&test);
        let y_train: Vec<f64> = train.iter().map(|&i| y[i]).collect();
        let y_test: Vec<f64> = test.iter().map(|&i| y[i]).collect();

        let baseline = fit_score(&x_train, &y_train, &x_test, &y_test)?;
        info!("({}) Baseline accuracy on test data: {:.6}", sample, baseline);
        baselines.push(baseline);

        let scores: Vec<MutFeatResult<f64>> = hold_outs
            .par_iter()
            .map(|h| {
                debug!("({}) Training while holding out {}", sample, h.name);
                fit_score(
                    &x_train.drop_intervals(&h.intervals),
                    &y_train,
                    &x_test.drop_intervals(&h.intervals),
                    &y_test,
                )
            })
            .collect();
        for (total, score) in totals.iter_mut().zip(scores) {
            *total += baseline - score?;
        }
    }

    let n = opts.samples as f64;
    let mut decreases: Vec<(String, f64)> = hold_outs
        .into_iter()
        .zip(totals)
        .map(|(h, total)| (h.name, total / n))
        .collect();
    decreases.sort_by(|a, b| b.1.total_cmp(&a.1));

    Ok(AblationReport {
        baselines,
        decreases,
    })
}
