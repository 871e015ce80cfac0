//! Regression models for kill-difficulty prediction
//!
//! Both estimators train on the sparse mapper output. Ridge solves the
//! centred normal equations with conjugate gradients; the random forest grows
//! shallow variance-reduction trees on bootstrap samples.

use crate::errors::{MutFeatError, MutFeatResult};
use crate::matrix::SparseMatrix;
use crate::metrics::r2_score;
use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub trait Estimator {
    fn fit(&mut self, x: &SparseMatrix, y: &[f64]) -> MutFeatResult<()>;

    fn predict(&self, x: &SparseMatrix) -> MutFeatResult<Vec<f64>>;

    /// R² of the predictions on `x` against `y`
    fn score(&self, x: &SparseMatrix, y: &[f64]) -> MutFeatResult<f64> {
        let pred = self.predict(x)?;
        Ok(r2_score(y, &pred))
    }
}

fn check_shape(x: &SparseMatrix, y: &[f64]) -> MutFeatResult<()> {
    if x.n_rows() != y.len() {
        return Err(MutFeatError::ModelError(format!(
            "feature matrix has {} rows but target has {} values",
            x.n_rows(),
            y.len()
        )));
    }
    if y.is_empty() {
        return Err(MutFeatError::ModelError("cannot fit on zero samples".to_string()));
    }
    if !x.all_finite() {
        return Err(MutFeatError::ModelError(
            "feature matrix contains NaN or infinite values".to_string(),
        ));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(MutFeatError::ModelError(
            "target contains NaN or infinite values".to_string(),
        ));
    }
    Ok(())
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ridge {
    pub alpha: f64,
    pub tol: f64,
    pub max_iter: usize,
    #[serde(default)]
    pub coef: Vec<f64>,
    #[serde(default)]
    pub intercept: f64,
}

impl Default for Ridge {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            tol: 1e-5,
            max_iter: 1000,
            coef: Vec::new(),
            intercept: 0.0,
        }
    }
}

impl Ridge {
    /// `(Xcᵀ Xc + αI) v` where `Xc` is `x` with column means `mu` removed
    fn normal_op(&self, x: &SparseMatrix, mu: &[f64], v: &[f64]) -> Vec<f64> {
        let shift = dot(mu, v);
        let xcv: Vec<f64> = x.mul_vec(v).into_iter().map(|e| e - shift).collect();
        let total: f64 = xcv.iter().sum();
        let mut out = x.t_mul_vec(&xcv);
        for ((o, m), vj) in out.iter_mut().zip(mu).zip(v) {
            *o += self.alpha * vj - m * total;
        }
        out
    }
}

impl Estimator for Ridge {
    fn fit(&mut self, x: &SparseMatrix, y: &[f64]) -> MutFeatResult<()> {
        check_shape(x, y)?;
        let n_features = x.n_cols();
        let mu = x.column_means();
        let y_mean = y.iter().sum::<f64>() / y.len() as f64;
        let yc: Vec<f64> = y.iter().map(|v| v - y_mean).collect();

        // Centred right-hand side; the mean correction vanishes since Σ yc = 0
        let b = x.t_mul_vec(&yc);
        let mut w = vec![0.0; n_features];
        let mut r = b.clone();
        let mut p = r.clone();
        let mut rs = dot(&r, &r);
        let tol = self.tol * rs.sqrt();

        let mut iterations = 0;
        while rs.sqrt() > tol && iterations < self.max_iter {
            let ap = self.normal_op(x, &mu, &p);
            let step = rs / dot(&p, &ap);
            for j in 0..n_features {
                w[j] += step * p[j];
                r[j] -= step * ap[j];
            }
            let rs_new = dot(&r, &r);
            let beta = rs_new / rs;
            for j in 0..n_features {
                p[j] = r[j] + beta * p[j];
            }
            rs = rs_new;
            iterations += 1;
        }
        debug!(
            "Ridge converged after {} iterations (residual {:.3e})",
            iterations,
            rs.sqrt()
        );

        self.intercept = y_mean - dot(&mu, &w);
        self.coef = w;
        Ok(())
    }

    fn predict(&self, x: &SparseMatrix) -> MutFeatResult<Vec<f64>> {
        if x.n_cols() != self.coef.len() {
            return Err(MutFeatError::ModelError(format!(
                "model expects {} features, got {}",
                self.coef.len(),
                x.n_cols()
            )));
        }
        Ok(x
            .mul_vec(&self.coef)
            .into_iter()
            .map(|v| v + self.intercept)
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RegressionTree {
    pub nodes: Vec<TreeNode>,
}

struct SplitCandidate {
    feature: usize,
    threshold: f64,
    gain: f64,
}

struct GrowContext<'a> {
    x: &'a SparseMatrix,
    y: &'a [f64],
    max_depth: usize,
}

/// Load column `feature` into `scratch`, run `f`, then zero it again
fn with_column<T>(
    x: &SparseMatrix,
    feature: usize,
    scratch: &mut [f64],
    f: impl FnOnce(&[f64]) -> T,
) -> T {
    for (row, v) in x.column(feature) {
        scratch[row] = v;
    }
    let out = f(scratch);
    for (row, _) in x.column(feature) {
        scratch[row] = 0.0;
    }
    out
}

fn sse(sum: f64, sq: f64, n: f64) -> f64 {
    sq - sum * sum / n
}

fn best_split(ctx: &GrowContext<'_>, samples: &[usize], scratch: &mut [f64]) -> Option<SplitCandidate> {
    let n = samples.len() as f64;
    let total: f64 = samples.iter().map(|&s| ctx.y[s]).sum();
    let total_sq: f64 = samples.iter().map(|&s| ctx.y[s] * ctx.y[s]).sum();
    let parent = sse(total, total_sq, n);

    let mut best: Option<SplitCandidate> = None;
    let mut pairs: Vec<(f64, f64)> = Vec::with_capacity(samples.len());

    for feature in 0..ctx.x.n_cols() {
        if ctx.x.column(feature).next().is_none() {
            continue;
        }
        pairs.clear();
        with_column(ctx.x, feature, scratch, |col| {
            pairs.extend(samples.iter().map(|&s| (col[s], ctx.y[s])));
        });
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let (mut left_sum, mut left_sq) = (0.0, 0.0);
        for i in 0..pairs.len() - 1 {
            let (v, t) = pairs[i];
            left_sum += t;
            left_sq += t * t;
            let next = pairs[i + 1].0;
            if next <= v {
                continue;
            }
            let left_n = (i + 1) as f64;
            let gain = parent
                - sse(left_sum, left_sq, left_n)
                - sse(total - left_sum, total_sq - left_sq, n - left_n);
            if gain > 1e-12 && best.as_ref().map_or(true, |b| gain > b.gain) {
                best = Some(SplitCandidate {
                    feature,
                    threshold: (v + next) / 2.0,
                    gain,
                });
            }
        }
    }
    best
}

impl RegressionTree {
    fn grow(
        &mut self,
        ctx: &GrowContext<'_>,
        samples: &[usize],
        depth: usize,
        scratch: &mut [f64],
    ) -> usize {
        let value = samples.iter().map(|&s| ctx.y[s]).sum::<f64>() / samples.len() as f64;
        let idx = self.nodes.len();
        self.nodes.push(TreeNode::Leaf { value });

        if depth >= ctx.max_depth || samples.len() < 2 {
            return idx;
        }
        let Some(split) = best_split(ctx, samples, scratch) else {
            return idx;
        };

        let (left_samples, right_samples): (Vec<usize>, Vec<usize>) =
            with_column(ctx.x, split.feature, scratch, |col| {
                samples.iter().partition(|&&s| col[s] <= split.threshold)
            });

        let left = self.grow(ctx, &left_samples, depth + 1, scratch);
        let right = self.grow(ctx, &right_samples, depth + 1, scratch);
        self.nodes[idx] = TreeNode::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        idx
    }

    fn predict_row(&self, row: &[(usize, f64)]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let v = row
                        .binary_search_by_key(feature, |(c, _)| *c)
                        .map(|i| row[i].1)
                        .unwrap_or(0.0);
                    idx = if v <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub seed: u64,
    #[serde(default)]
    pub n_features: usize,
    #[serde(default)]
    pub trees: Vec<RegressionTree>,
}

impl RandomForest {
    pub fn new(n_estimators: usize, max_depth: usize, seed: u64) -> Self {
        Self {
            n_estimators,
            max_depth,
            seed,
            n_features: 0,
            trees: Vec::new(),
        }
    }
}

impl Default for RandomForest {
    fn default() -> Self {
        Self::new(10, 3, 42)
    }
}

impl Estimator for RandomForest {
    fn fit(&mut self, x: &SparseMatrix, y: &[f64]) -> MutFeatResult<()> {
        check_shape(x, y)?;
        let n = y.len();
        let ctx = GrowContext {
            x,
            y,
            max_depth: self.max_depth,
        };
        let mut scratch = vec![0.0; n];

        self.trees.clear();
        for t in 0..self.n_estimators {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(t as u64));
            let samples: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let mut tree = RegressionTree::default();
            tree.grow(&ctx, &samples, 0, &mut scratch);
            debug!("Tree {} grown with {} nodes", t, tree.nodes.len());
            self.trees.push(tree);
        }
        self.n_features = x.n_cols();
        Ok(())
    }

    fn predict(&self, x: &SparseMatrix) -> MutFeatResult<Vec<f64>> {
        if self.trees.is_empty() {
            return Err(MutFeatError::ModelError("random forest is not fitted".to_string()));
        }
        if x.n_cols() != self.n_features {
            return Err(MutFeatError::ModelError(format!(
                "model expects {} features, got {}",
                self.n_features,
                x.n_cols()
            )));
        }
        let n_trees = self.trees.len() as f64;
        Ok(x
            .rows()
            .iter()
            .map(|row| self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>() / n_trees)
            .collect())
    }
}

/// Estimator families selectable from the command line
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Linear,
    #[value(name = "randomforest")]
    #[serde(rename = "randomforest")]
    RandomForest,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Linear, ModelKind::RandomForest];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Linear => "linear",
            ModelKind::RandomForest => "randomforest",
        }
    }

    pub fn build(&self, seed: u64) -> Model {
        match self {
            ModelKind::Linear => Model::Ridge(Ridge::default()),
            ModelKind::RandomForest => Model::RandomForest(RandomForest::new(10, 3, seed)),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A fitted (or fittable) model of either family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Model {
    Ridge(Ridge),
    RandomForest(RandomForest),
}

impl Estimator for Model {
    fn fit(&mut self, x: &SparseMatrix, y: &[f64]) -> MutFeatResult<()> {
        match self {
            Model::Ridge(m) => m.fit(x, y),
            Model::RandomForest(m) => m.fit(x, y),
        }
    }

    fn predict(&self, x: &SparseMatrix) -> MutFeatResult<Vec<f64>> {
        match self {
            Model::Ridge(m) => m.predict(x),
            Model::RandomForest(m) => m.predict(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_data() -> (SparseMatrix, Vec<f64>) {
        // y = 2 a - b + 3
        let a = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let b = vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let y: Vec<f64> = a.iter().zip(&b).map(|(a, b)| 2.0 * a - b + 3.0).collect();
        (SparseMatrix::from_dense_columns(6, &[a, b]), y)
    }

    #[test]
    fn test_ridge_small_alpha_recovers_coefficients() {
        let (x, y) = linear_data();
        let mut ridge = Ridge {
            alpha: 1e-8,
            tol: 1e-10,
            ..Default::default()
        };
        ridge.fit(&x, &y).unwrap();
        assert!((ridge.coef[0] - 2.0).abs() < 1e-4);
        assert!((ridge.coef[1] + 1.0).abs() < 1e-4);
        assert!((ridge.intercept - 3.0).abs() < 1e-4);
        assert!(ridge.score(&x, &y).unwrap() > 0.9999);
    }

    #[test]
    fn test_ridge_penalty_shrinks() {
        let (x, y) = linear_data();
        let mut weak = Ridge::default();
        let mut strong = Ridge {
            alpha: 100.0,
            ..Default::default()
        };
        weak.fit(&x, &y).unwrap();
        strong.fit(&x, &y).unwrap();
        assert!(strong.coef[0].abs() < weak.coef[0].abs());
    }

    #[test]
    fn test_ridge_rejects_shape_mismatch() {
        let (x, _) = linear_data();
        let mut ridge = Ridge::default();
        assert!(matches!(
            ridge.fit(&x, &[1.0, 2.0]),
            Err(MutFeatError::ModelError(_))
        ));
    }

    #[test]
    fn test_fit_rejects_missing_values() {
        let a = vec![0.0, 1.0, f64::NAN, 3.0, 4.0, 5.0];
        let x = SparseMatrix::from_dense_columns(6, &[a]);
        let y = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut ridge = Ridge::default();
        assert!(matches!(ridge.fit(&x, &y), Err(MutFeatError::ModelError(_))));
        let mut forest = RandomForest::default();
        assert!(matches!(forest.fit(&x, &y), Err(MutFeatError::ModelError(_))));

        let (x, mut y) = linear_data();
        y[0] = f64::INFINITY;
        assert!(matches!(ridge.fit(&x, &y), Err(MutFeatError::ModelError(_))));
    }

    #[test]
    fn test_forest_learns_step() {
        let a: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = a.iter().map(|v| if *v < 10.0 { 0.0 } else { 1.0 }).collect();
        let x = SparseMatrix::from_dense_columns(20, &[a]);

        let mut forest = RandomForest::new(5, 2, 7);
        forest.fit(&x, &y).unwrap();
        let pred = forest.predict(&x).unwrap();
        assert!(pred[0] < 0.3);
        assert!(pred[19] > 0.7);
        assert_eq!(forest.trees.len(), 5);
    }

    #[test]
    fn test_forest_is_deterministic_per_seed() {
        let (x, y) = linear_data();
        let mut a = RandomForest::new(3, 3, 11);
        let mut b = RandomForest::new(3, 3, 11);
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_model_serde_round_trip() {
        let (x, y) = linear_data();
        let mut model = ModelKind::Linear.build(0);
        model.fit(&x, &y).unwrap();
        let json = serde_json::to_string(&model).unwrap();
        let back: Model = serde_json::from_str(&json).unwrap();
        assert_eq!(model, back);
        assert!(json.contains("\"type\":\"ridge\""));
    }

    #[test]
    fn test_model_kind_names() {
        assert_eq!(ModelKind::RandomForest.to_string(), "randomforest");
        assert_eq!(
            ModelKind::from_str("randomforest", false).unwrap(),
            ModelKind::RandomForest
        );
        assert!(ModelKind::from_str("svm", false).is_err());
    }
}
