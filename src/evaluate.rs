//! Intrinsic evaluation of trained model artifacts
//!
//! Every artifact found under the model root is applied to the classes it
//! held out. Predictions are written per artifact as gzip-compressed CSV;
//! per-class R² and Spearman scores go into one metrics table, and the
//! per-project median Spearman into a summary table.

use crate::dataset::{take_rows, MutantTable};
use crate::errors::{MutFeatError, MutFeatResult};
use crate::metrics::{nan_median, r2_score, spearman};
use crate::model::{Estimator, ModelKind};
use crate::observability::RunMetrics;
use crate::train::{FeatureSet, ModelArtifact, SelectionKey, TrainingSet};
use flate2::write::GzEncoder;
use flate2::Compression;
use polars::prelude::*;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const PREDICTION_COLUMN: &str = "predictedProbKillsDom";

/// Identifies one artifact: model family, feature set and training set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelTriple {
    pub model: ModelKind,
    pub features: FeatureSet,
    pub training: TrainingSet,
}

impl ModelTriple {
    /// Every combination the trainer can produce
    pub fn all() -> Vec<ModelTriple> {
        let mut out = Vec::new();
        for model in ModelKind::ALL {
            for features in FeatureSet::ALL {
                for training in TrainingSet::ALL {
                    out.push(ModelTriple {
                        model,
                        features,
                        training,
                    });
                }
            }
        }
        out
    }

    /// `<modelType>-<featuresUsed>-<trainingSet>`
    pub fn name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.model.name(),
            self.features.name(),
            self.training.name()
        )
    }

    pub fn artifact_path(&self, model_root: &Path) -> PathBuf {
        model_root.join(ModelArtifact::file_name(
            self.model,
            self.features,
            self.training,
        ))
    }
}

/// Load every artifact present under `model_root`; absent ones are skipped
pub fn load_artifacts(model_root: &Path) -> MutFeatResult<Vec<(ModelTriple, ModelArtifact)>> {
    let mut loaded = Vec::new();
    for triple in ModelTriple::all() {
        let path = triple.artifact_path(model_root);
        if !path.is_file() {
            warn!("Skipping {}", path.display());
            continue;
        }
        info!("Loading {}", path.display());
        loaded.push((triple, ModelArtifact::load(&path)?));
    }
    Ok(loaded)
}

/// Scores of one model on one held-out class
#[derive(Debug, Clone, PartialEq)]
pub struct ClassMetrics {
    pub project_id: String,
    pub bug_id: String,
    pub class_name: String,
    pub r2: f64,
    pub spearman: f64,
    pub spearman_exp_dom_nodes: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub project_id: String,
    pub bug_id: String,
    pub mutant_id: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactEvaluation {
    pub metrics: Vec<ClassMetrics>,
    pub predictions: Vec<Prediction>,
}

/// Apply every model of `artifact` to the class(es) it held out
pub fn evaluate_artifact(
    table: &MutantTable,
    artifact: &ModelArtifact,
) -> MutFeatResult<ArtifactEvaluation> {
    let mut out = ArtifactEvaluation::default();
    let mut seen = HashSet::new();

    for trained in &artifact.models {
        let project = &trained.key.project_id;
        let bug_id = &trained.key.bug_id;
        let classes = match &trained.key.selection {
            SelectionKey::Project(p) => table.classes_of(p),
            SelectionKey::Class(c) => vec![c.clone()],
        };

        for class in classes {
            if !seen.insert((project.clone(), bug_id.clone(), class.clone())) {
                return Err(MutFeatError::Precondition(format!(
                    "duplicate evaluation key ({}, {}, {})",
                    project, bug_id, class
                )));
            }

            let rows = table.select(|p, c| p == project.as_str() && c == class.as_str());
            if rows.len() >= table.len() {
                return Err(MutFeatError::Precondition(format!(
                    "evaluation subset for class {} covers the whole table",
                    class
                )));
            }

            let subset = take_rows(&table.frame, &rows)?;
            let x = artifact.mapper.transform_matrix(&subset)?;
            let preds = trained.model.predict(&x)?;

            for (&row, &p) in rows.iter().zip(&preds) {
                out.predictions.push(Prediction {
                    project_id: project.clone(),
                    bug_id: bug_id.clone(),
                    mutant_id: table.mutant_ids[row].clone(),
                    value: p,
                });
            }

            let (r2, rho, rho_exp) = if rows.len() < 2 {
                warn!(
                    "Skipping R2/Spearman for {} because fewer than 2 samples",
                    class
                );
                (f64::NAN, f64::NAN, f64::NAN)
            } else {
                let y = table.targets_at(&rows);
                let exp: Vec<f64> = rows.iter().map(|&r| table.exp_killed[r]).collect();
                (r2_score(&y, &preds), spearman(&y, &preds), spearman(&exp, &preds))
            };

            out.metrics.push(ClassMetrics {
                project_id: project.clone(),
                bug_id: bug_id.clone(),
                class_name: class,
                r2,
                spearman: rho,
                spearman_exp_dom_nodes: rho_exp,
            });
        }
    }
    Ok(out)
}

pub fn predictions_frame(predictions: &[Prediction]) -> MutFeatResult<DataFrame> {
    let columns = vec![
        Column::new(
            "projectId".into(),
            predictions.iter().map(|p| p.project_id.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "bugId".into(),
            predictions.iter().map(|p| p.bug_id.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "mutantId".into(),
            predictions.iter().map(|p| p.mutant_id.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            PREDICTION_COLUMN.into(),
            predictions.iter().map(|p| p.value).collect::<Vec<_>>(),
        ),
    ];
    Ok(DataFrame::new(columns)?)
}

/// Write `predictions-<triple>.csv.gz` into `dir`
pub fn write_predictions(
    dir: &Path,
    triple: &ModelTriple,
    predictions: &[Prediction],
) -> MutFeatResult<PathBuf> {
    if predictions.is_empty() {
        return Err(MutFeatError::Precondition(format!(
            "model {} produced no predictions",
            triple.name()
        )));
    }
    let path = dir.join(format!("predictions-{}.csv.gz", triple.name()));
    let mut df = predictions_frame(predictions)?;
    let mut encoder = GzEncoder::new(File::create(&path)?, Compression::default());
    CsvWriter::new(&mut encoder).finish(&mut df)?;
    encoder.finish()?;
    Ok(path)
}

pub fn metrics_frame(results: &[(ModelTriple, Vec<ClassMetrics>)]) -> MutFeatResult<DataFrame> {
    let rows: Vec<(&ModelTriple, &ClassMetrics)> = results
        .iter()
        .flat_map(|(t, ms)| ms.iter().map(move |m| (t, m)))
        .collect();

    let columns = vec![
        Column::new(
            "modelType".into(),
            rows.iter().map(|(t, _)| t.model.name()).collect::<Vec<_>>(),
        ),
        Column::new(
            "featuresUsed".into(),
            rows.iter().map(|(t, _)| t.features.name()).collect::<Vec<_>>(),
        ),
        Column::new(
            "trainingSet".into(),
            rows.iter().map(|(t, _)| t.training.name()).collect::<Vec<_>>(),
        ),
        Column::new(
            "projectId".into(),
            rows.iter().map(|(_, m)| m.project_id.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "bugId".into(),
            rows.iter().map(|(_, m)| m.bug_id.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "className".into(),
            rows.iter().map(|(_, m)| m.class_name.as_str()).collect::<Vec<_>>(),
        ),
        Column::new("r2Score".into(), rows.iter().map(|(_, m)| m.r2).collect::<Vec<_>>()),
        Column::new(
            "spearmans".into(),
            rows.iter().map(|(_, m)| m.spearman).collect::<Vec<_>>(),
        ),
        Column::new(
            "spearmans_exp_dom_nodes".into(),
            rows.iter()
                .map(|(_, m)| m.spearman_exp_dom_nodes)
                .collect::<Vec<_>>(),
        ),
    ];
    Ok(DataFrame::new(columns)?)
}

/// Median Spearman per `(model, project)`
pub fn summary_frame(results: &[(ModelTriple, Vec<ClassMetrics>)]) -> MutFeatResult<DataFrame> {
    let mut groups: BTreeMap<(ModelTriple, String), Vec<f64>> = BTreeMap::new();
    for (triple, metrics) in results {
        for m in metrics {
            groups
                .entry((*triple, m.project_id.clone()))
                .or_default()
                .push(m.spearman);
        }
    }

    let keys: Vec<&(ModelTriple, String)> = groups.keys().collect();
    let columns = vec![
        Column::new(
            "modelType".into(),
            keys.iter().map(|(t, _)| t.model.name()).collect::<Vec<_>>(),
        ),
        Column::new(
            "featuresUsed".into(),
            keys.iter().map(|(t, _)| t.features.name()).collect::<Vec<_>>(),
        ),
        Column::new(
            "trainingSet".into(),
            keys.iter().map(|(t, _)| t.training.name()).collect::<Vec<_>>(),
        ),
        Column::new(
            "projectId".into(),
            keys.iter().map(|(_, p)| p.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "medianSpearman".into(),
            groups.values().map(|v| nan_median(v)).collect::<Vec<_>>(),
        ),
    ];
    Ok(DataFrame::new(columns)?)
}

pub(crate) fn write_csv(path: &Path, df: &mut DataFrame) -> MutFeatResult<()> {
    let file = File::create(path)?;
    CsvWriter::new(file).finish(df)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EvaluateOptions {
    pub results_dir: PathBuf,
    pub model_root: PathBuf,
    pub predictions_dir: PathBuf,
    /// Defaults to `<predictions_dir>/metrics.csv`
    pub metrics_path: Option<PathBuf>,
}

/// Evaluate every artifact and write predictions, metrics and summary
pub fn run_evaluation(opts: &EvaluateOptions) -> MutFeatResult<Vec<(ModelTriple, Vec<ClassMetrics>)>> {
    let mut run_metrics = RunMetrics::new();
    let table = run_metrics.time("load", || MutantTable::load(&opts.results_dir))?;
    run_metrics.rows_read = table.len();
    let artifacts = load_artifacts(&opts.model_root)?;
    run_metrics.models = artifacts.len();

    let evaluated: Vec<MutFeatResult<(ModelTriple, ArtifactEvaluation)>> =
        run_metrics.time("predict", || {
            artifacts
                .par_iter()
                .map(|(triple, artifact)| -> MutFeatResult<_> {
                    Ok((*triple, evaluate_artifact(&table, artifact)?))
                })
                .collect()
        });

    std::fs::create_dir_all(&opts.predictions_dir)?;
    let mut results = Vec::with_capacity(evaluated.len());
    for item in evaluated {
        let (triple, evaluation) = item?;
        let path = write_predictions(&opts.predictions_dir, &triple, &evaluation.predictions)?;
        info!(
            "Wrote {} predictions to {}",
            evaluation.predictions.len(),
            path.display()
        );
        results.push((triple, evaluation.metrics));
    }

    let metrics_path = opts
        .metrics_path
        .clone()
        .unwrap_or_else(|| opts.predictions_dir.join("metrics.csv"));
    write_csv(&metrics_path, &mut metrics_frame(&results)?)?;
    let summary_path = metrics_path.with_file_name("spearman-summary.csv");
    write_csv(&summary_path, &mut summary_frame(&results)?)?;
    info!(
        "Wrote metrics to {} and summary to {}",
        metrics_path.display(),
        summary_path.display()
    );
    info!(
        "Evaluation finished in {:.2?}: {}",
        run_metrics.total_duration(),
        serde_json::to_string(&run_metrics)?
    );
    Ok(results)
}
