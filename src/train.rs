//! Per-class and per-project model training
//!
//! One mapper is fitted on the whole covered table. Each job then trains a
//! model on a strict subset of the rows: everything except one held-out class
//! (optionally restricted to that class's project), or everything except one
//! held-out project. Jobs run on a dedicated rayon pool and are collected in
//! full before the artifact is written.

use crate::config::{AnalysisConfig, MapperConfig};
use crate::dataset::{discover_mutant_csvs, MutantTable};
use crate::errors::{MutFeatError, MutFeatResult};
use crate::mapper::{FeatureMapper, FittedMapper};
use crate::matrix::SparseMatrix;
use crate::model::{Estimator, Model, ModelKind};
use crate::observability::{Lineage, RunMetrics};
use anyhow::anyhow;
use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CPUS_ENV: &str = "TRAIN_MODEL_CPUS";

/// Which mapper preset the models are trained on
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize,
)]
pub enum FeatureSet {
    /// Every mutant feature
    #[value(name = "all")]
    #[serde(rename = "all_features")]
    All,
    /// Mutation operator and parent statement context only
    #[value(name = "small")]
    #[serde(rename = "few_features")]
    Small,
}

impl FeatureSet {
    pub const ALL: [FeatureSet; 2] = [FeatureSet::All, FeatureSet::Small];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureSet::All => "all_features",
            FeatureSet::Small => "few_features",
        }
    }

    pub fn mapper_config(&self, config: &AnalysisConfig) -> MapperConfig {
        match self {
            FeatureSet::All => config.mapper.clone(),
            FeatureSet::Small => config.small_mapper.clone(),
        }
    }

    /// Worker count when the environment does not say; 0 means all cores
    fn default_workers(&self) -> usize {
        match self {
            FeatureSet::All => 8,
            FeatureSet::Small => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingSet {
    AllProjects,
    ProjectOnly,
    BetweenProjects,
}

impl TrainingSet {
    pub const ALL: [TrainingSet; 3] = [
        TrainingSet::AllProjects,
        TrainingSet::ProjectOnly,
        TrainingSet::BetweenProjects,
    ];

    pub fn from_flags(project_only: bool, between_projects: bool) -> MutFeatResult<Self> {
        match (project_only, between_projects) {
            (true, true) => Err(MutFeatError::InvalidArgs(
                "--project-only and --between-projects cannot be combined".to_string(),
            )),
            (true, false) => Ok(TrainingSet::ProjectOnly),
            (false, true) => Ok(TrainingSet::BetweenProjects),
            (false, false) => Ok(TrainingSet::AllProjects),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrainingSet::AllProjects => "all_projects",
            TrainingSet::ProjectOnly => "project_only",
            TrainingSet::BetweenProjects => "between_projects",
        }
    }
}

/// What a model was held out from: one class or one whole project
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "RawSelectionKey")]
pub enum SelectionKey {
    Class(String),
    Project(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaggedSelectionKey {
    Class(String),
    Project(String),
}

// Older artifacts stored the held-out class as a bare string
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSelectionKey {
    Tagged(TaggedSelectionKey),
    Legacy(String),
}

impl From<RawSelectionKey> for SelectionKey {
    fn from(raw: RawSelectionKey) -> Self {
        match raw {
            RawSelectionKey::Tagged(TaggedSelectionKey::Class(c)) => SelectionKey::Class(c),
            RawSelectionKey::Tagged(TaggedSelectionKey::Project(p)) => SelectionKey::Project(p),
            RawSelectionKey::Legacy(c) => SelectionKey::Class(c),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub project_id: String,
    pub bug_id: String,
    pub selection: SelectionKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub key: ModelKey,
    pub model: Model,
}

/// Everything `evaluate` needs: the fitted mapper and one model per job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_type: ModelKind,
    pub features_used: FeatureSet,
    pub training_set: TrainingSet,
    pub mapper: FittedMapper,
    pub models: Vec<TrainedModel>,
    pub lineage: Lineage,
}

impl ModelArtifact {
    /// `model-<modelType>-<featuresUsed>-<trainingSet>.json`
    pub fn file_name(model: ModelKind, features: FeatureSet, training: TrainingSet) -> String {
        format!(
            "model-{}-{}-{}.json",
            model.name(),
            features.name(),
            training.name()
        )
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> MutFeatResult<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> MutFeatResult<Self> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub model: ModelKind,
    pub features: FeatureSet,
    pub training_set: TrainingSet,
    pub results_dir: PathBuf,
    pub out: PathBuf,
    pub seed: u64,
}

#[derive(Debug, Clone)]
enum Job {
    HeldOutClass { project: String, class: String },
    HeldOutProject { project: String },
}

impl Job {
    fn project(&self) -> &str {
        match self {
            Job::HeldOutClass { project, .. } | Job::HeldOutProject { project } => project,
        }
    }

    fn selection(&self) -> SelectionKey {
        match self {
            Job::HeldOutClass { class, .. } => SelectionKey::Class(class.clone()),
            Job::HeldOutProject { project } => SelectionKey::Project(project.clone()),
        }
    }

    /// Training rows for this job
    fn rows(&self, table: &MutantTable, training_set: TrainingSet) -> Vec<usize> {
        match self {
            Job::HeldOutClass { project, class } => table.select(|p, c| {
                c != class.as_str()
                    && (training_set != TrainingSet::ProjectOnly || p == project.as_str())
            }),
            Job::HeldOutProject { project } => table.select(|p, _| p != project.as_str()),
        }
    }
}

fn plan_jobs(table: &MutantTable, training_set: TrainingSet) -> Vec<Job> {
    match training_set {
        TrainingSet::BetweenProjects => table
            .projects()
            .into_iter()
            .map(|project| Job::HeldOutProject { project })
            .collect(),
        _ => table
            .project_classes()
            .into_iter()
            .map(|(project, class)| Job::HeldOutClass { project, class })
            .collect(),
    }
}

/// Pool size from `TRAIN_MODEL_CPUS`; a non-positive value means all cores
pub fn worker_count(features: FeatureSet, env_value: Option<&str>) -> MutFeatResult<usize> {
    match env_value {
        None => Ok(features.default_workers()),
        Some(raw) => {
            let n: i64 = raw.trim().parse().map_err(|_| {
                MutFeatError::InvalidArgs(format!("{} must be an integer, got '{}'", CPUS_ENV, raw))
            })?;
            Ok(if n <= 0 { 0 } else { n as usize })
        }
    }
}

fn fit_job(
    table: &MutantTable,
    x_all: &SparseMatrix,
    job: &Job,
    opts: &TrainOptions,
    job_index: usize,
) -> MutFeatResult<TrainedModel> {
    let project = job.project();
    let bug_id = table.bug_id_of(project)?;

    let rows: Vec<usize> = job
        .rows(table, opts.training_set)
        .into_iter()
        .filter(|&r| !table.target[r].is_nan())
        .collect();
    if rows.is_empty() {
        return Err(MutFeatError::Precondition(format!(
            "no training rows for {:?}",
            job.selection()
        )));
    }
    if rows.len() >= table.len() {
        return Err(MutFeatError::Precondition(format!(
            "training set for {:?} is not a strict subset of the data",
            job.selection()
        )));
    }

    let x = x_all.select_rows(&rows);
    let y = table.targets_at(&rows);
    let mut model = opts.model.build(opts.seed.wrapping_add(job_index as u64));
    model.fit(&x, &y)?;
    debug!(
        "Trained {} for {:?} on {} rows",
        opts.model,
        job.selection(),
        rows.len()
    );

    Ok(TrainedModel {
        key: ModelKey {
            project_id: project.to_string(),
            bug_id,
            selection: job.selection(),
        },
        model,
    })
}

/// Train every job and return the assembled artifact (not yet saved)
pub fn train_models(
    opts: &TrainOptions,
    config: &AnalysisConfig,
    run_id: &str,
    metrics: &mut RunMetrics,
) -> MutFeatResult<ModelArtifact> {
    let paths = discover_mutant_csvs(&opts.results_dir)?;
    let table = metrics.time("load", || MutantTable::load_paths(&paths))?;
    metrics.rows_read = table.len();

    let mapper_config = opts.features.mapper_config(config);
    let (mapper, x_all) = metrics.time("map", || -> MutFeatResult<_> {
        let mapper = FeatureMapper::fit(&table.frame, &mapper_config)?;
        let x = mapper.transform_matrix(&table.frame)?;
        Ok((mapper, x))
    })?;
    info!(
        "Mapped {} mutants to {} columns ({} non-zero)",
        x_all.n_rows(),
        x_all.n_cols(),
        x_all.nnz()
    );

    let jobs = plan_jobs(&table, opts.training_set);
    let workers = worker_count(opts.features, std::env::var(CPUS_ENV).ok().as_deref())?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| anyhow!("Failed to build worker pool: {}", e))?;
    info!(
        "Training {} models on {} workers",
        jobs.len(),
        pool.current_num_threads()
    );

    let pb = ProgressBar::new(jobs.len() as u64);
    if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} models ({eta})") {
        pb.set_style(style);
    }

    let results: Vec<MutFeatResult<TrainedModel>> = metrics.time("train", || {
        pool.install(|| {
            jobs.par_iter()
                .enumerate()
                .map(|(i, job)| {
                    let out = fit_job(&table, &x_all, job, opts, i);
                    pb.inc(1);
                    out
                })
                .collect()
        })
    });
    pb.finish_and_clear();

    let models = results.into_iter().collect::<MutFeatResult<Vec<_>>>()?;
    metrics.models = models.len();

    Ok(ModelArtifact {
        model_type: opts.model,
        features_used: opts.features,
        training_set: opts.training_set,
        mapper,
        models,
        lineage: Lineage::capture(run_id, &paths)?,
    })
}

/// Train and write the artifact to `opts.out`
pub fn run_training(
    opts: &TrainOptions,
    config: &AnalysisConfig,
    run_id: &str,
) -> MutFeatResult<ModelArtifact> {
    let mut metrics = RunMetrics::new();
    let artifact = train_models(opts, config, run_id, &mut metrics)?;

    info!("Writing to: {}", opts.out.display());
    metrics.time("write", || artifact.save(&opts.out))?;
    info!(
        "Training finished in {:.2?}: {}",
        metrics.total_duration(),
        serde_json::to_string(&metrics)?
    );
    Ok(artifact)
}
