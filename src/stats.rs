//! Per-project statistics of a results directory
//!
//! Walks `<results>/<project>/<version>/`, reading the mutant table, kill map
//! and test map of every subject. Class and mutant counts are reported over
//! all mutants and over covered ones; the dominator, killed and equivalent
//! percentages and the average covering/killing test counts are taken over
//! covered mutants only.

use crate::dataset::{
    flag_column, float_column, read_csv, string_column, CLASS_COLUMN, COVERED_COLUMN,
    MUTANTS_SUFFIX, MUTANT_COLUMN, PROJECT_COLUMN,
};
use crate::errors::{MutFeatError, MutFeatResult};
use crate::evaluate::write_csv;
use crate::observability::RunMetrics;
use polars::prelude::*;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const KILL_MAP: &str = "killMap.csv";
pub const TEST_MAP: &str = "testMap.csv";
const STATUS_COLUMN: &str = "[FAIL | TIME | EXC]";
const TIMEOUT_STATUS: &str = "TIME";
const IGNORED_PROJECT_DIRS: [&str; 1] = ["simulations"];
const LOG_NAMES: [&str; 3] = ["log", "log.gz", "log.zip"];

pub const TOTAL_LABEL: &str = "Total";

fn list_dirs(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect()
}

fn only_log_or_empty(dir: &Path) -> MutFeatResult<bool> {
    let entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    Ok(match entries.as_slice() {
        [] => true,
        [only] => {
            let name = only.file_name().to_string_lossy().to_lowercase();
            LOG_NAMES.contains(&name.as_str())
        }
        _ => false,
    })
}

/// Version directories holding one subject each.
///
/// Hidden and `simulations` project directories are ignored, as are version
/// directories that are empty or hold nothing but a log. Each project may
/// contribute at most one subject, and that subject must have a kill map.
pub fn walk_subject_dirs<P: AsRef<Path>>(root: P) -> MutFeatResult<Vec<PathBuf>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(MutFeatError::InvalidArgs(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut subjects = Vec::new();
    for project_dir in list_dirs(root) {
        let name = project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.starts_with('.') || IGNORED_PROJECT_DIRS.contains(&name.as_str()) {
            debug!("Ignoring {}", project_dir.display());
            continue;
        }

        let mut found: Option<PathBuf> = None;
        for version_dir in list_dirs(&project_dir) {
            if only_log_or_empty(&version_dir)? {
                debug!("Skipping {}: empty or log only", version_dir.display());
                continue;
            }
            if found.is_some() {
                return Err(MutFeatError::Precondition(format!(
                    "expected one version directory in {}",
                    project_dir.display()
                )));
            }
            let kill_map = version_dir.join(KILL_MAP);
            if !kill_map.is_file() {
                return Err(MutFeatError::Precondition(format!(
                    "expected file to exist: {}",
                    kill_map.display()
                )));
            }
            found = Some(version_dir);
        }
        subjects.extend(found);
    }

    if subjects.is_empty() {
        return Err(MutFeatError::Precondition(format!(
            "No subject directories found in {}",
            root.display()
        )));
    }
    Ok(subjects)
}

/// One `<project>/<version>` directory, read
#[derive(Debug, Clone)]
pub struct Subject {
    pub project_id: String,
    pub mutants: DataFrame,
    pub tests: usize,
    pub timeouts: usize,
    pub mutant_test_pairs: usize,
}

pub fn read_subject(dir: &Path) -> MutFeatResult<Subject> {
    let mutants = read_csv(dir.join(MUTANTS_SUFFIX))?.collect()?;
    let project_id = string_column(&mutants, PROJECT_COLUMN)?
        .into_iter()
        .next()
        .ok_or_else(|| MutFeatError::Precondition(format!("{} has no mutants", dir.display())))?;

    let tests = read_csv(dir.join(TEST_MAP))?.collect()?.height();
    let kill_map = read_csv(dir.join(KILL_MAP))?.collect()?;
    let timeouts = string_column(&kill_map, STATUS_COLUMN)?
        .iter()
        .filter(|s| s.as_str() == TIMEOUT_STATUS)
        .count();

    Ok(Subject {
        project_id,
        mutants,
        tests,
        timeouts,
        mutant_test_pairs: kill_map.height(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectStats {
    pub project_id: String,
    pub all_class_count: usize,
    pub all_mutant_count: usize,
    pub class_count: usize,
    pub mutant_count: usize,
    pub equivalent_pct: f64,
    pub dominator_pct: f64,
    pub killed_pct: f64,
    pub total_tests: usize,
    pub avg_tests_covering: f64,
    pub avg_tests_killing: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStats {
    pub projects: usize,
    pub classes: usize,
    pub timeouts: usize,
    pub mutant_test_pairs: usize,
    pub pct_pairs_timed_out: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    pub projects: Vec<ProjectStats>,
    pub total: ProjectStats,
    pub run: RunStats,
}

struct MutantRows {
    projects: Vec<String>,
    classes: Vec<String>,
    mutants: Vec<String>,
    covered: Vec<bool>,
    dominator: Vec<bool>,
    killed: Vec<bool>,
    covering: Vec<f64>,
    killing: Vec<f64>,
}

impl MutantRows {
    fn from_frame(df: &DataFrame) -> MutFeatResult<Self> {
        Ok(Self {
            projects: string_column(df, PROJECT_COLUMN)?,
            classes: string_column(df, CLASS_COLUMN)?,
            mutants: string_column(df, MUTANT_COLUMN)?,
            covered: flag_column(df, COVERED_COLUMN)?,
            dominator: flag_column(df, "isDominator")?,
            killed: flag_column(df, "isKilled")?,
            covering: float_column(df, "coveringTests")?,
            killing: float_column(df, "killingTests")?,
        })
    }

    fn summarize(&self, label: &str, all: &[usize], total_tests: usize) -> ProjectStats {
        let covered: Vec<usize> = all.iter().copied().filter(|&r| self.covered[r]).collect();
        let killed_pct = 100.0 * flag_rate(&covered, &self.killed);
        ProjectStats {
            project_id: label.to_string(),
            all_class_count: distinct(all, &self.classes),
            all_mutant_count: distinct(all, &self.mutants),
            class_count: distinct(&covered, &self.classes),
            mutant_count: distinct(&covered, &self.mutants),
            equivalent_pct: 100.0 - killed_pct,
            dominator_pct: 100.0 * flag_rate(&covered, &self.dominator),
            killed_pct,
            total_tests,
            avg_tests_covering: mean_at(&covered, &self.covering),
            avg_tests_killing: mean_at(&covered, &self.killing),
        }
    }
}

fn distinct(rows: &[usize], values: &[String]) -> usize {
    rows.iter()
        .map(|&r| values[r].as_str())
        .collect::<HashSet<_>>()
        .len()
}

fn flag_rate(rows: &[usize], flags: &[bool]) -> f64 {
    if rows.is_empty() {
        return f64::NAN;
    }
    rows.iter().filter(|&&r| flags[r]).count() as f64 / rows.len() as f64
}

/// Mean skipping missing values
fn mean_at(rows: &[usize], values: &[f64]) -> f64 {
    let present: Vec<f64> = rows
        .iter()
        .map(|&r| values[r])
        .filter(|v| !v.is_nan())
        .collect();
    if present.is_empty() {
        return f64::NAN;
    }
    present.iter().sum::<f64>() / present.len() as f64
}

pub fn compute_stats(subjects: &[Subject]) -> MutFeatResult<StatsReport> {
    let frames: Vec<LazyFrame> = subjects.iter().map(|s| s.mutants.clone().lazy()).collect();
    let args = UnionArgs {
        to_supertypes: true,
        ..Default::default()
    };
    let df = concat(frames, args)?.collect()?;
    let rows = MutantRows::from_frame(&df)?;

    let mut tests_per_project: BTreeMap<&str, usize> = BTreeMap::new();
    for s in subjects {
        *tests_per_project.entry(s.project_id.as_str()).or_default() += s.tests;
    }

    let mut by_project: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, p) in rows.projects.iter().enumerate() {
        by_project.entry(p.as_str()).or_default().push(i);
    }

    let projects: Vec<ProjectStats> = by_project
        .iter()
        .map(|(p, all)| {
            let tests = tests_per_project.get(p).copied().unwrap_or(0);
            rows.summarize(p, all, tests)
        })
        .collect();

    // Counts add up per project; rates are over every covered mutant
    let every_row: Vec<usize> = (0..df.height()).collect();
    let total_tests = projects.iter().map(|p| p.total_tests).sum();
    let mut total = rows.summarize(TOTAL_LABEL, &every_row, total_tests);
    total.all_class_count = projects.iter().map(|p| p.all_class_count).sum();
    total.all_mutant_count = projects.iter().map(|p| p.all_mutant_count).sum();
    total.class_count = projects.iter().map(|p| p.class_count).sum();
    total.mutant_count = projects.iter().map(|p| p.mutant_count).sum();

    let timeouts: usize = subjects.iter().map(|s| s.timeouts).sum();
    let pairs: usize = subjects.iter().map(|s| s.mutant_test_pairs).sum();
    let run = RunStats {
        projects: subjects.len(),
        classes: distinct(&every_row, &rows.classes),
        timeouts,
        mutant_test_pairs: pairs,
        pct_pairs_timed_out: 100.0 * timeouts as f64 / pairs as f64,
    };

    Ok(StatsReport {
        projects,
        total,
        run,
    })
}

/// One row per project followed by the total row
pub fn stats_frame(report: &StatsReport) -> MutFeatResult<DataFrame> {
    let rows: Vec<&ProjectStats> = report.projects.iter().chain([&report.total]).collect();
    let count = |f: fn(&ProjectStats) -> usize| rows.iter().map(|p| f(*p) as u64).collect::<Vec<_>>();
    let rate = |f: fn(&ProjectStats) -> f64| rows.iter().map(|p| f(*p)).collect::<Vec<_>>();

    let columns = vec![
        Column::new(
            "projectId".into(),
            rows.iter().map(|p| p.project_id.as_str()).collect::<Vec<_>>(),
        ),
        Column::new("allClassCnt".into(), count(|p| p.all_class_count)),
        Column::new("allMutantCnt".into(), count(|p| p.all_mutant_count)),
        Column::new("classCnt".into(), count(|p| p.class_count)),
        Column::new("mutantCnt".into(), count(|p| p.mutant_count)),
        Column::new("equivalentPct".into(), rate(|p| p.equivalent_pct)),
        Column::new("dominatorPct".into(), rate(|p| p.dominator_pct)),
        Column::new("killedPct".into(), rate(|p| p.killed_pct)),
        Column::new("totalTests".into(), count(|p| p.total_tests)),
        Column::new("avgTestsCoveringEachMutant".into(), rate(|p| p.avg_tests_covering)),
        Column::new("avgTestsKillingEachMutant".into(), rate(|p| p.avg_tests_killing)),
    ];
    Ok(DataFrame::new(columns)?)
}

pub fn run_frame(run: &RunStats) -> MutFeatResult<DataFrame> {
    let columns = vec![
        Column::new("numOfProjectsUsed".into(), vec![run.projects as u64]),
        Column::new("numOfClassesUsed".into(), vec![run.classes as u64]),
        Column::new("numSubjectsTimeout".into(), vec![run.timeouts as u64]),
        Column::new("numTestMutantPairs".into(), vec![run.mutant_test_pairs as u64]),
        Column::new("pctTestMutantPairsTimedOut".into(), vec![run.pct_pairs_timed_out]),
    ];
    Ok(DataFrame::new(columns)?)
}

/// Read every subject under `results_dir` and write `subject-stats.csv` and
/// `run-stats.csv` into `out_dir`
pub fn run_stats(results_dir: &Path, out_dir: &Path) -> MutFeatResult<StatsReport> {
    let mut run_metrics = RunMetrics::new();
    let dirs = walk_subject_dirs(results_dir)?;
    let subjects: Vec<Subject> = run_metrics.time("load", || {
        dirs.par_iter()
            .map(|d| read_subject(d))
            .collect::<MutFeatResult<Vec<_>>>()
    })?;
    run_metrics.rows_read = subjects.iter().map(|s| s.mutants.height()).sum();

    let report = run_metrics.time("summarize", || compute_stats(&subjects))?;

    std::fs::create_dir_all(out_dir)?;
    let subject_path = out_dir.join("subject-stats.csv");
    write_csv(&subject_path, &mut stats_frame(&report)?)?;
    let run_path = out_dir.join("run-stats.csv");
    write_csv(&run_path, &mut run_frame(&report.run)?)?;
    info!(
        "Wrote statistics for {} projects to {} and {}",
        report.projects.len(),
        subject_path.display(),
        run_path.display()
    );
    info!(
        "Statistics finished in {:.2?}: {}",
        run_metrics.total_duration(),
        serde_json::to_string(&run_metrics)?
    );
    Ok(report)
}
