//! Mutant table discovery and loading
//!
//! Results are laid out as `<results>/<project>/<version>/*customized-mutants.csv`.
//! Only covered mutants are kept, and every project must carry exactly one
//! bug id.

use crate::errors::{MutFeatError, MutFeatResult};
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

pub const MUTANTS_SUFFIX: &str = "customized-mutants.csv";
pub const PROJECT_COLUMN: &str = "projectId";
pub const BUG_COLUMN: &str = "bugId";
pub const CLASS_COLUMN: &str = "className";
pub const MUTANT_COLUMN: &str = "mutantId";
pub const COVERED_COLUMN: &str = "isCovered";
pub const TARGET_COLUMN: &str = "pKillsDom";
pub const EXP_KILLED_COLUMN: &str = "expKilledDomNodes";

pub fn read_csv<P: AsRef<Path>>(path: P) -> MutFeatResult<LazyFrame> {
    LazyCsvReader::new(path)
        .with_infer_schema_length(Some(10_000))
        .finish()
        .map_err(MutFeatError::PolarsError)
}

/// Every `*customized-mutants.csv` exactly two directories below `results_dir`
pub fn discover_mutant_csvs<P: AsRef<Path>>(results_dir: P) -> MutFeatResult<Vec<PathBuf>> {
    let results_dir = results_dir.as_ref();
    if !results_dir.is_dir() {
        return Err(MutFeatError::InvalidArgs(format!(
            "{} is not a directory",
            results_dir.display()
        )));
    }

    let paths: Vec<PathBuf> = WalkDir::new(results_dir)
        .min_depth(3)
        .max_depth(3)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(MUTANTS_SUFFIX))
        .map(|e| e.into_path())
        .collect();

    if paths.is_empty() {
        return Err(MutFeatError::Precondition(format!(
            "No {} files found in {}",
            MUTANTS_SUFFIX,
            results_dir.display()
        )));
    }
    Ok(paths)
}

/// Read and concatenate mutant CSVs
pub fn read_mutant_csvs(paths: &[PathBuf]) -> MutFeatResult<DataFrame> {
    let mut frames = Vec::with_capacity(paths.len());
    for path in paths {
        info!("Reading: {}", path.display());
        frames.push(read_csv(path)?);
    }
    let args = UnionArgs {
        to_supertypes: true,
        ..Default::default()
    };
    Ok(concat(frames, args)?.collect()?)
}

/// Boolean flags from a bool, `true`/`1` string or numeric column; nulls are
/// false
fn flag_values(column: &Column) -> MutFeatResult<Vec<bool>> {
    let flags: Vec<bool> = match column.dtype() {
        DataType::Boolean => column.bool()?.into_iter().map(|v| v.unwrap_or(false)).collect(),
        DataType::String => column
            .str()?
            .into_iter()
            .map(|v| {
                v.map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1"))
                    .unwrap_or(false)
            })
            .collect(),
        _ => column
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .map(|v| v.map(|x| x != 0.0).unwrap_or(false))
            .collect(),
    };
    Ok(flags)
}

pub fn flag_column(df: &DataFrame, name: &str) -> MutFeatResult<Vec<bool>> {
    flag_values(df.column(name)?)
}

fn covered_mask(column: &Column) -> MutFeatResult<BooleanChunked> {
    let mask = flag_values(column)?;
    Ok(BooleanChunked::from_slice(COVERED_COLUMN.into(), &mask))
}

/// Keep only rows whose `isCovered` flag is set
pub fn filter_covered(df: &DataFrame) -> MutFeatResult<DataFrame> {
    let mask = covered_mask(df.column(COVERED_COLUMN)?)?;
    let out = df.filter(&mask)?;
    debug!("Kept {} of {} mutants as covered", out.height(), df.height());
    Ok(out)
}

pub fn string_column(df: &DataFrame, name: &str) -> MutFeatResult<Vec<String>> {
    let col = df.column(name)?.cast(&DataType::String)?;
    Ok(col
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect())
}

pub fn float_column(df: &DataFrame, name: &str) -> MutFeatResult<Vec<f64>> {
    let col = df.column(name)?.cast(&DataType::Float64)?;
    Ok(col.f64()?.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

/// Rows of `df` at `indices`, in that order
pub fn take_rows(df: &DataFrame, indices: &[usize]) -> MutFeatResult<DataFrame> {
    let idx: Vec<IdxSize> = indices.iter().map(|&i| i as IdxSize).collect();
    let idx = IdxCa::from_vec("idx".into(), idx);
    Ok(df.take(&idx)?)
}

/// Covered mutants with their identifying columns pulled out for fast
/// selection.
#[derive(Debug, Clone)]
pub struct MutantTable {
    pub frame: DataFrame,
    pub project_ids: Vec<String>,
    pub bug_ids: Vec<String>,
    pub class_names: Vec<String>,
    pub mutant_ids: Vec<String>,
    pub target: Vec<f64>,
    /// Expected killed dominator nodes; NaN when the column is absent
    pub exp_killed: Vec<f64>,
}

impl MutantTable {
    pub fn from_frame(frame: DataFrame) -> MutFeatResult<Self> {
        let exp_killed = if frame.get_column_index(EXP_KILLED_COLUMN).is_some() {
            float_column(&frame, EXP_KILLED_COLUMN)?
        } else {
            vec![f64::NAN; frame.height()]
        };
        Ok(Self {
            project_ids: string_column(&frame, PROJECT_COLUMN)?,
            bug_ids: string_column(&frame, BUG_COLUMN)?,
            class_names: string_column(&frame, CLASS_COLUMN)?,
            mutant_ids: string_column(&frame, MUTANT_COLUMN)?,
            target: float_column(&frame, TARGET_COLUMN)?,
            exp_killed,
            frame,
        })
    }

    /// Discover, load, filter to covered mutants and check bug ids
    pub fn load<P: AsRef<Path>>(results_dir: P) -> MutFeatResult<Self> {
        let paths = discover_mutant_csvs(results_dir)?;
        Self::load_paths(&paths)
    }

    pub fn load_paths(paths: &[PathBuf]) -> MutFeatResult<Self> {
        let raw = read_mutant_csvs(paths)?;
        let covered = filter_covered(&raw)?;
        let table = Self::from_frame(covered)?;
        table.check_single_bug_per_project()?;
        info!(
            "Loaded {} covered mutants from {} projects",
            table.len(),
            table.projects().len()
        );
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.height() == 0
    }

    pub fn check_single_bug_per_project(&self) -> MutFeatResult<()> {
        let mut bugs: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (p, b) in self.project_ids.iter().zip(&self.bug_ids) {
            bugs.entry(p.as_str()).or_default().insert(b.as_str());
        }
        if let Some((project, ids)) = bugs.iter().find(|(_, ids)| ids.len() != 1) {
            return Err(MutFeatError::Precondition(format!(
                "project {} has {} bug ids, expected exactly one",
                project,
                ids.len()
            )));
        }
        Ok(())
    }

    /// Distinct projects in first-seen order
    pub fn projects(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.project_ids
            .iter()
            .filter(|p| seen.insert(p.as_str()))
            .cloned()
            .collect()
    }

    /// Distinct `(project, class)` pairs in first-seen order
    pub fn project_classes(&self) -> Vec<(String, String)> {
        let mut seen = BTreeSet::new();
        self.project_ids
            .iter()
            .zip(&self.class_names)
            .filter(|(p, c)| seen.insert((p.as_str(), c.as_str())))
            .map(|(p, c)| (p.clone(), c.clone()))
            .collect()
    }

    /// Distinct classes of `project` in first-seen order
    pub fn classes_of(&self, project: &str) -> Vec<String> {
        self.project_classes()
            .into_iter()
            .filter(|(p, _)| p == project)
            .map(|(_, c)| c)
            .collect()
    }

    /// The bug id of `project`
    pub fn bug_id_of(&self, project: &str) -> MutFeatResult<String> {
        let ids: BTreeSet<&str> = self
            .project_ids
            .iter()
            .zip(&self.bug_ids)
            .filter(|(p, _)| p.as_str() == project)
            .map(|(_, b)| b.as_str())
            .collect();
        match ids.len() {
            1 => Ok(ids.into_iter().next().unwrap_or_default().to_string()),
            0 => Err(MutFeatError::Precondition(format!(
                "project {} has no mutants",
                project
            ))),
            n => Err(MutFeatError::Precondition(format!(
                "project {} has {} bug ids, expected exactly one",
                project, n
            ))),
        }
    }

    /// Row indices where `pred(project, class)` holds
    pub fn select(&self, pred: impl Fn(&str, &str) -> bool) -> Vec<usize> {
        self.project_ids
            .iter()
            .zip(&self.class_names)
            .enumerate()
            .filter(|(_, (p, c))| pred(p, c))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn targets_at(&self, rows: &[usize]) -> Vec<f64> {
        rows.iter().map(|&r| self.target[r]).collect()
    }
}

/// Shuffled `(train, test)` index sets; the test side gets
/// `ceil(n * test_fraction)` rows.
pub fn train_test_split(n: usize, test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut idx: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    idx.shuffle(&mut rng);
    let n_test = ((n as f64) * test_fraction).ceil() as usize;
    let n_test = n_test.min(n);
    let test = idx[..n_test].to_vec();
    let train = idx[n_test..].to_vec();
    (train, test)
}

/// Random subset holding `frac` of the rows
pub fn sample_frac(df: &DataFrame, frac: f64, seed: u64) -> MutFeatResult<DataFrame> {
    if !(frac > 0.0 && frac <= 1.0) {
        return Err(MutFeatError::InvalidArgs(format!(
            "sample fraction must be in (0, 1], got {}",
            frac
        )));
    }
    if frac >= 1.0 {
        return Ok(df.clone());
    }
    let n = df.height();
    let keep = ((n as f64) * frac).round() as usize;
    let mut idx: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    idx.shuffle(&mut rng);
    idx.truncate(keep);
    take_rows(df, &idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const HEADER: &str = "projectId,bugId,className,mutantId,isCovered,pKillsDom,mutationOperator";

    fn write_project(root: &Path, project: &str, version: &str, body: &str) {
        let dir = root.join(project).join(version);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("customized-mutants.csv"),
            format!("{}\n{}", HEADER, body),
        )
        .unwrap();
    }

    #[test]
    fn test_discovery_depth() {
        let dir = tempdir().unwrap();
        write_project(dir.path(), "Codec", "18f", "Codec,18,A,1,True,0.5,AOR\n");
        // Too shallow and too deep are both ignored
        fs::write(dir.path().join("customized-mutants.csv"), HEADER).unwrap();
        let deep = dir.path().join("Lang").join("1f").join("extra");
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("customized-mutants.csv"), HEADER).unwrap();

        let found = discover_mutant_csvs(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("Codec/18f/customized-mutants.csv"));
    }

    #[test]
    fn test_discovery_empty_is_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            discover_mutant_csvs(dir.path()),
            Err(MutFeatError::Precondition(_))
        ));
    }

    #[test]
    fn test_load_filters_uncovered() {
        let dir = tempdir().unwrap();
        write_project(
            dir.path(),
            "Codec",
            "18f",
            "Codec,18,A,1,True,0.5,AOR\nCodec,18,A,2,False,0.1,ROR\nCodec,18,B,3,True,0.9,AOR\n",
        );
        write_project(dir.path(), "Lang", "1f", "Lang,1,C,1,True,0.2,LVR\n");

        let table = MutantTable::load(dir.path()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.projects(), vec!["Codec", "Lang"]);
        assert_eq!(table.classes_of("Codec"), vec!["A", "B"]);
        assert_eq!(table.bug_id_of("Lang").unwrap(), "1");
    }

    #[test]
    fn test_two_bugs_in_one_project_rejected() {
        let dir = tempdir().unwrap();
        write_project(
            dir.path(),
            "Codec",
            "18f",
            "Codec,18,A,1,True,0.5,AOR\nCodec,19,B,2,True,0.1,ROR\n",
        );
        assert!(matches!(
            MutantTable::load(dir.path()),
            Err(MutFeatError::Precondition(_))
        ));
    }

    #[test]
    fn test_covered_mask_numeric() {
        let df = df! {
            "isCovered" => &[1, 0, 1],
            "x" => &[1.0, 2.0, 3.0],
        }
        .unwrap();
        let out = filter_covered(&df).unwrap();
        assert_eq!(out.height(), 2);
    }

    #[test]
    fn test_train_test_split_partitions() {
        let (train, test) = train_test_split(10, 0.25, 42);
        assert_eq!(test.len(), 3);
        assert_eq!(train.len(), 7);
        let mut all: Vec<usize> = train.iter().chain(&test).copied().collect();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert_eq!(train_test_split(10, 0.25, 42), (train, test));
    }

    #[test]
    fn test_sample_frac() {
        let df = df! { "a" => &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10] }.unwrap();
        assert_eq!(sample_frac(&df, 0.2, 42).unwrap().height(), 2);
        assert_eq!(sample_frac(&df, 1.0, 42).unwrap().height(), 10);
        assert!(sample_frac(&df, 0.0, 42).is_err());
    }
}
