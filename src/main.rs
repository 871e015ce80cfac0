use clap::{Parser, Subcommand, ValueEnum};
use miette::Result;
use mutfeat::ablation::{run_ablation, AblationOptions, Granularity};
use mutfeat::config::AnalysisConfig;
use mutfeat::correlation::correlate;
use mutfeat::counts::column_names;
use mutfeat::dataset::{read_csv, sample_frac};
use mutfeat::evaluate::{run_evaluation, EvaluateOptions};
use mutfeat::mapper::FeatureMapper;
use mutfeat::model::ModelKind;
use mutfeat::stats::run_stats;
use mutfeat::train::{run_training, FeatureSet, TrainOptions, TrainingSet};
use mutfeat::{expanded_counts, group_counts, FeatureIntervalResolver, MutFeatResult, TransformLayout};
use polars::prelude::DataFrame;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Clone, ValueEnum, Debug)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "mutfeat")]
#[command(version = "0.1.0")]
#[command(about = "Mutant feature mapping, interval resolution and kill-difficulty models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase logging verbosity (Info -> Debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Silence all logs
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log format (text or json)
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// YAML file with mapper groups, recognized features and feature groups
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print expanded feature counts and transformed column groups
    Counts {
        /// Mutant CSV file
        #[arg(long, value_name = "CSV")]
        data: PathBuf,

        /// Fraction of rows to sample
        #[arg(long, default_value_t = 1.0)]
        frac: f64,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Print the column interval of one or more features
    Interval {
        #[arg(long, value_name = "CSV")]
        data: PathBuf,

        #[arg(required = true, value_name = "FEATURE")]
        features: Vec<String>,

        #[arg(long, default_value_t = 1.0)]
        frac: f64,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Train one model per held-out class or project
    Train {
        #[arg(long, value_enum)]
        model: ModelKind,

        /// Feature set to train on (`mapper` or `small_mapper` from --config)
        #[arg(long, value_enum)]
        data: FeatureSet,

        /// Destination of the model artifact
        #[arg(long, value_name = "PATH")]
        out: PathBuf,

        /// Only train on data from the same project as the held-out class
        #[arg(long)]
        project_only: bool,

        /// Train on all other projects, holding out a whole project
        #[arg(long)]
        between_projects: bool,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Directory to search for customized-mutants.csv files
        #[arg(value_name = "RESULTS_DIR")]
        results_dir: PathBuf,
    },
    /// Evaluate every trained model found under MODEL_ROOT
    Evaluate {
        #[arg(value_name = "RESULTS_DIR")]
        results_dir: PathBuf,

        /// Directory holding model-<type>-<features>-<training>.json files
        #[arg(value_name = "MODEL_ROOT")]
        model_root: PathBuf,

        /// Destination directory for prediction CSVs
        #[arg(value_name = "PREDICTIONS_DIR")]
        predictions_dir: PathBuf,

        /// Metrics CSV path (defaults to PREDICTIONS_DIR/metrics.csv)
        #[arg(long, value_name = "PATH")]
        metrics: Option<PathBuf>,
    },
    /// Write per-project class, mutant and test statistics
    Stats {
        /// Directory laid out as <project>/<version>/
        #[arg(value_name = "RESULTS_DIR")]
        results_dir: PathBuf,

        #[arg(value_name = "OUT_DIR")]
        out_dir: PathBuf,
    },
    /// Rank features by the drop in linear-model R² when held out
    Ablate {
        #[arg(long, value_name = "CSV")]
        data: PathBuf,

        #[arg(short, long, value_enum, default_value_t = Granularity::Group)]
        granularity: Granularity,

        /// Number of random splits to average over
        #[arg(long, default_value_t = 5)]
        samples: usize,

        #[arg(long, default_value_t = 0.2)]
        frac: f64,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Predict each column of one feature from another feature's columns
    Correlate {
        #[arg(long, value_name = "CSV")]
        data: PathBuf,

        #[arg(short, long = "independent-variable")]
        independent: String,

        #[arg(short, long = "dependent-variable")]
        dependent: String,

        #[arg(long, default_value_t = 0.2)]
        frac: f64,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn load_frame(path: &Path, frac: f64, seed: u64) -> MutFeatResult<DataFrame> {
    info!("Reading {}", path.display());
    let df = read_csv(path)?.collect()?;
    sample_frac(&df, frac, seed)
}

fn print_counts(df: &DataFrame, config: &AnalysisConfig) -> MutFeatResult<()> {
    let mapper = FeatureMapper::fit(df, &config.mapper)?;
    let transformed = mapper.transform(df)?;

    let expanded = expanded_counts(df, &config.recognized_features)?;
    for (name, count) in expanded.iter() {
        println!("{}: {}", name, count);
    }
    println!("Total number of features: {}", expanded.total());

    for (prefix, count) in group_counts(&column_names(&transformed))?.iter() {
        println!("Group Name: {}, Feature Count: {}", prefix, count);
    }
    Ok(())
}

fn print_intervals(df: &DataFrame, config: &AnalysisConfig, features: &[String]) -> MutFeatResult<()> {
    let mapper = FeatureMapper::fit(df, &config.mapper)?;
    let names = mapper.output_names();
    let resolver = FeatureIntervalResolver::new(config.recognized_features.clone());
    if let Err(e) = resolver.check_layout(&names, df) {
        warn!("Column names disagree with expanded counts: {}", e);
    }

    for feature in features {
        let by_name = resolver.resolve(&names, df, feature)?;
        let by_layout = mapper.interval(feature)?;
        println!("{}: {} (layout {})", feature, by_name, by_layout);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    // MUTFEAT_LOG takes precedence over -v/-q
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("MUTFEAT_LOG")
        .from_env_lossy();

    let run_id = Uuid::new_v4();

    match cli.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .json()
                .with_span_list(false)
                .with_current_span(false)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    let _span = tracing::info_span!("root", run_id = %run_id).entered();

    let config = match &cli.config {
        Some(path) => AnalysisConfig::from_path(path)?,
        None => AnalysisConfig::default(),
    };

    match cli.command {
        Commands::Counts { data, frac, seed } => {
            let df = load_frame(&data, frac, seed)?;
            print_counts(&df, &config)?;
        }
        Commands::Interval {
            data,
            features,
            frac,
            seed,
        } => {
            let df = load_frame(&data, frac, seed)?;
            print_intervals(&df, &config, &features)?;
        }
        Commands::Train {
            model,
            data,
            out,
            project_only,
            between_projects,
            seed,
            results_dir,
        } => {
            let training_set = TrainingSet::from_flags(project_only, between_projects)?;
            let opts = TrainOptions {
                model,
                features: data,
                training_set,
                results_dir,
                out,
                seed,
            };
            run_training(&opts, &config, &run_id.to_string())?;
        }
        Commands::Evaluate {
            results_dir,
            model_root,
            predictions_dir,
            metrics,
        } => {
            let opts = EvaluateOptions {
                results_dir,
                model_root,
                predictions_dir,
                metrics_path: metrics,
            };
            run_evaluation(&opts)?;
        }
        Commands::Stats {
            results_dir,
            out_dir,
        } => {
            let report = run_stats(&results_dir, &out_dir)?;
            println!(
                "{} projects, {} classes, {} of {} test-mutant pairs timed out",
                report.run.projects,
                report.run.classes,
                report.run.timeouts,
                report.run.mutant_test_pairs
            );
        }
        Commands::Ablate {
            data,
            granularity,
            samples,
            frac,
            seed,
        } => {
            let df = load_frame(&data, frac, seed)?;
            let opts = AblationOptions {
                granularity,
                samples,
                seed,
                ..Default::default()
            };
            let report = run_ablation(&df, &config, &opts)?;
            for (i, baseline) in report.baselines.iter().enumerate() {
                println!("Baseline accuracy on test data ({}): {}", i, baseline);
            }
            println!("\nHeld-out feature scores:");
            for (name, decrease) in &report.decreases {
                println!("{} decrease: {}", name, decrease);
            }
        }
        Commands::Correlate {
            data,
            independent,
            dependent,
            frac,
            seed,
        } => {
            let df = load_frame(&data, frac, seed)?;
            let report = correlate(&df, &config, &independent, &dependent, 0.2, seed)?;
            println!(
                "Using {} to predict values for {}",
                independent, dependent
            );
            println!(
                "Train set size: {}, Test set size: {}",
                report.train_size, report.test_size
            );
            for (column, score) in &report.scores {
                println!("{} : {}", column, score);
            }
        }
    }

    Ok(())
}
