//! Convert many images into multiscale OME-Zarr.
use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use log::error;
use zarrs_ome_convert::{
    batch::BatchOrchestrator,
    cli::{JobArgs, init_logging},
    convert::ExecutionContext,
    options::OptionOverrides,
};

#[derive(Parser, Debug)]
#[command(name = "ome-zarr-batch")]
#[command(about = "Convert many microscopy images into chunked multiscale OME-Zarr")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// JSON file of default options; flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    job: JobArgs,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// One job per row of a CSV file with a `source` column
    Csv { file: PathBuf },
    /// One job per matching file under a directory
    Dir {
        directory: PathBuf,
        /// Levels of subdirectories to descend into
        #[arg(long, default_value_t = 1)]
        depth: usize,
        /// Glob pattern on file names
        #[arg(long, default_value = "*")]
        pattern: String,
    },
    /// One job per path given
    List {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

fn run(args: &Args) -> zarrs_ome_convert::Result<bool> {
    let defaults = match &args.config {
        Some(path) => OptionOverrides::from_json_file(path)?,
        None => OptionOverrides::default(),
    };
    let defaults = defaults.merged_with(&args.job.to_overrides()?);
    let context = ExecutionContext::from_overrides(&defaults)?;
    let orchestrator = BatchOrchestrator::new(defaults).with_context(context);

    let jobs = match &args.mode {
        Mode::Csv { file } => orchestrator.from_csv(file)?,
        Mode::Dir {
            directory,
            depth,
            pattern,
        } => orchestrator.from_directory(directory, *depth, pattern)?,
        Mode::List { paths } => orchestrator.from_list(paths),
    };
    let summary = orchestrator.run_jobs(jobs);
    println!("{summary}");
    Ok(summary.all_succeeded())
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
