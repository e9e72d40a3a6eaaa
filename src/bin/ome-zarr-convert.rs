//! Convert one image into multiscale OME-Zarr.
use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use log::error;
use zarrs_ome_convert::{
    cli::{JobArgs, init_logging},
    convert::convert,
    options::OptionOverrides,
    storage::group_key,
};

#[derive(Parser, Debug)]
#[command(name = "ome-zarr-convert")]
#[command(about = "Convert a microscopy image into chunked multiscale OME-Zarr")]
struct Args {
    /// Image to convert (.npy file or Zarr array)
    source: PathBuf,

    /// JSON file of default options; flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    job: JobArgs,
}

fn run(args: &Args) -> zarrs_ome_convert::Result<bool> {
    let defaults = match &args.config {
        Some(path) => OptionOverrides::from_json_file(path)?,
        None => OptionOverrides::default(),
    };
    let overrides = defaults.merged_with(&args.job.to_overrides()?);
    let report = convert(&args.source, &overrides)?;
    for scene in &report.scenes {
        println!(
            "scene {}: {} ({} level(s), {} timepoint(s){})",
            scene.scene,
            group_key(&scene.name),
            scene.level_shapes.len(),
            scene.timepoints,
            if scene.cancelled { ", cancelled" } else { "" }
        );
    }
    Ok(!report.cancelled())
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
