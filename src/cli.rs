//! Command line arguments shared by the binaries.
use std::path::PathBuf;

use clap::Args;
use env_logger::{Builder, Env};

use crate::{Result, options::OptionOverrides};

/// Initialise logging at `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    builder.init();
}

/// Conversion options, as flags.
///
/// Lists are comma-separated; `--level-scales` separates levels with `;`.
#[derive(Args, Debug, Default, Clone)]
pub struct JobArgs {
    /// Directory the `<name>.ome.zarr` groups are written to
    #[arg(short, long)]
    pub destination: Option<PathBuf>,

    /// Output name; defaults to the source file name without extensions
    #[arg(short, long)]
    pub name: Option<String>,

    /// Scenes to convert: `all`, or a list of indices
    #[arg(short, long)]
    pub scenes: Option<String>,

    /// Replace existing output
    #[arg(long)]
    pub overwrite: bool,

    /// Timepoints read and written per batch
    #[arg(long)]
    pub tbatch: Option<u64>,

    /// Per-level TCZYX factors, e.g. `1,1,1,1,1;1,1,1,0.5,0.5`
    #[arg(long, allow_hyphen_values = true)]
    pub level_scales: Option<String>,

    /// XY factor of each level after the first
    #[arg(long)]
    pub xy_scale: Option<String>,

    /// Z factor of each level after the first
    #[arg(long)]
    pub z_scale: Option<String>,

    /// Number of levels, each halving X and Y
    #[arg(long)]
    pub num_levels: Option<usize>,

    /// TCZYX chunk shape; 0 means the full extent
    #[arg(long)]
    pub chunk_shape: Option<String>,

    /// TCZYX chunks per shard (Zarr V3 only)
    #[arg(long)]
    pub shard_factor: Option<String>,

    /// Grow shards up to this many bytes (Zarr V3 only)
    #[arg(long)]
    pub shard_memory_target: Option<u64>,

    /// Advisory size of one chunk in bytes
    #[arg(long)]
    pub memory_target: Option<u64>,

    /// Output data type, e.g. `uint16`
    #[arg(long)]
    pub dtype: Option<String>,

    /// Allow lossy dtype conversion, saturating out-of-range values
    #[arg(long)]
    pub truncate: bool,

    #[arg(long)]
    pub channel_names: Option<String>,

    /// Names or hex codes, e.g. `red,00FF00`
    #[arg(long)]
    pub channel_colors: Option<String>,

    #[arg(long)]
    pub channel_actives: Option<String>,

    #[arg(long)]
    pub channel_coefficients: Option<String>,

    #[arg(long)]
    pub channel_families: Option<String>,

    #[arg(long)]
    pub channel_inverted: Option<String>,

    #[arg(long)]
    pub channel_window_min: Option<String>,

    #[arg(long)]
    pub channel_window_max: Option<String>,

    #[arg(long)]
    pub channel_window_start: Option<String>,

    #[arg(long)]
    pub channel_window_end: Option<String>,

    /// Five axis names, TCZYX
    #[arg(long)]
    pub axis_names: Option<String>,

    /// Five axis types (time, channel or space)
    #[arg(long)]
    pub axis_types: Option<String>,

    /// Five axis units; `none` for unitless
    #[arg(long)]
    pub axis_units: Option<String>,

    /// Z, Y, X pixel sizes
    #[arg(long)]
    pub physical_pixel_sizes: Option<String>,

    /// Zarr format, 2 or 3
    #[arg(long)]
    pub format: Option<String>,

    /// `raw`, `gzip[:level]` or `bz2[:level]`
    #[arg(long)]
    pub compression: Option<String>,

    /// Worker threads for scenes or jobs
    #[arg(long)]
    pub workers: Option<usize>,

    /// Use a worker per two physical cores
    #[arg(long)]
    pub auto_cluster: bool,

    /// Extra options as KEY=VALUE
    #[arg(short = 'o', long = "opt", value_name = "KEY=VALUE")]
    pub opts: Vec<String>,
}

impl JobArgs {
    /// Overrides for every option given on the command line.
    pub fn to_overrides(&self) -> Result<OptionOverrides> {
        let mut out = OptionOverrides::default();
        let flags = [
            ("destination", self.destination.as_ref().map(|p| p.display().to_string())),
            ("name", self.name.clone()),
            ("scenes", self.scenes.clone()),
            ("overwrite", self.overwrite.then(|| "true".into())),
            ("tbatch", self.tbatch.map(|v| v.to_string())),
            ("level_scales", self.level_scales.clone()),
            ("xy_scale", self.xy_scale.clone()),
            ("z_scale", self.z_scale.clone()),
            ("num_levels", self.num_levels.map(|v| v.to_string())),
            ("chunk_shape", self.chunk_shape.clone()),
            ("shard_factor", self.shard_factor.clone()),
            ("shard_memory_target", self.shard_memory_target.map(|v| v.to_string())),
            ("memory_target", self.memory_target.map(|v| v.to_string())),
            ("dtype", self.dtype.clone()),
            ("truncate", self.truncate.then(|| "true".into())),
            ("channel_names", self.channel_names.clone()),
            ("channel_colors", self.channel_colors.clone()),
            ("channel_actives", self.channel_actives.clone()),
            ("channel_coefficients", self.channel_coefficients.clone()),
            ("channel_families", self.channel_families.clone()),
            ("channel_inverted", self.channel_inverted.clone()),
            ("channel_window_min", self.channel_window_min.clone()),
            ("channel_window_max", self.channel_window_max.clone()),
            ("channel_window_start", self.channel_window_start.clone()),
            ("channel_window_end", self.channel_window_end.clone()),
            ("axis_names", self.axis_names.clone()),
            ("axis_types", self.axis_types.clone()),
            ("axis_units", self.axis_units.clone()),
            ("physical_pixel_sizes", self.physical_pixel_sizes.clone()),
            ("format", self.format.clone()),
            ("compression", self.compression.clone()),
            ("workers", self.workers.map(|v| v.to_string())),
            ("auto_cluster", self.auto_cluster.then(|| "true".into())),
        ];
        for (key, value) in flags {
            if let Some(value) = value {
                out.set(key, &value)?;
            }
        }
        for pair in &self.opts {
            out.set_pair(pair)?;
        }
        Ok(out)
    }
}
