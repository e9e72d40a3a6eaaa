//! Layered, per-job option overrides.
//!
//! Every option a job accepts is a field of [`OptionOverrides`]. Overrides come
//! from JSON config files, `KEY=VALUE` pairs, CSV columns and command line flags;
//! all string forms are parsed by [`OptionOverrides::set`].
use std::{collections::HashSet, fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    codec::Compression,
    dtype::PixelType,
    metadata::FormatVersion,
};

/// Which scenes of a source to convert.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "SceneSelectionRepr", into = "SceneSelectionRepr")]
pub enum SceneSelection {
    #[default]
    All,
    Indices(Vec<usize>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SceneSelectionRepr {
    Index(usize),
    Indices(Vec<usize>),
    Text(String),
}

impl TryFrom<SceneSelectionRepr> for SceneSelection {
    type Error = Error;

    fn try_from(value: SceneSelectionRepr) -> Result<Self> {
        match value {
            SceneSelectionRepr::Index(idx) => Ok(Self::Indices(vec![idx])),
            SceneSelectionRepr::Indices(idxs) => Ok(Self::Indices(idxs)),
            SceneSelectionRepr::Text(s) => s.parse(),
        }
    }
}

impl From<SceneSelection> for SceneSelectionRepr {
    fn from(value: SceneSelection) -> Self {
        match value {
            SceneSelection::All => Self::Text("all".into()),
            SceneSelection::Indices(idxs) => Self::Indices(idxs),
        }
    }
}

impl FromStr for SceneSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        let idxs = parse_list(SCENES, s)?;
        if idxs.is_empty() {
            return Err(Error::invalid_option(SCENES, "no scenes given"));
        }
        Ok(Self::Indices(idxs))
    }
}

impl fmt::Display for SceneSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneSelection::All => f.write_str("all"),
            SceneSelection::Indices(idxs) => {
                let parts: Vec<String> = idxs.iter().map(ToString::to_string).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

impl SceneSelection {
    /// Resolve against the number of scenes in a source.
    ///
    /// Repeated indices are kept once, at their first position.
    pub fn indices(&self, count: usize) -> Result<Vec<usize>> {
        match self {
            SceneSelection::All => Ok((0..count).collect()),
            SceneSelection::Indices(idxs) => {
                if let Some(&index) = idxs.iter().find(|i| **i >= count) {
                    return Err(Error::SceneOutOfRange { index, count });
                }
                Ok(self.distinct())
            }
        }
    }

    /// Explicitly selected indices without repeats, in first-seen order.
    ///
    /// Empty for [`SceneSelection::All`].
    pub fn distinct(&self) -> Vec<usize> {
        match self {
            SceneSelection::All => Vec::new(),
            SceneSelection::Indices(idxs) => {
                let mut seen = HashSet::new();
                idxs.iter().copied().filter(|i| seen.insert(*i)).collect()
            }
        }
    }
}

const SCENES: &str = "scenes";

/// Split a comma-separated list, ignoring surrounding brackets and whitespace.
fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.trim()
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')'])
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

fn parse_one<T: FromStr>(key: &str, s: &str) -> Result<T> {
    s.trim()
        .parse()
        .map_err(|_| Error::invalid_option(key, format!("cannot parse {s:?}")))
}

fn parse_list<T: FromStr>(key: &str, s: &str) -> Result<Vec<T>> {
    split_list(s).map(|p| parse_one(key, p)).collect()
}

fn parse_bool(key: &str, s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(Error::invalid_option(key, format!("expected a boolean, got {s:?}"))),
    }
}

fn parse_bool_list(key: &str, s: &str) -> Result<Vec<bool>> {
    split_list(s).map(|p| parse_bool(key, p)).collect()
}

fn parse_strings(s: &str) -> Vec<String> {
    split_list(s).map(str::to_owned).collect()
}

/// `1,1,1,1,1;1,1,1,0.5,0.5`: levels separated by `;`.
fn parse_levels(key: &str, s: &str) -> Result<Vec<Vec<f64>>> {
    s.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|level| parse_list(key, level))
        .collect()
}

macro_rules! option_keys {
    ($($variant:ident => $name:literal $(| $alias:literal)*),* $(,)?) => {
        /// Names of every recognised option.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum OptionKey {
            $($variant),*
        }

        impl OptionKey {
            pub const ALL: &'static [OptionKey] = &[$(OptionKey::$variant),*];

            pub fn name(&self) -> &'static str {
                match self {
                    $(OptionKey::$variant => $name),*
                }
            }
        }

        impl FromStr for OptionKey {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
                match normalized.as_str() {
                    $($name $(| $alias)* => Ok(OptionKey::$variant),)*
                    _ => Err(Error::UnknownOption(s.trim().to_owned())),
                }
            }
        }
    };
}

option_keys! {
    Destination => "destination" | "output" | "destination_directory",
    Name => "name",
    Scenes => "scenes" | "scene",
    Overwrite => "overwrite",
    Tbatch => "tbatch",
    LevelScales => "level_scales",
    XyScale => "xy_scale",
    ZScale => "z_scale",
    NumLevels => "num_levels",
    ChunkShape => "chunk_shape",
    ShardFactor => "shard_factor",
    ShardMemoryTarget => "shard_memory_target",
    MemoryTarget => "memory_target" | "chunk_memory_target",
    Dtype => "dtype",
    Truncate => "truncate",
    ChannelNames => "channel_names" | "channel_labels",
    ChannelColors => "channel_colors",
    ChannelActives => "channel_actives",
    ChannelCoefficients => "channel_coefficients",
    ChannelFamilies => "channel_families",
    ChannelInverted => "channel_inverted",
    ChannelWindowMin => "channel_window_min",
    ChannelWindowMax => "channel_window_max",
    ChannelWindowStart => "channel_window_start",
    ChannelWindowEnd => "channel_window_end",
    AxisNames => "axis_names",
    AxisTypes => "axis_types",
    AxisUnits => "axis_units",
    PhysicalPixelSizes => "physical_pixel_sizes",
    Format => "format" | "zarr_format",
    Compression => "compression",
    Workers => "workers",
    AutoCluster => "auto_cluster",
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Options of one job; `None` means "not set at this layer".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptionOverrides {
    pub destination: Option<PathBuf>,
    pub name: Option<String>,
    pub scenes: Option<SceneSelection>,
    pub overwrite: Option<bool>,
    pub tbatch: Option<u64>,
    pub level_scales: Option<Vec<Vec<f64>>>,
    pub xy_scale: Option<Vec<f64>>,
    pub z_scale: Option<Vec<f64>>,
    pub num_levels: Option<usize>,
    pub chunk_shape: Option<Vec<u64>>,
    pub shard_factor: Option<Vec<u64>>,
    pub shard_memory_target: Option<u64>,
    pub memory_target: Option<u64>,
    pub dtype: Option<PixelType>,
    pub truncate: Option<bool>,
    pub channel_names: Option<Vec<String>>,
    pub channel_colors: Option<Vec<String>>,
    pub channel_actives: Option<Vec<bool>>,
    pub channel_coefficients: Option<Vec<f64>>,
    pub channel_families: Option<Vec<String>>,
    pub channel_inverted: Option<Vec<bool>>,
    pub channel_window_min: Option<Vec<f64>>,
    pub channel_window_max: Option<Vec<f64>>,
    pub channel_window_start: Option<Vec<f64>>,
    pub channel_window_end: Option<Vec<f64>>,
    pub axis_names: Option<Vec<String>>,
    pub axis_types: Option<Vec<String>>,
    pub axis_units: Option<Vec<String>>,
    pub physical_pixel_sizes: Option<Vec<f64>>,
    pub format: Option<FormatVersion>,
    pub compression: Option<Compression>,
    pub workers: Option<usize>,
    pub auto_cluster: Option<bool>,
}

macro_rules! merge_fields {
    ($base:expr, $over:expr, $($field:ident),* $(,)?) => {
        OptionOverrides {
            $($field: $over.$field.clone().or_else(|| $base.$field.clone())),*
        }
    };
}

impl OptionOverrides {
    /// Load overrides from a JSON object; unknown keys are rejected.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let overrides = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| Error::invalid_option("config", format!("{}: {e}", path.display())))?;
        Ok(overrides)
    }

    /// Set one option from its string form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let key: OptionKey = key.parse()?;
        let k = key.name();
        match key {
            OptionKey::Destination => self.destination = Some(PathBuf::from(value.trim())),
            OptionKey::Name => self.name = Some(value.trim().to_owned()),
            OptionKey::Scenes => self.scenes = Some(value.parse()?),
            OptionKey::Overwrite => self.overwrite = Some(parse_bool(k, value)?),
            OptionKey::Tbatch => self.tbatch = Some(parse_one(k, value)?),
            OptionKey::LevelScales => self.level_scales = Some(parse_levels(k, value)?),
            OptionKey::XyScale => self.xy_scale = Some(parse_list(k, value)?),
            OptionKey::ZScale => self.z_scale = Some(parse_list(k, value)?),
            OptionKey::NumLevels => self.num_levels = Some(parse_one(k, value)?),
            OptionKey::ChunkShape => self.chunk_shape = Some(parse_list(k, value)?),
            OptionKey::ShardFactor => self.shard_factor = Some(parse_list(k, value)?),
            OptionKey::ShardMemoryTarget => self.shard_memory_target = Some(parse_one(k, value)?),
            OptionKey::MemoryTarget => self.memory_target = Some(parse_one(k, value)?),
            OptionKey::Dtype => self.dtype = Some(value.parse()?),
            OptionKey::Truncate => self.truncate = Some(parse_bool(k, value)?),
            OptionKey::ChannelNames => self.channel_names = Some(parse_strings(value)),
            OptionKey::ChannelColors => self.channel_colors = Some(parse_strings(value)),
            OptionKey::ChannelActives => self.channel_actives = Some(parse_bool_list(k, value)?),
            OptionKey::ChannelCoefficients => {
                self.channel_coefficients = Some(parse_list(k, value)?)
            }
            OptionKey::ChannelFamilies => self.channel_families = Some(parse_strings(value)),
            OptionKey::ChannelInverted => {
                self.channel_inverted = Some(parse_bool_list(k, value)?)
            }
            OptionKey::ChannelWindowMin => self.channel_window_min = Some(parse_list(k, value)?),
            OptionKey::ChannelWindowMax => self.channel_window_max = Some(parse_list(k, value)?),
            OptionKey::ChannelWindowStart => {
                self.channel_window_start = Some(parse_list(k, value)?)
            }
            OptionKey::ChannelWindowEnd => self.channel_window_end = Some(parse_list(k, value)?),
            OptionKey::AxisNames => self.axis_names = Some(parse_strings(value)),
            OptionKey::AxisTypes => self.axis_types = Some(parse_strings(value)),
            OptionKey::AxisUnits => self.axis_units = Some(parse_strings(value)),
            OptionKey::PhysicalPixelSizes => {
                self.physical_pixel_sizes = Some(parse_list(k, value)?)
            }
            OptionKey::Format => self.format = Some(value.parse()?),
            OptionKey::Compression => self.compression = Some(value.parse()?),
            OptionKey::Workers => self.workers = Some(parse_one(k, value)?),
            OptionKey::AutoCluster => self.auto_cluster = Some(parse_bool(k, value)?),
        }
        Ok(())
    }

    /// Parse and set a `KEY=VALUE` pair.
    pub fn set_pair(&mut self, pair: &str) -> Result<()> {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            Error::invalid_option(pair.trim(), "expected KEY=VALUE")
        })?;
        self.set(key, value)
    }

    /// Layer `other` on top of `self`: every option set in `other` wins.
    pub fn merged_with(&self, other: &OptionOverrides) -> OptionOverrides {
        merge_fields!(
            self,
            other,
            destination,
            name,
            scenes,
            overwrite,
            tbatch,
            level_scales,
            xy_scale,
            z_scale,
            num_levels,
            chunk_shape,
            shard_factor,
            shard_memory_target,
            memory_target,
            dtype,
            truncate,
            channel_names,
            channel_colors,
            channel_actives,
            channel_coefficients,
            channel_families,
            channel_inverted,
            channel_window_min,
            channel_window_max,
            channel_window_start,
            channel_window_end,
            axis_names,
            axis_types,
            axis_units,
            physical_pixel_sizes,
            format,
            compression,
            workers,
            auto_cluster,
        )
    }
}
