//! Conversion of one source into one multiscale group per scene.
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use rayon::prelude::*;

use crate::{
    Error, Result,
    chunk::{self, ChunkPlan, DEFAULT_MEMORY_TARGET, ShardIntent},
    codec::Compression,
    dtype::{DtypePolicy, PixelType, check_override},
    metadata::{AxisKind, AxisSpec, ChannelSpec, FormatVersion, Metadata, parse_color},
    options::{OptionOverrides, SceneSelection},
    pyramid::{PyramidWriter, WriteReport},
    scale::{C, NDIM, ScaleIntent, ScalePlan, Shape},
    source::{self, ImageReader, SceneInfo},
    storage::{StoreWriter, ZarrStore, group_key},
};

/// Cooperative cancellation flag, checked between time batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where independent units of work (scenes, jobs) run.
#[derive(Debug, Clone, Default)]
pub enum ExecutionContext {
    /// One after another on the calling thread.
    #[default]
    Sequential,
    /// On a dedicated thread pool.
    Pool(Arc<rayon::ThreadPool>),
}

impl ExecutionContext {
    pub fn with_workers(workers: usize) -> Result<Self> {
        if workers <= 1 {
            return Ok(Self::Sequential);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(Error::wrap)?;
        log::info!("using a pool of {workers} workers");
        Ok(Self::Pool(Arc::new(pool)))
    }

    /// Half the physical cores, at least one.
    pub fn auto() -> Result<Self> {
        Self::with_workers((num_cpus::get_physical() / 2).max(1))
    }

    /// Context described by the `workers` and `auto_cluster` options.
    pub fn from_overrides(overrides: &OptionOverrides) -> Result<Self> {
        match (overrides.workers, overrides.auto_cluster) {
            (Some(n), _) => Self::with_workers(n),
            (None, Some(true)) => Self::auto(),
            _ => Ok(Self::Sequential),
        }
    }

    /// Apply `f` to every item, preserving order in the output.
    pub fn map<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        match self {
            ExecutionContext::Sequential => items.into_iter().map(f).collect(),
            ExecutionContext::Pool(pool) => {
                pool.install(|| items.into_par_iter().map(f).collect())
            }
        }
    }
}

/// Per-channel rendering overrides, aligned by index to channel order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelOverrides {
    pub labels: Option<Vec<String>>,
    pub colors: Option<Vec<String>>,
    pub actives: Option<Vec<bool>>,
    pub coefficients: Option<Vec<f64>>,
    pub families: Option<Vec<String>>,
    pub inverted: Option<Vec<bool>>,
    pub window_min: Option<Vec<f64>>,
    pub window_max: Option<Vec<f64>>,
    pub window_start: Option<Vec<f64>>,
    pub window_end: Option<Vec<f64>>,
}

fn apply<T: Clone>(
    values: &Option<Vec<T>>,
    channels: &mut [ChannelSpec],
    f: impl Fn(&mut ChannelSpec, T),
) {
    if let Some(values) = values {
        for (ch, v) in channels.iter_mut().zip(values) {
            f(ch, v.clone());
        }
    }
}

impl ChannelOverrides {
    fn from_overrides(o: &OptionOverrides) -> Result<Self> {
        let colors = o
            .channel_colors
            .as_ref()
            .map(|cs| cs.iter().map(|c| parse_color(c)).collect::<Result<Vec<_>>>())
            .transpose()?;
        Ok(Self {
            labels: o.channel_names.clone(),
            colors,
            actives: o.channel_actives.clone(),
            coefficients: o.channel_coefficients.clone(),
            families: o.channel_families.clone(),
            inverted: o.channel_inverted.clone(),
            window_min: o.channel_window_min.clone(),
            window_max: o.channel_window_max.clone(),
            window_start: o.channel_window_start.clone(),
            window_end: o.channel_window_end.clone(),
        })
    }

    /// Channel descriptors for an image with `count` channels.
    ///
    /// Labels come from the overrides, then the reader, then `Channel:<i>`.
    /// User-supplied labels are used as given, so a count mismatch surfaces
    /// when metadata is built.
    pub fn resolve(
        &self,
        count: usize,
        reader_labels: Option<&[String]>,
        dtype: PixelType,
    ) -> Result<Vec<ChannelSpec>> {
        let labels: Vec<String> = match (&self.labels, reader_labels) {
            (Some(labels), _) => labels.clone(),
            (None, Some(labels)) if labels.len() == count => labels.to_vec(),
            _ => (0..count).map(ChannelSpec::default_label).collect(),
        };
        for (key, len) in [
            ("channel_colors", self.colors.as_ref().map(Vec::len)),
            ("channel_actives", self.actives.as_ref().map(Vec::len)),
            ("channel_coefficients", self.coefficients.as_ref().map(Vec::len)),
            ("channel_families", self.families.as_ref().map(Vec::len)),
            ("channel_inverted", self.inverted.as_ref().map(Vec::len)),
            ("channel_window_min", self.window_min.as_ref().map(Vec::len)),
            ("channel_window_max", self.window_max.as_ref().map(Vec::len)),
            ("channel_window_start", self.window_start.as_ref().map(Vec::len)),
            ("channel_window_end", self.window_end.as_ref().map(Vec::len)),
        ] {
            if let Some(len) = len
                && len > labels.len()
            {
                return Err(Error::invalid_option(
                    key,
                    format!("{len} values for {} channel(s)", labels.len()),
                ));
            }
        }

        let mut channels: Vec<ChannelSpec> = labels
            .into_iter()
            .map(|label| ChannelSpec::new(label, dtype))
            .collect();
        apply(&self.colors, &mut channels, |ch, v| ch.color = v);
        apply(&self.actives, &mut channels, |ch, v| ch.active = v);
        apply(&self.coefficients, &mut channels, |ch, v| ch.coefficient = v);
        apply(&self.families, &mut channels, |ch, v| ch.family = v);
        apply(&self.inverted, &mut channels, |ch, v| ch.inverted = v);
        apply(&self.window_min, &mut channels, |ch, v| ch.window.min = v);
        apply(&self.window_max, &mut channels, |ch, v| ch.window.max = v);
        apply(&self.window_start, &mut channels, |ch, v| ch.window.start = v);
        apply(&self.window_end, &mut channels, |ch, v| ch.window.end = v);
        Ok(channels)
    }
}

/// Axis naming overrides; each list, if given, has one entry per TCZYX axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AxisOverrides {
    pub names: Option<Vec<String>>,
    pub kinds: Option<Vec<AxisKind>>,
    pub units: Option<Vec<String>>,
    /// Z, Y, X pixel sizes.
    pub physical_sizes: Option<[f64; 3]>,
}

fn five<T>(key: &str, values: Option<Vec<T>>) -> Result<Option<Vec<T>>> {
    match values {
        Some(v) if v.len() != NDIM => Err(Error::invalid_option(
            key,
            format!("expected {NDIM} values (TCZYX), got {}", v.len()),
        )),
        v => Ok(v),
    }
}

impl AxisOverrides {
    fn from_overrides(o: &OptionOverrides) -> Result<Self> {
        let kinds = o
            .axis_types
            .as_ref()
            .map(|ts| ts.iter().map(|t| t.parse()).collect::<Result<Vec<_>>>())
            .transpose()?;
        let physical_sizes = match &o.physical_pixel_sizes {
            None => None,
            Some(sizes) => {
                let zyx: [f64; 3] = sizes.as_slice().try_into().map_err(|_| {
                    Error::invalid_option(
                        "physical_pixel_sizes",
                        format!("expected 3 values (Z, Y, X), got {}", sizes.len()),
                    )
                })?;
                if zyx.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
                    return Err(Error::invalid_option(
                        "physical_pixel_sizes",
                        "sizes must be positive",
                    ));
                }
                Some(zyx)
            }
        };
        Ok(Self {
            names: five("axis_names", o.axis_names.clone())?,
            kinds: five("axis_types", kinds)?,
            units: five("axis_units", o.axis_units.clone())?,
            physical_sizes,
        })
    }

    /// Axis descriptors, falling back to the reader's pixel sizes.
    pub fn resolve(&self, reader_sizes: Option<[f64; 3]>) -> [AxisSpec; NDIM] {
        let mut axes = AxisSpec::defaults();
        for (idx, axis) in axes.iter_mut().enumerate() {
            if let Some(names) = &self.names {
                axis.name = names[idx].clone();
            }
            if let Some(kinds) = &self.kinds {
                axis.kind = kinds[idx];
            }
            if let Some(units) = &self.units {
                let unit = units[idx].trim();
                axis.unit = (!unit.is_empty() && unit != "none").then(|| unit.to_owned());
            }
        }
        if let Some(zyx) = self.physical_sizes.or(reader_sizes) {
            for (axis, size) in axes[2..].iter_mut().zip(zyx) {
                axis.physical_size = size;
            }
        }
        axes
    }
}

fn shape_option(key: &str, values: &Option<Vec<u64>>) -> Result<Option<Shape>> {
    values
        .as_ref()
        .map(|v| {
            Shape::try_from(v.as_slice()).map_err(|_| {
                Error::invalid_option(
                    key,
                    format!("expected {NDIM} values (TCZYX), got {}", v.len()),
                )
            })
        })
        .transpose()
}

/// Fully-resolved options of one conversion job.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOptions {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Output name, without the `.ome.zarr` suffix.
    pub name: String,
    pub scenes: SceneSelection,
    pub overwrite: bool,
    pub tbatch: u64,
    pub scale: ScaleIntent,
    pub chunk_shape: Option<Shape>,
    pub shard: ShardIntent,
    pub memory_target: u64,
    pub dtype: Option<PixelType>,
    pub dtype_policy: DtypePolicy,
    pub channels: ChannelOverrides,
    pub axes: AxisOverrides,
    pub format: FormatVersion,
    pub compression: Compression,
}

/// Default output name: the file name without extensions or a trailing `.ome`.
pub fn default_name(source: &Path) -> String {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".into());
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name.as_str(),
    };
    let stem = stem.strip_suffix(".ome").unwrap_or(stem);
    stem.to_owned()
}

impl ConversionOptions {
    /// Validate `overrides` for `source`, filling in defaults.
    ///
    /// Nothing is read or written.
    pub fn resolve(source: impl Into<PathBuf>, overrides: &OptionOverrides) -> Result<Self> {
        let source = source.into();
        let destination = overrides
            .destination
            .clone()
            .ok_or(Error::MissingOption("destination"))?;
        let name = match &overrides.name {
            Some(name) if name.trim().is_empty() || name.contains(['/', '\\']) => {
                return Err(Error::invalid_option(
                    "name",
                    format!("{name:?} is not a valid output name"),
                ));
            }
            Some(name) => name.trim().to_owned(),
            None => default_name(&source),
        };
        let tbatch = overrides.tbatch.unwrap_or(1);
        if tbatch == 0 {
            return Err(Error::invalid_option("tbatch", "must be at least 1"));
        }
        let memory_target = overrides.memory_target.unwrap_or(DEFAULT_MEMORY_TARGET);
        if memory_target == 0 {
            return Err(Error::invalid_option("memory_target", "must be positive"));
        }

        let scale = ScaleIntent::from_parts(
            overrides.level_scales.clone(),
            overrides.xy_scale.clone(),
            overrides.z_scale.clone(),
            overrides.num_levels,
        )?;
        let shard = match (&overrides.shard_factor, overrides.shard_memory_target) {
            (Some(_), Some(_)) => {
                return Err(Error::invalid_option(
                    "shard_factor",
                    "cannot be combined with shard_memory_target",
                ));
            }
            (Some(_), None) => ShardIntent::Explicit(
                shape_option("shard_factor", &overrides.shard_factor)?.unwrap_or([1; NDIM]),
            ),
            (None, Some(memory_target)) => ShardIntent::Auto { memory_target },
            (None, None) => ShardIntent::None,
        };

        Ok(Self {
            source,
            destination,
            name,
            scenes: overrides.scenes.clone().unwrap_or_default(),
            overwrite: overrides.overwrite.unwrap_or(false),
            tbatch,
            scale,
            chunk_shape: shape_option("chunk_shape", &overrides.chunk_shape)?,
            shard,
            memory_target,
            dtype: overrides.dtype,
            dtype_policy: if overrides.truncate.unwrap_or(false) {
                DtypePolicy::Truncate
            } else {
                DtypePolicy::Lossless
            },
            channels: ChannelOverrides::from_overrides(overrides)?,
            axes: AxisOverrides::from_overrides(overrides)?,
            format: overrides.format.unwrap_or_default(),
            compression: overrides.compression.unwrap_or_default(),
        })
    }

    /// Group name of `scene`; scenes are suffixed when a job writes several.
    pub fn output_name(&self, scene: usize, multi_scene: bool) -> String {
        if multi_scene {
            format!("{}_{scene}", self.name)
        } else {
            self.name.clone()
        }
    }

    /// Path of the group written for `scene`.
    pub fn output_path(&self, scene: usize, multi_scene: bool) -> PathBuf {
        self.destination
            .join(group_key(&self.output_name(scene, multi_scene)))
    }
}

/// Everything written by one job.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionReport {
    pub source: PathBuf,
    pub scenes: Vec<WriteReport>,
}

impl ConversionReport {
    pub fn cancelled(&self) -> bool {
        self.scenes.iter().any(|s| s.cancelled)
    }
}

/// Everything resolved for one scene before any data is written.
struct ScenePlan {
    name: String,
    dtype: PixelType,
    scale: ScalePlan,
    chunks: Vec<ChunkPlan>,
    metadata: Metadata,
}

/// Converts one source, writing one multiscale group per selected scene.
pub struct ConversionJob {
    options: ConversionOptions,
    context: ExecutionContext,
    cancel: CancelToken,
}

impl ConversionJob {
    pub fn new(options: ConversionOptions) -> Self {
        Self {
            options,
            context: ExecutionContext::Sequential,
            cancel: CancelToken::new(),
        }
    }

    /// Run scenes on `context`.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Open the source and a filesystem store at the destination, then convert.
    pub fn run(&self) -> Result<ConversionReport> {
        let reader = source::open_reader(&self.options.source)?;
        let store = ZarrStore::open_filesystem(
            &self.options.destination,
            self.options.format,
            self.options.compression,
        )?;
        self.run_with(reader.as_ref(), &store)
    }

    fn plan_scene(&self, info: &SceneInfo, name: String) -> Result<ScenePlan> {
        let opts = &self.options;
        let dtype = opts.dtype.unwrap_or(info.dtype);
        check_override(info.dtype, dtype, opts.dtype_policy)?;
        let scale = ScalePlan::resolve(&opts.scale, info.shape)?;
        let chunks: Vec<ChunkPlan> = scale
            .level_shapes()
            .iter()
            .map(|shape| {
                chunk::plan(
                    shape,
                    dtype,
                    opts.memory_target,
                    opts.chunk_shape.as_ref(),
                    &opts.shard,
                    opts.format.supports_sharding(),
                )
            })
            .collect();
        let channels = opts.channels.resolve(
            info.shape[C] as usize,
            info.channel_names.as_deref(),
            dtype,
        )?;
        let axes = opts.axes.resolve(info.physical_sizes);
        let metadata = Metadata::build(&scale, &axes, &channels, dtype, opts.format, &name)?;
        Ok(ScenePlan {
            name,
            dtype,
            scale,
            chunks,
            metadata,
        })
    }

    /// Convert the selected scenes of `reader` into `store`.
    ///
    /// All scenes are validated before anything is written. Without a thread pool the
    /// first failing scene aborts the job; with one, every scene is attempted and the
    /// first failure is returned.
    pub fn run_with(
        &self,
        reader: &dyn ImageReader,
        store: &dyn StoreWriter,
    ) -> Result<ConversionReport> {
        let opts = &self.options;
        let scenes = opts.scenes.indices(reader.scene_count())?;
        let multi_scene = scenes.len() > 1;

        let mut plans = Vec::with_capacity(scenes.len());
        let mut existing = Vec::new();
        for &scene in &scenes {
            let info = reader.scene(scene).map_err(|e| e.at(scene, None))?;
            let plan = self.plan_scene(&info, opts.output_name(scene, multi_scene))?;
            if store.exists(&plan.name)? {
                if !opts.overwrite {
                    return Err(Error::DestinationExists(
                        opts.output_path(scene, multi_scene).display().to_string(),
                    ));
                }
                existing.push(plan.name.clone());
            }
            plans.push((scene, plan));
        }
        for name in existing {
            store.remove(&name)?;
        }

        let write = |(scene, plan): (usize, ScenePlan)| -> Result<WriteReport> {
            log::info!(
                "converting scene {scene} of {} to {}",
                opts.source.display(),
                group_key(&plan.name)
            );
            PyramidWriter::new(
                &plan.scale,
                &plan.chunks,
                &plan.metadata,
                plan.dtype,
                opts.tbatch,
            )
            .with_cancel(&self.cancel)
            .run(reader, scene, store, &plan.name)
        };

        let reports = match &self.context {
            ExecutionContext::Sequential => {
                plans.into_iter().map(write).collect::<Result<Vec<_>>>()?
            }
            context => context
                .map(plans, write)
                .into_iter()
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(ConversionReport {
            source: opts.source.clone(),
            scenes: reports,
        })
    }
}

/// Convert `source` with `overrides` layered on the defaults.
pub fn convert(
    source: impl Into<PathBuf>,
    overrides: &OptionOverrides,
) -> Result<ConversionReport> {
    let options = ConversionOptions::resolve(source, overrides)?;
    let context = ExecutionContext::from_overrides(overrides)?;
    ConversionJob::new(options).with_context(context).run()
}
