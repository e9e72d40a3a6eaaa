//! Streaming multiscale pyramid writing, one time batch at a time.
use crate::{
    Error, Result,
    chunk::ChunkPlan,
    convert::CancelToken,
    dtype::{PixelBuffer, PixelType, Sample},
    error::BatchCoords,
    metadata::Metadata,
    scale::{NDIM, ScalePlan, Shape, T},
    source::{ImageBlock, ImageReader},
    storage::{GroupWriter, LevelArraySpec, StoreWriter, group_key},
    with_pixels,
};

/// Outcome of writing one scene.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    pub scene: usize,
    /// Group name, without the `.ome.zarr` suffix.
    pub name: String,
    pub dtype: PixelType,
    pub level_shapes: Vec<Shape>,
    pub chunk_plans: Vec<ChunkPlan>,
    pub batches_written: u64,
    /// Timepoints present in the output.
    pub timepoints: u64,
    pub cancelled: bool,
}

/// Writes every level of one scene, reading the source once per time batch.
///
/// At most one batch of level 0 and its downsampled levels are held in memory.
pub struct PyramidWriter<'a> {
    plan: &'a ScalePlan,
    chunk_plans: &'a [ChunkPlan],
    metadata: &'a Metadata,
    dtype: PixelType,
    tbatch: u64,
    cancel: Option<&'a CancelToken>,
}

impl<'a> PyramidWriter<'a> {
    pub fn new(
        plan: &'a ScalePlan,
        chunk_plans: &'a [ChunkPlan],
        metadata: &'a Metadata,
        dtype: PixelType,
        tbatch: u64,
    ) -> Self {
        Self {
            plan,
            chunk_plans,
            metadata,
            dtype,
            tbatch: tbatch.max(1),
            cancel: None,
        }
    }

    /// Check `token` between batches; a cancelled scene keeps the batches already written.
    pub fn with_cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn level_specs(&self) -> Vec<LevelArraySpec> {
        let dimension_names = self
            .metadata
            .multiscale
            .axes
            .iter()
            .map(|a| a.name.clone())
            .collect::<Vec<_>>();
        let dimension_names: [String; NDIM] = dimension_names
            .try_into()
            .unwrap_or_else(|_| ["t", "c", "z", "y", "x"].map(String::from));
        self.plan
            .level_shapes()
            .into_iter()
            .zip(self.chunk_plans)
            .map(|(shape, chunks)| LevelArraySpec {
                shape,
                dtype: self.dtype,
                chunks: chunks.clone(),
                dimension_names: dimension_names.clone(),
            })
            .collect()
    }

    /// Convert `scene` of `reader` into group `name` of `store`.
    ///
    /// Failures are annotated with the scene and, once writing has started, the batch.
    pub fn run(
        &self,
        reader: &dyn ImageReader,
        scene: usize,
        store: &dyn StoreWriter,
        name: &str,
    ) -> Result<WriteReport> {
        if self.chunk_plans.len() != self.plan.num_levels() {
            return Err(Error::general(format!(
                "{} chunk plans for {} levels",
                self.chunk_plans.len(),
                self.plan.num_levels()
            ))
            .at(scene, None));
        }
        let specs = self.level_specs();
        let mut group = store
            .create_group(name, &specs)
            .map_err(|e| e.at(scene, None))?;

        let n_timepoints = self.plan.level0_shape()[T];
        let mut report = WriteReport {
            scene,
            name: name.to_owned(),
            dtype: self.dtype,
            level_shapes: specs.iter().map(|s| s.shape).collect(),
            chunk_plans: self.chunk_plans.to_vec(),
            batches_written: 0,
            timepoints: 0,
            cancelled: false,
        };

        for (index, start) in (0..n_timepoints).step_by(self.tbatch as usize).enumerate() {
            if self.cancel.is_some_and(CancelToken::is_cancelled) {
                log::warn!(
                    "{}: cancelled after {} of {n_timepoints} timepoints",
                    group_key(name),
                    report.timepoints
                );
                report.cancelled = true;
                break;
            }
            let time = start..(start + self.tbatch).min(n_timepoints);
            let coords = BatchCoords {
                index: index as u64,
                time: time.clone(),
            };
            self.write_batch(reader, scene, group.as_ref(), &coords)
                .map_err(|e| e.at(scene, Some(coords.clone())))?;
            report.batches_written += 1;
            report.timepoints = time.end;
            log::debug!("{}: wrote {coords}", group_key(name));
        }

        if report.cancelled {
            group
                .truncate_time(report.timepoints)
                .map_err(|e| e.at(scene, None))?;
            for shape in report.level_shapes.iter_mut() {
                shape[T] = report.timepoints;
            }
        }
        group
            .write_metadata(self.metadata)
            .map_err(|e| e.at(scene, None))?;
        log::info!(
            "wrote {} ({} level(s), {} timepoint(s))",
            group_key(name),
            report.level_shapes.len(),
            report.timepoints
        );
        Ok(report)
    }

    fn write_batch(
        &self,
        reader: &dyn ImageReader,
        scene: usize,
        group: &dyn GroupWriter,
        coords: &BatchCoords,
    ) -> Result<()> {
        let mut block = reader.read_time_batch(scene, coords.time.clone())?;
        let mut expected = *self.plan.level0_shape();
        expected[T] = coords.time.end - coords.time.start;
        if block.shape != expected {
            return Err(Error::general(format!(
                "reader returned a block of shape {:?}, expected {expected:?}",
                block.shape
            )));
        }
        if block.pixel_type() != self.dtype {
            block.data = block.data.cast(self.dtype);
        }

        let mut offset = [0u64; NDIM];
        offset[T] = coords.time.start;
        group.write_block(0, &offset, &block)?;
        for level in 1..self.plan.num_levels() {
            block = downsample(&block, self.plan.window(level));
            group.write_block(level, &offset, &block)?;
        }
        Ok(())
    }
}

/// Reduce `block` by averaging non-overlapping boxes of `window` elements.
///
/// Boxes truncated by the block edge are averaged over the elements they contain.
/// Integer results are rounded to nearest.
pub fn downsample(block: &ImageBlock, window: &Shape) -> ImageBlock {
    if window.iter().all(|w| *w <= 1) {
        return block.clone();
    }
    let mut shape = block.shape;
    for axis in 0..NDIM {
        shape[axis] = block.shape[axis].div_ceil(window[axis].max(1));
    }
    let data = with_pixels!(&block.data, v => {
        PixelBuffer::from(box_average(v.as_slice(), &block.shape, window, &shape))
    });
    ImageBlock { shape, data }
}

fn box_average<S: Sample>(
    data: &[S],
    shape: &Shape,
    window: &Shape,
    out_shape: &Shape,
) -> Vec<S> {
    let mut strides = [1usize; NDIM];
    for axis in (0..NDIM - 1).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1] as usize;
    }
    // Per-axis input range of each output index.
    let bounds: Vec<Vec<(usize, usize)>> = (0..NDIM)
        .map(|axis| {
            let w = window[axis].max(1);
            (0..out_shape[axis])
                .map(|o| {
                    let lo = o * w;
                    let hi = ((o + 1) * w).min(shape[axis]);
                    (lo as usize, hi as usize)
                })
                .collect()
        })
        .collect();

    let mut out = Vec::with_capacity(out_shape.iter().product::<u64>() as usize);
    for &(t0, t1) in &bounds[0] {
        for &(c0, c1) in &bounds[1] {
            for &(z0, z1) in &bounds[2] {
                for &(y0, y1) in &bounds[3] {
                    for &(x0, x1) in &bounds[4] {
                        let mut sum = S::Sum::default();
                        let mut count = 0usize;
                        for t in t0..t1 {
                            for c in c0..c1 {
                                for z in z0..z1 {
                                    for y in y0..y1 {
                                        let row = t * strides[0]
                                            + c * strides[1]
                                            + z * strides[2]
                                            + y * strides[3];
                                        for value in &data[row + x0..row + x1] {
                                            sum += value.to_sum();
                                        }
                                        count += x1 - x0;
                                    }
                                }
                            }
                        }
                        out.push(S::mean(sum, count));
                    }
                }
            }
        }
    }
    out
}
