//! Chunk and shard shape selection for each pyramid level.
use std::fmt;

use crate::{
    dtype::PixelType,
    scale::{C, NDIM, Shape, T, X, Y, Z},
};

/// Default advisory size of one chunk, 16 MiB.
pub const DEFAULT_MEMORY_TARGET: u64 = 16 * 1024 * 1024;

/// Axes grow in this order; axes in one group grow round-robin.
const GROWTH_ORDER: [&[usize]; 4] = [&[Y, X], &[Z], &[T], &[C]];

/// A single element already meets or exceeds the memory target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTooLarge {
    pub minimal_bytes: u64,
    pub memory_target: u64,
}

impl fmt::Display for ChunkTooLarge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "smallest possible chunk ({} bytes) meets or exceeds the memory target of {} bytes",
            self.minimal_bytes, self.memory_target
        )
    }
}

/// How chunks are grouped into shards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShardIntent {
    /// One file per chunk.
    #[default]
    None,
    /// Chunks per shard along each axis; 0 means as many as fit in the level.
    Explicit(Shape),
    /// Grow shards like chunks, up to this many bytes.
    Auto { memory_target: u64 },
}

/// Chunk (and optional shard) layout for one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_shape: Shape,
    /// Chunks per shard along each axis.
    pub shard_factor: Option<Shape>,
    pub warning: Option<ChunkTooLarge>,
}

impl ChunkPlan {
    pub fn chunk_bytes(&self, dtype: PixelType) -> u64 {
        n_elements(&self.chunk_shape).saturating_mul(dtype.size() as u64)
    }

    /// Shape of one shard in elements, if sharded.
    pub fn shard_shape(&self) -> Option<Shape> {
        self.shard_factor.map(|factor| {
            let mut shape = self.chunk_shape;
            for axis in 0..NDIM {
                shape[axis] *= factor[axis];
            }
            shape
        })
    }
}

fn n_elements(shape: &Shape) -> u64 {
    shape.iter().fold(1u64, |acc, n| acc.saturating_mul(*n))
}

/// Double axes from all-ones, following [`GROWTH_ORDER`], while `unit_bytes`
/// times the element count stays within `target`.
fn grow(extent: &Shape, unit_bytes: u64, target: u64) -> Shape {
    let mut shape = [1u64; NDIM];
    for group in GROWTH_ORDER {
        let mut saturated = [false; NDIM];
        loop {
            let mut grew = false;
            for &axis in group {
                if saturated[axis] {
                    continue;
                }
                let candidate = (shape[axis] * 2).min(extent[axis]);
                if candidate <= shape[axis] {
                    saturated[axis] = true;
                    continue;
                }
                let mut trial = shape;
                trial[axis] = candidate;
                if n_elements(&trial).saturating_mul(unit_bytes) <= target {
                    shape = trial;
                    grew = true;
                } else {
                    saturated[axis] = true;
                }
            }
            if !grew {
                break;
            }
        }
    }
    shape
}

/// Choose the chunk layout for an array of `level_shape` elements of `dtype`.
///
/// An explicit chunk shape is clamped to the level extent, with 0 meaning the full
/// extent. Otherwise chunks grow from one element, prioritising Y and X, then Z, T
/// and C, until the next doubling would exceed `memory_target`.
///
/// Sharding is only applied when `sharding_supported`.
pub fn plan(
    level_shape: &Shape,
    dtype: PixelType,
    memory_target: u64,
    explicit_chunk: Option<&Shape>,
    shard: &ShardIntent,
    sharding_supported: bool,
) -> ChunkPlan {
    let element_bytes = dtype.size() as u64;
    let extent = level_shape.map(|n| n.max(1));
    let mut warning = None;

    let chunk_shape = match explicit_chunk {
        Some(requested) => {
            let mut shape = extent;
            for axis in 0..NDIM {
                if requested[axis] != 0 {
                    shape[axis] = requested[axis].min(extent[axis]);
                }
            }
            let bytes = n_elements(&shape).saturating_mul(element_bytes);
            if bytes > memory_target {
                log::debug!(
                    "explicit chunk shape {shape:?} is {bytes} bytes, above the {memory_target} byte target"
                );
            }
            shape
        }
        None => {
            if element_bytes >= memory_target && n_elements(&extent) > 1 {
                let w = ChunkTooLarge {
                    minimal_bytes: element_bytes,
                    memory_target,
                };
                log::warn!("{w}");
                warning = Some(w);
            }
            grow(&extent, element_bytes, memory_target)
        }
    };

    let shard_factor = match shard {
        ShardIntent::None => None,
        _ if !sharding_supported => {
            log::warn!("sharding is not supported by this format; writing unsharded chunks");
            None
        }
        intent => {
            let mut max_factor = [1u64; NDIM];
            for axis in 0..NDIM {
                max_factor[axis] = (extent[axis] / chunk_shape[axis]).max(1);
            }
            let factor = match intent {
                ShardIntent::Explicit(requested) => {
                    let mut factor = max_factor;
                    for axis in 0..NDIM {
                        if requested[axis] != 0 {
                            factor[axis] = requested[axis].min(max_factor[axis]);
                        }
                    }
                    factor
                }
                ShardIntent::Auto { memory_target } => {
                    let chunk_bytes = n_elements(&chunk_shape).saturating_mul(element_bytes);
                    grow(&max_factor, chunk_bytes, *memory_target)
                }
                ShardIntent::None => [1; NDIM],
            };
            // One chunk per shard is no sharding at all.
            factor.iter().any(|f| *f > 1).then_some(factor)
        }
    };

    ChunkPlan {
        chunk_shape,
        shard_factor,
        warning,
    }
}
