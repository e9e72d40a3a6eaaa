//! Image readers which provide TCZYX blocks in time batches.
use std::{ops::Range, path::Path};

use crate::{
    Error, Result,
    dtype::{PixelBuffer, PixelType},
    scale::{NDIM, Shape, T},
};

mod memory;
mod npy;
mod zarr;

pub use memory::{MemoryReader, MemoryScene};
pub use npy::NpyReader;
pub use zarr::ZarrReader;

/// What a reader knows about one scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneInfo {
    pub name: Option<String>,
    pub shape: Shape,
    pub dtype: PixelType,
    pub channel_names: Option<Vec<String>>,
    /// Z, Y, X pixel sizes, if recorded in the source.
    pub physical_sizes: Option<[f64; 3]>,
}

impl SceneInfo {
    pub fn new(shape: Shape, dtype: PixelType) -> Self {
        Self {
            name: None,
            shape,
            dtype,
            channel_names: None,
            physical_sizes: None,
        }
    }

    /// Elements in one timepoint.
    pub fn timepoint_len(&self) -> u64 {
        self.shape[1..].iter().product()
    }
}

/// A C-order TCZYX block of pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBlock {
    pub shape: Shape,
    pub data: PixelBuffer,
}

impl ImageBlock {
    pub fn new(shape: Shape, data: PixelBuffer) -> Result<Self> {
        let expected: u64 = shape.iter().product();
        if expected != data.len() as u64 {
            return Err(Error::general(format!(
                "block of shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn pixel_type(&self) -> PixelType {
        self.data.pixel_type()
    }
}

/// Source of image data, opened once per job.
///
/// Implementations must tolerate concurrent reads of different scenes.
pub trait ImageReader: Send + Sync {
    fn scene_count(&self) -> usize;

    fn scene(&self, index: usize) -> Result<SceneInfo>;

    /// Read timepoints `time` of every channel and plane of `scene`.
    fn read_time_batch(&self, scene: usize, time: Range<u64>) -> Result<ImageBlock>;
}

pub(crate) fn check_scene(index: usize, count: usize) -> Result<()> {
    if index >= count {
        Err(Error::SceneOutOfRange { index, count })
    } else {
        Ok(())
    }
}

pub(crate) fn check_time(shape: &Shape, time: &Range<u64>) -> Result<()> {
    if time.start >= time.end || time.end > shape[T] {
        Err(Error::general(format!(
            "time range {}..{} out of bounds for {} timepoints",
            time.start, time.end, shape[T]
        )))
    } else {
        Ok(())
    }
}

/// Expand a shape of up to five dimensions to TCZYX by prepending singleton axes.
pub fn right_align(shape: &[u64]) -> Result<Shape> {
    if shape.is_empty() || shape.len() > NDIM {
        return Err(Error::general(format!(
            "expected 1 to {NDIM} dimensions, got {}",
            shape.len()
        )));
    }
    let mut out = [1u64; NDIM];
    out[NDIM - shape.len()..].copy_from_slice(shape);
    Ok(out)
}

/// Open a reader based on the path's extension.
///
/// `.npy` files are read with [`NpyReader`]; `.zarr` directories with [`ZarrReader`].
pub fn open_reader(path: &Path) -> Result<Box<dyn ImageReader>> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if !path.exists() {
        return Err(Error::UnsupportedSource {
            path: path.to_owned(),
            reason: "no such file or directory".into(),
        });
    }
    if file_name.ends_with(".npy") {
        Ok(Box::new(NpyReader::open(path)?))
    } else if file_name.ends_with(".zarr") || path.is_dir() {
        Ok(Box::new(ZarrReader::open(path)?))
    } else {
        Err(Error::UnsupportedSource {
            path: path.to_owned(),
            reason: "no reader for this file type".into(),
        })
    }
}
