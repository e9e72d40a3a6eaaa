use std::{
    fs::File,
    io::BufReader,
    ops::Range,
    path::{Path, PathBuf},
};

use npyz::{DType, NpyFile, Order};

use crate::{
    Error, Result,
    dtype::{IntoPixelBuffer, PixelBuffer, PixelType},
    scale::{Shape, T},
    source::{ImageBlock, ImageReader, SceneInfo, check_scene, check_time, right_align},
};

/// Reader for a single-scene `.npy` file of up to five dimensions.
///
/// Fewer than five dimensions are treated as the trailing TCZYX axes.
/// Batches are streamed from disk rather than loading the whole array.
#[derive(Debug, Clone)]
pub struct NpyReader {
    path: PathBuf,
    info: SceneInfo,
}

impl NpyReader {
    pub fn open(path: &Path) -> Result<Self> {
        let npy = Self::header(path)?;
        let unsupported = |reason: String| Error::UnsupportedSource {
            path: path.to_owned(),
            reason,
        };
        if matches!(npy.order(), Order::Fortran) {
            return Err(unsupported("Fortran-ordered arrays are not supported".into()));
        }
        let dtype = match npy.dtype() {
            DType::Plain(typestr) => {
                let typestr = typestr.to_string();
                PixelType::from_typestr(&typestr)
                    .ok_or_else(|| unsupported(format!("unsupported dtype {typestr}")))?
            }
            other => return Err(unsupported(format!("unsupported dtype {other:?}"))),
        };
        let shape = right_align(npy.shape()).map_err(|e| unsupported(e.to_string()))?;
        let mut info = SceneInfo::new(shape, dtype);
        info.name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
        log::debug!("opened {} as {dtype} {shape:?}", path.display());
        Ok(Self {
            path: path.to_owned(),
            info,
        })
    }

    fn header(path: &Path) -> Result<NpyFile<BufReader<File>>> {
        let file = BufReader::new(File::open(path)?);
        Ok(NpyFile::new(file)?)
    }
}

fn read_range<S>(npy: NpyFile<BufReader<File>>, range: Range<usize>) -> Result<PixelBuffer>
where
    S: IntoPixelBuffer + npyz::Deserialize,
{
    let mut data = npy.data::<S>().map_err(Error::wrap)?;
    // Bounds were checked against the header shape.
    data.seek_to(range.start as u64)?;
    let values = data
        .take(range.end - range.start)
        .collect::<std::io::Result<Vec<S>>>()?;
    Ok(S::into_buffer(values))
}

impl ImageReader for NpyReader {
    fn scene_count(&self) -> usize {
        1
    }

    fn scene(&self, index: usize) -> Result<SceneInfo> {
        check_scene(index, 1)?;
        Ok(self.info.clone())
    }

    fn read_time_batch(&self, scene: usize, time: Range<u64>) -> Result<ImageBlock> {
        check_scene(scene, 1)?;
        let shape: Shape = self.info.shape;
        check_time(&shape, &time)?;
        let per_t = self.info.timepoint_len() as usize;
        let range = time.start as usize * per_t..time.end as usize * per_t;

        let npy = Self::header(&self.path)?;
        let data = match self.info.dtype {
            PixelType::Uint8 => read_range::<u8>(npy, range),
            PixelType::Uint16 => read_range::<u16>(npy, range),
            PixelType::Uint32 => read_range::<u32>(npy, range),
            PixelType::Uint64 => read_range::<u64>(npy, range),
            PixelType::Int8 => read_range::<i8>(npy, range),
            PixelType::Int16 => read_range::<i16>(npy, range),
            PixelType::Int32 => read_range::<i32>(npy, range),
            PixelType::Int64 => read_range::<i64>(npy, range),
            PixelType::Float32 => read_range::<f32>(npy, range),
            PixelType::Float64 => read_range::<f64>(npy, range),
        }?;

        let mut block_shape = shape;
        block_shape[T] = time.end - time.start;
        ImageBlock::new(block_shape, data)
    }
}
