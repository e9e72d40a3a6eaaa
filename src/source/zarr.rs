use std::{
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Buf;
use zarrs::{
    array::{Array, ArraySubset},
    filesystem::FilesystemStore,
    storage::{ReadableStorageTraits, StoreKey},
};

use crate::{
    Error, Result,
    dtype::{IntoPixelBuffer, PixelBuffer, PixelType},
    metadata::Metadata,
    scale::{NDIM, T},
    source::{ImageBlock, ImageReader, SceneInfo, check_scene, check_time, right_align},
};

/// Reader for a Zarr array, or the first level of a multiscale Zarr group.
///
/// Channel names and pixel sizes are taken from OME attributes where present.
pub struct ZarrReader {
    path: PathBuf,
    array: Array<FilesystemStore>,
    info: SceneInfo,
}

impl std::fmt::Debug for ZarrReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZarrReader")
            .field("path", &self.path)
            .field("info", &self.info)
            .finish()
    }
}

/// Attributes of the root node, from either `zarr.json` or `.zattrs`.
fn root_attributes(
    store: &FilesystemStore,
) -> Result<Option<serde_json::Map<String, serde_json::Value>>> {
    for (key, nested) in [("zarr.json", true), (".zattrs", false)] {
        let key = StoreKey::new(key).map_err(Error::wrap)?;
        let Some(bytes) = store.get(&key)? else {
            continue;
        };
        let mut value: serde_json::Value = serde_json::from_reader(bytes.reader())?;
        if nested {
            value = value
                .get_mut("attributes")
                .map(serde_json::Value::take)
                .unwrap_or_default();
        }
        if let serde_json::Value::Object(map) = value {
            return Ok(Some(map));
        }
    }
    Ok(None)
}

fn retrieve<S: IntoPixelBuffer>(
    array: &Array<FilesystemStore>,
    subset: &ArraySubset,
) -> Result<PixelBuffer> {
    Ok(S::into_buffer(array.retrieve_array_subset::<Vec<S>>(subset)?))
}

impl ZarrReader {
    pub fn open(path: &Path) -> Result<Self> {
        let store = Arc::new(FilesystemStore::new(path).map_err(Error::wrap)?);
        let unsupported = |reason: String| Error::UnsupportedSource {
            path: path.to_owned(),
            reason,
        };

        let array = match Array::open(store.clone(), "/") {
            Ok(array) => array,
            Err(_) => Array::open(store.clone(), "/0")
                .map_err(|e| unsupported(format!("no array at root or level 0: {e}")))?,
        };
        let dtype = PixelType::from_data_type(array.data_type())
            .ok_or_else(|| unsupported(format!("unsupported data type {:?}", array.data_type())))?;
        let shape = right_align(array.shape()).map_err(|e| unsupported(e.to_string()))?;

        let mut info = SceneInfo::new(shape, dtype);
        info.name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
        if let Some((multiscale, omero)) = root_attributes(&store)?
            .as_ref()
            .and_then(Metadata::from_attributes)
        {
            if let Some(scale) = multiscale.datasets.first().and_then(|d| d.scale())
                && scale.len() >= 3
            {
                let n = scale.len();
                info.physical_sizes = Some([scale[n - 3], scale[n - 2], scale[n - 1]]);
            }
            info.channel_names = omero.map(|o| o.channels.into_iter().map(|c| c.label).collect());
        }
        log::debug!("opened {} as {dtype} {shape:?}", path.display());

        Ok(Self {
            path: path.to_owned(),
            array,
            info,
        })
    }
}

impl ImageReader for ZarrReader {
    fn scene_count(&self) -> usize {
        1
    }

    fn scene(&self, index: usize) -> Result<SceneInfo> {
        check_scene(index, 1)?;
        Ok(self.info.clone())
    }

    fn read_time_batch(&self, scene: usize, time: Range<u64>) -> Result<ImageBlock> {
        check_scene(scene, 1)?;
        check_time(&self.info.shape, &time)?;

        let native = self.array.shape();
        let offset = NDIM - native.len();
        let ranges: Vec<Range<u64>> = native
            .iter()
            .enumerate()
            .map(|(dim, n)| {
                if dim + offset == T {
                    time.clone()
                } else {
                    0..*n
                }
            })
            .collect();
        let subset = ArraySubset::new_with_ranges(&ranges);

        let data = match self.info.dtype {
            PixelType::Uint8 => retrieve::<u8>(&self.array, &subset),
            PixelType::Uint16 => retrieve::<u16>(&self.array, &subset),
            PixelType::Uint32 => retrieve::<u32>(&self.array, &subset),
            PixelType::Uint64 => retrieve::<u64>(&self.array, &subset),
            PixelType::Int8 => retrieve::<i8>(&self.array, &subset),
            PixelType::Int16 => retrieve::<i16>(&self.array, &subset),
            PixelType::Int32 => retrieve::<i32>(&self.array, &subset),
            PixelType::Int64 => retrieve::<i64>(&self.array, &subset),
            PixelType::Float32 => retrieve::<f32>(&self.array, &subset),
            PixelType::Float64 => retrieve::<f64>(&self.array, &subset),
        }?;

        let mut shape = self.info.shape;
        shape[T] = time.end - time.start;
        ImageBlock::new(shape, data)
    }
}
