//! Destination stores for multiscale image groups.
use std::{num::NonZeroU64, ops::Range, path::Path, sync::Arc};

use zarrs::{
    array::{
        Array, ArrayBuilder, ArrayMetadata, ArrayMetadataV2, ArraySubset, ChunkKeySeparator,
        FillValueMetadata,
    },
    filesystem::FilesystemStore,
    group::{Group, GroupBuilder},
    metadata::{
        GroupMetadata,
        v2::{DataTypeMetadataV2, GroupMetadataV2},
    },
    storage::{
        ReadableWritableListableStorage, ReadableWritableListableStorageTraits, StorePrefix,
    },
};

use crate::{
    Error, Result,
    chunk::ChunkPlan,
    codec::Compression,
    dtype::PixelType,
    metadata::{FormatVersion, Metadata},
    scale::{NDIM, Shape, T},
    source::ImageBlock,
    with_pixels,
};

/// Array layout of one pyramid level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelArraySpec {
    pub shape: Shape,
    pub dtype: PixelType,
    pub chunks: ChunkPlan,
    pub dimension_names: [String; NDIM],
}

/// Writes the levels of one multiscale group.
pub trait GroupWriter: Send + Sync {
    /// Write `block` into `level` with its origin at `offset`.
    fn write_block(&self, level: usize, offset: &Shape, block: &ImageBlock) -> Result<()>;

    /// Shrink the time extent of every level, e.g. after cancellation.
    fn truncate_time(&mut self, timepoints: u64) -> Result<()>;

    /// Write the OME metadata as the group's top-level descriptor.
    fn write_metadata(&self, metadata: &Metadata) -> Result<()>;
}

/// A place multiscale groups can be created in, keyed by group name.
pub trait StoreWriter: Send + Sync {
    fn exists(&self, name: &str) -> Result<bool>;

    fn remove(&self, name: &str) -> Result<()>;

    /// Create a group with one array per level, replacing any array metadata present.
    fn create_group(&self, name: &str, levels: &[LevelArraySpec])
    -> Result<Box<dyn GroupWriter>>;
}

/// Storage key of group `name`, which is written as `<name>.ome.zarr`.
pub fn group_key(name: &str) -> String {
    format!("{name}.ome.zarr")
}

/// [`StoreWriter`] over any zarrs store.
#[derive(Clone)]
pub struct ZarrStore {
    storage: ReadableWritableListableStorage,
    format: FormatVersion,
    compression: Compression,
}

impl ZarrStore {
    pub fn new(
        storage: ReadableWritableListableStorage,
        format: FormatVersion,
        compression: Compression,
    ) -> Self {
        Self {
            storage,
            format,
            compression,
        }
    }

    /// Store groups as directories under `root`, creating it if needed.
    pub fn open_filesystem(
        root: &Path,
        format: FormatVersion,
        compression: Compression,
    ) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let store = FilesystemStore::new(root).map_err(Error::wrap)?;
        Ok(Self::new(Arc::new(store), format, compression))
    }

    pub fn storage(&self) -> &ReadableWritableListableStorage {
        &self.storage
    }

    fn prefix(name: &str) -> Result<StorePrefix> {
        StorePrefix::new(format!("{}/", group_key(name))).map_err(Error::wrap)
    }

    fn create_array(
        &self,
        path: &str,
        spec: &LevelArraySpec,
    ) -> Result<Array<dyn ReadableWritableListableStorageTraits>> {
        let array = match self.format {
            FormatVersion::V3 => {
                let block_shape = spec.chunks.shard_shape().unwrap_or(spec.chunks.chunk_shape);
                let mut builder = ArrayBuilder::new(
                    spec.shape.to_vec(),
                    block_shape.to_vec(),
                    spec.dtype.to_data_type(),
                    0u8,
                );
                builder.dimension_names(Some(spec.dimension_names.iter().map(String::as_str)));
                if let Some(codec) = self.compression.to_bytes_to_bytes_codec()? {
                    builder.bytes_to_bytes_codecs(vec![codec]);
                }
                if spec.chunks.shard_factor.is_some() {
                    builder.subchunk_shape(spec.chunks.chunk_shape.to_vec());
                }
                builder.build(self.storage.clone(), path)?
            }
            FormatVersion::V2 => {
                let chunks = spec
                    .chunks
                    .chunk_shape
                    .iter()
                    .map(|&c| {
                        NonZeroU64::new(c)
                            .ok_or_else(|| Error::general(format!("zero chunk extent in {path}")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let metadata = ArrayMetadataV2::new(
                    spec.shape.to_vec(),
                    chunks.try_into().map_err(Error::wrap)?,
                    DataTypeMetadataV2::Simple(spec.dtype.v2_dtype().to_owned()),
                    FillValueMetadata::from(0u8),
                    self.compression.to_v2_compressor()?,
                    None,
                )
                .with_dimension_separator(ChunkKeySeparator::Slash);
                Array::new_with_metadata(self.storage.clone(), path, ArrayMetadata::V2(metadata))?
            }
        };
        array.store_metadata()?;
        Ok(array)
    }

    fn write_group_attributes(
        &self,
        name: &str,
        attributes: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let path = format!("/{}", group_key(name));
        let group = match self.format {
            FormatVersion::V3 => {
                let mut group = GroupBuilder::new().build(self.storage.clone(), &path)?;
                group.attributes_mut().extend(attributes);
                group
            }
            FormatVersion::V2 => Group::new_with_metadata(
                self.storage.clone(),
                &path,
                GroupMetadata::V2(GroupMetadataV2::new().with_attributes(attributes)),
            )?,
        };
        group.store_metadata()?;
        Ok(())
    }
}

impl StoreWriter for ZarrStore {
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(!self.storage.list_prefix(&Self::prefix(name)?)?.is_empty())
    }

    fn remove(&self, name: &str) -> Result<()> {
        log::info!("removing existing {}", group_key(name));
        self.storage.erase_prefix(&Self::prefix(name)?)?;
        Ok(())
    }

    fn create_group(
        &self,
        name: &str,
        levels: &[LevelArraySpec],
    ) -> Result<Box<dyn GroupWriter>> {
        // Plain group first so the hierarchy is valid while levels are being written.
        self.write_group_attributes(name, Default::default())?;
        let arrays = levels
            .iter()
            .enumerate()
            .map(|(level, spec)| self.create_array(&format!("/{}/{level}", group_key(name)), spec))
            .collect::<Result<Vec<_>>>()?;
        log::debug!("created {} with {} level(s)", group_key(name), arrays.len());
        Ok(Box::new(ZarrGroup {
            store: self.clone(),
            name: name.to_owned(),
            arrays,
        }))
    }
}

/// The levels of one group in a [`ZarrStore`].
pub struct ZarrGroup {
    store: ZarrStore,
    name: String,
    arrays: Vec<Array<dyn ReadableWritableListableStorageTraits>>,
}

impl GroupWriter for ZarrGroup {
    fn write_block(&self, level: usize, offset: &Shape, block: &ImageBlock) -> Result<()> {
        let array = self
            .arrays
            .get(level)
            .ok_or_else(|| Error::general(format!("no level {level} in {}", self.name)))?;
        let ranges: Vec<Range<u64>> = (0..NDIM)
            .map(|axis| offset[axis]..offset[axis] + block.shape[axis])
            .collect();
        let subset = ArraySubset::new_with_ranges(&ranges);
        with_pixels!(&block.data, v => array.store_array_subset(&subset, v))?;
        Ok(())
    }

    fn truncate_time(&mut self, timepoints: u64) -> Result<()> {
        for array in self.arrays.iter_mut() {
            let mut shape = array.shape().to_vec();
            shape[T] = timepoints;
            array.set_shape(shape)?;
            array.store_metadata()?;
        }
        Ok(())
    }

    fn write_metadata(&self, metadata: &Metadata) -> Result<()> {
        self.store
            .write_group_attributes(&self.name, metadata.to_attributes()?)
    }
}
