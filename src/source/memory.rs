use std::ops::Range;

use crate::{
    Result,
    dtype::{IntoPixelBuffer, PixelBuffer},
    scale::{Shape, T},
    source::{ImageBlock, ImageReader, SceneInfo, check_scene, check_time},
    with_pixels,
};

/// One in-memory TCZYX image.
#[derive(Debug, Clone)]
pub struct MemoryScene {
    info: SceneInfo,
    data: PixelBuffer,
}

impl MemoryScene {
    pub fn new<S: IntoPixelBuffer>(shape: Shape, data: Vec<S>) -> Result<Self> {
        let block = ImageBlock::new(shape, S::into_buffer(data))?;
        Ok(Self {
            info: SceneInfo::new(shape, block.pixel_type()),
            data: block.data,
        })
    }

    pub fn with_channel_names(mut self, names: Vec<String>) -> Self {
        self.info.channel_names = Some(names);
        self
    }

    pub fn with_physical_sizes(mut self, zyx: [f64; 3]) -> Self {
        self.info.physical_sizes = Some(zyx);
        self
    }
}

/// Reader over scenes held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    scenes: Vec<MemoryScene>,
}

impl MemoryReader {
    pub fn new(scenes: Vec<MemoryScene>) -> Self {
        Self { scenes }
    }
}

impl ImageReader for MemoryReader {
    fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    fn scene(&self, index: usize) -> Result<SceneInfo> {
        check_scene(index, self.scenes.len())?;
        Ok(self.scenes[index].info.clone())
    }

    fn read_time_batch(&self, scene: usize, time: Range<u64>) -> Result<ImageBlock> {
        check_scene(scene, self.scenes.len())?;
        let MemoryScene { info, data } = &self.scenes[scene];
        check_time(&info.shape, &time)?;
        let per_t = info.timepoint_len() as usize;
        let range = time.start as usize * per_t..time.end as usize * per_t;
        let mut shape = info.shape;
        shape[T] = time.end - time.start;
        ImageBlock::new(shape, with_pixels!(data, v => PixelBuffer::from(v[range].to_vec())))
    }
}
